//! Handshake state machine shared by the server's and client's connection
//! setup streams.
//!
//! Grounded on `ServerHandshakeManager`/`ClientHandshakeManager` in the
//! original implementation's `handshake.py`.

use bytes::{Bytes, BytesMut};

use crate::errors::NetworkError;
use crate::packet::{DecodedPacket, ProtocolId};
use crate::serialise::{pack_short_string, unpack_short_string};
use crate::world::Netmode;

/// States a handshake transitions through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    AwaitingHandshake,
    ReceivedHandshake,
    Connected,
    Failed,
    Disconnected,
    TimedOut,
}

/// Reads the netmode byte a `request_handshake` payload carries. A missing
/// byte (a malformed or legacy-shaped packet) defaults to `Client` so it
/// doesn't spuriously trip the peer-is-server rejection.
pub fn parse_request_netmode(payload: &[u8]) -> Netmode {
    Netmode::from_byte(payload.first().copied().unwrap_or(Netmode::Client.to_byte()))
}

/// Server-side handshake stream: one per incoming connection attempt.
pub struct ServerHandshake {
    pub state: HandshakeState,
    pub handshake_error: Option<NetworkError>,
}

impl ServerHandshake {
    /// Starts in `AwaitingHandshake` and immediately queues an
    /// `invoke_handshake` multicast so the client can (re)issue its
    /// request if it missed the initial one.
    pub fn new() -> (Self, DecodedPacket) {
        let stream = Self {
            state: HandshakeState::AwaitingHandshake,
            handshake_error: None,
        };
        let packet = DecodedPacket {
            protocol_id: ProtocolId::InvokeHandshake,
            reliable: true,
            payload: Bytes::new(),
        };
        (stream, packet)
    }

    /// Handles an inbound `request_handshake`; `pre_initialise` is the
    /// caller's `Rules::pre_initialise` outcome, already evaluated (this
    /// type has no async dependency of its own). Returns the packet to send
    /// in reply.
    pub fn receive_handshake_request(&mut self, pre_initialise: Result<(), NetworkError>) -> DecodedPacket {
        if self.state != HandshakeState::AwaitingHandshake {
            return DecodedPacket {
                protocol_id: ProtocolId::InvokeHandshake,
                reliable: true,
                payload: Bytes::new(),
            };
        }

        self.handshake_error = pre_initialise.err();
        self.state = HandshakeState::ReceivedHandshake;
        self.send_handshake_result()
    }

    fn send_handshake_result(&mut self) -> DecodedPacket {
        match self.handshake_error.take() {
            Some(err) => {
                self.state = HandshakeState::Failed;
                let mut payload = BytesMut::new();
                pack_short_string(err.type_name(), &mut payload);
                pack_short_string(err.message(), &mut payload);
                DecodedPacket {
                    protocol_id: ProtocolId::HandshakeFailed,
                    reliable: true,
                    payload: payload.freeze(),
                }
            }
            None => {
                self.state = HandshakeState::Connected;
                DecodedPacket {
                    protocol_id: ProtocolId::HandshakeSuccess,
                    reliable: true,
                    payload: Bytes::new(),
                }
            }
        }
    }

    /// Call once the `handshake_failed` packet has been acked: tears down
    /// the connection.
    pub fn on_ack_handshake_failed(&mut self) {
        self.state = HandshakeState::Failed;
    }

    pub fn receive_disconnect_request(&mut self) {
        self.state = HandshakeState::Disconnected;
    }

    pub fn on_timeout(&mut self) {
        self.state = HandshakeState::TimedOut;
    }
}

impl Default for ServerHandshake {
    fn default() -> Self {
        Self::new().0
    }
}

/// Client-side handshake stream.
pub struct ClientHandshake {
    pub state: HandshakeState,
}

impl ClientHandshake {
    /// Immediately sends a reliable `request_handshake` carrying the
    /// client's netmode byte, so the server can reject a peer that
    /// identifies itself as another server.
    pub fn new() -> (Self, DecodedPacket) {
        let stream = Self {
            state: HandshakeState::ReceivedHandshake,
        };
        let packet = DecodedPacket {
            protocol_id: ProtocolId::HandshakeRequest,
            reliable: true,
            payload: Bytes::copy_from_slice(&[Netmode::Client.to_byte()]),
        };
        (stream, packet)
    }

    pub fn receive_handshake_success(&mut self) -> bool {
        if self.state != HandshakeState::ReceivedHandshake {
            return false;
        }
        self.state = HandshakeState::Connected;
        true
    }

    /// Re-issues the handshake request in response to a server multicast.
    pub fn receive_multicast_ping(&mut self) -> DecodedPacket {
        self.state = HandshakeState::ReceivedHandshake;
        DecodedPacket {
            protocol_id: ProtocolId::HandshakeRequest,
            reliable: true,
            payload: Bytes::copy_from_slice(&[Netmode::Client.to_byte()]),
        }
    }

    pub fn receive_handshake_failed(&mut self, payload: &[u8]) -> Result<NetworkError, crate::errors::DecodeError> {
        let (type_name, read) = unpack_short_string(payload).map_err(|e| crate::errors::DecodeError::MalformedDatagram(e.to_string()))?;
        let (message, _) = unpack_short_string(&payload[read..]).map_err(|e| crate::errors::DecodeError::MalformedDatagram(e.to_string()))?;

        self.state = HandshakeState::Failed;
        NetworkError::from_type_name(&type_name, message)
            .ok_or_else(|| crate::errors::DecodeError::MalformedDatagram(format!("unknown error type {type_name}")))
    }

    pub fn on_timeout(&mut self) {
        self.state = HandshakeState::TimedOut;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_handshake_success_path() {
        let (mut server, invoke) = ServerHandshake::new();
        assert_eq!(invoke.protocol_id, ProtocolId::InvokeHandshake);

        let reply = server.receive_handshake_request(Ok(()));
        assert_eq!(reply.protocol_id, ProtocolId::HandshakeSuccess);
        assert_eq!(server.state, HandshakeState::Connected);
    }

    #[test]
    fn server_handshake_failure_path_then_ack_tears_down() {
        let (mut server, _) = ServerHandshake::new();
        let reply = server.receive_handshake_request(Err(NetworkError::PlayerLimitReached("full".to_string())));
        assert_eq!(reply.protocol_id, ProtocolId::HandshakeFailed);
        assert_eq!(server.state, HandshakeState::Failed);

        server.on_ack_handshake_failed();
        assert_eq!(server.state, HandshakeState::Failed);
    }

    #[test]
    fn client_handshake_round_trips_failure_payload() {
        let (mut server, _) = ServerHandshake::new();
        let reply = server.receive_handshake_request(Err(NetworkError::Blacklisted("banned".to_string())));

        let (mut client, _) = ClientHandshake::new();
        let err = client.receive_handshake_failed(&reply.payload).unwrap();
        assert_eq!(err, NetworkError::Blacklisted("banned".to_string()));
        assert_eq!(client.state, HandshakeState::Failed);
    }

    #[test]
    fn client_handshake_connects_on_success() {
        let (mut client, _) = ClientHandshake::new();
        assert!(client.receive_handshake_success());
        assert_eq!(client.state, HandshakeState::Connected);
    }

    #[test]
    fn request_handshake_carries_the_client_netmode_byte() {
        let (_client, request) = ClientHandshake::new();
        assert_eq!(parse_request_netmode(&request.payload), Netmode::Client);
    }

    #[test]
    fn multicast_reissue_also_carries_the_netmode_byte() {
        let (mut client, _) = ClientHandshake::new();
        let reissued = client.receive_multicast_ping();
        assert_eq!(parse_request_netmode(&reissued.payload), Netmode::Client);
    }

    #[test]
    fn missing_netmode_byte_defaults_to_client() {
        assert_eq!(parse_request_netmode(&[]), Netmode::Client);
    }

    #[test]
    fn peer_is_server_is_reachable_through_handshake_failed() {
        let (mut server, _) = ServerHandshake::new();
        let reply = server.receive_handshake_request(Err(NetworkError::PeerIsServer("server-to-server".to_string())));
        assert_eq!(reply.protocol_id, ProtocolId::HandshakeFailed);

        let (mut client, _) = ClientHandshake::new();
        let err = client.receive_handshake_failed(&reply.payload).unwrap();
        assert_eq!(err, NetworkError::PeerIsServer("server-to-server".to_string()));
    }
}
