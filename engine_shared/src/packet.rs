//! Packet protocol ids and the packet-collection framing used inside a
//! datagram's payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::DecodeError;

/// Protocol discriminants carried by every framed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    HandshakeRequest,
    HandshakeSuccess,
    HandshakeFailed,
    InvokeHandshake,
    DisconnectRequest,
    Heartbeat,
    SceneCreated,
    SceneDestroyed,
    ReplicableCreated,
    ReplicableDestroyed,
    AttributeUpdate,
    RpcInvocation,
}

impl ProtocolId {
    pub fn to_u8(self) -> u8 {
        match self {
            ProtocolId::HandshakeRequest => 0,
            ProtocolId::HandshakeSuccess => 1,
            ProtocolId::HandshakeFailed => 2,
            ProtocolId::InvokeHandshake => 3,
            ProtocolId::DisconnectRequest => 4,
            ProtocolId::Heartbeat => 5,
            ProtocolId::SceneCreated => 6,
            ProtocolId::SceneDestroyed => 7,
            ProtocolId::ReplicableCreated => 8,
            ProtocolId::ReplicableDestroyed => 9,
            ProtocolId::AttributeUpdate => 10,
            ProtocolId::RpcInvocation => 11,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => ProtocolId::HandshakeRequest,
            1 => ProtocolId::HandshakeSuccess,
            2 => ProtocolId::HandshakeFailed,
            3 => ProtocolId::InvokeHandshake,
            4 => ProtocolId::DisconnectRequest,
            5 => ProtocolId::Heartbeat,
            6 => ProtocolId::SceneCreated,
            7 => ProtocolId::SceneDestroyed,
            8 => ProtocolId::ReplicableCreated,
            9 => ProtocolId::ReplicableDestroyed,
            10 => ProtocolId::AttributeUpdate,
            11 => ProtocolId::RpcInvocation,
            _ => return None,
        })
    }
}

/// A single outgoing packet: protocol, body, reliability, and callbacks
/// invoked once the connection's transport resolves its fate.
pub struct Packet {
    pub protocol_id: ProtocolId,
    pub payload: Bytes,
    pub reliable: bool,
    pub on_success: Option<Box<dyn FnOnce() + Send>>,
    pub on_failure: Option<Box<dyn FnOnce() + Send>>,
}

impl Packet {
    pub fn new(protocol_id: ProtocolId, payload: Bytes, reliable: bool) -> Self {
        Self {
            protocol_id,
            payload,
            reliable,
            on_success: None,
            on_failure: None,
        }
    }

    pub fn with_on_success(mut self, cb: Box<dyn FnOnce() + Send>) -> Self {
        self.on_success = Some(cb);
        self
    }

    pub fn with_on_failure(mut self, cb: Box<dyn FnOnce() + Send>) -> Self {
        self.on_failure = Some(cb);
        self
    }
}

/// A decoded packet, stripped of its send-time callbacks.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub protocol_id: ProtocolId,
    pub reliable: bool,
    pub payload: Bytes,
}

/// Encodes a run of packets as `[protocol_id][reliable_flag][u16 len][body]`
/// repeated, until the datagram's payload budget is exhausted.
pub fn encode_collection(packets: &[DecodedPacket], buf: &mut BytesMut) {
    for packet in packets {
        buf.put_u8(packet.protocol_id.to_u8());
        buf.put_u8(packet.reliable as u8);
        buf.put_u16_le(packet.payload.len() as u16);
        buf.put_slice(&packet.payload);
    }
}

/// Decodes a packet collection until the buffer is exhausted. A malformed
/// trailing packet truncates the result rather than failing the whole
/// datagram, per the transport's drop-and-log policy.
pub fn decode_collection(mut data: Bytes) -> Result<Vec<DecodedPacket>, DecodeError> {
    let mut packets = Vec::new();
    while data.remaining() > 0 {
        if data.remaining() < 4 {
            return Err(DecodeError::MalformedDatagram(
                "packet collection truncated before header".to_string(),
            ));
        }
        let protocol_byte = data.get_u8();
        let reliable = data.get_u8() != 0;
        let len = data.get_u16_le() as usize;
        if data.remaining() < len {
            return Err(DecodeError::MalformedDatagram(
                "packet collection body shorter than declared length".to_string(),
            ));
        }
        let payload = data.copy_to_bytes(len);
        let Some(protocol_id) = ProtocolId::from_u8(protocol_byte) else {
            return Err(DecodeError::UnknownProtocol(protocol_byte));
        };
        packets.push(DecodedPacket {
            protocol_id,
            reliable,
            payload,
        });
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_roundtrips_multiple_packets() {
        let packets = vec![
            DecodedPacket {
                protocol_id: ProtocolId::Heartbeat,
                reliable: false,
                payload: Bytes::from_static(&[1, 2, 3]),
            },
            DecodedPacket {
                protocol_id: ProtocolId::AttributeUpdate,
                reliable: true,
                payload: Bytes::new(),
            },
        ];

        let mut buf = BytesMut::new();
        encode_collection(&packets, &mut buf);
        let decoded = decode_collection(buf.freeze()).unwrap();

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].protocol_id, ProtocolId::Heartbeat);
        assert_eq!(decoded[0].payload.as_ref(), &[1, 2, 3]);
        assert!(decoded[1].reliable);
        assert!(decoded[1].payload.is_empty());
    }

    #[test]
    fn unknown_protocol_id_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(250);
        buf.put_u8(0);
        buf.put_u16_le(0);
        let err = decode_collection(buf.freeze()).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownProtocol(250)));
    }
}
