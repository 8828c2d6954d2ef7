//! Error kinds shared by the transport, handshake, and replication layers.
//!
//! See the error table in the design notes: most of these are logged and
//! the offending item is dropped rather than propagated, so callers should
//! generally match on the variant rather than bailing with `?`.

use thiserror::Error;

/// Errors raised while establishing or tearing down a connection.
///
/// These are the four kinds `Rules::pre_initialise` may raise; their type
/// name (via [`NetworkError::type_name`]) is what gets sent to the client
/// in a `handshake_failed` packet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("player limit reached: {0}")]
    PlayerLimitReached(String),
    #[error("blacklisted: {0}")]
    Blacklisted(String),
    #[error("peer is a server: {0}")]
    PeerIsServer(String),
}

impl NetworkError {
    /// Stable type name used on the wire and for `from_type_name` round-trips.
    pub fn type_name(&self) -> &'static str {
        match self {
            NetworkError::AuthenticationFailed(_) => "AuthenticationFailed",
            NetworkError::PlayerLimitReached(_) => "PlayerLimitReached",
            NetworkError::Blacklisted(_) => "Blacklisted",
            NetworkError::PeerIsServer(_) => "PeerIsServer",
        }
    }

    /// Human-readable message, as sent in the second length-prefixed string.
    pub fn message(&self) -> &str {
        match self {
            NetworkError::AuthenticationFailed(m)
            | NetworkError::PlayerLimitReached(m)
            | NetworkError::Blacklisted(m)
            | NetworkError::PeerIsServer(m) => m,
        }
    }

    /// Reconstructs an error from its wire type name and message.
    pub fn from_type_name(type_name: &str, message: impl Into<String>) -> Option<Self> {
        let message = message.into();
        match type_name {
            "AuthenticationFailed" => Some(NetworkError::AuthenticationFailed(message)),
            "PlayerLimitReached" => Some(NetworkError::PlayerLimitReached(message)),
            "Blacklisted" => Some(NetworkError::Blacklisted(message)),
            "PeerIsServer" => Some(NetworkError::PeerIsServer(message)),
            _ => None,
        }
    }
}

/// Decode-time errors. None of these should ever propagate across a tick
/// boundary; callers log and drop per the policy table.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed datagram: {0}")]
    MalformedDatagram(String),
    #[error("unknown protocol id {0}")]
    UnknownProtocol(u8),
    #[error("unknown replicable id {0}")]
    UnknownReplicableId(u8),
    #[error("unknown function index {0}")]
    UnknownFunctionIndex(u8),
    #[error("serialisation failed for {what}: {reason}")]
    SerialisationFailure { what: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_error_round_trips_by_type_name() {
        let err = NetworkError::PlayerLimitReached("server full".to_string());
        let restored = NetworkError::from_type_name(err.type_name(), err.message()).unwrap();
        assert_eq!(err, restored);
    }
}
