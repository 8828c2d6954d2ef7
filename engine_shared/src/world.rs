//! Netmode, the `Rules` collaborator trait, and the top-level `World`.

use async_trait::async_trait;

use crate::errors::NetworkError;
use crate::replicable::{Replicable, ReplicableId, Role};
use crate::scene::Scene;

/// Which peer kind a replicated function targets, and which kind of process
/// a handshaking peer identifies itself as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Netmode {
    Server,
    Client,
}

impl Netmode {
    /// The single byte a `request_handshake` packet carries to identify its
    /// sender's netmode.
    pub fn to_byte(self) -> u8 {
        match self {
            Netmode::Server => 0,
            Netmode::Client => 1,
        }
    }

    /// Defaults to `Client` for any value other than the server's byte, so a
    /// truncated or missing payload still handshakes as a regular peer
    /// rather than spuriously tripping the peer-is-server rejection.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Netmode::Server,
            _ => Netmode::Client,
        }
    }
}

/// Game-specific policy hooks consulted by connection setup/teardown and by
/// relevance filtering. A server supplies one implementation; a client may
/// supply a permissive stub.
#[async_trait]
pub trait Rules: Send + Sync {
    /// Called before a handshake is accepted, with the netmode byte the peer
    /// reported in its `request_handshake`. Returning `Err` rejects the
    /// connection and the error's type name is sent back as the failure
    /// reason. The core itself rejects a peer reporting `Netmode::Server`
    /// before this is ever called; by the time `Rules` sees a request, the
    /// netmode is informational (logging, per-netmode policy) rather than a
    /// gate it still needs to enforce.
    async fn pre_initialise(&self, addr: std::net::SocketAddr, netmode: Netmode) -> Result<(), NetworkError> {
        let _ = (addr, netmode);
        Ok(())
    }

    /// Called once a connection is fully established, so the rules can spawn
    /// the player's pawn/controller pair.
    async fn post_initialise(&self, connection_id: ReplicableId) -> Option<ReplicableId> {
        let _ = connection_id;
        None
    }

    /// Called when a connection is torn down, for clean-up of owned
    /// replicables.
    async fn post_disconnect(&self, connection_id: ReplicableId) {
        let _ = connection_id;
    }

    /// Relevance filter: whether `replicable` should be replicated to the
    /// peer that owns `viewer`. Default: visible whenever role is not `None`.
    fn is_relevant(&self, viewer: Option<&Replicable>, replicable: &Replicable) -> bool {
        let _ = viewer;
        replicable.roles.remote != Role::None
    }
}

/// A `Rules` implementation with no restrictions, used by clients (which do
/// not arbitrate connection acceptance) and in tests.
pub struct PermissiveRules;

#[async_trait]
impl Rules for PermissiveRules {}

/// Top-level container: the single active scene plus the rules collaborator.
/// Mirrors the teacher's single-`World`-per-process design; multiple scenes
/// are a possible extension but out of scope here.
pub struct World {
    pub scene: Scene,
    pub rules: Box<dyn Rules>,
}

impl World {
    pub fn new(rules: Box<dyn Rules>) -> Self {
        Self {
            scene: Scene::new(),
            rules,
        }
    }
}
