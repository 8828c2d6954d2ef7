//! `engine_server`
//!
//! Server-side replication authority:
//! - Owns the authoritative [`engine_shared::scene::Scene`] and ticks
//!   per-connection replication channels
//! - Runs the reliable-ish UDP transport (`engine_shared::connection`) and
//!   handshake state machine per peer
//! - Dejitters and validates client moves, reconciling mispredicted clients
//! - Rewinds pawn history for lag-compensated hit validation
//!
//! Networking model: everything rides a single UDP socket
//! (`engine_shared::net::GameSocket`), framed per `engine_shared::packet`.

pub mod jitter;
pub mod reconcile;
pub mod rewind;
pub mod server;

pub use server::GameServer;
