//! `engine_client`
//!
//! Client-side systems:
//! - Connection management over [`engine_shared::connection::Connection`]
//! - Input capture and command generation
//! - Prediction and reconciliation
//! - Interpolation for remote entity states

pub mod client;
pub mod input;
pub mod interp;
pub mod predict;

pub use client::GameClient;
