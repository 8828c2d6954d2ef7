//! Configuration system.
//!
//! Loads engine configuration from JSON strings/files (file IO left to app).

use serde::{Deserialize, Serialize};

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Fixed simulation tick rate.
    pub tick_hz: u32,
    /// Path to the keymap file (client only).
    #[serde(default = "default_keymap_path")]
    pub keymap_path: String,
    /// Player name (client only).
    #[serde(default = "default_player_name")]
    pub player_name: String,
    /// Server only: connections rejected once this many are active.
    #[serde(default = "default_max_players")]
    pub max_players: usize,
    /// Per-connection replication channel period, in milliseconds.
    #[serde(default = "default_replication_update_period_ms")]
    pub replication_update_period_ms: u64,
    /// Starting bandwidth estimate for a new connection, in bytes/second.
    #[serde(default = "default_bandwidth_initial")]
    pub bandwidth_initial: f64,
    /// Additive bandwidth growth applied per sent packet.
    #[serde(default = "default_packet_growth")]
    pub packet_growth: f64,
    /// Seconds without an inbound datagram before a connection times out.
    #[serde(default = "default_timeout_duration_secs")]
    pub timeout_duration_secs: u64,
    /// Server-side jitter buffer depth, in ticks (~0.1s of ticks by default).
    #[serde(default = "default_jitter_buffer_ticks")]
    pub jitter_buffer_ticks: usize,
    /// Squared position error beyond which a client move is corrected.
    #[serde(default = "default_max_position_error_sq")]
    pub max_position_error_sq: f32,
    /// Squared yaw error (radians) beyond which a client move is corrected.
    #[serde(default = "default_max_orientation_error_sq")]
    pub max_orientation_error_sq: f32,
    /// Below this clock drift (seconds) the client applies no correction.
    #[serde(default = "default_correction_nudge_min_secs")]
    pub correction_nudge_min_secs: f64,
    /// Above this clock drift (seconds) the client snaps instead of nudging.
    #[serde(default = "default_correction_nudge_max_secs")]
    pub correction_nudge_max_secs: f64,
}

fn default_keymap_path() -> String {
    "keymap.cfg".to_string()
}

fn default_player_name() -> String {
    "Player".to_string()
}

fn default_max_players() -> usize {
    8
}

fn default_replication_update_period_ms() -> u64 {
    100
}

fn default_bandwidth_initial() -> f64 {
    1000.0
}

fn default_packet_growth() -> f64 {
    500.0
}

fn default_timeout_duration_secs() -> u64 {
    10
}

fn default_jitter_buffer_ticks() -> usize {
    6
}

fn default_max_position_error_sq() -> f32 {
    0.5
}

fn default_max_orientation_error_sq() -> f32 {
    let deg5 = 5.0_f32.to_radians();
    deg5 * deg5
}

fn default_correction_nudge_min_secs() -> f64 {
    0.05
}

fn default_correction_nudge_max_secs() -> f64 {
    0.4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            tick_hz: 64,
            keymap_path: default_keymap_path(),
            player_name: default_player_name(),
            max_players: default_max_players(),
            replication_update_period_ms: default_replication_update_period_ms(),
            bandwidth_initial: default_bandwidth_initial(),
            packet_growth: default_packet_growth(),
            timeout_duration_secs: default_timeout_duration_secs(),
            jitter_buffer_ticks: default_jitter_buffer_ticks(),
            max_position_error_sq: default_max_position_error_sq(),
            max_orientation_error_sq: default_max_orientation_error_sq(),
            correction_nudge_min_secs: default_correction_nudge_min_secs(),
            correction_nudge_max_secs: default_correction_nudge_max_secs(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Fixed timestep duration implied by `tick_hz`.
    pub fn tick_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.tick_hz as f64)
    }

    pub fn replication_update_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.replication_update_period_ms)
    }

    pub fn timeout_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_duration_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_json() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back = EngineConfig::from_json_str(&json).unwrap();
        assert_eq!(back.server_addr, cfg.server_addr);
        assert_eq!(back.tick_hz, cfg.tick_hz);
    }

    #[test]
    fn missing_optional_fields_use_defaults() {
        let cfg = EngineConfig::from_json_str(
            r#"{"server_addr":"127.0.0.1:1","tick_hz":30}"#,
        )
        .unwrap();
        assert_eq!(cfg.keymap_path, "keymap.cfg");
        assert_eq!(cfg.player_name, "Player");
    }
}
