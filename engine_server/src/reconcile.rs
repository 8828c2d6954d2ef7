//! Server-authoritative move reconciliation.
//!
//! After the server steps physics for a client's validated move, it compares
//! its own resulting pose against the pose the client reported for that same
//! move. A small divergence is expected (floating point drift, minor
//! misprediction) and ignored; a divergence past the thresholds below means
//! the client simulated wrongly and must be corrected. Grounded on
//! `original_source/game_system/controllers.py`'s `process_move` /
//! `correct_move` pair and `bge_network/controllers.py`'s error-squared
//! comparison.

use engine_shared::math::Vec3;
pub use engine_shared::movement::Correction;

/// Squared position error beyond which the server corrects the client.
pub const MAX_POSITION_ERROR_SQUARED: f32 = 0.5;

/// Squared yaw error (radians) beyond which the server corrects the client,
/// derived from a 5 degree tolerance.
pub const MAX_ORIENTATION_ANGLE_ERROR_SQUARED: f32 = {
    const DEG5_RAD: f32 = 5.0 * std::f32::consts::PI / 180.0;
    DEG5_RAD * DEG5_RAD
};

/// The server's own post-step pose for a validated move, to compare against
/// what the client reported for the same `move_id`.
#[derive(Debug, Clone, Copy)]
pub struct ServerMoveResult {
    pub move_id: u32,
    pub position: Vec3,
    pub yaw: f32,
    pub velocity: Vec3,
    pub angular_yaw: f32,
}

/// Tracks the last move_id a correction was issued for, so repeated
/// corrections for the same root cause aren't sent every tick.
#[derive(Debug, Default)]
pub struct Reconciler {
    pub last_corrected_move_id: Option<u32>,
}

fn squared_distance(a: Vec3, b: Vec3) -> f32 {
    let d = Vec3::new(a.x - b.x, a.y - b.y, a.z - b.z);
    d.len_sq()
}

/// Minimum wrap-around angular distance between two yaws, in radians.
fn yaw_error(a: f32, b: f32) -> f32 {
    let two_pi = std::f32::consts::PI * 2.0;
    let mut diff = (a - b) % two_pi;
    if diff > std::f32::consts::PI {
        diff -= two_pi;
    } else if diff < -std::f32::consts::PI {
        diff += two_pi;
    }
    diff
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compares the server's post-step pose against the client-reported one
    /// for the same move and returns a correction if they've diverged past
    /// tolerance.
    pub fn check(
        &mut self,
        server_result: ServerMoveResult,
        client_position: Vec3,
        client_yaw: f32,
    ) -> Option<Correction> {
        let position_error = squared_distance(server_result.position, client_position);
        let angle_error = yaw_error(server_result.yaw, client_yaw);
        let angle_error_sq = angle_error * angle_error;

        if position_error <= MAX_POSITION_ERROR_SQUARED
            && angle_error_sq <= MAX_ORIENTATION_ANGLE_ERROR_SQUARED
        {
            return None;
        }

        self.last_corrected_move_id = Some(server_result.move_id);
        Some(Correction {
            move_id: server_result.move_id,
            position: server_result.position,
            yaw: server_result.yaw,
            velocity: server_result.velocity,
            angular_yaw: server_result.angular_yaw,
        })
    }
}
