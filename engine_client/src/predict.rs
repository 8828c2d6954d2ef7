//! Client-side prediction and reconciliation.
//!
//! The predictor integrates input locally the moment it's sampled (so the
//! player's own pawn never waits on a round trip), remembers every move it
//! has sent, and replays the backlog from a corrected move forward whenever
//! the server reports a divergence. Grounded on
//! `original_source/game_system/controllers.py`'s move loop and
//! `bge_network/controllers.py`'s correction-replay shape.

use std::collections::VecDeque;

use engine_shared::math::Vec3;
use engine_shared::movement::{integrate, is_move_newer, next_move_id, Correction, InputState, PlayerMove};

/// How many of the most recently sent moves are attached to each outgoing
/// `PlayerMove` as a resend guard against a dropped unreliable packet.
const RESEND_BACKLOG: usize = 5;

struct SentMove {
    move_id: u32,
    input: InputState,
}

/// Per-pawn predicted movement state, owned by the connection driving that
/// pawn.
pub struct Predictor {
    move_id: u32,
    last_correction_id: u32,
    sent: VecDeque<SentMove>,
    recent_capacity: usize,
    position: Vec3,
    yaw: f32,
}

impl Predictor {
    pub fn new() -> Self {
        Self {
            move_id: 0,
            last_correction_id: 0,
            sent: VecDeque::new(),
            recent_capacity: RESEND_BACKLOG * 4,
            position: Vec3::ZERO,
            yaw: 0.0,
        }
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    /// Integrates `input` against the predicted pose, records it, and
    /// returns the `PlayerMove` to upload to the server.
    pub fn sample(&mut self, input: InputState, dt: f32) -> PlayerMove {
        let (position, yaw) = integrate(self.position, self.yaw, &input, dt);
        self.position = position;
        self.yaw = yaw;

        let move_id = self.move_id;
        self.sent.push_back(SentMove {
            move_id,
            input: input.clone(),
        });
        while self.sent.len() > self.recent_capacity {
            self.sent.pop_front();
        }

        let recent_states = self
            .sent
            .iter()
            .rev()
            .take(RESEND_BACKLOG)
            .map(|m| m.input.clone())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        self.move_id = next_move_id(self.move_id);

        PlayerMove {
            move_id,
            latest_correction_id: self.last_correction_id,
            recent_states,
            position: self.position,
            yaw: self.yaw,
        }
    }

    /// Applies a server correction, if it's newer than the last one applied:
    /// snaps to the corrected pose and replays every stored input sent since
    /// that move forward, at the same fixed timestep they were originally
    /// sampled with.
    pub fn apply_correction(&mut self, correction: &Correction, dt: f32) {
        if !is_move_newer(self.last_correction_id, correction.move_id) && correction.move_id != 0 {
            return;
        }
        self.last_correction_id = correction.move_id;
        self.position = correction.position;
        self.yaw = correction.yaw;

        let replay: Vec<InputState> = self
            .sent
            .iter()
            .filter(|m| is_move_newer(correction.move_id, m.move_id))
            .map(|m| m.input.clone())
            .collect();

        for input in replay {
            let (position, yaw) = integrate(self.position, self.yaw, &input, dt);
            self.position = position;
            self.yaw = yaw;
        }
    }
}

impl Default for Predictor {
    fn default() -> Self {
        Self::new()
    }
}
