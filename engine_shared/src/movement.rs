//! Shared input/move wire types for the prediction and reconciliation loop.
//!
//! Grounded on `original_source/game_system/controllers.py` (input sampling
//! and the move record) and `bge_network/controllers.py` (the
//! `move_id`/`recent_states` resend-guard shape); the packed tri-state
//! bitfield layout is new, following the 2-bits-per-flag convention the
//! design notes call for.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::DecodeError;
use crate::serialise::{pack_short_string, unpack_short_string};

/// `move_id` wraps modulo 1000, per the design notes.
pub const MOVE_ID_MODULUS: u32 = 1000;

/// Per-button state for one sampled tick. `None` is never transmitted: its
/// absence from an [`InputState`]'s button map *is* the "none" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    Pressed,
    Held,
    Released,
}

impl ButtonState {
    fn to_bits(self) -> u8 {
        match self {
            ButtonState::Pressed => 0b01,
            ButtonState::Held => 0b10,
            ButtonState::Released => 0b11,
        }
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0b01 => Some(ButtonState::Pressed),
            0b10 => Some(ButtonState::Held),
            0b11 => Some(ButtonState::Released),
            _ => None,
        }
    }
}

/// One tick's sampled input: named button tri-states plus named analogue
/// ranges, already remapped from native device codes to logical names by
/// the client's keymap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputState {
    buttons: BTreeMap<String, ButtonState>,
    ranges: BTreeMap<String, f32>,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_button(&mut self, name: impl Into<String>, state: ButtonState) {
        self.buttons.insert(name.into(), state);
    }

    pub fn set_range(&mut self, name: impl Into<String>, value: f32) {
        self.ranges.insert(name.into(), value);
    }

    pub fn button(&self, name: &str) -> Option<ButtonState> {
        self.buttons.get(name).copied()
    }

    pub fn range(&self, name: &str) -> f32 {
        self.ranges.get(name).copied().unwrap_or(0.0)
    }

    pub fn buttons(&self) -> impl Iterator<Item = (&str, ButtonState)> {
        self.buttons.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Packs buttons as a 2-bits-per-entry bitmask (padded to whole bytes)
    /// preceded by a u16 count, each entry a length-prefixed name then its
    /// 2-bit state; then ranges as a u16 count of (name, f32) pairs.
    pub fn pack(&self, buf: &mut BytesMut) {
        buf.put_u16(self.buttons.len() as u16);
        let byte_len = (self.buttons.len() * 2 + 7) / 8;
        let mut packed = vec![0u8; byte_len];
        for (i, (name, state)) in self.buttons.iter().enumerate() {
            pack_short_string(name, buf);
            let bit_index = i * 2;
            packed[bit_index / 8] |= state.to_bits() << (bit_index % 8);
        }
        buf.put_slice(&packed);

        buf.put_u16(self.ranges.len() as u16);
        for (name, value) in &self.ranges {
            pack_short_string(name, buf);
            buf.put_f32(*value);
        }
    }

    pub fn unpack(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        let mut offset = 0;
        let bad = |reason: &str| DecodeError::SerialisationFailure {
            what: "InputState".to_string(),
            reason: reason.to_string(),
        };

        if data.len() < offset + 2 {
            return Err(bad("truncated button count"));
        }
        let button_count = (&data[offset..offset + 2]).get_u16() as usize;
        offset += 2;

        let mut names = Vec::with_capacity(button_count);
        for _ in 0..button_count {
            let (name, read) = unpack_short_string(&data[offset..]).map_err(|e| bad(&e.to_string()))?;
            offset += read;
            names.push(name);
        }

        let byte_len = (button_count * 2 + 7) / 8;
        if data.len() < offset + byte_len {
            return Err(bad("truncated button bitmask"));
        }
        let packed = &data[offset..offset + byte_len];
        offset += byte_len;

        let mut buttons = BTreeMap::new();
        for (i, name) in names.into_iter().enumerate() {
            let bit_index = i * 2;
            let bits = (packed[bit_index / 8] >> (bit_index % 8)) & 0b11;
            if let Some(state) = ButtonState::from_bits(bits) {
                buttons.insert(name, state);
            }
        }

        if data.len() < offset + 2 {
            return Err(bad("truncated range count"));
        }
        let range_count = (&data[offset..offset + 2]).get_u16() as usize;
        offset += 2;

        let mut ranges = BTreeMap::new();
        for _ in 0..range_count {
            let (name, read) = unpack_short_string(&data[offset..]).map_err(|e| bad(&e.to_string()))?;
            offset += read;
            if data.len() < offset + 4 {
                return Err(bad("truncated range value"));
            }
            let value = (&data[offset..offset + 4]).get_f32();
            offset += 4;
            ranges.insert(name, value);
        }

        Ok((Self { buttons, ranges }, offset))
    }
}

/// A client-reported move: the input applied plus the client's resulting
/// pose, sent alongside a short backlog of recent states to guard against a
/// dropped unreliable move packet.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerMove {
    pub move_id: u32,
    pub latest_correction_id: u32,
    pub recent_states: Vec<InputState>,
    pub position: crate::math::Vec3,
    pub yaw: f32,
}

impl PlayerMove {
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(self.move_id as u16);
        buf.put_u16(self.latest_correction_id as u16);
        buf.put_u8(self.recent_states.len() as u8);
        for state in &self.recent_states {
            state.pack(&mut buf);
        }
        buf.put_f32(self.position.x);
        buf.put_f32(self.position.y);
        buf.put_f32(self.position.z);
        buf.put_f32(self.yaw);
        buf.freeze()
    }

    /// Returns the decoded move alongside the number of bytes consumed, so
    /// callers can advance past it in a contiguous run of RPC calls.
    pub fn unpack(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        let bad = |reason: &str| DecodeError::SerialisationFailure {
            what: "PlayerMove".to_string(),
            reason: reason.to_string(),
        };
        if data.len() < 5 {
            return Err(bad("truncated header"));
        }
        let move_id = (&data[0..2]).get_u16() as u32;
        let latest_correction_id = (&data[2..4]).get_u16() as u32;
        let count = data[4] as usize;
        let mut offset = 5;

        let mut recent_states = Vec::with_capacity(count);
        for _ in 0..count {
            let (state, read) = InputState::unpack(&data[offset..])?;
            offset += read;
            recent_states.push(state);
        }

        if data.len() < offset + 16 {
            return Err(bad("truncated pose"));
        }
        let mut rest = &data[offset..offset + 16];
        let x = rest.get_f32();
        let y = rest.get_f32();
        let z = rest.get_f32();
        let yaw = rest.get_f32();
        offset += 16;

        Ok((
            Self {
                move_id,
                latest_correction_id,
                recent_states,
                position: crate::math::Vec3::new(x, y, z),
                yaw,
            },
            offset,
        ))
    }

    /// The `move_id` each entry in `recent_states` corresponds to, oldest
    /// first, ending at `move_id` itself. The backlog is built from
    /// consecutive sampled moves (see `engine_client::predict::Predictor`),
    /// so an entry's id is recoverable from its offset from the top-level
    /// `move_id` without shipping it on the wire.
    pub fn recent_move_ids(&self) -> Vec<u32> {
        let n = self.recent_states.len();
        (0..n)
            .map(|i| {
                let offset = (n - 1 - i) as u32;
                (self.move_id + MOVE_ID_MODULUS - offset % MOVE_ID_MODULUS) % MOVE_ID_MODULUS
            })
            .collect()
    }
}

/// Advances a `move_id`, wrapping modulo [`MOVE_ID_MODULUS`].
pub fn next_move_id(current: u32) -> u32 {
    (current + 1) % MOVE_ID_MODULUS
}

/// True if `candidate` comes strictly after `base` in the modular move_id
/// sequence (wrap-aware half-range comparison, shared by the predictor's
/// correction replay and the server's jitter buffer).
pub fn is_move_newer(base: u32, candidate: u32) -> bool {
    let half = MOVE_ID_MODULUS / 2;
    let diff = (candidate + MOVE_ID_MODULUS - base) % MOVE_ID_MODULUS;
    diff != 0 && diff < half
}

/// Units per second at full forward/strafe range.
pub const MOVE_SPEED: f32 = 5.0;
/// Radians per second at full turn range.
pub const TURN_SPEED: f32 = std::f32::consts::PI;

/// Deterministic kinematic step shared by client prediction and server
/// validation: both must produce the same pose from the same input for a
/// move to be predictable at all. Reads the `"forward"`, `"right"`, and
/// `"turn"` ranges; any input lacking them simply doesn't move/turn on that
/// axis.
pub fn integrate(position: crate::math::Vec3, yaw: f32, input: &InputState, dt: f32) -> (crate::math::Vec3, f32) {
    let forward = input.range("forward").clamp(-1.0, 1.0);
    let strafe = input.range("right").clamp(-1.0, 1.0);
    let turn = input.range("turn").clamp(-1.0, 1.0);

    let new_yaw = yaw + turn * TURN_SPEED * dt;
    let (sin, cos) = new_yaw.sin_cos();
    let dx = (forward * cos - strafe * sin) * MOVE_SPEED * dt;
    let dz = (forward * sin + strafe * cos) * MOVE_SPEED * dt;

    (
        crate::math::Vec3::new(position.x + dx, position.y, position.z + dz),
        new_yaw,
    )
}

/// Server-to-client `client_correct_move` payload: authoritative pose for a
/// move_id the client mispredicted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub move_id: u32,
    pub position: crate::math::Vec3,
    pub yaw: f32,
    pub velocity: crate::math::Vec3,
    pub angular_yaw: f32,
}

impl Correction {
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(self.move_id as u16);
        buf.put_f32(self.position.x);
        buf.put_f32(self.position.y);
        buf.put_f32(self.position.z);
        buf.put_f32(self.yaw);
        buf.put_f32(self.velocity.x);
        buf.put_f32(self.velocity.y);
        buf.put_f32(self.velocity.z);
        buf.put_f32(self.angular_yaw);
        buf.freeze()
    }

    /// Fixed-width 34 bytes; returns the decoded correction alongside that
    /// constant consumed length for contiguous-run RPC decoding.
    pub fn unpack(data: &[u8]) -> Result<(Self, usize), DecodeError> {
        if data.len() < 34 {
            return Err(DecodeError::SerialisationFailure {
                what: "Correction".to_string(),
                reason: "truncated".to_string(),
            });
        }
        let mut rest = &data[..34];
        let move_id = rest.get_u16() as u32;
        let x = rest.get_f32();
        let y = rest.get_f32();
        let z = rest.get_f32();
        let yaw = rest.get_f32();
        let vx = rest.get_f32();
        let vy = rest.get_f32();
        let vz = rest.get_f32();
        let angular_yaw = rest.get_f32();
        Ok((
            Self {
                move_id,
                position: crate::math::Vec3::new(x, y, z),
                yaw,
                velocity: crate::math::Vec3::new(vx, vy, vz),
                angular_yaw,
            },
            34,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vec3;

    #[test]
    fn input_state_roundtrips_buttons_and_ranges() {
        let mut input = InputState::new();
        input.set_button("fire", ButtonState::Pressed);
        input.set_button("jump", ButtonState::Released);
        input.set_range("forward", 0.75);

        let mut buf = BytesMut::new();
        input.pack(&mut buf);
        let (decoded, read) = InputState::unpack(&buf).unwrap();
        assert_eq!(read, buf.len());
        assert_eq!(decoded.button("fire"), Some(ButtonState::Pressed));
        assert_eq!(decoded.button("jump"), Some(ButtonState::Released));
        assert_eq!(decoded.button("crouch"), None);
        assert_eq!(decoded.range("forward"), 0.75);
    }

    #[test]
    fn player_move_roundtrips() {
        let mut input = InputState::new();
        input.set_button("fire", ButtonState::Held);
        let mv = PlayerMove {
            move_id: 42,
            latest_correction_id: 10,
            recent_states: vec![input.clone(), input],
            position: Vec3::new(1.0, 2.0, 3.0),
            yaw: 0.5,
        };
        let packed = mv.pack();
        let (decoded, read) = PlayerMove::unpack(&packed).unwrap();
        assert_eq!(read, packed.len());
        assert_eq!(decoded, mv);
    }

    #[test]
    fn correction_roundtrips_and_reports_fixed_width() {
        let correction = Correction {
            move_id: 7,
            position: Vec3::new(1.0, 2.0, 3.0),
            yaw: 0.25,
            velocity: Vec3::new(0.1, 0.0, -0.2),
            angular_yaw: 1.5,
        };
        let packed = correction.pack();
        let (decoded, read) = Correction::unpack(&packed).unwrap();
        assert_eq!(read, 34);
        assert_eq!(decoded, correction);
    }

    #[test]
    fn move_id_wraps_at_modulus() {
        assert_eq!(next_move_id(999), 0);
        assert_eq!(next_move_id(5), 6);
    }

    #[test]
    fn recent_move_ids_are_consecutive_ending_at_move_id() {
        let input = InputState::new();
        let mv = PlayerMove {
            move_id: 7,
            latest_correction_id: 0,
            recent_states: vec![input.clone(), input.clone(), input],
            position: Vec3::ZERO,
            yaw: 0.0,
        };
        assert_eq!(mv.recent_move_ids(), vec![5, 6, 7]);
    }

    #[test]
    fn recent_move_ids_wrap_around_the_modulus() {
        let input = InputState::new();
        let mv = PlayerMove {
            move_id: 1,
            latest_correction_id: 0,
            recent_states: vec![input.clone(), input.clone(), input],
            position: Vec3::ZERO,
            yaw: 0.0,
        };
        assert_eq!(mv.recent_move_ids(), vec![999, 0, 1]);
    }

    #[test]
    fn is_move_newer_handles_wrap_and_equality() {
        assert!(is_move_newer(998, 0));
        assert!(!is_move_newer(5, 5));
        assert!(!is_move_newer(5, 0));
        assert!(is_move_newer(5, 6));
    }

    #[test]
    fn integrate_moves_forward_along_zero_yaw() {
        let mut input = InputState::new();
        input.set_range("forward", 1.0);
        let (pos, yaw) = integrate(Vec3::ZERO, 0.0, &input, 1.0);
        assert_eq!(yaw, 0.0);
        assert!((pos.x - MOVE_SPEED).abs() < 1e-5);
        assert_eq!(pos.z, 0.0);
    }

    #[test]
    fn integrate_with_no_input_is_a_no_op() {
        let input = InputState::new();
        let (pos, yaw) = integrate(Vec3::new(1.0, 2.0, 3.0), 0.5, &input, 0.5);
        assert_eq!(pos, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(yaw, 0.5);
    }
}
