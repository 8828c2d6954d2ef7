//! Input handling.
//!
//! Raw device key events come in as native keycodes; the sampler remaps them
//! through a [`Keymap`] into named tri-state buttons, then derives the
//! analogue "forward"/"right"/"turn" ranges [`engine_shared::movement`]
//! expects from fixed named button pairs. Grounded on
//! `original_source/game_system/controllers.py`'s input-to-move mapping.

use std::collections::HashSet;

use engine_shared::keymap::Keymap;
use engine_shared::movement::{ButtonState, InputState};

/// `(axis name, positive button, negative button)`. A name not present in
/// the keymap simply never contributes to its axis.
const AXES: &[(&str, &str, &str)] = &[
    ("forward", "forward", "back"),
    ("right", "right", "left"),
    ("turn", "turnright", "turnleft"),
];

/// Samples a [`Keymap`]-driven input device into per-tick [`InputState`]s.
pub struct InputSampler {
    keymap: Keymap,
    down: HashSet<String>,
    previous_down: HashSet<String>,
}

impl InputSampler {
    pub fn new(keymap: Keymap) -> Self {
        Self {
            keymap,
            down: HashSet::new(),
            previous_down: HashSet::new(),
        }
    }

    /// Feeds one native key transition. Keycodes the keymap doesn't bind are
    /// ignored.
    pub fn on_key_event(&mut self, keycode: i32, pressed: bool) {
        let Some(button) = self.keymap.button_for_keycode(keycode) else {
            return;
        };
        let button = button.to_string();
        if pressed {
            self.down.insert(button);
        } else {
            self.down.remove(&button);
        }
    }

    /// Presses a named button directly (for a synthetic/headless harness
    /// with no real device to remap from).
    pub fn press(&mut self, button: impl Into<String>) {
        self.down.insert(button.into());
    }

    pub fn release(&mut self, button: &str) {
        self.down.remove(button);
    }

    fn axis_value(&self, positive: &str, negative: &str) -> f32 {
        let p = if self.down.contains(positive) { 1.0 } else { 0.0 };
        let n = if self.down.contains(negative) { 1.0 } else { 0.0 };
        p - n
    }

    /// Builds this tick's [`InputState`]: every held button gets a tri-state
    /// (`Pressed` the first tick it's down, `Held` afterward, `Released` the
    /// one tick it's released) plus the derived movement ranges.
    pub fn sample(&mut self) -> InputState {
        let mut input = InputState::new();

        for button in &self.down {
            let state = if self.previous_down.contains(button) {
                ButtonState::Held
            } else {
                ButtonState::Pressed
            };
            input.set_button(button.clone(), state);
        }
        for button in self.previous_down.difference(&self.down) {
            input.set_button(button.clone(), ButtonState::Released);
        }

        for (axis, positive, negative) in AXES {
            input.set_range(*axis, self.axis_value(positive, negative));
        }

        self.previous_down = self.down.clone();
        input
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler() -> InputSampler {
        let keymap = Keymap::parse("forward = 87\nback = 83\nfire = 1\n").unwrap();
        InputSampler::new(keymap)
    }

    #[test]
    fn unbound_keycode_is_ignored() {
        let mut sampler = sampler();
        sampler.on_key_event(999, true);
        let input = sampler.sample();
        assert_eq!(input.buttons().count(), 0);
    }

    #[test]
    fn button_transitions_through_pressed_held_released() {
        let mut sampler = sampler();
        sampler.on_key_event(1, true);
        assert_eq!(sampler.sample().button("fire"), Some(ButtonState::Pressed));
        assert_eq!(sampler.sample().button("fire"), Some(ButtonState::Held));
        sampler.on_key_event(1, false);
        assert_eq!(sampler.sample().button("fire"), Some(ButtonState::Released));
        assert_eq!(sampler.sample().button("fire"), None);
    }

    #[test]
    fn forward_axis_reflects_held_button() {
        let mut sampler = sampler();
        sampler.on_key_event(87, true);
        assert_eq!(sampler.sample().range("forward"), 1.0);
        sampler.on_key_event(87, false);
        sampler.on_key_event(83, true);
        assert_eq!(sampler.sample().range("forward"), -1.0);
    }

    #[test]
    fn press_and_release_helpers_bypass_the_keymap() {
        let mut sampler = sampler();
        sampler.press("jump");
        assert_eq!(sampler.sample().button("jump"), Some(ButtonState::Pressed));
        sampler.release("jump");
        assert_eq!(sampler.sample().button("jump"), Some(ButtonState::Released));
    }
}
