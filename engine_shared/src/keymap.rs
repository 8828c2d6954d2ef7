//! Keybinding configuration: `name = integer_keycode` text format with a
//! `[defaults]` section clients interpolate missing bindings from.
//!
//! Grounded on `console.rs`'s token-parsing style (line-oriented, `#`
//! comments, `key = value`); the section-header handling is new but follows
//! the same manual-parser approach rather than pulling in a TOML crate for
//! a format this small.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeymapError {
    #[error("line {line}: expected `name = keycode`")]
    BadLine { line: usize },
    #[error("line {line}: keycode `{value}` is not an integer")]
    BadKeycode { line: usize, value: String },
}

/// A logical button name mapped to a native device keycode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keymap {
    bindings: HashMap<String, i32>,
}

impl Keymap {
    /// Parses a keymap from text with an optional `[defaults]` section.
    /// Bindings outside any section (or in a section other than
    /// `[defaults]`) override defaults of the same name; entries under
    /// `[defaults]` are used only to fill names left unbound elsewhere.
    pub fn parse(text: &str) -> Result<Self, KeymapError> {
        let mut defaults = HashMap::new();
        let mut overrides = HashMap::new();
        let mut in_defaults = false;

        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                in_defaults = line.trim_matches(['[', ']']).eq_ignore_ascii_case("defaults");
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                return Err(KeymapError::BadLine { line: idx + 1 });
            };
            let name = name.trim().to_string();
            let value = value.trim();
            let keycode: i32 = value.parse().map_err(|_| KeymapError::BadKeycode {
                line: idx + 1,
                value: value.to_string(),
            })?;

            if in_defaults {
                defaults.insert(name, keycode);
            } else {
                overrides.insert(name, keycode);
            }
        }

        let mut bindings = defaults;
        bindings.extend(overrides);
        Ok(Self { bindings })
    }

    pub fn keycode_for(&self, button: &str) -> Option<i32> {
        self.bindings.get(button).copied()
    }

    /// Reverse lookup: the logical button name bound to a native keycode,
    /// used to remap a raw input device event into a button name.
    pub fn button_for_keycode(&self, keycode: i32) -> Option<&str> {
        self.bindings
            .iter()
            .find(|(_, code)| **code == keycode)
            .map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
