//! Keyboard keymap and auto-repeat state
//!
//! The compositor ships a compiled-keymap blob with every keymap event; key
//! state is always derived through the compiled keymap, never tracked by
//! hand. Repeat handling allows exactly one repeating scancode at a time: a
//! new repeatable press replaces the current one, a matching release (or
//! focus loss) disarms it.

use anyhow::{Context as AnyhowContext, Result};
use log::{debug, warn};
use xkbcommon::xkb;

use crate::engine::Modifiers;

/// Offset between evdev scancodes and xkb keycodes
const EVDEV_KEYCODE_OFFSET: u32 = 8;

/// A key resolved through the compiled keymap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub scancode: u32,
    pub keysym: u32,
    /// UTF-8 the key produces under the current modifier state, if any
    pub text: Option<String>,
    /// Whether the keymap marks this key as auto-repeating
    pub repeats: bool,
}

/// Per-seat keyboard state
pub struct KeyboardState {
    context: xkb::Context,
    keymap: Option<xkb::Keymap>,
    state: Option<xkb::State>,
    repeat_rate: u32,
    repeat_delay_ms: u32,
    repeating: Option<u32>,
}

impl KeyboardState {
    /// `repeat_rate` in presses per second, `repeat_delay_ms` before the
    /// first repeat; both are defaults until a repeat-info event arrives
    pub fn new(repeat_rate: u32, repeat_delay_ms: u32) -> Self {
        Self {
            context: xkb::Context::new(xkb::CONTEXT_NO_FLAGS),
            keymap: None,
            state: None,
            repeat_rate,
            repeat_delay_ms,
            repeating: None,
        }
    }

    /// (Re)compiles the keymap from a compositor-supplied blob.
    ///
    /// A malformed blob keeps the previous keymap; dropping all key events
    /// mid-session would be worse than staying on the old layout.
    pub fn load_keymap(&mut self, blob: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(blob)
            .context("Keymap blob is not UTF-8")?
            .trim_end_matches('\0');

        match xkb::Keymap::new_from_string(
            &self.context,
            text.to_string(),
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        ) {
            Some(keymap) => {
                self.state = Some(xkb::State::new(&keymap));
                self.keymap = Some(keymap);
                debug!("Keymap compiled ({} bytes)", blob.len());
                Ok(())
            }
            None => {
                warn!("Keymap compilation failed; keeping the previous keymap");
                anyhow::bail!("xkb rejected the keymap blob");
            }
        }
    }

    pub fn has_keymap(&self) -> bool {
        self.keymap.is_some()
    }

    /// Applies a modifiers event to the live xkb state
    pub fn update_modifiers(&mut self, depressed: u32, latched: u32, locked: u32, group: u32) {
        if let Some(state) = self.state.as_mut() {
            state.update_mask(depressed, latched, locked, 0, 0, group);
        }
    }

    /// Current modifier state as the engine sees it
    pub fn modifiers(&self) -> Modifiers {
        let Some(state) = self.state.as_ref() else {
            return Modifiers::default();
        };
        Modifiers {
            shift: state.mod_name_is_active(xkb::MOD_NAME_SHIFT, xkb::STATE_MODS_EFFECTIVE),
            ctrl: state.mod_name_is_active(xkb::MOD_NAME_CTRL, xkb::STATE_MODS_EFFECTIVE),
            alt: state.mod_name_is_active(xkb::MOD_NAME_ALT, xkb::STATE_MODS_EFFECTIVE),
            logo: state.mod_name_is_active(xkb::MOD_NAME_LOGO, xkb::STATE_MODS_EFFECTIVE),
            caps_lock: state.mod_name_is_active(xkb::MOD_NAME_CAPS, xkb::STATE_MODS_EFFECTIVE),
            num_lock: state.mod_name_is_active(xkb::MOD_NAME_NUM, xkb::STATE_MODS_EFFECTIVE),
        }
    }

    /// Resolves an evdev scancode through the compiled keymap
    pub fn resolve(&self, scancode: u32) -> Option<ResolvedKey> {
        let state = self.state.as_ref()?;
        let keymap = self.keymap.as_ref()?;
        let keycode = scancode + EVDEV_KEYCODE_OFFSET;

        let keysym = state.key_get_one_sym(keycode.into());
        let text = state.key_get_utf8(keycode.into());
        Some(ResolvedKey {
            scancode,
            keysym: u32::from(keysym),
            text: (!text.is_empty()).then_some(text),
            repeats: keymap.key_repeats(keycode.into()),
        })
    }

    /// Updates rate/delay from a seat repeat-info event. Rate 0 disables
    /// repeats entirely per the protocol.
    pub fn set_repeat_info(&mut self, rate: u32, delay_ms: u32) {
        debug!("Keyboard repeat-info: {}/s after {}ms", rate, delay_ms);
        self.repeat_rate = rate;
        self.repeat_delay_ms = delay_ms;
    }

    pub fn repeat_rate(&self) -> u32 {
        self.repeat_rate
    }

    pub fn repeat_delay_ms(&self) -> u32 {
        self.repeat_delay_ms
    }

    /// Records a press. Returns true when the repeat timer should be
    /// (re)armed for this scancode; any previously repeating key is
    /// replaced.
    pub fn press(&mut self, key: &ResolvedKey) -> bool {
        if key.repeats && self.repeat_rate > 0 {
            self.repeating = Some(key.scancode);
            true
        } else {
            false
        }
    }

    /// Records a release. Returns true when the repeat timer should be
    /// disarmed (the released key was the repeating one).
    pub fn release(&mut self, scancode: u32) -> bool {
        if self.repeating == Some(scancode) {
            self.repeating = None;
            true
        } else {
            false
        }
    }

    /// Focus loss disarms unconditionally
    pub fn clear_repeat(&mut self) -> bool {
        self.repeating.take().is_some()
    }

    /// The currently auto-repeating scancode, if any
    pub fn repeating(&self) -> Option<u32> {
        self.repeating
    }
}
