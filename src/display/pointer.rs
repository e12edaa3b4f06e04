//! Pointer phase state machine
//!
//! Wayland delivers pointer state as enter/leave/motion/button/axis events;
//! the hosted engine expects a phase per sample (Add/Hover/Down/Move/Up/
//! Remove). The phase is always *derived* from the previous phase and the
//! current button mask: it is never stored independently of that
//! derivation, so a compositor that reports button state on every sample
//! cannot produce spurious repeated Down phases.

use crate::engine::PointerPhase;

/// Linux evdev button code for the left mouse button
const BTN_LEFT: u32 = 0x110;

/// Per-seat pointer state
///
/// Holds the last surface-local coordinates, the active button mask, and the
/// last derived phase (which is an *input* to the next derivation, not an
/// independent piece of state).
#[derive(Debug, Clone)]
pub struct PointerState {
    x: f64,
    y: f64,
    buttons: u32,
    phase: PointerPhase,
}

impl PointerState {
    pub fn new() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            buttons: 0,
            phase: PointerPhase::Remove,
        }
    }

    /// Pointer entered the surface at the given coordinates
    pub fn enter(&mut self, x: f64, y: f64) -> PointerPhase {
        self.x = x;
        self.y = y;
        self.buttons = 0;
        self.phase = PointerPhase::Add;
        self.phase
    }

    /// Pointer left the surface; held buttons are forgotten with it
    pub fn leave(&mut self) -> PointerPhase {
        self.buttons = 0;
        self.phase = PointerPhase::Remove;
        self.phase
    }

    /// Motion sample. While buttons are held this collapses into `Move`;
    /// with no buttons held it is a `Hover`.
    pub fn motion(&mut self, x: f64, y: f64) -> PointerPhase {
        self.x = x;
        self.y = y;
        self.phase = if self.buttons != 0 {
            match self.phase {
                // A pressed sample while already down is motion, not a new down
                PointerPhase::Down | PointerPhase::Move => PointerPhase::Move,
                _ => PointerPhase::Down,
            }
        } else {
            PointerPhase::Hover
        };
        self.phase
    }

    /// Button sample. A press while already down is `Move` (second pressed
    /// sample collapses into motion); a release while down is `Up` and
    /// clears the button mask.
    pub fn button(&mut self, button_code: u32, pressed: bool) -> PointerPhase {
        if pressed {
            self.buttons |= button_bit(button_code);
            self.phase = match self.phase {
                PointerPhase::Down | PointerPhase::Move => PointerPhase::Move,
                _ => PointerPhase::Down,
            };
        } else {
            self.buttons = 0;
            self.phase = match self.phase {
                PointerPhase::Down | PointerPhase::Move => PointerPhase::Up,
                _ => PointerPhase::Hover,
            };
        }
        self.phase
    }

    /// Scroll sample; the phase is whatever the current motion phase is
    pub fn axis(&mut self) -> PointerPhase {
        self.phase = if self.buttons != 0 {
            PointerPhase::Move
        } else {
            PointerPhase::Hover
        };
        self.phase
    }

    pub fn position(&self) -> (f64, f64) {
        (self.x, self.y)
    }

    pub fn buttons(&self) -> u32 {
        self.buttons
    }

    pub fn phase(&self) -> PointerPhase {
        self.phase
    }
}

impl Default for PointerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a Linux button code onto the engine's button bitmask
fn button_bit(button_code: u32) -> u32 {
    match button_code.checked_sub(BTN_LEFT) {
        Some(offset) if offset < 32 => 1 << offset,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BTN_RIGHT: u32 = 0x111;

    #[test]
    fn test_enter_reports_add() {
        let mut pointer = PointerState::new();
        assert_eq!(pointer.enter(10.0, 20.0), PointerPhase::Add);
        assert_eq!(pointer.position(), (10.0, 20.0));
    }

    #[test]
    fn test_motion_without_buttons_is_hover() {
        let mut pointer = PointerState::new();
        pointer.enter(0.0, 0.0);
        assert_eq!(pointer.motion(5.0, 5.0), PointerPhase::Hover);
        assert_eq!(pointer.motion(6.0, 5.0), PointerPhase::Hover);
    }

    #[test]
    fn test_press_then_motion_is_down_then_move() {
        let mut pointer = PointerState::new();
        pointer.enter(0.0, 0.0);
        assert_eq!(pointer.button(BTN_LEFT, true), PointerPhase::Down);
        assert_eq!(pointer.motion(1.0, 1.0), PointerPhase::Move);
        assert_eq!(pointer.motion(2.0, 2.0), PointerPhase::Move);
        assert_eq!(pointer.button(BTN_LEFT, false), PointerPhase::Up);
    }

    #[test]
    fn test_second_press_sample_collapses_to_move() {
        let mut pointer = PointerState::new();
        pointer.enter(0.0, 0.0);
        assert_eq!(pointer.button(BTN_LEFT, true), PointerPhase::Down);
        // Chorded second button while already down is motion, not a new down
        assert_eq!(pointer.button(BTN_RIGHT, true), PointerPhase::Move);
    }

    #[test]
    fn test_release_clears_button_mask() {
        let mut pointer = PointerState::new();
        pointer.enter(0.0, 0.0);
        pointer.button(BTN_LEFT, true);
        pointer.button(BTN_RIGHT, true);
        assert_eq!(pointer.button(BTN_LEFT, false), PointerPhase::Up);
        assert_eq!(pointer.buttons(), 0);
        assert_eq!(pointer.motion(1.0, 1.0), PointerPhase::Hover);
    }

    #[test]
    fn test_release_without_down_is_hover() {
        let mut pointer = PointerState::new();
        pointer.enter(0.0, 0.0);
        assert_eq!(pointer.button(BTN_LEFT, false), PointerPhase::Hover);
    }

    #[test]
    fn test_leave_forgets_buttons() {
        let mut pointer = PointerState::new();
        pointer.enter(0.0, 0.0);
        pointer.button(BTN_LEFT, true);
        assert_eq!(pointer.leave(), PointerPhase::Remove);
        assert_eq!(pointer.buttons(), 0);

        // Re-entry starts over
        assert_eq!(pointer.enter(0.0, 0.0), PointerPhase::Add);
        assert_eq!(pointer.motion(1.0, 1.0), PointerPhase::Hover);
    }

    #[test]
    fn test_axis_phase_follows_button_state() {
        let mut pointer = PointerState::new();
        pointer.enter(0.0, 0.0);
        assert_eq!(pointer.axis(), PointerPhase::Hover);
        pointer.button(BTN_LEFT, true);
        assert_eq!(pointer.axis(), PointerPhase::Move);
    }

    #[test]
    fn test_no_consecutive_downs() {
        // Exhaustive-ish sample soup: phases must never report Down twice
        // without an intervening Up/Hover/Remove.
        let mut pointer = PointerState::new();
        pointer.enter(0.0, 0.0);
        let mut last_was_down = false;
        let samples: Vec<(u32, bool)> = vec![
            (BTN_LEFT, true),
            (BTN_LEFT, true),
            (BTN_RIGHT, true),
            (BTN_LEFT, false),
            (BTN_LEFT, true),
            (BTN_RIGHT, false),
            (BTN_RIGHT, false),
            (BTN_LEFT, true),
        ];
        for (code, pressed) in samples {
            let phase = pointer.button(code, pressed);
            if phase == PointerPhase::Down {
                assert!(!last_was_down, "two Down phases without Up/Hover");
                last_was_down = true;
            } else if matches!(
                phase,
                PointerPhase::Up | PointerPhase::Hover | PointerPhase::Remove
            ) {
                last_was_down = false;
            }
        }
    }
}
