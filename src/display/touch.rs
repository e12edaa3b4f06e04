//! Touch contact tracking
//!
//! Compositors may deliver duplicate or overlapping down events for the same
//! finger id. Each id therefore carries a reference-counted down count: only
//! the 0→1 transition is a logical `Down` and only the →0 transition a
//! logical `Up`; everything in between collapses into `Move`.

use std::collections::HashMap;

use crate::engine::PointerPhase;

/// Per-finger contact state for one seat
#[derive(Debug, Default)]
pub struct TouchTracker {
    contacts: HashMap<i32, Contact>,
}

#[derive(Debug, Clone, Copy)]
struct Contact {
    down_count: u32,
    x: f64,
    y: f64,
}

impl TouchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `down` event for the given finger id
    ///
    /// Reports `Down` only when this is the first down for the id; repeated
    /// downs on an already-tracked id are motion.
    pub fn down(&mut self, id: i32, x: f64, y: f64) -> PointerPhase {
        let contact = self.contacts.entry(id).or_insert(Contact {
            down_count: 0,
            x,
            y,
        });
        contact.down_count += 1;
        contact.x = x;
        contact.y = y;

        if contact.down_count == 1 {
            PointerPhase::Down
        } else {
            PointerPhase::Move
        }
    }

    /// A motion event for a tracked finger; unknown ids are dropped
    pub fn motion(&mut self, id: i32, x: f64, y: f64) -> Option<PointerPhase> {
        let contact = self.contacts.get_mut(&id)?;
        contact.x = x;
        contact.y = y;
        Some(PointerPhase::Move)
    }

    /// An `up` event for the given finger id
    ///
    /// Reports `Up` only when the down count reaches zero (the true last
    /// up); earlier ups on a multiply-downed id are motion. Ups for unknown
    /// ids are dropped.
    pub fn up(&mut self, id: i32) -> Option<(PointerPhase, f64, f64)> {
        let contact = self.contacts.get_mut(&id)?;
        contact.down_count -= 1;
        let (x, y) = (contact.x, contact.y);
        if contact.down_count == 0 {
            self.contacts.remove(&id);
            Some((PointerPhase::Up, x, y))
        } else {
            Some((PointerPhase::Move, x, y))
        }
    }

    /// Compositor cancelled the touch session; every tracked finger gets a
    /// synthesized `Up` at its last position
    pub fn cancel(&mut self) -> Vec<(i32, f64, f64)> {
        let mut lifted: Vec<(i32, f64, f64)> = self
            .contacts
            .drain()
            .map(|(id, contact)| (id, contact.x, contact.y))
            .collect();
        lifted.sort_by_key(|(id, _, _)| *id);
        lifted
    }

    /// Last known position of a tracked finger
    pub fn position(&self, id: i32) -> Option<(f64, f64)> {
        self.contacts.get(&id).map(|c| (c.x, c.y))
    }

    /// Number of fingers currently tracked
    pub fn active_contacts(&self) -> usize {
        self.contacts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_down_up() {
        let mut touch = TouchTracker::new();
        assert_eq!(touch.down(0, 1.0, 2.0), PointerPhase::Down);
        assert_eq!(touch.up(0), Some((PointerPhase::Up, 1.0, 2.0)));
        assert_eq!(touch.active_contacts(), 0);
    }

    #[test]
    fn test_overlapping_downs_collapse() {
        // Two overlapping downs on id=3, then two ups: Down, Move, Move, Up.
        // Only the second up is the logical Up.
        let mut touch = TouchTracker::new();
        assert_eq!(touch.down(3, 0.0, 0.0), PointerPhase::Down);
        assert_eq!(touch.down(3, 1.0, 1.0), PointerPhase::Move);
        assert_eq!(touch.up(3), Some((PointerPhase::Move, 1.0, 1.0)));
        assert_eq!(touch.up(3), Some((PointerPhase::Up, 1.0, 1.0)));
        assert_eq!(touch.active_contacts(), 0);
    }

    #[test]
    fn test_independent_finger_ids() {
        let mut touch = TouchTracker::new();
        assert_eq!(touch.down(0, 0.0, 0.0), PointerPhase::Down);
        assert_eq!(touch.down(1, 5.0, 5.0), PointerPhase::Down);
        assert_eq!(touch.up(0), Some((PointerPhase::Up, 0.0, 0.0)));
        // Finger 1 unaffected by finger 0's lifecycle
        assert_eq!(touch.motion(1, 6.0, 6.0), Some(PointerPhase::Move));
        assert_eq!(touch.up(1), Some((PointerPhase::Up, 6.0, 6.0)));
    }

    #[test]
    fn test_up_for_unknown_id_is_dropped() {
        let mut touch = TouchTracker::new();
        assert_eq!(touch.up(7), None);
        assert_eq!(touch.motion(7, 0.0, 0.0), None);
    }

    #[test]
    fn test_cancel_lifts_all_fingers() {
        let mut touch = TouchTracker::new();
        touch.down(0, 1.0, 1.0);
        touch.down(1, 2.0, 2.0);
        touch.down(1, 3.0, 3.0);

        let lifted = touch.cancel();
        assert_eq!(lifted, vec![(0, 1.0, 1.0), (1, 3.0, 3.0)]);
        assert_eq!(touch.active_contacts(), 0);
    }

    #[test]
    fn test_motion_updates_position() {
        let mut touch = TouchTracker::new();
        touch.down(2, 0.0, 0.0);
        touch.motion(2, 9.0, 8.0);
        assert_eq!(touch.position(2), Some((9.0, 8.0)));
    }
}
