//! Frame damage bookkeeping for the windowed backends
//!
//! The hosted engine reports, with every present, the rectangle of the frame
//! that actually changed. When the engine later reuses a framebuffer whose
//! contents are several presents old (its *buffer age*), it asks the embedder
//! which region of that buffer is stale. Answering the query means unioning
//! the damage of the frames presented since the buffer was last used, so the
//! backends keep a short, bounded history of per-frame damage rectangles.

use std::collections::{HashMap, VecDeque};

/// Maximum number of per-frame damage rectangles remembered for buffer-age
/// reconstruction. Swapchains do not run deeper than this in practice.
pub const MAX_HISTORY: usize = 10;

/// Buffer age assumed when the window system cannot report one. Old enough
/// that the accumulated damage covers any realistic swapchain depth.
pub const FALLBACK_BUFFER_AGE: usize = 4;

/// An axis-aligned damage rectangle in surface coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DamageRect {
    /// X coordinate (pixels)
    pub x: i32,
    /// Y coordinate (pixels)
    pub y: i32,
    /// Width (pixels)
    pub width: u32,
    /// Height (pixels)
    pub height: u32,
}

impl DamageRect {
    /// Creates a new damage rectangle
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A rectangle covering a whole surface of the given size
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Returns the area of this rectangle in pixels
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// True when the rectangle covers no pixels
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Checks if this rectangle intersects another
    pub fn intersects(&self, other: &DamageRect) -> bool {
        !(self.x + self.width as i32 <= other.x
            || other.x + other.width as i32 <= self.x
            || self.y + self.height as i32 <= other.y
            || other.y + other.height as i32 <= self.y)
    }

    /// Computes the union of two rectangles (smallest bounding box
    /// containing both). An empty rectangle is the identity.
    pub fn union(&self, other: &DamageRect) -> DamageRect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }

        let x1 = self.x.min(other.x);
        let y1 = self.y.min(other.y);
        let x2 = (self.x + self.width as i32).max(other.x + other.width as i32);
        let y2 = (self.y + self.height as i32).max(other.y + other.height as i32);

        DamageRect {
            x: x1,
            y: y1,
            width: (x2 - x1) as u32,
            height: (y2 - y1) as u32,
        }
    }

    /// Converts to EGL's bottom-left-origin rectangle layout
    /// `[x, y, width, height]` given the surface height.
    pub fn to_egl(&self, surface_height: u32) -> [i32; 4] {
        let flipped_y = surface_height as i32 - (self.y + self.height as i32);
        [self.x, flipped_y, self.width as i32, self.height as i32]
    }
}

/// Bounded FIFO history of per-frame damage rectangles
///
/// Index 0 is the oldest remembered frame; the back is the most recent
/// present. Pushing beyond the bound evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct DamageHistory {
    entries: VecDeque<DamageRect>,
    cap: usize,
}

impl DamageHistory {
    /// Creates a history bounded at [`MAX_HISTORY`] entries
    pub fn new() -> Self {
        Self::with_capacity(MAX_HISTORY)
    }

    /// Creates a history with a custom bound (must be at least 1)
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.max(1)),
            cap: cap.max(1),
        }
    }

    /// Records the damage of a presented frame, evicting the oldest entry
    /// once the bound is reached
    pub fn push(&mut self, rect: DamageRect) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(rect);
    }

    /// Number of frames currently remembered
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no frame has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unions the damage a reused buffer of the given age has missed.
    ///
    /// A buffer of age N was last drawn N presents ago, so it is missing the
    /// damage of the last N - 1 frames. Age 0 (unknown content) and age 1
    /// (just presented) need no join and yield an empty rectangle; an age
    /// larger than the remembered history caps at the history length.
    pub fn accumulated(&self, age: usize) -> DamageRect {
        if age <= 1 {
            return DamageRect::default();
        }

        let span = (age - 1).min(self.entries.len());
        self.entries
            .iter()
            .rev()
            .take(span)
            .fold(DamageRect::default(), |acc, rect| acc.union(rect))
    }
}

impl Default for DamageHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-framebuffer cache of the stale region reported to the engine
///
/// The engine queries the existing damage for a framebuffer id right before
/// repainting it; the record is dropped again when that framebuffer is
/// presented.
#[derive(Debug, Default)]
pub struct ExistingDamageMap {
    records: HashMap<u32, DamageRect>,
}

impl ExistingDamageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the stale region reported for a framebuffer
    pub fn insert(&mut self, fbo_id: u32, rect: DamageRect) {
        self.records.insert(fbo_id, rect);
    }

    /// Drops the record for a framebuffer that was just presented
    pub fn remove(&mut self, fbo_id: u32) -> Option<DamageRect> {
        self.records.remove(&fbo_id)
    }

    pub fn get(&self, fbo_id: u32) -> Option<&DamageRect> {
        self.records.get(&fbo_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_union() {
        let a = DamageRect::new(0, 0, 100, 100);
        let b = DamageRect::new(50, 50, 100, 100);
        assert_eq!(a.union(&b), DamageRect::new(0, 0, 150, 150));
    }

    #[test]
    fn test_rect_union_empty_identity() {
        let a = DamageRect::new(10, 20, 30, 40);
        assert_eq!(a.union(&DamageRect::default()), a);
        assert_eq!(DamageRect::default().union(&a), a);
    }

    #[test]
    fn test_rect_intersects() {
        let a = DamageRect::new(0, 0, 100, 100);
        assert!(a.intersects(&DamageRect::new(50, 50, 100, 100)));
        assert!(!a.intersects(&DamageRect::new(200, 200, 50, 50)));
    }

    #[test]
    fn test_rect_to_egl_flips_y() {
        let rect = DamageRect::new(10, 20, 30, 40);
        assert_eq!(rect.to_egl(200), [10, 140, 30, 40]);
    }

    #[test]
    fn test_history_never_exceeds_bound() {
        let mut history = DamageHistory::new();
        for i in 0..(MAX_HISTORY as i32 * 3) {
            history.push(DamageRect::new(i, 0, 1, 1));
            assert!(history.len() <= MAX_HISTORY);
        }
        assert_eq!(history.len(), MAX_HISTORY);
    }

    #[test]
    fn test_history_evicts_fifo() {
        let mut history = DamageHistory::with_capacity(3);
        history.push(DamageRect::new(0, 0, 1, 1));
        history.push(DamageRect::new(1, 0, 1, 1));
        history.push(DamageRect::new(2, 0, 1, 1));
        history.push(DamageRect::new(3, 0, 1, 1));

        // Oldest entry (x=0) evicted; union over the full history starts at x=1
        let union = history.accumulated(usize::MAX);
        assert_eq!(union.x, 1);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_accumulated_age_one_is_empty() {
        let mut history = DamageHistory::new();
        history.push(DamageRect::new(0, 0, 64, 64));
        assert!(history.accumulated(0).is_empty());
        assert!(history.accumulated(1).is_empty());
    }

    #[test]
    fn test_accumulated_joins_last_age_minus_one() {
        let mut history = DamageHistory::new();
        history.push(DamageRect::new(0, 0, 10, 10)); // not included at age 3
        history.push(DamageRect::new(100, 0, 10, 10));
        history.push(DamageRect::new(0, 100, 10, 10));

        let acc = history.accumulated(3);
        // Joins the last two entries only
        assert_eq!(acc, DamageRect::new(0, 0, 110, 110));
    }

    #[test]
    fn test_accumulated_age_beyond_history_caps() {
        let mut history = DamageHistory::with_capacity(2);
        history.push(DamageRect::new(0, 0, 10, 10));
        history.push(DamageRect::new(20, 20, 10, 10));

        assert_eq!(history.accumulated(100), history.accumulated(3));
    }

    #[test]
    fn test_existing_damage_round_trip() {
        let mut map = ExistingDamageMap::new();
        map.insert(2, DamageRect::new(0, 0, 5, 5));
        assert_eq!(map.get(2), Some(&DamageRect::new(0, 0, 5, 5)));
        assert_eq!(map.remove(2), Some(DamageRect::new(0, 0, 5, 5)));
        assert!(map.is_empty());
        assert_eq!(map.remove(2), None);
    }
}
