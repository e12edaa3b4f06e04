//! Output (display head) tracking
//!
//! One record per advertised output, filled in by geometry/mode/scale
//! events and committed atomically by the `done` event. Lifetime matches
//! the compositor connection.

use log::debug;

/// Physical geometry and transform of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputGeometry {
    pub x: i32,
    pub y: i32,
    /// Physical dimensions in millimeters
    pub physical_width: i32,
    pub physical_height: i32,
    /// Protocol transform value (rotation/flip)
    pub transform: i32,
}

/// Current mode of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputMode {
    pub width: i32,
    pub height: i32,
    /// Refresh rate in millihertz
    pub refresh_mhz: i32,
}

/// Everything known about one output
#[derive(Debug, Clone, Default)]
pub struct OutputInfo {
    /// Registry name (the global's numeric name)
    pub global_name: u32,
    pub geometry: OutputGeometry,
    pub mode: OutputMode,
    pub scale: i32,
    /// Set once the first `done` commits a consistent snapshot
    pub ready: bool,
    // Pending values accumulate between `done` events
    pending_geometry: OutputGeometry,
    pending_mode: OutputMode,
    pending_scale: i32,
}

impl OutputInfo {
    pub fn new(global_name: u32) -> Self {
        Self {
            global_name,
            scale: 1,
            pending_scale: 1,
            ..Default::default()
        }
    }

    pub fn geometry_event(&mut self, geometry: OutputGeometry) {
        self.pending_geometry = geometry;
    }

    /// Only the current mode is tracked; non-current advertised modes are
    /// ignored
    pub fn mode_event(&mut self, current: bool, mode: OutputMode) {
        if current {
            self.pending_mode = mode;
        }
    }

    pub fn scale_event(&mut self, scale: i32) {
        self.pending_scale = scale.max(1);
    }

    /// `done` commits the accumulated pending state
    pub fn done_event(&mut self) {
        self.geometry = self.pending_geometry;
        self.mode = self.pending_mode;
        self.scale = self.pending_scale;
        self.ready = true;
        debug!(
            "Output {}: {}x{}@{}mHz scale {}",
            self.global_name, self.mode.width, self.mode.height, self.mode.refresh_mhz, self.scale
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_commits_on_done() {
        let mut output = OutputInfo::new(3);
        output.mode_event(
            true,
            OutputMode {
                width: 1920,
                height: 1080,
                refresh_mhz: 60000,
            },
        );
        output.scale_event(2);

        // Nothing visible before done
        assert!(!output.ready);
        assert_eq!(output.mode.width, 0);
        assert_eq!(output.scale, 1);

        output.done_event();
        assert!(output.ready);
        assert_eq!(output.mode.width, 1920);
        assert_eq!(output.scale, 2);
    }

    #[test]
    fn test_non_current_modes_ignored() {
        let mut output = OutputInfo::new(0);
        output.mode_event(
            false,
            OutputMode {
                width: 640,
                height: 480,
                refresh_mhz: 60000,
            },
        );
        output.done_event();
        assert_eq!(output.mode.width, 0);
    }

    #[test]
    fn test_scale_floor_is_one() {
        let mut output = OutputInfo::new(0);
        output.scale_event(0);
        output.done_event();
        assert_eq!(output.scale, 1);
    }

    #[test]
    fn test_updates_after_done_need_new_done() {
        let mut output = OutputInfo::new(0);
        output.mode_event(
            true,
            OutputMode {
                width: 1280,
                height: 720,
                refresh_mhz: 60000,
            },
        );
        output.done_event();

        output.mode_event(
            true,
            OutputMode {
                width: 3840,
                height: 2160,
                refresh_mhz: 30000,
            },
        );
        assert_eq!(output.mode.width, 1280);
        output.done_event();
        assert_eq!(output.mode.width, 3840);
    }
}
