//! Hosted-engine boundary
//!
//! The UI engine Perch embeds is an external component consumed only through
//! its fixed, versioned callback ABI. This module defines the safe vocabulary
//! the rest of the embedder speaks: pointer/touch/key events, scheduled
//! tasks, window metrics: and the [`Engine`] trait covering every call the
//! embedder makes *into* the engine. The raw `#[repr(C)]` tables live in
//! [`abi`]; the dlopen-based production binding lives in [`runtime`].

pub mod abi;
pub mod messenger;
pub mod runtime;
pub mod state;

use std::time::Duration;

use thiserror::Error;

/// Result of a call across the engine ABI
pub type EngineResult = std::result::Result<(), EngineError>;

/// Errors reported by the hosted engine
///
/// These mirror the ABI's result codes; callers match on the kind to decide
/// between dropping an event and tearing the instance down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine rejected the call's arguments
    #[error("engine rejected invalid arguments")]
    InvalidArguments,

    /// The engine detected an internal inconsistency; the instance is suspect
    #[error("engine internal inconsistency")]
    InternalInconsistency,

    /// The engine instance has already shut down
    #[error("engine instance is shut down")]
    Shutdown,

    /// The engine library could not satisfy the call
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

/// Pointer interaction phase, derived by the display subsystem
///
/// The engine's hit-testing relies on phases forming a well-formed sequence:
/// `Add` on enter, `Hover`/`Down`/`Move`/`Up` while inside, `Remove` on
/// leave. The derivation rules live in [`crate::display::pointer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerPhase {
    /// Pointer appeared over the surface
    Add,
    /// Motion with no buttons held
    Hover,
    /// First sample with a button held
    Down,
    /// Motion or repeated press samples while held
    Move,
    /// Last button released
    Up,
    /// Pointer left the surface
    Remove,
}

/// Source device class of a pointer-style event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerDeviceKind {
    Mouse,
    Touch,
}

/// A translated pointer event, surface-local coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerEvent {
    pub phase: PointerPhase,
    pub kind: PointerDeviceKind,
    /// Device id: 0 for the seat pointer, the finger id for touch
    pub device: i32,
    pub x: f64,
    pub y: f64,
    /// Currently held button mask (mouse only)
    pub buttons: u32,
    pub scroll_delta_x: f64,
    pub scroll_delta_y: f64,
    /// Event time from the window system, milliseconds
    pub timestamp_ms: u32,
}

impl PointerEvent {
    /// A plain phase-change sample with no scroll deltas
    pub fn sample(
        phase: PointerPhase,
        kind: PointerDeviceKind,
        device: i32,
        x: f64,
        y: f64,
        buttons: u32,
        timestamp_ms: u32,
    ) -> Self {
        Self {
            phase,
            kind,
            device,
            x,
            y,
            buttons,
            scroll_delta_x: 0.0,
            scroll_delta_y: 0.0,
            timestamp_ms,
        }
    }
}

/// Keyboard modifier state resolved through the compiled keymap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modifiers {
    pub shift: bool,
    pub ctrl: bool,
    pub alt: bool,
    pub logo: bool,
    pub caps_lock: bool,
    pub num_lock: bool,
}

/// A translated key event
#[derive(Debug, Clone, PartialEq)]
pub struct KeyEvent {
    /// Raw scancode as delivered by the window system (evdev domain)
    pub scancode: u32,
    /// Keysym resolved through the compiled keymap
    pub keysym: u32,
    /// UTF-8 text produced by the key, if any
    pub text: Option<String>,
    pub pressed: bool,
    /// True for synthetic auto-repeat re-emissions
    pub repeat: bool,
    pub modifiers: Modifiers,
    pub timestamp_ms: u32,
}

/// A deferred work item the engine asked the embedder to run later
///
/// The token is opaque; the target time is a point on the *engine's*
/// monotonic clock, not wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTask {
    pub token: u64,
    pub target_time: Duration,
}

/// Physical window metrics reported to the engine on create/resize
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowMetrics {
    pub width: u32,
    pub height: u32,
    pub pixel_ratio: f64,
}

impl WindowMetrics {
    pub fn new(width: u32, height: u32, pixel_ratio: f64) -> Self {
        Self {
            width,
            height,
            pixel_ratio,
        }
    }
}

/// Every call the embedder makes into the hosted engine
///
/// One implementation wraps the dlopened engine library
/// ([`runtime::RuntimeEngine`]); tests substitute recording fakes. All
/// methods are callable from any thread: the engine serializes internally
/// per its ABI contract, and the task runner additionally funnels
/// embedder-originated calls through its own strand.
pub trait Engine: Send + Sync {
    /// Reports a new surface size and scale factor
    fn notify_window_metrics(&self, metrics: WindowMetrics) -> EngineResult;

    /// Submits a translated pointer or touch event
    fn send_pointer_event(&self, event: PointerEvent) -> EngineResult;

    /// Submits a translated key event
    fn send_key_event(&self, event: KeyEvent) -> EngineResult;

    /// Executes a task previously scheduled through the embedder
    fn run_task(&self, task: &EngineTask) -> EngineResult;

    /// Current time on the engine's monotonic clock
    fn current_time(&self) -> Duration;

    /// Sends a platform message on a named channel
    fn send_platform_message(&self, channel: &str, payload: &[u8]) -> EngineResult;

    /// Updates the engine's active locale (e.g. "en_US")
    fn update_locale(&self, locale: &str) -> EngineResult;

    /// Begins engine shutdown; subsequent calls report [`EngineError::Shutdown`]
    fn shutdown(&self) -> EngineResult;
}
