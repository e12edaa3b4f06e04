//! # Perch Wayland Platform Embedder Library
//!
//! Perch hosts an external UI engine on an embedded Linux Wayland session and
//! supplies everything that engine needs to draw and receive input: a
//! GPU-backed rendering surface, a task scheduler that honors the engine's own
//! clock, and translation of Wayland input events into the engine's event
//! vocabulary.
//!
//! ## Architecture
//!
//! Perch is built on a modular architecture:
//! - `backend`: GPU surface abstraction (headless, EGL/GL, Vulkan swapchain)
//! - `display`: Wayland client, output/seat discovery, input state machines
//! - `engine`: the hosted engine's callback ABI and the safe glue around it
//! - `embedder`: orchestration wiring the subsystems to engine instances
//! - `runner`: per-engine task runner draining engine-scheduled work
//! - `timer`: timerfd-backed event timers shared through one epoll set
//! - `watchdog`: liveness heartbeat that escalates to the supervisor
//! - `config`: configuration parsing and validation
//!
//! ## Usage
//!
//! ```rust,no_run
//! use perch::{Embedder, PerchConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = PerchConfig::default();
//!     let embedder = Embedder::new(config)?;
//!     embedder.run()
//! }
//! ```

pub mod backend;
pub mod config;
pub mod display;
pub mod embedder;
pub mod engine;
pub mod runner;
pub mod timer;
pub mod watchdog;

// Re-export main types for easy access
pub use backend::{Backend, BackendKind};
pub use config::PerchConfig;
pub use display::Display;
pub use embedder::Embedder;
pub use engine::Engine;
pub use runner::TaskRunner;
pub use watchdog::Watchdog;

// Re-export common error types
pub use anyhow::{Context, Error, Result};

/// Version information for Perch
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
