//! Embedder orchestration
//!
//! [`Embedder`] wires the subsystems together: the GPU backend, the Wayland
//! display, one engine instance (with its task runner) per window, and the
//! liveness watchdog. The [`EngineBridge`] is the production [`EventSink`]:
//! it routes translated display events to the engine instance mapped to the
//! event's surface.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::backend::{create_backend, Backend, BackendKind};
use crate::config::PerchConfig;
use crate::display::{Display, EventSink};
use crate::engine::messenger::TextureRegistry;
use crate::engine::runtime::EngineLibrary;
use crate::engine::state::EngineState;
use crate::engine::{KeyEvent, PointerEvent, WindowMetrics};
use crate::watchdog::Watchdog;

/// Engine shared-object name inside the asset bundle
const ENGINE_LIBRARY_NAME: &str = "lib/libui_engine.so";

type EngineMap = Arc<Mutex<HashMap<usize, Arc<EngineState>>>>;

/// Routes translated display events to the engine mapped to each slot.
///
/// Events for slots with no engine are dropped without error; that race is
/// normal during instance teardown.
pub(crate) struct EngineBridge {
    engines: EngineMap,
    running: Arc<AtomicBool>,
}

impl EngineBridge {
    pub(crate) fn new(engines: EngineMap, running: Arc<AtomicBool>) -> Self {
        Self { engines, running }
    }

    fn with_engine(&self, slot: usize, f: impl FnOnce(&EngineState)) {
        if let Some(state) = self.engines.lock().get(&slot).cloned() {
            f(&state);
        }
    }
}

impl EventSink for EngineBridge {
    fn pointer_event(&mut self, slot: usize, event: PointerEvent) {
        self.with_engine(slot, |state| state.send_pointer_event(event));
    }

    fn key_event(&mut self, slot: usize, event: KeyEvent) {
        self.with_engine(slot, |state| state.send_key_event(event));
    }

    fn window_resized(&mut self, slot: usize, width: u32, height: u32) {
        self.with_engine(slot, |state| {
            if let Err(e) = state.handle_resize(width, height) {
                warn!("⚠️ Resize to {}x{} failed: {}", width, height, e);
            }
        });
    }

    fn scale_changed(&mut self, slot: usize, scale: f64) {
        self.with_engine(slot, |state| {
            if let Err(e) = state.set_pixel_ratio(scale) {
                warn!("⚠️ Scale change to {} failed: {}", scale, e);
            }
        });
    }

    fn window_closed(&mut self, slot: usize) {
        let last = {
            let mut engines = self.engines.lock();
            match engines.remove(&slot) {
                Some(state) => {
                    info!("🔽 Engine instance {} closing with its window", slot);
                    state.shutdown();
                    engines.is_empty()
                }
                None => return,
            }
        };
        if last {
            info!("Last engine instance gone; stopping the embedder");
            self.running.store(false, Ordering::SeqCst);
        }
    }
}

/// The assembled embedder
pub struct Embedder {
    config: PerchConfig,
    backend: Arc<dyn Backend>,
    display: Display,
    library: Arc<EngineLibrary>,
    engines: EngineMap,
    textures: Arc<TextureRegistry>,
    watchdog: Option<Watchdog>,
    running: Arc<AtomicBool>,
    next_slot: usize,
}

impl Embedder {
    /// Builds every subsystem; any failure here is fatal at startup
    pub fn new(config: PerchConfig) -> Result<Self> {
        info!("🏗️ Initializing Perch embedder...");

        let textures = Arc::new(TextureRegistry::new());

        debug!("🎨 Selecting GPU backend ({})...", config.backend.kind);
        let kind: BackendKind = config.backend.kind.parse()?;
        let backend = create_backend(
            kind,
            config.backend.vsync,
            config.backend.damage_history,
            Arc::clone(&textures),
        )?;

        let running = Arc::new(AtomicBool::new(true));
        let engines: EngineMap = Arc::new(Mutex::new(HashMap::new()));
        let bridge = EngineBridge::new(Arc::clone(&engines), Arc::clone(&running));

        debug!("🔌 Connecting to the compositor...");
        let display = Display::connect(
            Box::new(bridge),
            config.input.natural_scrolling,
            config.input.keyboard_repeat_rate,
            config.input.keyboard_repeat_delay,
        )?;

        let bundle = PathBuf::from(&config.general.bundle_path);
        let library = Arc::new(
            EngineLibrary::load(&bundle.join(ENGINE_LIBRARY_NAME))
                .context("Failed to load the hosted engine from the bundle")?,
        );

        let watchdog = if config.watchdog.enabled {
            Some(Watchdog::start(Duration::from_secs(
                config.watchdog.interval_secs,
            ))?)
        } else {
            None
        };

        info!("✅ All subsystems initialized successfully");
        Ok(Self {
            config,
            backend,
            display,
            library,
            engines,
            textures,
            watchdog,
            running,
            next_slot: 0,
        })
    }

    /// Creates a window, binds it to the backend, and starts an engine
    /// instance in the next free slot
    pub fn launch_instance(&mut self) -> Result<usize> {
        let slot = self.next_slot;
        self.next_slot += 1;

        let (width, height) = (self.config.window.width, self.config.window.height);
        let native = self.display.create_window(
            slot,
            &self.config.window.app_id,
            &self.config.window.title,
            width,
            height,
        )?;
        self.backend.create_surface(slot, native, width, height)?;

        let bundle = PathBuf::from(&self.config.general.bundle_path);
        let state = EngineState::start(
            Arc::clone(&self.library),
            &bundle,
            Arc::clone(&self.backend),
            Arc::clone(&self.textures),
            slot,
            WindowMetrics::new(width, height, 1.0),
        )?;
        self.engines.lock().insert(slot, Arc::new(state));

        info!("🚀 Engine instance {} launched", slot);
        Ok(slot)
    }

    /// Flag shared with signal handlers; storing false stops [`run`]
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Pumps the display until the running flag drops, then shuts every
    /// engine instance down
    pub fn run(mut self) -> Result<()> {
        self.display.run(&self.running, self.watchdog.as_ref())?;

        info!("🔽 Shutting down Perch embedder...");
        for (_, state) in self.engines.lock().drain() {
            state.shutdown();
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
        info!("✅ Perch embedder shutdown complete");
        Ok(())
    }

    pub fn config(&self) -> &PerchConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessBackend;
    use crate::backend::NativeSurface;
    use crate::engine::{Engine, EngineResult, EngineTask};
    use wayland_backend::client::ObjectId;

    #[derive(Default)]
    struct RecordingEngine {
        pointer_events: Mutex<Vec<PointerEvent>>,
        key_events: Mutex<Vec<KeyEvent>>,
        shutdowns: Mutex<u32>,
    }

    impl Engine for RecordingEngine {
        fn notify_window_metrics(&self, _m: WindowMetrics) -> EngineResult {
            Ok(())
        }
        fn send_pointer_event(&self, event: PointerEvent) -> EngineResult {
            self.pointer_events.lock().push(event);
            Ok(())
        }
        fn send_key_event(&self, event: KeyEvent) -> EngineResult {
            self.key_events.lock().push(event);
            Ok(())
        }
        fn run_task(&self, _t: &EngineTask) -> EngineResult {
            Ok(())
        }
        fn current_time(&self) -> Duration {
            Duration::ZERO
        }
        fn send_platform_message(&self, _c: &str, _p: &[u8]) -> EngineResult {
            Ok(())
        }
        fn update_locale(&self, _l: &str) -> EngineResult {
            Ok(())
        }
        fn shutdown(&self) -> EngineResult {
            *self.shutdowns.lock() += 1;
            Ok(())
        }
    }

    fn bridge_with_one_engine() -> (Arc<RecordingEngine>, EngineBridge, EngineMap) {
        let engine = Arc::new(RecordingEngine::default());
        let textures = Arc::new(TextureRegistry::new());
        let backend = Arc::new(HeadlessBackend::new(Arc::clone(&textures)));
        backend
            .create_surface(
                0,
                NativeSurface {
                    display_ptr: std::ptr::null_mut(),
                    surface_ptr: std::ptr::null_mut(),
                    surface_id: ObjectId::null(),
                },
                320,
                240,
            )
            .unwrap();
        let state = EngineState::with_engine(
            Arc::clone(&engine) as Arc<dyn Engine>,
            backend,
            textures,
            0,
            WindowMetrics::new(320, 240, 1.0),
        )
        .unwrap();

        let engines: EngineMap = Arc::new(Mutex::new(HashMap::new()));
        engines.lock().insert(0, Arc::new(state));
        let bridge = EngineBridge::new(
            Arc::clone(&engines),
            Arc::new(AtomicBool::new(true)),
        );
        (engine, bridge, engines)
    }

    #[test]
    fn test_bridge_routes_pointer_events() {
        use crate::engine::{PointerDeviceKind, PointerPhase};
        let (engine, mut bridge, _engines) = bridge_with_one_engine();

        let event = PointerEvent::sample(
            PointerPhase::Hover,
            PointerDeviceKind::Mouse,
            0,
            1.0,
            2.0,
            0,
            10,
        );
        bridge.pointer_event(0, event);
        assert_eq!(engine.pointer_events.lock().len(), 1);

        // Unmapped slot: dropped silently
        bridge.pointer_event(9, event);
        assert_eq!(engine.pointer_events.lock().len(), 1);
    }

    #[test]
    fn test_bridge_window_close_shuts_engine_down() {
        let (engine, mut bridge, engines) = bridge_with_one_engine();

        bridge.window_closed(0);
        assert_eq!(*engine.shutdowns.lock(), 1);
        assert!(engines.lock().is_empty());

        // A second close for the same slot is a no-op
        bridge.window_closed(0);
        assert_eq!(*engine.shutdowns.lock(), 1);
    }

    #[test]
    fn test_bridge_resize_reaches_backend_and_engine() {
        let (_engine, mut bridge, engines) = bridge_with_one_engine();

        bridge.window_resized(0, 800, 600);
        let metrics = engines.lock().get(&0).unwrap().metrics();
        assert_eq!((metrics.width, metrics.height), (800, 600));
    }
}
