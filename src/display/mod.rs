//! Wayland display and input subsystem
//!
//! Owns the compositor connection, discovers globals (outputs, seats, the
//! xdg shell and its activation extension), creates one toplevel surface per
//! hosted-engine instance, and converts raw protocol input into the
//! engine's event vocabulary through the per-seat state machines in
//! [`pointer`], [`touch`], and [`keyboard`].
//!
//! Translated events leave through the [`EventSink`] trait: production wires
//! it to the engine bridge, tests substitute a recording sink, keeping the
//! state-machine logic checkable without a live compositor.

pub mod activation;
pub mod keyboard;
pub mod output;
pub mod pointer;
pub mod seat;
pub mod touch;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use calloop::generic::Generic;
use calloop::{EventLoop, Interest, Mode, PostAction};
use calloop_wayland_source::WaylandSource;
use log::{debug, info, warn};
use wayland_backend::client::ObjectId;
use wayland_client::globals::{registry_queue_init, GlobalListContents};
use wayland_client::protocol::{
    wl_compositor, wl_output, wl_registry, wl_seat, wl_shm, wl_surface,
};
use wayland_client::{Connection, Dispatch, Proxy, QueueHandle, WEnum};
use wayland_protocols::xdg::activation::v1::client::{xdg_activation_token_v1, xdg_activation_v1};
use wayland_protocols::xdg::shell::client::{xdg_surface, xdg_toplevel, xdg_wm_base};

use crate::backend::NativeSurface;
use crate::engine::{KeyEvent, PointerEvent};
use crate::timer::TimerSet;
use crate::watchdog::Watchdog;
use activation::ActivationStack;
use output::{OutputGeometry, OutputInfo, OutputMode};
use seat::Seat;

/// Where translated input and window lifecycle events go
///
/// Implemented by the engine bridge in production and by recording fakes in
/// tests.
pub trait EventSink {
    fn pointer_event(&mut self, slot: usize, event: PointerEvent);
    fn key_event(&mut self, slot: usize, event: KeyEvent);
    fn window_resized(&mut self, slot: usize, width: u32, height: u32);
    fn scale_changed(&mut self, slot: usize, scale: f64);
    fn window_closed(&mut self, slot: usize);
}

/// One embedder toplevel, mapped to exactly one engine instance slot
pub struct EmbedderWindow {
    pub slot: usize,
    pub app_id: String,
    pub surface: wl_surface::WlSurface,
    pub xdg_surface: xdg_surface::XdgSurface,
    pub toplevel: xdg_toplevel::XdgToplevel,
    pub width: u32,
    pub height: u32,
    pub configured: bool,
}

/// Protocol-side state, driven by the dispatch impls below
pub struct DisplayState {
    compositor: wl_compositor::WlCompositor,
    wm_base: xdg_wm_base::XdgWmBase,
    activation: Option<xdg_activation_v1::XdgActivationV1>,
    _shm: wl_shm::WlShm,
    seats: Vec<Seat>,
    outputs: Vec<(wl_output::WlOutput, OutputInfo)>,
    windows: Vec<EmbedderWindow>,
    /// Non-owning surface → engine-slot map; input focus routing only
    surface_engines: HashMap<ObjectId, usize>,
    active_surface: Option<ObjectId>,
    active_slot: Option<usize>,
    sink: Box<dyn EventSink>,
    timers: TimerSet,
    /// Seat indices whose repeat timer fired, drained after each poll step
    repeat_queue: Rc<RefCell<VecDeque<usize>>>,
    activation_stack: ActivationStack,
    natural_scrolling: bool,
    default_repeat_rate: u32,
    default_repeat_delay_ms: u32,
}

impl DisplayState {
    /// Focus change: subsequent seat events route to this surface's engine
    /// until the next enter
    fn focus_surface(&mut self, surface: ObjectId) {
        self.active_slot = self.surface_engines.get(&surface).copied();
        if self.active_slot.is_none() {
            // Normal race during surface teardown; events will be dropped
            debug!("Focus on unmapped surface {:?}", surface);
        }
        self.active_surface = Some(surface);
    }

    /// Records an activation and asks the compositor to foreground the
    /// window when the activation extension is present
    fn activate_window(&mut self, slot: usize, qh: &QueueHandle<Self>) {
        let Some(window) = self.windows.iter().find(|w| w.slot == slot) else {
            return;
        };
        self.activation_stack.activate(&window.app_id);
        if let Some(activation) = &self.activation {
            let token = activation.get_activation_token(qh, slot);
            token.set_app_id(window.app_id.clone());
            token.set_surface(&window.surface);
            token.commit();
        }
    }

    /// A window went away: drop its mapping and re-activate the next
    /// application down the stack
    fn remove_window(&mut self, slot: usize, qh: &QueueHandle<Self>) {
        let Some(position) = self.windows.iter().position(|w| w.slot == slot) else {
            return;
        };
        let window = self.windows.remove(position);
        self.surface_engines.remove(&window.surface.id());
        if self.active_surface == Some(window.surface.id()) {
            self.active_surface = None;
            self.active_slot = None;
        }
        window.toplevel.destroy();
        window.xdg_surface.destroy();
        window.surface.destroy();

        if let Some(next_app) = self.activation_stack.remove(&window.app_id) {
            if let Some(next_slot) = self
                .windows
                .iter()
                .find(|w| w.app_id == next_app)
                .map(|w| w.slot)
            {
                info!("↩️ Re-activating {}", next_app);
                self.activate_window(next_slot, qh);
            }
        }
        self.sink.window_closed(slot);
    }

    /// Scale of the output a surface entered, default 1
    fn output_scale(&self, output_id: &ObjectId) -> i32 {
        self.outputs
            .iter()
            .find(|(proxy, _)| proxy.id() == *output_id)
            .map(|(_, info)| info.scale)
            .unwrap_or(1)
    }

    pub fn windows(&self) -> &[EmbedderWindow] {
        &self.windows
    }

    pub fn activation_stack(&self) -> &ActivationStack {
        &self.activation_stack
    }
}

/// The compositor connection plus its event pump
pub struct Display {
    conn: Connection,
    event_loop: EventLoop<'static, DisplayState>,
    queue_handle: QueueHandle<DisplayState>,
    state: DisplayState,
}

impl Display {
    /// Connects to the compositor named by the environment and discovers
    /// the required globals. A missing required global is fatal.
    pub fn connect(
        sink: Box<dyn EventSink>,
        natural_scrolling: bool,
        repeat_rate: u32,
        repeat_delay_ms: u32,
    ) -> Result<Self> {
        let conn = Connection::connect_to_env()
            .context("Failed to connect to the Wayland compositor")?;
        let (globals, event_queue) =
            registry_queue_init::<DisplayState>(&conn).context("Wayland registry init failed")?;
        let queue_handle = event_queue.handle();

        let compositor: wl_compositor::WlCompositor = globals
            .bind(&queue_handle, 4..=6, ())
            .context("Compositor lacks wl_compositor (required)")?;
        let shm: wl_shm::WlShm = globals
            .bind(&queue_handle, 1..=1, ())
            .context("Compositor lacks wl_shm (required)")?;
        let wm_base: xdg_wm_base::XdgWmBase = globals
            .bind(&queue_handle, 1..=6, ())
            .context("Compositor lacks xdg_wm_base (required)")?;
        let activation: Option<xdg_activation_v1::XdgActivationV1> =
            globals.bind(&queue_handle, 1..=1, ()).ok();
        if activation.is_none() {
            info!("xdg_activation_v1 not offered; activation stack is local-only");
        }

        let timers = TimerSet::new()?;
        let mut state = DisplayState {
            compositor,
            wm_base,
            activation,
            _shm: shm,
            seats: Vec::new(),
            outputs: Vec::new(),
            windows: Vec::new(),
            surface_engines: HashMap::new(),
            active_surface: None,
            active_slot: None,
            sink,
            timers,
            repeat_queue: Rc::new(RefCell::new(VecDeque::new())),
            activation_stack: ActivationStack::new(),
            natural_scrolling,
            default_repeat_rate: repeat_rate,
            default_repeat_delay_ms: repeat_delay_ms,
        };

        // Bind the seats and outputs that were already advertised
        for global in globals.contents().clone_list() {
            match global.interface.as_str() {
                "wl_seat" => {
                    let seat: wl_seat::WlSeat = globals.registry().bind(
                        global.name,
                        global.version.min(7),
                        &queue_handle,
                        (),
                    );
                    state
                        .seats
                        .push(Seat::new(seat, repeat_rate, repeat_delay_ms));
                }
                "wl_output" => {
                    let output: wl_output::WlOutput = globals.registry().bind(
                        global.name,
                        global.version.min(4),
                        &queue_handle,
                        (),
                    );
                    state.outputs.push((output, OutputInfo::new(global.name)));
                }
                _ => {}
            }
        }
        info!(
            "🔌 Wayland connected: {} seat(s), {} output(s)",
            state.seats.len(),
            state.outputs.len()
        );

        let event_loop: EventLoop<'static, DisplayState> =
            EventLoop::try_new().context("Failed to create the display event loop")?;
        WaylandSource::new(conn.clone(), event_queue)
            .insert(event_loop.handle())
            .map_err(|e| anyhow::anyhow!("Failed to register the Wayland source: {}", e))?;

        // The shared timer epoll joins the same loop; repeats are flushed
        // right after the timers fire
        let timer_fd = state.timers.poll_fd_dup()?;
        event_loop
            .handle()
            .insert_source(
                Generic::new(timer_fd, Interest::READ, Mode::Level),
                |_, _, state: &mut DisplayState| {
                    if let Err(e) = state.timers.poll_dispatch(Duration::ZERO) {
                        warn!("Timer dispatch failed: {}", e);
                    }
                    state.flush_repeats();
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|e| anyhow::anyhow!("Failed to register the timer source: {}", e))?;

        Ok(Self {
            conn,
            event_loop,
            queue_handle,
            state,
        })
    }

    /// Creates the toplevel surface for an engine instance slot and maps it
    /// in the surface → engine relation
    pub fn create_window(
        &mut self,
        slot: usize,
        app_id: &str,
        title: &str,
        width: u32,
        height: u32,
    ) -> Result<NativeSurface> {
        let qh = &self.queue_handle;
        let surface = self.state.compositor.create_surface(qh, ());
        let xdg_surface = self.state.wm_base.get_xdg_surface(&surface, qh, slot);
        let toplevel = xdg_surface.get_toplevel(qh, slot);
        toplevel.set_title(title.to_string());
        toplevel.set_app_id(app_id.to_string());
        surface.commit();

        let native = NativeSurface {
            display_ptr: self.conn.backend().display_ptr().cast(),
            surface_ptr: surface.id().as_ptr().cast(),
            surface_id: surface.id(),
        };

        self.state.surface_engines.insert(surface.id(), slot);
        self.state.windows.push(EmbedderWindow {
            slot,
            app_id: app_id.to_string(),
            surface,
            xdg_surface,
            toplevel,
            width,
            height,
            configured: false,
        });
        self.state.activation_stack.activate(app_id);

        // Round-trip so the initial configure lands before rendering starts
        self.conn
            .flush()
            .context("Failed to flush the Wayland connection")?;
        info!(
            "🪟 Window created for engine instance {} ({}x{})",
            slot, width, height
        );
        Ok(native)
    }

    /// Pumps compositor events until `running` goes false, petting the
    /// watchdog every iteration
    pub fn run(&mut self, running: &AtomicBool, watchdog: Option<&Watchdog>) -> Result<()> {
        info!("🎬 Display event pump started");
        while running.load(Ordering::SeqCst) {
            self.event_loop
                .dispatch(Duration::from_millis(16), &mut self.state)
                .context("Display event loop dispatch failed")?;
            if let Some(watchdog) = watchdog {
                watchdog.pet();
            }
            self.conn.flush().ok();
        }
        info!("🛑 Display event pump finished");
        Ok(())
    }

    /// Single pump step, used by the embedder's own loop
    pub fn pump(&mut self, timeout: Duration) -> Result<()> {
        self.event_loop
            .dispatch(timeout, &mut self.state)
            .context("Display event loop dispatch failed")?;
        self.conn.flush().ok();
        Ok(())
    }

    pub fn state(&self) -> &DisplayState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut DisplayState {
        &mut self.state
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for DisplayState {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => match interface.as_str() {
                "wl_output" => {
                    let output: wl_output::WlOutput =
                        registry.bind(name, version.min(4), qh, ());
                    debug!("Output {} appeared", name);
                    state.outputs.push((output, OutputInfo::new(name)));
                }
                "wl_seat" => {
                    let seat: wl_seat::WlSeat = registry.bind(name, version.min(7), qh, ());
                    debug!("Seat {} appeared", name);
                    state.seats.push(Seat::new(
                        seat,
                        state.default_repeat_rate,
                        state.default_repeat_delay_ms,
                    ));
                }
                _ => {}
            },
            wl_registry::Event::GlobalRemove { name } => {
                if let Some(position) = state
                    .outputs
                    .iter()
                    .position(|(_, info)| info.global_name == name)
                {
                    debug!("Output {} removed", name);
                    let (output, _) = state.outputs.remove(position);
                    output.release();
                }
            }
            _ => {}
        }
    }
}

// No events on these
impl Dispatch<wl_compositor::WlCompositor, ()> for DisplayState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_compositor::WlCompositor,
        _event: wl_compositor::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_shm::WlShm, ()> for DisplayState {
    fn event(
        _state: &mut Self,
        _proxy: &wl_shm::WlShm,
        _event: wl_shm::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<xdg_activation_v1::XdgActivationV1, ()> for DisplayState {
    fn event(
        _state: &mut Self,
        _proxy: &xdg_activation_v1::XdgActivationV1,
        _event: xdg_activation_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

// ---------------------------------------------------------------------------
// Surfaces and outputs
// ---------------------------------------------------------------------------

impl Dispatch<wl_surface::WlSurface, ()> for DisplayState {
    fn event(
        state: &mut Self,
        surface: &wl_surface::WlSurface,
        event: wl_surface::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_surface::Event::Enter { output } = event {
            let scale = state.output_scale(&output.id());
            if let Some(&slot) = state.surface_engines.get(&surface.id()) {
                state.sink.scale_changed(slot, scale as f64);
            }
        }
    }
}

impl Dispatch<wl_output::WlOutput, ()> for DisplayState {
    fn event(
        state: &mut Self,
        output: &wl_output::WlOutput,
        event: wl_output::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some((_, info)) = state
            .outputs
            .iter_mut()
            .find(|(proxy, _)| proxy.id() == output.id())
        else {
            return;
        };
        match event {
            wl_output::Event::Geometry {
                x,
                y,
                physical_width,
                physical_height,
                transform,
                ..
            } => {
                info.geometry_event(OutputGeometry {
                    x,
                    y,
                    physical_width,
                    physical_height,
                    transform: match transform {
                        WEnum::Value(t) => t as i32,
                        WEnum::Unknown(raw) => raw as i32,
                    },
                });
            }
            wl_output::Event::Mode {
                flags,
                width,
                height,
                refresh,
            } => {
                let current = match flags {
                    WEnum::Value(flags) => flags.contains(wl_output::Mode::Current),
                    WEnum::Unknown(_) => false,
                };
                info.mode_event(
                    current,
                    OutputMode {
                        width,
                        height,
                        refresh_mhz: refresh,
                    },
                );
            }
            wl_output::Event::Scale { factor } => info.scale_event(factor),
            wl_output::Event::Done => info.done_event(),
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// XDG shell
// ---------------------------------------------------------------------------

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for DisplayState {
    fn event(
        _state: &mut Self,
        wm_base: &xdg_wm_base::XdgWmBase,
        event: xdg_wm_base::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            wm_base.pong(serial);
        }
    }
}

impl Dispatch<xdg_surface::XdgSurface, usize> for DisplayState {
    fn event(
        state: &mut Self,
        xdg_surface: &xdg_surface::XdgSurface,
        event: xdg_surface::Event,
        data: &usize,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            xdg_surface.ack_configure(serial);
            let slot = *data;
            if let Some(window) = state.windows.iter_mut().find(|w| w.slot == slot) {
                let first = !window.configured;
                window.configured = true;
                let (width, height) = (window.width, window.height);
                if first {
                    state.sink.window_resized(slot, width, height);
                }
            }
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, usize> for DisplayState {
    fn event(
        state: &mut Self,
        _toplevel: &xdg_toplevel::XdgToplevel,
        event: xdg_toplevel::Event,
        data: &usize,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        let slot = *data;
        match event {
            xdg_toplevel::Event::Configure { width, height, .. } => {
                if width > 0 && height > 0 {
                    let mut changed = false;
                    if let Some(window) = state.windows.iter_mut().find(|w| w.slot == slot) {
                        let (new_width, new_height) = (width as u32, height as u32);
                        if window.width != new_width || window.height != new_height {
                            window.width = new_width;
                            window.height = new_height;
                            changed = window.configured;
                        }
                    }
                    if changed {
                        state.sink.window_resized(slot, width as u32, height as u32);
                    }
                }
            }
            xdg_toplevel::Event::Close => {
                info!("Window for engine instance {} asked to close", slot);
                state.remove_window(slot, qh);
            }
            _ => {}
        }
    }
}

impl Dispatch<xdg_activation_token_v1::XdgActivationTokenV1, usize> for DisplayState {
    fn event(
        state: &mut Self,
        token_proxy: &xdg_activation_token_v1::XdgActivationTokenV1,
        event: xdg_activation_token_v1::Event,
        data: &usize,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_activation_token_v1::Event::Done { token } = event {
            let slot = *data;
            if let (Some(activation), Some(window)) = (
                state.activation.as_ref(),
                state.windows.iter().find(|w| w.slot == slot),
            ) {
                activation.activate(token, &window.surface);
            }
            token_proxy.destroy();
        }
    }
}
