//! Production binding to the hosted engine library
//!
//! [`EngineLibrary`] resolves the engine's exported entry points from its
//! shared object; [`RuntimeEngine`] implements [`Engine`] over them. The
//! `bind_*` functions adapt the backend capability traits into the ABI's
//! callback tables: each table's `user_data` is a leaked box around a
//! context owning an `Arc` of the capability object, reclaimed when the
//! bound config is dropped. No global tables, nothing keyed by raw
//! pointers.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;

use super::abi;
use super::{
    Engine, EngineError, EngineResult, EngineTask, KeyEvent, PointerDeviceKind, PointerEvent,
    PointerPhase, WindowMetrics,
};
use crate::backend::damage::DamageRect;
use crate::backend::{
    BackingStore, CompositorOps, Layer, PresentInfo, RendererOps, VulkanOps,
};
use crate::runner::TaskRunner;

// ---------------------------------------------------------------------------
// Engine library
// ---------------------------------------------------------------------------

/// The engine's entry points, resolved once at load time
pub struct EngineLibrary {
    // Dropped last; the resolved pointers borrow from it
    _lib: libloading::Library,
    run: abi::RunFn,
    shutdown: abi::ShutdownFn,
    send_window_metrics: abi::SendWindowMetricsFn,
    send_pointer_event: abi::SendPointerEventFn,
    send_key_event: abi::SendKeyEventFn,
    run_task: abi::RunTaskFn,
    current_time: abi::CurrentTimeFn,
    send_platform_message: abi::SendPlatformMessageFn,
    update_locale: abi::UpdateLocaleFn,
}

impl EngineLibrary {
    /// Loads the engine shared object and resolves every required symbol.
    /// A missing symbol is a fatal startup error.
    pub fn load(path: &Path) -> Result<Self> {
        let lib = unsafe { libloading::Library::new(path) }
            .with_context(|| format!("Failed to load engine library {}", path.display()))?;

        unsafe {
            let library = Self {
                run: *lib
                    .get(abi::SYM_RUN)
                    .context("Engine library lacks the run entry point")?,
                shutdown: *lib
                    .get(abi::SYM_SHUTDOWN)
                    .context("Engine library lacks the shutdown entry point")?,
                send_window_metrics: *lib
                    .get(abi::SYM_SEND_WINDOW_METRICS)
                    .context("Engine library lacks the window-metrics entry point")?,
                send_pointer_event: *lib
                    .get(abi::SYM_SEND_POINTER_EVENT)
                    .context("Engine library lacks the pointer-event entry point")?,
                send_key_event: *lib
                    .get(abi::SYM_SEND_KEY_EVENT)
                    .context("Engine library lacks the key-event entry point")?,
                run_task: *lib
                    .get(abi::SYM_RUN_TASK)
                    .context("Engine library lacks the run-task entry point")?,
                current_time: *lib
                    .get(abi::SYM_CURRENT_TIME)
                    .context("Engine library lacks the current-time entry point")?,
                send_platform_message: *lib
                    .get(abi::SYM_SEND_PLATFORM_MESSAGE)
                    .context("Engine library lacks the platform-message entry point")?,
                update_locale: *lib
                    .get(abi::SYM_UPDATE_LOCALE)
                    .context("Engine library lacks the locale entry point")?,
                _lib: lib,
            };
            info!("📦 Engine library loaded from {}", path.display());
            Ok(library)
        }
    }
}

/// A live engine instance driven through the loaded library
pub struct RuntimeEngine {
    library: Arc<EngineLibrary>,
    handle: abi::RawEngineHandle,
}

// The engine handle is documented thread-safe in the ABI; the embedder adds
// its own strand on top via the task runner.
unsafe impl Send for RuntimeEngine {}
unsafe impl Sync for RuntimeEngine {}

impl RuntimeEngine {
    /// Starts an engine instance with the bound callback tables.
    ///
    /// The bound configs must outlive the returned engine; [`super::state::EngineState`]
    /// owns both and drops the engine first.
    pub fn run(
        library: Arc<EngineLibrary>,
        bundle_path: &Path,
        renderer: &BoundRendererConfig,
        compositor: Option<&BoundCompositorConfig>,
        task_runner: &BoundTaskRunnerConfig,
    ) -> Result<Arc<Self>> {
        let bundle = CString::new(bundle_path.to_string_lossy().as_bytes())
            .context("Bundle path contains an interior NUL")?;
        let mut handle: abi::RawEngineHandle = std::ptr::null_mut();
        let compositor_ptr = compositor
            .map(|c| &c.raw as *const abi::RawCompositorConfig)
            .unwrap_or(std::ptr::null());

        let code = unsafe {
            (library.run)(
                abi::ABI_VERSION,
                &renderer.raw,
                compositor_ptr,
                &task_runner.raw,
                bundle.as_ptr(),
                &mut handle,
            )
        };
        abi::check(code).map_err(|e| anyhow::anyhow!("Engine failed to start: {}", e))?;
        if handle.is_null() {
            anyhow::bail!("Engine reported success but returned a null handle");
        }

        info!("🚀 Engine instance started");
        Ok(Arc::new(Self { library, handle }))
    }
}

impl Engine for RuntimeEngine {
    fn notify_window_metrics(&self, metrics: WindowMetrics) -> EngineResult {
        let event = abi::RawWindowMetricsEvent {
            struct_size: std::mem::size_of::<abi::RawWindowMetricsEvent>(),
            width: metrics.width as usize,
            height: metrics.height as usize,
            pixel_ratio: metrics.pixel_ratio,
        };
        abi::check(unsafe { (self.library.send_window_metrics)(self.handle, &event) })
    }

    fn send_pointer_event(&self, event: PointerEvent) -> EngineResult {
        let raw = abi::RawPointerEvent {
            struct_size: std::mem::size_of::<abi::RawPointerEvent>(),
            phase: phase_to_abi(event.phase),
            timestamp_us: event.timestamp_ms as usize * 1000,
            x: event.x,
            y: event.y,
            device: event.device,
            scroll_delta_x: event.scroll_delta_x,
            scroll_delta_y: event.scroll_delta_y,
            device_kind: match event.kind {
                PointerDeviceKind::Mouse => abi::DEVICE_KIND_MOUSE,
                PointerDeviceKind::Touch => abi::DEVICE_KIND_TOUCH,
            },
            buttons: event.buttons as i64,
        };
        abi::check(unsafe { (self.library.send_pointer_event)(self.handle, &raw, 1) })
    }

    fn send_key_event(&self, event: KeyEvent) -> EngineResult {
        let text = event
            .text
            .as_deref()
            .and_then(|t| CString::new(t).ok());
        let raw = abi::RawKeyEvent {
            struct_size: std::mem::size_of::<abi::RawKeyEvent>(),
            timestamp_us: event.timestamp_ms as usize * 1000,
            scancode: event.scancode,
            keysym: event.keysym,
            text: text.as_ref().map(|t| t.as_ptr()).unwrap_or(std::ptr::null()),
            pressed: event.pressed,
            repeat: event.repeat,
            modifiers: modifiers_to_abi(&event),
        };
        abi::check(unsafe { (self.library.send_key_event)(self.handle, &raw) })
    }

    fn run_task(&self, task: &EngineTask) -> EngineResult {
        let raw = abi::RawTask {
            token: task.token,
            target_time_nanos: task.target_time.as_nanos() as u64,
        };
        abi::check(unsafe { (self.library.run_task)(self.handle, &raw) })
    }

    fn current_time(&self) -> Duration {
        Duration::from_nanos(unsafe { (self.library.current_time)() })
    }

    fn send_platform_message(&self, channel: &str, payload: &[u8]) -> EngineResult {
        let channel = CString::new(channel).map_err(|_| EngineError::InvalidArguments)?;
        let raw = abi::RawPlatformMessage {
            struct_size: std::mem::size_of::<abi::RawPlatformMessage>(),
            channel: channel.as_ptr(),
            message: payload.as_ptr(),
            message_size: payload.len(),
            response_handle: std::ptr::null_mut(),
        };
        abi::check(unsafe { (self.library.send_platform_message)(self.handle, &raw) })
    }

    fn update_locale(&self, locale: &str) -> EngineResult {
        let locale = CString::new(locale).map_err(|_| EngineError::InvalidArguments)?;
        abi::check(unsafe { (self.library.update_locale)(self.handle, locale.as_ptr()) })
    }

    fn shutdown(&self) -> EngineResult {
        debug!("Shutting down engine instance");
        abi::check(unsafe { (self.library.shutdown)(self.handle) })
    }
}

fn phase_to_abi(phase: PointerPhase) -> i32 {
    match phase {
        PointerPhase::Add => abi::POINTER_PHASE_ADD,
        PointerPhase::Hover => abi::POINTER_PHASE_HOVER,
        PointerPhase::Down => abi::POINTER_PHASE_DOWN,
        PointerPhase::Move => abi::POINTER_PHASE_MOVE,
        PointerPhase::Up => abi::POINTER_PHASE_UP,
        PointerPhase::Remove => abi::POINTER_PHASE_REMOVE,
    }
}

fn modifiers_to_abi(event: &KeyEvent) -> u32 {
    let m = &event.modifiers;
    (m.shift as u32)
        | (m.ctrl as u32) << 1
        | (m.alt as u32) << 2
        | (m.logo as u32) << 3
        | (m.caps_lock as u32) << 4
        | (m.num_lock as u32) << 5
}

// ---------------------------------------------------------------------------
// Renderer config binding
// ---------------------------------------------------------------------------

struct RendererContext {
    ops: Arc<dyn RendererOps>,
    /// Backing storage for the rectangle reported through
    /// `populate_existing_damage`; the engine copies it during the call
    scratch_damage: Mutex<abi::RawRect>,
}

/// A renderer callback table plus the context it borrows.
///
/// Must outlive the engine instance it was handed to.
pub struct BoundRendererConfig {
    pub raw: abi::RawRendererConfig,
    context: *mut RendererContext,
}

unsafe impl Send for BoundRendererConfig {}
unsafe impl Sync for BoundRendererConfig {}

impl Drop for BoundRendererConfig {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.context) });
    }
}

/// Binds a backend's renderer capability into the engine's callback table
pub fn bind_renderer_config(ops: Arc<dyn RendererOps>) -> BoundRendererConfig {
    let context = Box::into_raw(Box::new(RendererContext {
        ops,
        scratch_damage: Mutex::new(abi::RawRect::default()),
    }));

    BoundRendererConfig {
        raw: abi::RawRendererConfig {
            struct_size: std::mem::size_of::<abi::RawRendererConfig>(),
            user_data: context.cast(),
            make_current: renderer_make_current,
            clear_current: renderer_clear_current,
            present: renderer_present,
            fbo_callback: renderer_fbo,
            resource_make_current: renderer_resource_make_current,
            proc_resolver: renderer_proc_resolver,
            external_texture_frame: renderer_texture_frame,
            present_with_info: renderer_present_with_info,
            populate_existing_damage: renderer_populate_existing_damage,
        },
        context,
    }
}

unsafe fn renderer_context<'a>(user_data: *mut c_void) -> &'a RendererContext {
    &*(user_data as *const RendererContext)
}

unsafe extern "C" fn renderer_make_current(user_data: *mut c_void) -> bool {
    renderer_context(user_data).ops.make_current()
}

unsafe extern "C" fn renderer_clear_current(user_data: *mut c_void) -> bool {
    renderer_context(user_data).ops.clear_current()
}

unsafe extern "C" fn renderer_present(user_data: *mut c_void) -> bool {
    renderer_context(user_data).ops.present()
}

unsafe extern "C" fn renderer_fbo(user_data: *mut c_void) -> u32 {
    renderer_context(user_data).ops.fbo_id()
}

unsafe extern "C" fn renderer_resource_make_current(user_data: *mut c_void) -> bool {
    renderer_context(user_data).ops.resource_make_current()
}

unsafe extern "C" fn renderer_proc_resolver(
    user_data: *mut c_void,
    name: *const c_char,
) -> *mut c_void {
    if name.is_null() {
        return std::ptr::null_mut();
    }
    let name = CStr::from_ptr(name);
    match name.to_str() {
        Ok(name) => renderer_context(user_data).ops.proc_address(name),
        Err(_) => std::ptr::null_mut(),
    }
}

unsafe extern "C" fn renderer_texture_frame(
    user_data: *mut c_void,
    texture_id: i64,
    width: usize,
    height: usize,
    out_texture: *mut abi::RawTexture,
) -> bool {
    let context = renderer_context(user_data);
    match context
        .ops
        .texture_frame(texture_id, width as u32, height as u32)
    {
        Some(frame) => {
            *out_texture = abi::RawTexture {
                target: frame.target,
                name: frame.name,
                format: frame.format,
                width: frame.width as usize,
                height: frame.height as usize,
                user_data: std::ptr::null_mut(),
                destruction_callback: None,
            };
            true
        }
        None => false,
    }
}

unsafe extern "C" fn renderer_present_with_info(
    user_data: *mut c_void,
    info: *const abi::RawPresentInfo,
) -> bool {
    if info.is_null() {
        return renderer_context(user_data).ops.present();
    }
    let info = &*info;
    let frame_damage = if info.frame_damage.num_rects > 0 && !info.frame_damage.damage.is_null() {
        raw_rect_to_damage(&*info.frame_damage.damage)
    } else {
        DamageRect::default()
    };
    renderer_context(user_data).ops.present_with_damage(&PresentInfo {
        fbo_id: info.fbo_id,
        frame_damage,
    })
}

unsafe extern "C" fn renderer_populate_existing_damage(
    user_data: *mut c_void,
    fbo_id: isize,
    existing_damage: *mut abi::RawDamage,
) {
    if existing_damage.is_null() {
        return;
    }
    let context = renderer_context(user_data);
    let rect = context.ops.existing_damage(fbo_id.max(0) as u32);

    let mut scratch = context.scratch_damage.lock();
    *scratch = damage_to_raw_rect(&rect);
    (*existing_damage).struct_size = std::mem::size_of::<abi::RawDamage>();
    (*existing_damage).num_rects = 1;
    (*existing_damage).damage = context.scratch_damage.data_ptr();
}

fn raw_rect_to_damage(rect: &abi::RawRect) -> DamageRect {
    DamageRect {
        x: rect.left as i32,
        y: rect.top as i32,
        width: (rect.right - rect.left).max(0.0) as u32,
        height: (rect.bottom - rect.top).max(0.0) as u32,
    }
}

fn damage_to_raw_rect(rect: &DamageRect) -> abi::RawRect {
    abi::RawRect {
        left: rect.x as f64,
        top: rect.y as f64,
        right: (rect.x + rect.width as i32) as f64,
        bottom: (rect.y + rect.height as i32) as f64,
    }
}

// ---------------------------------------------------------------------------
// Vulkan renderer config binding
// ---------------------------------------------------------------------------

struct VulkanContext {
    ops: Arc<dyn VulkanOps>,
}

/// A Vulkan callback table plus its context
pub struct BoundVulkanConfig {
    pub raw: abi::RawVulkanRendererConfig,
    context: *mut VulkanContext,
}

unsafe impl Send for BoundVulkanConfig {}
unsafe impl Sync for BoundVulkanConfig {}

impl Drop for BoundVulkanConfig {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.context) });
    }
}

/// Binds the Vulkan capability into the engine's swapchain callback table
pub fn bind_vulkan_config(ops: Arc<dyn VulkanOps>) -> BoundVulkanConfig {
    let context = Box::into_raw(Box::new(VulkanContext { ops }));
    BoundVulkanConfig {
        raw: abi::RawVulkanRendererConfig {
            struct_size: std::mem::size_of::<abi::RawVulkanRendererConfig>(),
            user_data: context.cast(),
            get_instance_proc_address: vulkan_proc_resolver,
            get_next_image: vulkan_next_image,
            present_image: vulkan_present_image,
        },
        context,
    }
}

unsafe fn vulkan_context<'a>(user_data: *mut c_void) -> &'a VulkanContext {
    &*(user_data as *const VulkanContext)
}

unsafe extern "C" fn vulkan_proc_resolver(
    user_data: *mut c_void,
    instance: *mut c_void,
    name: *const c_char,
) -> *mut c_void {
    if name.is_null() {
        return std::ptr::null_mut();
    }
    match CStr::from_ptr(name).to_str() {
        Ok(name) => vulkan_context(user_data)
            .ops
            .instance_proc_address(instance, name),
        Err(_) => std::ptr::null_mut(),
    }
}

unsafe extern "C" fn vulkan_next_image(
    user_data: *mut c_void,
    _frame_info: *const abi::RawFrameInfo,
    out_image: *mut abi::RawVulkanImage,
) -> bool {
    match vulkan_context(user_data).ops.next_image() {
        Some(image) => {
            *out_image = abi::RawVulkanImage {
                struct_size: std::mem::size_of::<abi::RawVulkanImage>(),
                image: image.image,
                format: image.format,
            };
            true
        }
        None => false,
    }
}

unsafe extern "C" fn vulkan_present_image(
    user_data: *mut c_void,
    image: *const abi::RawVulkanImage,
) -> bool {
    if image.is_null() {
        return false;
    }
    let image = &*image;
    vulkan_context(user_data).ops.present_image(&crate::backend::VulkanImage {
        image: image.image,
        format: image.format,
    })
}

// ---------------------------------------------------------------------------
// Compositor config binding
// ---------------------------------------------------------------------------

struct CompositorContext {
    ops: Arc<dyn CompositorOps>,
}

/// A compositor callback table plus its context
pub struct BoundCompositorConfig {
    pub raw: abi::RawCompositorConfig,
    context: *mut CompositorContext,
}

unsafe impl Send for BoundCompositorConfig {}
unsafe impl Sync for BoundCompositorConfig {}

impl Drop for BoundCompositorConfig {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.context) });
    }
}

/// Binds the compositor capability into the engine's callback table
pub fn bind_compositor_config(ops: Arc<dyn CompositorOps>) -> BoundCompositorConfig {
    let context = Box::into_raw(Box::new(CompositorContext { ops }));
    BoundCompositorConfig {
        raw: abi::RawCompositorConfig {
            struct_size: std::mem::size_of::<abi::RawCompositorConfig>(),
            user_data: context.cast(),
            create_backing_store: compositor_create_backing_store,
            collect_backing_store: compositor_collect_backing_store,
            present_layers: compositor_present_layers,
        },
        context,
    }
}

unsafe fn compositor_context<'a>(user_data: *mut c_void) -> &'a CompositorContext {
    &*(user_data as *const CompositorContext)
}

unsafe extern "C" fn compositor_create_backing_store(
    user_data: *mut c_void,
    config: *const abi::RawBackingStoreConfig,
    out_store: *mut abi::RawBackingStore,
) -> bool {
    if config.is_null() || out_store.is_null() {
        return false;
    }
    let config = &*config;
    match compositor_context(user_data)
        .ops
        .create_backing_store(config.size.width, config.size.height)
    {
        Some(store) => {
            *out_store = abi::RawBackingStore {
                struct_size: std::mem::size_of::<abi::RawBackingStore>(),
                user_data: std::ptr::null_mut(),
                image: store.image,
            };
            true
        }
        None => false,
    }
}

unsafe extern "C" fn compositor_collect_backing_store(
    user_data: *mut c_void,
    store: *const abi::RawBackingStore,
) -> bool {
    if store.is_null() {
        return false;
    }
    let store = &*store;
    compositor_context(user_data)
        .ops
        .collect_backing_store(&BackingStore { image: store.image })
}

unsafe extern "C" fn compositor_present_layers(
    user_data: *mut c_void,
    layers: *const *const abi::RawLayer,
    layer_count: usize,
) -> bool {
    let mut converted = Vec::with_capacity(layer_count);
    if !layers.is_null() {
        for i in 0..layer_count {
            let layer = *layers.add(i);
            if layer.is_null() || (*layer).backing_store.is_null() {
                continue;
            }
            let layer = &*layer;
            let store = &*layer.backing_store;
            converted.push(Layer {
                store: BackingStore { image: store.image },
                offset: (layer.offset.x, layer.offset.y),
                size: (layer.size.width, layer.size.height),
            });
        }
    }
    compositor_context(user_data).ops.present_layers(&converted)
}

// ---------------------------------------------------------------------------
// Task runner binding
// ---------------------------------------------------------------------------

/// Indirection between the engine's post-task callback and the runner.
///
/// The engine receives its callback table before the runner exists (the
/// runner needs the engine handle); posts that arrive in that window are
/// buffered and flushed on attach.
pub struct TaskPoster {
    inner: Mutex<TaskPosterState>,
}

struct TaskPosterState {
    runner: Option<Arc<TaskRunner>>,
    pending: Vec<EngineTask>,
}

impl TaskPoster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TaskPosterState {
                runner: None,
                pending: Vec::new(),
            }),
        })
    }

    /// Wires the runner in and flushes any buffered tasks
    pub fn attach(&self, runner: Arc<TaskRunner>) {
        let mut inner = self.inner.lock();
        for task in inner.pending.drain(..) {
            runner.post_task(task);
        }
        inner.runner = Some(runner);
    }

    pub fn post(&self, task: EngineTask) {
        let mut inner = self.inner.lock();
        match &inner.runner {
            Some(runner) => runner.post_task(task),
            None => inner.pending.push(task),
        }
    }
}

/// A task-runner callback table plus its context
pub struct BoundTaskRunnerConfig {
    pub raw: abi::RawTaskRunnerConfig,
    context: *mut Arc<TaskPoster>,
}

unsafe impl Send for BoundTaskRunnerConfig {}
unsafe impl Sync for BoundTaskRunnerConfig {}

impl Drop for BoundTaskRunnerConfig {
    fn drop(&mut self) {
        drop(unsafe { Box::from_raw(self.context) });
    }
}

/// Binds a task poster into the engine's task-runner description
pub fn bind_task_runner_config(poster: Arc<TaskPoster>) -> BoundTaskRunnerConfig {
    let context = Box::into_raw(Box::new(poster));
    BoundTaskRunnerConfig {
        raw: abi::RawTaskRunnerConfig {
            struct_size: std::mem::size_of::<abi::RawTaskRunnerConfig>(),
            user_data: context.cast(),
            post_task: task_runner_post_task,
        },
        context,
    }
}

unsafe extern "C" fn task_runner_post_task(
    user_data: *mut c_void,
    task: *const abi::RawTask,
) -> bool {
    if task.is_null() {
        warn!("Engine posted a null task");
        return false;
    }
    let raw = &*task;
    let poster = &*(user_data as *const Arc<TaskPoster>);
    poster.post(EngineTask {
        token: raw.token,
        target_time: Duration::from_nanos(raw.target_time_nanos),
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TextureFrame;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingOps {
        make_current_calls: AtomicU32,
        present_calls: AtomicU32,
    }

    impl RendererOps for CountingOps {
        fn make_current(&self) -> bool {
            self.make_current_calls.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn clear_current(&self) -> bool {
            true
        }
        fn present(&self) -> bool {
            self.present_calls.fetch_add(1, Ordering::SeqCst);
            true
        }
        fn fbo_id(&self) -> u32 {
            42
        }
        fn resource_make_current(&self) -> bool {
            false
        }
        fn proc_address(&self, _name: &str) -> *mut c_void {
            std::ptr::null_mut()
        }
        fn texture_frame(
            &self,
            texture_id: i64,
            _width: u32,
            _height: u32,
        ) -> Option<TextureFrame> {
            (texture_id == 1).then_some(TextureFrame {
                target: 1,
                name: 2,
                format: 3,
                width: 4,
                height: 5,
            })
        }
        fn present_with_damage(&self, _info: &PresentInfo) -> bool {
            true
        }
        fn existing_damage(&self, _fbo_id: u32) -> DamageRect {
            DamageRect::new(1, 2, 3, 4)
        }
    }

    #[test]
    fn test_renderer_trampolines_reach_the_ops() {
        let ops = Arc::new(CountingOps::default());
        let bound = bind_renderer_config(Arc::clone(&ops) as Arc<dyn RendererOps>);

        unsafe {
            assert!((bound.raw.make_current)(bound.raw.user_data));
            assert!((bound.raw.present)(bound.raw.user_data));
            assert_eq!((bound.raw.fbo_callback)(bound.raw.user_data), 42);
            assert!(!(bound.raw.resource_make_current)(bound.raw.user_data));
        }
        assert_eq!(ops.make_current_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ops.present_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_texture_frame_trampoline_fills_output() {
        let ops = Arc::new(CountingOps::default());
        let bound = bind_renderer_config(ops as Arc<dyn RendererOps>);

        let mut out = abi::RawTexture {
            target: 0,
            name: 0,
            format: 0,
            width: 0,
            height: 0,
            user_data: std::ptr::null_mut(),
            destruction_callback: None,
        };
        unsafe {
            assert!((bound.raw.external_texture_frame)(
                bound.raw.user_data,
                1,
                4,
                5,
                &mut out
            ));
            assert_eq!(out.name, 2);
            // Unknown id reports "not found"
            assert!(!(bound.raw.external_texture_frame)(
                bound.raw.user_data,
                9,
                4,
                5,
                &mut out
            ));
        }
    }

    #[test]
    fn test_populate_existing_damage_writes_scratch_rect() {
        let ops = Arc::new(CountingOps::default());
        let bound = bind_renderer_config(ops as Arc<dyn RendererOps>);

        let mut out = abi::RawDamage {
            struct_size: 0,
            num_rects: 0,
            damage: std::ptr::null_mut(),
        };
        unsafe {
            (bound.raw.populate_existing_damage)(bound.raw.user_data, 0, &mut out);
            assert_eq!(out.num_rects, 1);
            let rect = &*out.damage;
            assert_eq!(rect.left, 1.0);
            assert_eq!(rect.top, 2.0);
            assert_eq!(rect.right, 4.0);
            assert_eq!(rect.bottom, 6.0);
        }
    }

    #[test]
    fn test_task_poster_buffers_until_attached() {
        use crate::engine::{EngineResult, KeyEvent, PointerEvent};

        struct NullEngine;
        impl Engine for NullEngine {
            fn notify_window_metrics(&self, _m: WindowMetrics) -> EngineResult {
                Ok(())
            }
            fn send_pointer_event(&self, _e: PointerEvent) -> EngineResult {
                Ok(())
            }
            fn send_key_event(&self, _e: KeyEvent) -> EngineResult {
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
                Ok(())
            }
        }

        let poster = TaskPoster::new();
        let bound = bind_task_runner_config(Arc::clone(&poster));

        let raw = abi::RawTask {
            token: 11,
            target_time_nanos: 5,
        };
        unsafe {
            assert!((bound.raw.post_task)(bound.raw.user_data, &raw));
        }
        assert_eq!(poster.inner.lock().pending.len(), 1);

        let runner = Arc::new(TaskRunner::new(Arc::new(NullEngine), 0).unwrap());
        poster.attach(runner);
        assert!(poster.inner.lock().pending.is_empty());
    }

    #[test]
    fn test_rect_conversions() {
        let rect = DamageRect::new(10, 20, 30, 40);
        let raw = damage_to_raw_rect(&rect);
        assert_eq!(raw_rect_to_damage(&raw), rect);
    }
}
