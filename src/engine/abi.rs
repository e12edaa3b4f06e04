//! Raw callback ABI of the hosted engine
//!
//! The engine is consumed exclusively through this fixed, versioned C ABI:
//! the embedder hands it callback tables at startup and calls a small set of
//! exported entry points afterwards. This module is layout only: every
//! struct is `#[repr(C)]` and free of behavior. The safe adaptation lives in
//! [`super::runtime`].

use std::os::raw::{c_char, c_void};

use super::{EngineError, EngineResult};

/// ABI version this embedder was built against. Passed to the engine's run
/// entry point, which refuses to start on a mismatch.
pub const ABI_VERSION: usize = 1;

/// Opaque engine instance handle owned by the engine library
pub type RawEngineHandle = *mut c_void;

/// Result codes shared by every engine entry point
pub const RESULT_SUCCESS: i32 = 0;
pub const RESULT_INVALID_LIBRARY_VERSION: i32 = 1;
pub const RESULT_INVALID_ARGUMENTS: i32 = 2;
pub const RESULT_INTERNAL_INCONSISTENCY: i32 = 3;

/// Maps an ABI result code onto the safe error type
pub fn check(code: i32) -> EngineResult {
    match code {
        RESULT_SUCCESS => Ok(()),
        RESULT_INVALID_ARGUMENTS => Err(EngineError::InvalidArguments),
        RESULT_INTERNAL_INCONSISTENCY => Err(EngineError::InternalInconsistency),
        other => Err(EngineError::Unavailable(format!(
            "engine returned unknown result code {}",
            other
        ))),
    }
}

// ---------------------------------------------------------------------------
// Renderer callback table
// ---------------------------------------------------------------------------

pub type BoolCallback = unsafe extern "C" fn(user_data: *mut c_void) -> bool;
pub type UIntCallback = unsafe extern "C" fn(user_data: *mut c_void) -> u32;
pub type ProcResolverCallback =
    unsafe extern "C" fn(user_data: *mut c_void, name: *const c_char) -> *mut c_void;
pub type TextureFrameCallback = unsafe extern "C" fn(
    user_data: *mut c_void,
    texture_id: i64,
    width: usize,
    height: usize,
    out_texture: *mut RawTexture,
) -> bool;
pub type PresentWithInfoCallback =
    unsafe extern "C" fn(user_data: *mut c_void, info: *const RawPresentInfo) -> bool;
pub type PopulateExistingDamageCallback =
    unsafe extern "C" fn(user_data: *mut c_void, fbo_id: isize, existing_damage: *mut RawDamage);

/// Rectangle in surface coordinates, `right`/`bottom` exclusive
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawRect {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

/// Damage region: a borrowed array of rectangles
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawDamage {
    pub struct_size: usize,
    pub num_rects: usize,
    pub damage: *mut RawRect,
}

/// Payload of a present-with-damage call
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawPresentInfo {
    pub struct_size: usize,
    /// Framebuffer being presented
    pub fbo_id: u32,
    /// Region of the frame that changed since the previous present
    pub frame_damage: RawDamage,
    /// Region the engine repainted (frame damage joined with the buffer's
    /// existing damage)
    pub buffer_damage: RawDamage,
}

/// A resolved external texture reported back to the engine
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawTexture {
    /// GL target (e.g. `GL_TEXTURE_2D`)
    pub target: u32,
    /// GL texture name
    pub name: u32,
    /// Pixel format (e.g. `GL_RGBA8`)
    pub format: u32,
    pub width: usize,
    pub height: usize,
    pub user_data: *mut c_void,
    pub destruction_callback: Option<unsafe extern "C" fn(user_data: *mut c_void)>,
}

/// Renderer callback table handed to the engine at startup
#[repr(C)]
pub struct RawRendererConfig {
    pub struct_size: usize,
    /// Context pointer passed back on every callback
    pub user_data: *mut c_void,
    pub make_current: BoolCallback,
    pub clear_current: BoolCallback,
    pub present: BoolCallback,
    pub fbo_callback: UIntCallback,
    pub resource_make_current: BoolCallback,
    pub proc_resolver: ProcResolverCallback,
    pub external_texture_frame: TextureFrameCallback,
    pub present_with_info: PresentWithInfoCallback,
    pub populate_existing_damage: PopulateExistingDamageCallback,
}

// ---------------------------------------------------------------------------
// Vulkan swapchain additions
// ---------------------------------------------------------------------------

pub type VulkanProcResolverCallback = unsafe extern "C" fn(
    user_data: *mut c_void,
    instance: *mut c_void,
    name: *const c_char,
) -> *mut c_void;
pub type VulkanNextImageCallback = unsafe extern "C" fn(
    user_data: *mut c_void,
    frame_info: *const RawFrameInfo,
    out_image: *mut RawVulkanImage,
) -> bool;
pub type VulkanPresentCallback =
    unsafe extern "C" fn(user_data: *mut c_void, image: *const RawVulkanImage) -> bool;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawUIntSize {
    pub width: u32,
    pub height: u32,
}

/// Metadata for the frame about to be drawn
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFrameInfo {
    pub struct_size: usize,
    pub size: RawUIntSize,
}

/// A swapchain image handed to the engine for rendering
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawVulkanImage {
    pub struct_size: usize,
    /// `VkImage` handle value
    pub image: u64,
    /// `VkFormat` value
    pub format: u32,
}

/// Vulkan-specific renderer callback table
#[repr(C)]
pub struct RawVulkanRendererConfig {
    pub struct_size: usize,
    pub user_data: *mut c_void,
    pub get_instance_proc_address: VulkanProcResolverCallback,
    pub get_next_image: VulkanNextImageCallback,
    pub present_image: VulkanPresentCallback,
}

// ---------------------------------------------------------------------------
// Compositor callback table
// ---------------------------------------------------------------------------

pub type CreateBackingStoreCallback = unsafe extern "C" fn(
    user_data: *mut c_void,
    config: *const RawBackingStoreConfig,
    out_store: *mut RawBackingStore,
) -> bool;
pub type CollectBackingStoreCallback =
    unsafe extern "C" fn(user_data: *mut c_void, store: *const RawBackingStore) -> bool;
pub type PresentLayersCallback = unsafe extern "C" fn(
    user_data: *mut c_void,
    layers: *const *const RawLayer,
    layer_count: usize,
) -> bool;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSize {
    pub width: f64,
    pub height: f64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawPoint {
    pub x: f64,
    pub y: f64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawBackingStoreConfig {
    pub struct_size: usize,
    pub size: RawSize,
}

/// A render target the embedder created for one compositor layer
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawBackingStore {
    pub struct_size: usize,
    pub user_data: *mut c_void,
    /// Backend-specific image identifier (swapchain image handle or fbo id)
    pub image: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawLayer {
    pub struct_size: usize,
    pub backing_store: *const RawBackingStore,
    pub offset: RawPoint,
    pub size: RawSize,
}

/// Compositor callback table handed to the engine at startup
#[repr(C)]
pub struct RawCompositorConfig {
    pub struct_size: usize,
    pub user_data: *mut c_void,
    pub create_backing_store: CreateBackingStoreCallback,
    pub collect_backing_store: CollectBackingStoreCallback,
    pub present_layers: PresentLayersCallback,
}

// ---------------------------------------------------------------------------
// Event and task structs
// ---------------------------------------------------------------------------

/// Pointer phases in ABI encoding
pub const POINTER_PHASE_CANCEL: i32 = 0;
pub const POINTER_PHASE_UP: i32 = 1;
pub const POINTER_PHASE_DOWN: i32 = 2;
pub const POINTER_PHASE_MOVE: i32 = 3;
pub const POINTER_PHASE_ADD: i32 = 4;
pub const POINTER_PHASE_REMOVE: i32 = 5;
pub const POINTER_PHASE_HOVER: i32 = 6;

/// Pointer device kinds in ABI encoding
pub const DEVICE_KIND_MOUSE: i32 = 1;
pub const DEVICE_KIND_TOUCH: i32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawPointerEvent {
    pub struct_size: usize,
    pub phase: i32,
    /// Event time, microseconds
    pub timestamp_us: usize,
    pub x: f64,
    pub y: f64,
    /// Seat pointer: 0; touch: the finger id
    pub device: i32,
    pub scroll_delta_x: f64,
    pub scroll_delta_y: f64,
    pub device_kind: i32,
    pub buttons: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawKeyEvent {
    pub struct_size: usize,
    pub timestamp_us: usize,
    pub scancode: u32,
    pub keysym: u32,
    /// NUL-terminated UTF-8 produced by the key, or null
    pub text: *const c_char,
    pub pressed: bool,
    pub repeat: bool,
    /// Modifier bitmask: shift 1, ctrl 2, alt 4, logo 8, caps 16, num 32
    pub modifiers: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawWindowMetricsEvent {
    pub struct_size: usize,
    pub width: usize,
    pub height: usize,
    pub pixel_ratio: f64,
}

/// A deferred work item the engine posts to the embedder's task runner
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawTask {
    pub token: u64,
    /// Absolute deadline on the engine's monotonic clock, nanoseconds
    pub target_time_nanos: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawPlatformMessage {
    pub struct_size: usize,
    pub channel: *const c_char,
    pub message: *const u8,
    pub message_size: usize,
    /// Engine-owned handle for responding; null for fire-and-forget
    pub response_handle: *mut c_void,
}

/// Callback through which the engine posts tasks to the embedder
pub type PostTaskCallback =
    unsafe extern "C" fn(user_data: *mut c_void, task: *const RawTask) -> bool;

/// Task runner description handed to the engine at startup
#[repr(C)]
pub struct RawTaskRunnerConfig {
    pub struct_size: usize,
    pub user_data: *mut c_void,
    pub post_task: PostTaskCallback,
}

// ---------------------------------------------------------------------------
// Exported entry points resolved from the engine library
// ---------------------------------------------------------------------------

pub const SYM_RUN: &[u8] = b"ui_engine_run\0";
pub const SYM_SHUTDOWN: &[u8] = b"ui_engine_shutdown\0";
pub const SYM_SEND_WINDOW_METRICS: &[u8] = b"ui_engine_send_window_metrics_event\0";
pub const SYM_SEND_POINTER_EVENT: &[u8] = b"ui_engine_send_pointer_event\0";
pub const SYM_SEND_KEY_EVENT: &[u8] = b"ui_engine_send_key_event\0";
pub const SYM_RUN_TASK: &[u8] = b"ui_engine_run_task\0";
pub const SYM_CURRENT_TIME: &[u8] = b"ui_engine_get_current_time\0";
pub const SYM_SEND_PLATFORM_MESSAGE: &[u8] = b"ui_engine_send_platform_message\0";
pub const SYM_UPDATE_LOCALE: &[u8] = b"ui_engine_update_locale\0";

pub type RunFn = unsafe extern "C" fn(
    version: usize,
    renderer: *const RawRendererConfig,
    compositor: *const RawCompositorConfig,
    task_runner: *const RawTaskRunnerConfig,
    bundle_path: *const c_char,
    out_handle: *mut RawEngineHandle,
) -> i32;
pub type ShutdownFn = unsafe extern "C" fn(handle: RawEngineHandle) -> i32;
pub type SendWindowMetricsFn =
    unsafe extern "C" fn(handle: RawEngineHandle, event: *const RawWindowMetricsEvent) -> i32;
pub type SendPointerEventFn = unsafe extern "C" fn(
    handle: RawEngineHandle,
    events: *const RawPointerEvent,
    count: usize,
) -> i32;
pub type SendKeyEventFn =
    unsafe extern "C" fn(handle: RawEngineHandle, event: *const RawKeyEvent) -> i32;
pub type RunTaskFn = unsafe extern "C" fn(handle: RawEngineHandle, task: *const RawTask) -> i32;
pub type CurrentTimeFn = unsafe extern "C" fn() -> u64;
pub type SendPlatformMessageFn =
    unsafe extern "C" fn(handle: RawEngineHandle, message: *const RawPlatformMessage) -> i32;
pub type UpdateLocaleFn =
    unsafe extern "C" fn(handle: RawEngineHandle, locale: *const c_char) -> i32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(check(RESULT_SUCCESS), Ok(()));
        assert_eq!(
            check(RESULT_INVALID_ARGUMENTS),
            Err(EngineError::InvalidArguments)
        );
        assert_eq!(
            check(RESULT_INTERNAL_INCONSISTENCY),
            Err(EngineError::InternalInconsistency)
        );
        assert!(matches!(check(42), Err(EngineError::Unavailable(_))));
    }

    #[test]
    fn test_symbol_names_are_nul_terminated() {
        for sym in [
            SYM_RUN,
            SYM_SHUTDOWN,
            SYM_SEND_WINDOW_METRICS,
            SYM_SEND_POINTER_EVENT,
            SYM_SEND_KEY_EVENT,
            SYM_RUN_TASK,
            SYM_CURRENT_TIME,
            SYM_SEND_PLATFORM_MESSAGE,
            SYM_UPDATE_LOCALE,
        ] {
            assert_eq!(sym.last(), Some(&0u8));
        }
    }
}
