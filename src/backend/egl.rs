//! Windowed EGL/GL backend
//!
//! One native `wl_egl_window`-backed drawable per engine instance slot, a
//! primary and a shared resource context, and a damage-aware present path:
//! when the swap-with-damage extension is available the swap carries the
//! frame's damage rectangle, and the bounded damage history answers the
//! engine's buffer-age queries so unaffected regions are not repainted.
//! Missing extensions degrade silently to full-frame behavior.

use std::ffi::c_void;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use khronos_egl as egl;
use log::{debug, info, warn};
use parking_lot::Mutex;
use wayland_egl::WlEglSurface;

use super::damage::{DamageHistory, DamageRect, ExistingDamageMap, FALLBACK_BUFFER_AGE};
use super::{
    Backend, BackendKind, CompositorOps, NativeSurface, PresentInfo, RendererOps, TextureFrame,
    VulkanOps,
};
use crate::engine::messenger::TextureRegistry;
use crate::engine::{Engine, WindowMetrics};

type EglInstance = egl::DynamicInstance<egl::EGL1_4>;

/// `EGL_BUFFER_AGE_EXT`, not exported by the EGL 1.4 core bindings
const EGL_BUFFER_AGE_EXT: i32 = 0x313D;

/// `EGLBoolean` swap entry point taking a damage rect list
type SwapWithDamageFn =
    unsafe extern "system" fn(*mut c_void, *mut c_void, *const i32, i32) -> u32;

#[derive(Default)]
struct EglExtensions {
    /// `EGL_EXT_buffer_age`
    buffer_age: bool,
    /// `eglSwapBuffersWithDamageKHR`
    swap_with_damage: Option<SwapWithDamageFn>,
    /// `eglSetDamageRegionKHR` from `EGL_KHR_partial_update`
    set_damage_region: Option<SwapWithDamageFn>,
}

struct EglState {
    display: egl::Display,
    config: egl::Config,
    context: egl::Context,
    resource_context: egl::Context,
    /// 1x1 pbuffer keeping the resource context bindable without a window
    resource_surface: egl::Surface,
    extensions: EglExtensions,
}

struct GlSlot {
    surface: egl::Surface,
    // Owns the wl_egl_window; dropped with the slot
    egl_window: WlEglSurface,
    width: u32,
    height: u32,
    history: DamageHistory,
    existing: ExistingDamageMap,
}

/// EGL/GL backend state shared by every instance slot
pub struct GlBackend {
    egl: EglInstance,
    state: Mutex<Option<EglState>>,
    slots: Mutex<Vec<Option<GlSlot>>>,
    damage_history_cap: usize,
    textures: Arc<TextureRegistry>,
}

// EGL handles are plain pointers; the engine honors the
// make_current/clear_current bracket, so no context is ever touched from two
// threads at once.
unsafe impl Send for GlBackend {}
unsafe impl Sync for GlBackend {}

impl GlBackend {
    /// Loads libEGL. The display connection is bound lazily on the first
    /// `create_surface`, which is when a native display pointer exists.
    pub fn new(damage_history_cap: usize, textures: Arc<TextureRegistry>) -> Result<Self> {
        let egl = unsafe { EglInstance::load_required() }
            .context("Failed to load libEGL; no GL backend available")?;
        Ok(Self {
            egl,
            state: Mutex::new(None),
            slots: Mutex::new(Vec::new()),
            damage_history_cap,
            textures,
        })
    }

    /// One-time EGL display/context initialization
    fn ensure_initialized(&self, display_ptr: *mut c_void) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(());
        }

        let display = unsafe { self.egl.get_display(display_ptr) }
            .ok_or_else(|| anyhow!("eglGetDisplay failed for the Wayland display"))?;
        let (major, minor) = self
            .egl
            .initialize(display)
            .context("eglInitialize failed")?;
        debug!("EGL initialized, version {}.{}", major, minor);

        self.egl
            .bind_api(egl::OPENGL_ES_API)
            .context("Failed to bind the GLES API")?;

        let config_attribs = [
            egl::SURFACE_TYPE,
            egl::WINDOW_BIT | egl::PBUFFER_BIT,
            egl::RENDERABLE_TYPE,
            egl::OPENGL_ES2_BIT,
            egl::RED_SIZE,
            8,
            egl::GREEN_SIZE,
            8,
            egl::BLUE_SIZE,
            8,
            egl::ALPHA_SIZE,
            8,
            egl::NONE,
        ];
        let config = self
            .egl
            .choose_first_config(display, &config_attribs)
            .context("eglChooseConfig failed")?
            .ok_or_else(|| anyhow!("No EGL config matches the required attributes"))?;

        let context_attribs = [egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE];
        let context = self
            .egl
            .create_context(display, config, None, &context_attribs)
            .context("Failed to create the primary GL context")?;
        let resource_context = self
            .egl
            .create_context(display, config, Some(context), &context_attribs)
            .context("Failed to create the shared resource context")?;

        let pbuffer_attribs = [egl::WIDTH, 1, egl::HEIGHT, 1, egl::NONE];
        let resource_surface = self
            .egl
            .create_pbuffer_surface(display, config, &pbuffer_attribs)
            .context("Failed to create the resource pbuffer surface")?;

        let extensions = self.probe_extensions(display);

        // Resolve GL entry points once; the engine resolves its own through
        // the proc resolver callback.
        gl::load_with(|symbol| {
            self.egl
                .get_proc_address(symbol)
                .map(|f| f as *const c_void)
                .unwrap_or(std::ptr::null())
        });

        *state = Some(EglState {
            display,
            config,
            context,
            resource_context,
            resource_surface,
            extensions,
        });
        Ok(())
    }

    fn probe_extensions(&self, display: egl::Display) -> EglExtensions {
        let extension_list = self
            .egl
            .query_string(Some(display), egl::EXTENSIONS)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let has = |name: &str| extension_list.split(' ').any(|ext| ext == name);

        let mut extensions = EglExtensions {
            buffer_age: has("EGL_EXT_buffer_age"),
            ..Default::default()
        };
        if has("EGL_KHR_swap_buffers_with_damage") {
            extensions.swap_with_damage = self.resolve_damage_fn("eglSwapBuffersWithDamageKHR");
        }
        if has("EGL_KHR_partial_update") {
            extensions.set_damage_region = self.resolve_damage_fn("eglSetDamageRegionKHR");
        }

        if extensions.swap_with_damage.is_none() {
            info!("Damage-aware swap unavailable; falling back to full swaps");
        }
        if !extensions.buffer_age {
            info!(
                "EGL_EXT_buffer_age unavailable; assuming buffer age {}",
                FALLBACK_BUFFER_AGE
            );
        }
        extensions
    }

    fn resolve_damage_fn(&self, name: &str) -> Option<SwapWithDamageFn> {
        self.egl
            .get_proc_address(name)
            .map(|f| unsafe { std::mem::transmute::<extern "system" fn(), SwapWithDamageFn>(f) })
    }

    fn with_slot<R>(&self, instance: usize, f: impl FnOnce(&mut GlSlot) -> R) -> Option<R> {
        let mut slots = self.slots.lock();
        slots.get_mut(instance).and_then(|s| s.as_mut()).map(f)
    }

    fn make_current_slot(&self, instance: usize) -> bool {
        let state = self.state.lock();
        let Some(state) = state.as_ref() else {
            return false;
        };
        let Some(surface) = self.with_slot(instance, |slot| slot.surface) else {
            return false;
        };
        self.egl
            .make_current(state.display, Some(surface), Some(surface), Some(state.context))
            .is_ok()
    }

    fn clear_current_slot(&self) -> bool {
        let state = self.state.lock();
        let Some(state) = state.as_ref() else {
            return false;
        };
        // Flush pending GL work before unbinding the context
        unsafe { gl::Flush() };
        self.egl
            .make_current(state.display, None, None, None)
            .is_ok()
    }

    fn resource_make_current_slot(&self) -> bool {
        let state = self.state.lock();
        let Some(state) = state.as_ref() else {
            return false;
        };
        self.egl
            .make_current(
                state.display,
                Some(state.resource_surface),
                Some(state.resource_surface),
                Some(state.resource_context),
            )
            .is_ok()
    }

    fn present_slot(&self, instance: usize, info: Option<&PresentInfo>) -> bool {
        let state = self.state.lock();
        let Some(state) = state.as_ref() else {
            return false;
        };

        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(instance).and_then(|s| s.as_mut()) else {
            return false;
        };

        match info {
            Some(info) => {
                // The presented framebuffer's staleness record is consumed
                // by this present
                slot.existing.remove(info.fbo_id);

                let rect = info.frame_damage.to_egl(slot.height);
                if let Some(set_damage_region) = state.extensions.set_damage_region {
                    let ok = unsafe {
                        set_damage_region(
                            state.display.as_ptr(),
                            slot.surface.as_ptr(),
                            rect.as_ptr(),
                            1,
                        )
                    };
                    if ok == 0 {
                        debug!("eglSetDamageRegionKHR failed; continuing");
                    }
                }

                slot.history.push(info.frame_damage);

                if let Some(swap_with_damage) = state.extensions.swap_with_damage {
                    let ok = unsafe {
                        swap_with_damage(
                            state.display.as_ptr(),
                            slot.surface.as_ptr(),
                            rect.as_ptr(),
                            1,
                        )
                    };
                    if ok != 0 {
                        return true;
                    }
                    debug!("Damage-aware swap failed; falling back to full swap");
                }
                self.egl.swap_buffers(state.display, slot.surface).is_ok()
            }
            None => self.egl.swap_buffers(state.display, slot.surface).is_ok(),
        }
    }

    fn existing_damage_slot(&self, instance: usize, fbo_id: u32) -> DamageRect {
        let state = self.state.lock();
        let Some(state) = state.as_ref() else {
            return DamageRect::default();
        };

        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(instance).and_then(|s| s.as_mut()) else {
            return DamageRect::default();
        };

        let age = if state.extensions.buffer_age {
            self.egl
                .query_surface(state.display, slot.surface, EGL_BUFFER_AGE_EXT)
                .map(|age| age.max(0) as usize)
                .unwrap_or(FALLBACK_BUFFER_AGE)
        } else {
            FALLBACK_BUFFER_AGE
        };

        let accumulated = slot.history.accumulated(age);
        slot.existing.insert(fbo_id, accumulated);
        accumulated
    }
}

impl Backend for GlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Gl
    }

    fn create_surface(
        &self,
        instance: usize,
        surface: NativeSurface,
        width: u32,
        height: u32,
    ) -> Result<()> {
        self.ensure_initialized(surface.display_ptr)?;

        // Lock order is state before slots everywhere; take what we need
        // from the state up front.
        let (display, config) = {
            let state = self.state.lock();
            let state = state.as_ref().expect("initialized above");
            (state.display, state.config)
        };

        let egl_window = WlEglSurface::new(surface.surface_id, width as i32, height as i32)
            .context("Failed to create the native EGL window")?;

        let egl_surface = unsafe {
            self.egl.create_window_surface(
                display,
                config,
                egl_window.ptr() as egl::NativeWindowType,
                None,
            )
        }
        .context("Failed to create the EGL window surface")?;

        let mut slots = self.slots.lock();
        if slots.len() <= instance {
            slots.resize_with(instance + 1, || None);
        }
        if slots[instance].is_some() {
            anyhow::bail!("Surface already bound for instance {}", instance);
        }

        slots[instance] = Some(GlSlot {
            surface: egl_surface,
            egl_window,
            width,
            height,
            history: DamageHistory::with_capacity(self.damage_history_cap),
            existing: ExistingDamageMap::new(),
        });
        debug!(
            "GL surface bound for instance {} ({}x{})",
            instance, width, height
        );
        Ok(())
    }

    fn resize(
        &self,
        instance: usize,
        engine: Option<&dyn Engine>,
        width: u32,
        height: u32,
    ) -> Result<()> {
        self.with_slot(instance, |slot| {
            // The native drawable always tracks the window system, even for
            // same-size calls
            slot.egl_window.resize(width as i32, height as i32, 0, 0);
            slot.width = width;
            slot.height = height;
        })
        .ok_or_else(|| anyhow!("No surface bound for instance {}", instance))?;

        if let Some(engine) = engine {
            engine
                .notify_window_metrics(WindowMetrics::new(width, height, 1.0))
                .map_err(|e| anyhow!("Engine rejected window metrics: {}", e))?;
        }
        Ok(())
    }

    fn surface_size(&self, instance: usize) -> Option<(u32, u32)> {
        let slots = self.slots.lock();
        slots
            .get(instance)
            .and_then(|s| s.as_ref())
            .map(|s| (s.width, s.height))
    }

    fn renderer_ops(self: Arc<Self>, instance: usize) -> Arc<dyn RendererOps> {
        Arc::new(GlSlotRenderer {
            backend: self,
            instance,
        })
    }

    fn vulkan_ops(self: Arc<Self>, _instance: usize) -> Option<Arc<dyn VulkanOps>> {
        None
    }

    fn compositor_ops(self: Arc<Self>, _instance: usize) -> Option<Arc<dyn CompositorOps>> {
        None
    }
}

/// Renderer capability bound to one instance slot
struct GlSlotRenderer {
    backend: Arc<GlBackend>,
    instance: usize,
}

impl RendererOps for GlSlotRenderer {
    fn make_current(&self) -> bool {
        self.backend.make_current_slot(self.instance)
    }

    fn clear_current(&self) -> bool {
        self.backend.clear_current_slot()
    }

    fn present(&self) -> bool {
        self.backend.present_slot(self.instance, None)
    }

    fn fbo_id(&self) -> u32 {
        // The engine renders into the window surface's default framebuffer
        0
    }

    fn resource_make_current(&self) -> bool {
        self.backend.resource_make_current_slot()
    }

    fn proc_address(&self, name: &str) -> *mut c_void {
        self.backend
            .egl
            .get_proc_address(name)
            .map(|f| f as *mut c_void)
            .unwrap_or(std::ptr::null_mut())
    }

    fn texture_frame(&self, texture_id: i64, _width: u32, _height: u32) -> Option<TextureFrame> {
        self.backend.textures.frame(texture_id)
    }

    fn present_with_damage(&self, info: &PresentInfo) -> bool {
        self.backend.present_slot(self.instance, Some(info))
    }

    fn existing_damage(&self, fbo_id: u32) -> DamageRect {
        self.backend.existing_damage_slot(self.instance, fbo_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Live EGL needs a Wayland session; what is testable headlessly is the
    // damage bookkeeping driven by the present/existing-damage paths.

    #[test]
    fn test_fallback_age_accumulates_capped_history() {
        let mut history = DamageHistory::with_capacity(4);
        for i in 0..8 {
            history.push(DamageRect::new(i, 0, 1, 1));
        }
        let acc = history.accumulated(FALLBACK_BUFFER_AGE);
        // Joins the last FALLBACK_BUFFER_AGE - 1 = 3 entries: x in 5..=7
        assert_eq!(acc, DamageRect::new(5, 0, 3, 1));
    }

    #[test]
    fn test_present_consumes_existing_damage_record() {
        let mut existing = ExistingDamageMap::new();
        existing.insert(0, DamageRect::new(0, 0, 10, 10));

        // The present path removes the record for the presented fbo
        assert!(existing.remove(0).is_some());
        assert!(existing.remove(0).is_none());
    }
}
