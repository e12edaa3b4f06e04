//! GPU backend abstraction
//!
//! One interface with interchangeable implementations: a software/off-screen
//! backend for testing, an EGL/GL backend presenting with damage-aware
//! swaps, and a Vulkan swapchain backend with explicit damage tracking. All
//! of them satisfy the hosted engine's renderer (and, for Vulkan, the
//! compositor) callback contract; the engine reaches them through the
//! capability traits below, bound into its ABI tables by
//! [`crate::engine::runtime`].

pub mod damage;
pub mod egl;
pub mod headless;
pub mod vulkan;

use std::os::raw::c_void;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};
use wayland_backend::client::ObjectId;

use crate::engine::messenger::TextureRegistry;
use crate::engine::Engine;
use damage::DamageRect;

/// Which concrete backend to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Auto,
    Vulkan,
    Gl,
    Headless,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "vulkan" => Ok(Self::Vulkan),
            "gl" => Ok(Self::Gl),
            "headless" => Ok(Self::Headless),
            other => anyhow::bail!("Unknown backend kind: {}", other),
        }
    }
}

/// Native window-system handles a backend binds a drawable to
///
/// Raw pointers originate from the Wayland connection's system library
/// backend and stay valid for the connection lifetime. Backends only pass
/// them on to EGL/Vulkan; they never dereference them.
#[derive(Debug, Clone)]
pub struct NativeSurface {
    /// `*mut wl_display` of the connection
    pub display_ptr: *mut c_void,
    /// `*mut wl_proxy` of the surface
    pub surface_ptr: *mut c_void,
    /// Protocol object id of the surface (for wayland-egl)
    pub surface_id: ObjectId,
}

unsafe impl Send for NativeSurface {}
unsafe impl Sync for NativeSurface {}

/// A resolved external texture, reported to the engine on frame lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureFrame {
    /// GL target (e.g. `GL_TEXTURE_2D`)
    pub target: u32,
    /// GL texture name
    pub name: u32,
    /// Pixel format (e.g. `GL_RGBA8`)
    pub format: u32,
    pub width: u32,
    pub height: u32,
}

/// Present parameters carrying the frame's damage
#[derive(Debug, Clone, Copy)]
pub struct PresentInfo {
    pub fbo_id: u32,
    pub frame_damage: DamageRect,
}

/// A swapchain image handed to the engine for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VulkanImage {
    /// `VkImage` handle value
    pub image: u64,
    /// `VkFormat` value
    pub format: u32,
}

/// A render target created for one compositor layer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackingStore {
    /// Backend-specific image identifier
    pub image: u64,
}

/// One layer of a composited frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Layer {
    pub store: BackingStore,
    pub offset: (f64, f64),
    pub size: (f64, f64),
}

/// The renderer half of the engine's callback contract
///
/// Called from the engine's render thread. Context-affinity discipline is
/// the engine's: it brackets GL work in make_current/clear_current and never
/// calls these concurrently for one instance.
pub trait RendererOps: Send + Sync {
    fn make_current(&self) -> bool;
    fn clear_current(&self) -> bool;
    /// Full-frame present (no damage information)
    fn present(&self) -> bool;
    /// Framebuffer the engine should render into
    fn fbo_id(&self) -> u32;
    fn resource_make_current(&self) -> bool;
    /// Resolves a GL (or EGL) entry point for the engine
    fn proc_address(&self, name: &str) -> *mut c_void;
    /// Resolves an external texture against the live registry; `None` makes
    /// the engine skip drawing that texture this frame
    fn texture_frame(&self, texture_id: i64, width: u32, height: u32) -> Option<TextureFrame>;
    /// Present with explicit frame damage
    fn present_with_damage(&self, info: &PresentInfo) -> bool;
    /// Stale region of a reused framebuffer, reconstructed from the damage
    /// history and the buffer's age
    fn existing_damage(&self, fbo_id: u32) -> DamageRect;
}

/// Swapchain-specific additions implemented by the Vulkan backend
pub trait VulkanOps: Send + Sync {
    fn instance_proc_address(&self, instance: *mut c_void, name: &str) -> *mut c_void;
    /// Acquires the next swapchain image, recreating the swapchain first if
    /// a resize is pending or the last present invalidated it
    fn next_image(&self) -> Option<VulkanImage>;
    /// Presents a previously acquired image
    fn present_image(&self, image: &VulkanImage) -> bool;
}

/// The compositor half of the engine's callback contract
pub trait CompositorOps: Send + Sync {
    fn create_backing_store(&self, width: f64, height: f64) -> Option<BackingStore>;
    fn collect_backing_store(&self, store: &BackingStore) -> bool;
    fn present_layers(&self, layers: &[Layer]) -> bool;
}

/// GPU backend contract, implemented identically by every variant
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Binds a freshly created native surface to an engine instance slot.
    /// Must be called exactly once per slot before any render callback
    /// fires.
    fn create_surface(
        &self,
        instance: usize,
        surface: NativeSurface,
        width: u32,
        height: u32,
    ) -> Result<()>;

    /// Reconfigures the native drawable and, when an engine handle is
    /// supplied, notifies it of the new window size. Idempotent for
    /// unchanged framework-side dimensions; a window-system resize always
    /// updates the drawable.
    fn resize(
        &self,
        instance: usize,
        engine: Option<&dyn Engine>,
        width: u32,
        height: u32,
    ) -> Result<()>;

    /// Current drawable size of a bound slot
    fn surface_size(&self, instance: usize) -> Option<(u32, u32)>;

    /// Renderer capability bound to one instance slot; this is what gets
    /// adapted into the engine's renderer callback table
    fn renderer_ops(self: Arc<Self>, instance: usize) -> Arc<dyn RendererOps>;

    /// Swapchain capability, `None` for non-Vulkan backends
    fn vulkan_ops(self: Arc<Self>, instance: usize) -> Option<Arc<dyn VulkanOps>>;

    /// Compositor capability, `None` for backends without layer composition
    fn compositor_ops(self: Arc<Self>, instance: usize) -> Option<Arc<dyn CompositorOps>>;
}

/// Instantiates the configured backend, probing `auto` from most to least
/// capable. Inability to produce any windowed backend is fatal; headless
/// runs only by explicit request.
pub fn create_backend(
    kind: BackendKind,
    vsync: bool,
    damage_history_cap: usize,
    textures: Arc<TextureRegistry>,
) -> Result<Arc<dyn Backend>> {
    match kind {
        BackendKind::Headless => {
            info!("🖥️ Using headless software backend");
            Ok(Arc::new(headless::HeadlessBackend::new(textures)))
        }
        BackendKind::Vulkan => {
            let backend = vulkan::VulkanBackend::new(vsync, damage_history_cap, textures)?;
            info!("🌋 Using Vulkan swapchain backend");
            Ok(Arc::new(backend))
        }
        BackendKind::Gl => {
            let backend = egl::GlBackend::new(damage_history_cap, textures)?;
            info!("🎨 Using EGL/GL backend");
            Ok(Arc::new(backend))
        }
        BackendKind::Auto => {
            match vulkan::VulkanBackend::new(vsync, damage_history_cap, Arc::clone(&textures)) {
                Ok(backend) => {
                    info!("🌋 Auto-selected Vulkan swapchain backend");
                    Ok(Arc::new(backend))
                }
                Err(e) => {
                    warn!("Vulkan unavailable ({}), falling back to EGL/GL", e);
                    let backend = egl::GlBackend::new(damage_history_cap, textures)?;
                    info!("🎨 Auto-selected EGL/GL backend");
                    Ok(Arc::new(backend))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("auto".parse::<BackendKind>().unwrap(), BackendKind::Auto);
        assert_eq!(
            "vulkan".parse::<BackendKind>().unwrap(),
            BackendKind::Vulkan
        );
        assert_eq!("gl".parse::<BackendKind>().unwrap(), BackendKind::Gl);
        assert_eq!(
            "headless".parse::<BackendKind>().unwrap(),
            BackendKind::Headless
        );
        assert!("metal".parse::<BackendKind>().is_err());
    }
}
