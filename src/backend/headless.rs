//! Headless software backend
//!
//! No native window: the engine draws into a heap buffer sized to the last
//! resize, and present is a synchronization point only (nothing is swapped
//! anywhere). Used for off-screen and testing configurations.

use std::os::raw::c_void;
use std::sync::Arc;

use anyhow::Result;
use log::debug;
use parking_lot::Mutex;

use super::damage::DamageRect;
use super::{
    Backend, BackendKind, CompositorOps, NativeSurface, PresentInfo, RendererOps, TextureFrame,
    VulkanOps,
};
use crate::engine::messenger::TextureRegistry;
use crate::engine::{Engine, WindowMetrics};

const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug)]
struct HeadlessSlot {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl HeadlessSlot {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
        }
    }
}

/// Software backend rendering into heap memory
pub struct HeadlessBackend {
    slots: Mutex<Vec<Option<HeadlessSlot>>>,
    textures: Arc<TextureRegistry>,
}

impl HeadlessBackend {
    pub fn new(textures: Arc<TextureRegistry>) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            textures,
        }
    }

    /// Byte length of a slot's pixel buffer (tests and screenshot paths)
    pub fn buffer_len(&self, instance: usize) -> Option<usize> {
        let slots = self.slots.lock();
        slots
            .get(instance)
            .and_then(|s| s.as_ref())
            .map(|s| s.pixels.len())
    }

    /// Copies a slot's pixel buffer out
    pub fn read_pixels(&self, instance: usize) -> Option<Vec<u8>> {
        let slots = self.slots.lock();
        slots
            .get(instance)
            .and_then(|s| s.as_ref())
            .map(|s| s.pixels.clone())
    }
}

impl Backend for HeadlessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Headless
    }

    fn create_surface(
        &self,
        instance: usize,
        _surface: NativeSurface,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let mut slots = self.slots.lock();
        if slots.len() <= instance {
            slots.resize_with(instance + 1, || None);
        }
        if slots[instance].is_some() {
            anyhow::bail!("Surface already bound for instance {}", instance);
        }
        slots[instance] = Some(HeadlessSlot::new(width, height));
        debug!(
            "Headless surface bound for instance {} ({}x{})",
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
        {
            let mut slots = self.slots.lock();
            let slot = slots
                .get_mut(instance)
                .and_then(|s| s.as_mut())
                .ok_or_else(|| anyhow::anyhow!("No surface bound for instance {}", instance))?;
            if slot.width != width || slot.height != height {
                *slot = HeadlessSlot::new(width, height);
            }
        }

        if let Some(engine) = engine {
            engine
                .notify_window_metrics(WindowMetrics::new(width, height, 1.0))
                .map_err(|e| anyhow::anyhow!("Engine rejected window metrics: {}", e))?;
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

    fn renderer_ops(self: Arc<Self>, _instance: usize) -> Arc<dyn RendererOps> {
        // The software backend has no per-slot GPU state; one adapter
        // serves every slot
        self
    }

    fn vulkan_ops(self: Arc<Self>, _instance: usize) -> Option<Arc<dyn VulkanOps>> {
        None
    }

    fn compositor_ops(self: Arc<Self>, _instance: usize) -> Option<Arc<dyn CompositorOps>> {
        None
    }
}

impl RendererOps for HeadlessBackend {
    fn make_current(&self) -> bool {
        true
    }

    fn clear_current(&self) -> bool {
        true
    }

    fn present(&self) -> bool {
        // Synchronization only; there is nothing to swap
        true
    }

    fn fbo_id(&self) -> u32 {
        0
    }

    fn resource_make_current(&self) -> bool {
        true
    }

    fn proc_address(&self, _name: &str) -> *mut c_void {
        std::ptr::null_mut()
    }

    fn texture_frame(&self, texture_id: i64, _width: u32, _height: u32) -> Option<TextureFrame> {
        self.textures.frame(texture_id)
    }

    fn present_with_damage(&self, _info: &PresentInfo) -> bool {
        self.present()
    }

    fn existing_damage(&self, _fbo_id: u32) -> DamageRect {
        DamageRect::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayland_backend::client::ObjectId;

    fn native_surface() -> NativeSurface {
        NativeSurface {
            display_ptr: std::ptr::null_mut(),
            surface_ptr: std::ptr::null_mut(),
            surface_id: ObjectId::null(),
        }
    }

    #[test]
    fn test_create_surface_once_per_instance() {
        let backend = HeadlessBackend::new(Arc::new(TextureRegistry::new()));
        backend
            .create_surface(0, native_surface(), 320, 240)
            .unwrap();
        assert!(backend.create_surface(0, native_surface(), 320, 240).is_err());
    }

    #[test]
    fn test_resize_round_trip() {
        let backend = HeadlessBackend::new(Arc::new(TextureRegistry::new()));
        backend
            .create_surface(0, native_surface(), 320, 240)
            .unwrap();

        backend.resize(0, None, 800, 600).unwrap();
        assert_eq!(backend.surface_size(0), Some((800, 600)));
        assert_eq!(backend.buffer_len(0), Some(800 * 600 * BYTES_PER_PIXEL));
    }

    #[test]
    fn test_resize_unbound_instance_fails() {
        let backend = HeadlessBackend::new(Arc::new(TextureRegistry::new()));
        assert!(backend.resize(1, None, 100, 100).is_err());
    }

    #[test]
    fn test_renderer_ops_defaults() {
        let backend = Arc::new(HeadlessBackend::new(Arc::new(TextureRegistry::new())));
        let ops = Arc::clone(&backend).renderer_ops(0);
        assert!(ops.make_current());
        assert!(ops.present());
        assert_eq!(ops.fbo_id(), 0);
        assert!(ops.existing_damage(0).is_empty());
    }

    #[test]
    fn test_texture_lookup_goes_through_registry() {
        let registry = Arc::new(TextureRegistry::new());
        let backend = HeadlessBackend::new(Arc::clone(&registry));

        let frame = TextureFrame {
            target: 0x0DE1,
            name: 3,
            format: 0x8058,
            width: 16,
            height: 16,
        };
        registry.register(5, frame);
        registry.mark_frame_available(5);

        assert_eq!(backend.texture_frame(5, 16, 16), Some(frame));
        assert_eq!(backend.texture_frame(6, 16, 16), None);
    }
}
