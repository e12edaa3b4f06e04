//! Platform messaging and texture registration
//!
//! The engine's plugin surface reaches the platform through named message
//! channels carrying JSON-encoded method calls, and registers external
//! textures the renderer resolves at draw time. Both registries are owned
//! by the instance they serve: never process-wide statics.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backend::TextureFrame;
use crate::engine::PointerEvent;

/// A JSON method call travelling over a platform channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl MethodCall {
    pub fn new(method: &str, args: serde_json::Value) -> Self {
        Self {
            method: method.to_string(),
            args,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to encode method call")
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).context("Failed to decode method call")
    }
}

/// Handler for inbound messages on one channel; the returned bytes, if any,
/// are sent back as the response
pub type MessageHandler = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Named-channel dispatcher for engine-originated platform messages
#[derive(Default)]
pub struct Messenger {
    handlers: Mutex<HashMap<String, MessageHandler>>,
}

impl Messenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the handler for a channel
    pub fn set_handler(&self, channel: &str, handler: MessageHandler) {
        self.handlers.lock().insert(channel.to_string(), handler);
    }

    pub fn remove_handler(&self, channel: &str) {
        self.handlers.lock().remove(channel);
    }

    /// Dispatches an inbound message. Messages for channels without a
    /// handler are dropped with a debug log: plugins come and go.
    pub fn dispatch(&self, channel: &str, payload: &[u8]) -> Option<Vec<u8>> {
        let handler = self.handlers.lock().get(channel).cloned();
        match handler {
            Some(handler) => handler(payload),
            None => {
                debug!("No handler for platform channel '{}'", channel);
                None
            }
        }
    }

    pub fn has_handler(&self, channel: &str) -> bool {
        self.handlers.lock().contains_key(channel)
    }
}

#[derive(Debug, Clone, Copy)]
struct RegisteredTexture {
    frame: TextureFrame,
    /// Set by `mark_frame_available`; the renderer only resolves textures
    /// that have a frame ready
    available: bool,
}

/// Live registry of external textures, resolved by the backends on the
/// engine's texture-frame callback
#[derive(Default)]
pub struct TextureRegistry {
    textures: Mutex<HashMap<i64, RegisteredTexture>>,
}

impl TextureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a texture id with its GL description
    pub fn register(&self, texture_id: i64, frame: TextureFrame) {
        let previous = self.textures.lock().insert(
            texture_id,
            RegisteredTexture {
                frame,
                available: false,
            },
        );
        if previous.is_some() {
            warn!("Texture {} re-registered; replacing", texture_id);
        }
    }

    /// Removes a texture; pending lookups will report "not found" and the
    /// engine falls back to not drawing it
    pub fn unregister(&self, texture_id: i64) -> bool {
        self.textures.lock().remove(&texture_id).is_some()
    }

    /// Marks a new frame as ready on an already-registered texture
    pub fn mark_frame_available(&self, texture_id: i64) -> bool {
        match self.textures.lock().get_mut(&texture_id) {
            Some(texture) => {
                texture.available = true;
                true
            }
            None => false,
        }
    }

    /// Resolves a texture for drawing; `None` when unknown or no frame has
    /// been marked available yet
    pub fn frame(&self, texture_id: i64) -> Option<TextureFrame> {
        self.textures
            .lock()
            .get(&texture_id)
            .filter(|t| t.available)
            .map(|t| t.frame)
    }

    pub fn len(&self) -> usize {
        self.textures.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.lock().is_empty()
    }
}

/// Contract implemented by GPU-surface-backed embedded platform views
///
/// The plugin layer registers one listener per view id; the core only
/// forwards lifecycle and input, it never manages view state itself.
pub trait PlatformViewListener: Send + Sync {
    fn added(&self, view_id: i64, width: f64, height: f64);
    fn removed(&self, view_id: i64);
    fn resized(&self, view_id: i64, width: f64, height: f64);
    fn moved(&self, view_id: i64, x: f64, y: f64);
    fn touch(&self, view_id: i64, event: &PointerEvent);
    fn disposed(&self, view_id: i64);
}

/// Instance-owned registry of platform-view listeners
#[derive(Default)]
pub struct PlatformViewRegistry {
    listeners: Mutex<HashMap<i64, Arc<dyn PlatformViewListener>>>,
}

impl PlatformViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, view_id: i64, listener: Arc<dyn PlatformViewListener>) {
        self.listeners.lock().insert(view_id, listener);
    }

    pub fn unregister(&self, view_id: i64) -> bool {
        self.listeners.lock().remove(&view_id).is_some()
    }

    /// Runs `f` with the listener for a view; unknown views are ignored
    pub fn with_listener(&self, view_id: i64, f: impl FnOnce(&dyn PlatformViewListener)) {
        let listener = self.listeners.lock().get(&view_id).cloned();
        if let Some(listener) = listener {
            f(listener.as_ref());
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }
}

/// What a per-feature plugin gets handed at registration time
///
/// Thin bundle of the instance-owned registries; plugins never see the
/// engine handle or the protocol connection.
pub struct PluginRegistrar {
    pub messenger: Arc<Messenger>,
    pub textures: Arc<TextureRegistry>,
    pub views: Arc<PlatformViewRegistry>,
}

impl PluginRegistrar {
    pub fn new(
        messenger: Arc<Messenger>,
        textures: Arc<TextureRegistry>,
        views: Arc<PlatformViewRegistry>,
    ) -> Self {
        Self {
            messenger,
            textures,
            views,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frame() -> TextureFrame {
        TextureFrame {
            target: 0x0DE1, // GL_TEXTURE_2D
            name: 7,
            format: 0x8058, // GL_RGBA8
            width: 640,
            height: 480,
        }
    }

    #[test]
    fn test_method_call_round_trip() {
        let call = MethodCall::new("setVolume", serde_json::json!({ "level": 0.5 }));
        let encoded = call.encode().unwrap();
        let decoded = MethodCall::decode(&encoded).unwrap();
        assert_eq!(call, decoded);
    }

    #[test]
    fn test_method_call_without_args() {
        let decoded = MethodCall::decode(br#"{"method":"pause"}"#).unwrap();
        assert_eq!(decoded.method, "pause");
        assert!(decoded.args.is_null());
    }

    #[test]
    fn test_messenger_dispatch() {
        let messenger = Messenger::new();
        messenger.set_handler(
            "perch/audio",
            Arc::new(|payload| Some(payload.to_vec())),
        );

        assert_eq!(
            messenger.dispatch("perch/audio", b"ping"),
            Some(b"ping".to_vec())
        );
        assert_eq!(messenger.dispatch("perch/unknown", b"ping"), None);
    }

    #[test]
    fn test_messenger_handler_replacement() {
        let messenger = Messenger::new();
        messenger.set_handler("c", Arc::new(|_| Some(b"one".to_vec())));
        messenger.set_handler("c", Arc::new(|_| Some(b"two".to_vec())));
        assert_eq!(messenger.dispatch("c", b""), Some(b"two".to_vec()));

        messenger.remove_handler("c");
        assert!(!messenger.has_handler("c"));
    }

    #[test]
    fn test_texture_not_resolved_until_frame_available() {
        let registry = TextureRegistry::new();
        registry.register(42, test_frame());

        assert_eq!(registry.frame(42), None);
        assert!(registry.mark_frame_available(42));
        assert_eq!(registry.frame(42), Some(test_frame()));
    }

    #[test]
    fn test_platform_view_registry_dispatch() {
        use std::sync::atomic::{AtomicU32, Ordering};

        #[derive(Default)]
        struct CountingListener {
            resizes: AtomicU32,
        }
        impl PlatformViewListener for CountingListener {
            fn added(&self, _id: i64, _w: f64, _h: f64) {}
            fn removed(&self, _id: i64) {}
            fn resized(&self, _id: i64, _w: f64, _h: f64) {
                self.resizes.fetch_add(1, Ordering::SeqCst);
            }
            fn moved(&self, _id: i64, _x: f64, _y: f64) {}
            fn touch(&self, _id: i64, _event: &PointerEvent) {}
            fn disposed(&self, _id: i64) {}
        }

        let registry = PlatformViewRegistry::new();
        let listener = Arc::new(CountingListener::default());
        registry.register(4, Arc::clone(&listener) as Arc<dyn PlatformViewListener>);

        registry.with_listener(4, |l| l.resized(4, 100.0, 100.0));
        registry.with_listener(5, |l| l.resized(5, 100.0, 100.0)); // unknown: ignored
        assert_eq!(listener.resizes.load(Ordering::SeqCst), 1);

        assert!(registry.unregister(4));
        assert!(!registry.unregister(4));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregistered_texture_reports_not_found() {
        let registry = TextureRegistry::new();
        registry.register(1, test_frame());
        registry.mark_frame_available(1);
        assert!(registry.unregister(1));

        assert_eq!(registry.frame(1), None);
        assert!(!registry.unregister(1));
        assert!(!registry.mark_frame_available(1));
    }
}
