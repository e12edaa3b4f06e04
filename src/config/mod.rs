//! Configuration management for Perch
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files. It combines settings for the embedder window, the
//! GPU backend, input handling, and the liveness watchdog.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[cfg(test)]
mod tests;

/// Main configuration struct containing all Perch settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PerchConfig {
    /// Embedder window settings
    #[serde(default)]
    pub window: WindowConfig,

    /// GPU backend selection and tuning
    #[serde(default)]
    pub backend: BackendConfig,

    /// Input handling settings
    #[serde(default)]
    pub input: InputConfig,

    /// Liveness watchdog settings
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// General embedder settings
    #[serde(default)]
    pub general: GeneralConfig,
}

/// Embedder window configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowConfig {
    /// Initial surface width (pixels)
    pub width: u32,

    /// Initial surface height (pixels)
    pub height: u32,

    /// Toplevel title
    pub title: String,

    /// Application id advertised to the compositor (also used by the
    /// activation stack)
    pub app_id: String,
}

/// GPU backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Backend to use: "auto", "vulkan", "gl", "headless"
    pub kind: String,

    /// Enable VSync (FIFO presentation for the Vulkan backend)
    pub vsync: bool,

    /// Number of frame damage rectangles remembered for buffer-age
    /// reconstruction
    #[serde(default = "BackendConfig::default_damage_history")]
    pub damage_history: usize,
}

/// Input configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputConfig {
    /// Keyboard repeat delay (milliseconds). Overridden at runtime by the
    /// seat's repeat-info event when the compositor sends one.
    pub keyboard_repeat_delay: u32,

    /// Keyboard repeat rate (per second). Overridden like the delay.
    pub keyboard_repeat_rate: u32,

    /// Natural scrolling (invert axis deltas)
    pub natural_scrolling: bool,
}

/// Watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchdogConfig {
    /// Enable the liveness watchdog thread
    pub enabled: bool,

    /// Seconds the event pump may go unresponsive before the watchdog
    /// escalates
    pub interval_secs: u64,
}

/// General embedder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Enable debug logging
    pub debug: bool,

    /// Path to the hosted engine's asset bundle (contains the engine
    /// shared object and its assets)
    pub bundle_path: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            title: "Perch".to_string(),
            app_id: "org.perch.embedder".to_string(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: "auto".to_string(),
            vsync: true,
            damage_history: Self::default_damage_history(),
        }
    }
}

impl BackendConfig {
    fn default_damage_history() -> usize {
        crate::backend::damage::MAX_HISTORY
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            keyboard_repeat_delay: 400,
            keyboard_repeat_rate: 25,
            natural_scrolling: false,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            debug: false,
            bundle_path: String::new(),
        }
    }
}

impl PerchConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Path::new(&home).join(path.strip_prefix("~").unwrap_or(path))
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: PerchConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.window.width == 0 || self.window.height == 0 {
            anyhow::bail!(
                "Invalid window size: {}x{}",
                self.window.width,
                self.window.height
            );
        }

        let valid_backends = ["auto", "vulkan", "gl", "headless"];
        if !valid_backends.contains(&self.backend.kind.as_str()) {
            anyhow::bail!("Invalid backend kind: {}", self.backend.kind);
        }

        if self.backend.damage_history == 0 {
            anyhow::bail!("damage_history must be at least 1");
        }

        if self.input.keyboard_repeat_rate == 0 || self.input.keyboard_repeat_rate > 1000 {
            anyhow::bail!(
                "Invalid keyboard_repeat_rate: {} (must be 1..=1000)",
                self.input.keyboard_repeat_rate
            );
        }

        if self.watchdog.enabled && self.watchdog.interval_secs == 0 {
            anyhow::bail!("Watchdog interval must be at least one second");
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        fs::write(path.as_ref(), contents).with_context(|| {
            format!("Failed to write config file: {}", path.as_ref().display())
        })?;
        Ok(())
    }
}
