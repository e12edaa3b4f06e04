//! Unit tests for configuration module
//!
//! Tests configuration parsing, validation, serialization/deserialization,
//! and edge cases in configuration handling.

use super::*;
use anyhow::Result;
use std::fs;
use tempfile::tempdir;

#[test]
fn test_default_configuration_is_valid() {
    let config = PerchConfig::default();

    assert!(config.validate().is_ok());
    assert!(config.window.width > 0);
    assert!(config.window.height > 0);
    assert!(config.input.keyboard_repeat_delay > 0);
    assert!(config.input.keyboard_repeat_rate > 0);
    assert!(config.backend.damage_history > 0);
}

#[test]
fn test_configuration_serialization_roundtrip() -> Result<()> {
    let original = PerchConfig::default();

    let toml_string = toml::to_string(&original)?;
    let deserialized: PerchConfig = toml::from_str(&toml_string)?;

    assert_eq!(original.window, deserialized.window);
    assert_eq!(original.backend, deserialized.backend);
    assert_eq!(original.input, deserialized.input);
    assert_eq!(original.watchdog, deserialized.watchdog);

    Ok(())
}

#[test]
fn test_configuration_from_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("perch.toml");

    fs::write(
        &path,
        r#"
[window]
width = 1920
height = 1080
title = "Cluster"
app_id = "org.example.cluster"

[backend]
kind = "vulkan"
vsync = false

[input]
keyboard_repeat_delay = 250
keyboard_repeat_rate = 40
natural_scrolling = true
"#,
    )?;

    let config = PerchConfig::load(&path)?;
    assert_eq!(config.window.width, 1920);
    assert_eq!(config.window.height, 1080);
    assert_eq!(config.backend.kind, "vulkan");
    assert!(!config.backend.vsync);
    assert_eq!(config.input.keyboard_repeat_rate, 40);
    assert!(config.input.natural_scrolling);
    // Sections absent from the file fall back to defaults
    assert!(config.watchdog.enabled);

    Ok(())
}

#[test]
fn test_partial_configuration_uses_defaults() -> Result<()> {
    let config: PerchConfig = toml::from_str(
        r#"
[backend]
kind = "headless"
vsync = true
"#,
    )?;

    assert_eq!(config.backend.kind, "headless");
    assert_eq!(config.window.width, WindowConfig::default().width);
    assert_eq!(
        config.input.keyboard_repeat_delay,
        InputConfig::default().keyboard_repeat_delay
    );

    Ok(())
}

#[test]
fn test_invalid_backend_kind_rejected() {
    let mut config = PerchConfig::default();
    config.backend.kind = "metal".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_zero_window_size_rejected() {
    let mut config = PerchConfig::default();
    config.window.width = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_repeat_rate_bounds() {
    let mut config = PerchConfig::default();
    config.input.keyboard_repeat_rate = 0;
    assert!(config.validate().is_err());

    config.input.keyboard_repeat_rate = 1001;
    assert!(config.validate().is_err());

    config.input.keyboard_repeat_rate = 1000;
    assert!(config.validate().is_ok());
}

#[test]
fn test_zero_watchdog_interval_rejected() {
    let mut config = PerchConfig::default();
    config.watchdog.interval_secs = 0;
    assert!(config.validate().is_err());

    config.watchdog.enabled = false;
    // Disabled watchdog does not care about the interval
    assert!(config.validate().is_ok());
}

#[test]
fn test_save_and_reload() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("saved.toml");

    let mut config = PerchConfig::default();
    config.window.title = "Saved".to_string();
    config.save(&path)?;

    let reloaded = PerchConfig::load(&path)?;
    assert_eq!(reloaded.window.title, "Saved");

    Ok(())
}

#[test]
fn test_malformed_file_is_an_error() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[window\nwidth = ")?;

    assert!(PerchConfig::load(&path).is_err());
    Ok(())
}
