//! # Perch - Wayland Platform Embedder
//!
//! Hosts an external UI engine on an embedded Linux Wayland session: a
//! GPU-backed surface for it to draw into, a task runner honoring the
//! engine's clock, and translation of Wayland input into the engine's event
//! vocabulary.

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use tokio::signal;

use perch::config::PerchConfig;
use perch::embedder::Embedder;

#[derive(Parser)]
#[command(name = "perch")]
#[command(about = "A Wayland platform embedder hosting an external UI engine")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/perch/perch.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Path to the engine asset bundle (overrides the config file)
    #[arg(short, long)]
    bundle: Option<String>,

    /// Select GPU backend: auto, vulkan, gl, headless
    #[arg(long)]
    backend: Option<String>,

    /// Force headless mode (software rendering, no on-screen window)
    #[arg(long, default_value_t = false)]
    headless: bool,

    /// Initial surface width (overrides the config file)
    #[arg(long)]
    width: Option<u32>,

    /// Initial surface height (overrides the config file)
    #[arg(long)]
    height: Option<u32>,

    /// Disable the liveness watchdog
    #[arg(long)]
    no_watchdog: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting Perch - Wayland platform embedder");
    info!("📄 Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = match PerchConfig::load(&cli.config) {
        Ok(config) => {
            info!("✅ Configuration loaded from: {}", cli.config);
            config
        }
        Err(e) => {
            error!("❌ Failed to load configuration: {}", e);
            info!("📝 Using default configuration");
            PerchConfig::default()
        }
    };

    // Override config with CLI flags
    let mut config = config;
    if let Some(bundle) = cli.bundle {
        config.general.bundle_path = bundle;
    }
    if let Some(backend) = cli.backend {
        config.backend.kind = backend;
    }
    if cli.headless {
        config.backend.kind = "headless".to_string();
        info!("🖥️ Headless mode enabled via CLI flag");
    }
    if let Some(width) = cli.width {
        config.window.width = width;
    }
    if let Some(height) = cli.height {
        config.window.height = height;
    }
    if cli.no_watchdog {
        config.watchdog.enabled = false;
        info!("🚫 Watchdog disabled via CLI flag");
    }
    config.validate()?;

    info!("🏗️ Initializing Perch embedder...");
    let mut embedder = Embedder::new(config)?;
    embedder.launch_instance()?;

    // Signal handling flips the shared running flag; the display pump
    // notices on its next iteration
    let running = embedder.running_flag();
    tokio::spawn(async move {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("📨 Received SIGINT (Ctrl+C), shutting down gracefully");
            }
            _ = sigterm.recv() => {
                info!("📨 Received SIGTERM, shutting down gracefully");
            }
        }
        running.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    // The display pump is synchronous and not Send; park this runtime
    // thread on it
    tokio::task::block_in_place(|| embedder.run())?;

    info!("👋 Perch shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["perch"]).unwrap();
        assert!(!cli.debug);
        assert!(!cli.headless);
        assert!(cli.backend.is_none());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "perch",
            "--debug",
            "--headless",
            "--backend",
            "gl",
            "--bundle",
            "/opt/app",
            "--width",
            "800",
        ])
        .unwrap();
        assert!(cli.debug);
        assert!(cli.headless);
        assert_eq!(cli.backend.as_deref(), Some("gl"));
        assert_eq!(cli.bundle.as_deref(), Some("/opt/app"));
        assert_eq!(cli.width, Some(800));
    }
}
