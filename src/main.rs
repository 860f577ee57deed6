use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use deckhand::{config::Config, App};

#[derive(Parser, Debug)]
#[command(name = "deckhand")]
#[command(about = "Desktop controller for AJAZZ AKP05E / Mirabox N4 key displays")]
#[command(version)]
struct Cli {
    /// Check device connection status and exit
    #[arg(long)]
    status: bool,

    /// Set device brightness (0-100) and exit
    #[arg(long, value_name = "PERCENT")]
    brightness: Option<u8>,

    /// Deck-wide background image or GIF, overrides the config
    #[arg(long, value_name = "PATH")]
    background: Option<PathBuf>,

    /// Playback rate for an animated background
    #[arg(long, value_name = "FPS")]
    fps: Option<f32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Handle simple commands first
    if cli.status {
        return check_status().await;
    }

    if let Some(brightness) = cli.brightness {
        return set_brightness(brightness).await;
    }

    // Load configuration, CLI flags win over the file
    let mut config = Config::load()?;
    if let Some(background) = cli.background {
        config.render.background = Some(background);
    }
    if let Some(fps) = cli.fps {
        config.render.background_fps = fps;
    }

    info!("Starting deckhand");

    // Run the application with graceful shutdown
    let mut app = App::new(config);

    // Set up signal handlers for graceful shutdown
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let result = tokio::select! {
        result = app.run() => {
            result
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
            Ok(())
        }
    };

    // Always run shutdown
    app.shutdown().await;
    result
}

async fn check_status() -> Result<()> {
    use deckhand::device::HidTransport;

    info!("Checking device status...");

    match HidTransport::find_device().await {
        Ok(info) => {
            println!("✓ Device found: {}", info.name);
            println!("  Serial: {}", info.serial_number);
            Ok(())
        }
        Err(e) => {
            println!("✗ No device found: {}", e);
            std::process::exit(1);
        }
    }
}

async fn set_brightness(brightness: u8) -> Result<()> {
    use deckhand::device::{DeckTransport, HidTransport};

    let brightness = brightness.min(100);
    info!("Setting brightness to {}%", brightness);

    let transport = HidTransport::connect().await?;
    transport.set_brightness(brightness).await?;
    println!("✓ Brightness set to {}%", brightness);
    Ok(())
}
