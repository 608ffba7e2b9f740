//! CLI entry point for volume-station
//!
//! # Usage
//!
//! Run the station:
//! ```bash
//! volume-station run --config config/station.toml
//! ```
//!
//! Validate a configuration file without opening devices:
//! ```bash
//! volume-station check-config --config config/station.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use volume_station::config::StationConfig;
use volume_station::devices::DeviceRegistry;
use volume_station::logging;
use volume_station::station::Station;

#[derive(Parser)]
#[command(name = "volume-station")]
#[command(about = "Parcel dimensioning station", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open devices and serve measurement requests until Ctrl+C
    Run {
        /// Station configuration file
        #[arg(long, default_value = "config/station.toml")]
        config: PathBuf,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Station configuration file
        #[arg(long, default_value = "config/station.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_station(config).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = StationConfig::load_validated(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    println!("Configuration {} is valid", path.display());
    println!("  camera: {} @ {} fps", config.devices.camera.name, config.devices.camera_fps);
    println!("  scanners: {}", config.devices.scanners.len());
    println!("  http: {}", config.http.bind_address());
    Ok(())
}

async fn run_station(path: PathBuf) -> Result<()> {
    let config = StationConfig::load_validated(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    logging::init(&config.logging).map_err(anyhow::Error::msg)?;
    info!(config = %path.display(), "Starting volume station");

    let registry = DeviceRegistry::with_builtin();
    let station = Station::start(&config, &registry)
        .await
        .context("station could not enter service")?;

    let cancel = station.cancellation_token();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Shutdown requested");
        cancel.cancel();
    });

    let served = station.serve(&config.http.bind_address()).await;
    station.shutdown().await;
    served.context("listener failed")?;
    Ok(())
}
