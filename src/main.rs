//! CLI entry point for spim-daq
//!
//! - `run`: assemble the configured devices and execute the acquisition
//! - `validate`: check a configuration without touching hardware
//! - `home`: home every homeable stage
//!
//! # Usage
//!
//! ```bash
//! spim-daq run --config config/acquisition.example.toml
//! spim-daq validate --config config/acquisition.example.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spim_daq::acquisition::{Acquisition, MemorySink, ProgressEvent};
use spim_daq::config::AppConfig;
use spim_daq::hardware::DriverRegistry;
use spim_daq::tracing_init::{self, OutputFormat, TracingConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "spim-daq")]
#[command(about = "Timed multi-position light-sheet acquisition", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Pretty, global = true)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured acquisition
    Run {
        /// Configuration file
        #[arg(long, short)]
        config: PathBuf,
    },

    /// Validate a configuration file and its device entries
    Validate {
        /// Configuration file
        #[arg(long, short)]
        config: PathBuf,
    },

    /// Home every stage that supports it
    Home {
        /// Configuration file
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(&config, cli.log_format).await,
        Commands::Validate { config } => validate(&config, cli.log_format),
        Commands::Home { config } => home(&config, cli.log_format).await,
    }
}

fn load(path: &Path, format: OutputFormat) -> Result<AppConfig> {
    let config = AppConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    let tracing = TracingConfig::from_app_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(format);
    tracing_init::init(tracing).map_err(anyhow::Error::msg)?;
    Ok(config)
}

async fn run(path: &Path, format: OutputFormat) -> Result<()> {
    let config = load(path, format)?;
    let registry = DriverRegistry::with_mock_drivers();
    let devices = registry.assemble(&config.hardware).await?;
    let acquisition = Arc::new(Acquisition::new(devices));

    let sink = Arc::new(MemorySink::new());
    let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressEvent>(64);
    let params = config
        .acquisition
        .to_params(sink.clone())?
        .with_progress(Arc::new(progress_tx));

    let printer = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            println!(
                "t={} row={} stack {:>5.1}%  overall {:>5.1}%",
                event.time_point,
                event.row,
                event.stack_fraction * 100.0,
                event.overall_fraction * 100.0
            );
        }
    });

    let interrupt = {
        let acquisition = acquisition.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, aborting acquisition");
                acquisition.abort();
            }
        })
    };

    let outcome = acquisition.run(params).await;
    interrupt.abort();
    let outcome = outcome?;
    // The progress sender lives in the params, dropped by `run`
    let _ = printer.await;

    let summary = serde_json::json!({
        "run_id": outcome.run_id,
        "started_at": outcome.started_at.to_rfc3339(),
        "status": outcome.status,
        "elapsed_secs": outcome.elapsed.as_secs_f64(),
        "abort_reason": outcome.abort_reason.as_ref().map(|e| e.to_string()),
        "result": outcome.result,
        "corrections": outcome.corrections,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    match outcome.abort_reason {
        Some(reason) => Err(anyhow::Error::new(reason).context("acquisition aborted")),
        None => Ok(()),
    }
}

fn validate(path: &Path, format: OutputFormat) -> Result<()> {
    let config = load(path, format)?;
    let registry = DriverRegistry::with_mock_drivers();
    for device in config.hardware.devices.iter().filter(|d| d.enabled) {
        registry.validate_device(device)?;
    }

    let rows = config.acquisition.rows();
    info!(
        devices = config.hardware.devices.len(),
        rows = rows.len(),
        time_points = config.acquisition.time_points,
        "Configuration is valid"
    );
    println!("{}: configuration is valid", path.display());
    for driver in registry.list_drivers() {
        println!(
            "  driver {:<14} {} {:?}",
            driver.driver_type, driver.name, driver.capabilities
        );
    }
    Ok(())
}

async fn home(path: &Path, format: OutputFormat) -> Result<()> {
    let config = load(path, format)?;
    let devices = DriverRegistry::with_mock_drivers()
        .assemble(&config.hardware)
        .await?;
    let homed = devices.home_all().await?;
    println!("Homed axes: {:?}", homed);
    Ok(())
}
