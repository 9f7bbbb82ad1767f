//! CLI Entry Point for xyscan
//!
//! Provides command-line interface for:
//! - Running one experiment end to end against the simulated bench
//! - Validating a configuration directory
//!
//! # Usage
//!
//! Run a transmission scan:
//! ```bash
//! xyscan run --config-dir config --experiment transmission
//! ```
//!
//! Check the configuration files:
//! ```bash
//! xyscan check-config --config-dir config
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use xyscan_daq::config::BenchConfig;
use xyscan_daq::data::BackendFactory;
use xyscan_daq::experiment::ExperimentKind;
use xyscan_daq::instrument::mock::MockOptions;
use xyscan_daq::instrument::InstrumentRegistry;
use xyscan_daq::logging::{self, LoggingConfig};
use xyscan_daq::messages::UiEvent;
use xyscan_daq::orchestrator::state::{State, TransitionOutcome, Trigger};
use xyscan_daq::orchestrator::{Orchestrator, OrchestratorHandle, OrchestratorSetup};

#[derive(Parser)]
#[command(name = "xyscan")]
#[command(about = "Experiment orchestrator for the XY-scanning spectroscopy bench", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one experiment on the simulated bench
    Run {
        /// Directory holding app.toml, config_main.yaml and settings_ui.yaml
        #[arg(long, default_value = "config")]
        config_dir: PathBuf,

        /// transmission, excitation_emission, decay or calibration
        #[arg(long)]
        experiment: ExperimentKind,

        /// Speed factor of the simulated instruments (0 = no delays)
        #[arg(long, default_value = "1.0")]
        time_scale: f64,

        /// Do not wait for Enter between the two calibration positions
        #[arg(long)]
        auto_continue: bool,
    },

    /// Load and validate a configuration directory
    CheckConfig {
        #[arg(long, default_value = "config")]
        config_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config_dir,
            experiment,
            time_scale,
            auto_continue,
        } => run_experiment(&config_dir, experiment, time_scale, auto_continue).await,
        Commands::CheckConfig { config_dir } => check_config(&config_dir),
    }
}

fn load(config_dir: &Path) -> Result<BenchConfig> {
    let bench = BenchConfig::load(config_dir)
        .with_context(|| format!("loading configuration from {}", config_dir.display()))?;
    logging::init(LoggingConfig::from_app_config(&bench.app)?)?;
    Ok(bench)
}

fn check_config(config_dir: &Path) -> Result<()> {
    let bench = load(config_dir)?;
    println!("Configuration in {} is valid", config_dir.display());
    println!("  storage backend: {}", bench.app.storage_backend()?);
    println!("  output directory: {}", bench.app.storage.output_dir.display());
    println!("  transitions: {}", bench.transitions.len());
    for kind in ExperimentKind::ALL {
        let instruments: Vec<&str> = bench
            .topology
            .instruments_for(kind)
            .iter()
            .map(|name| name.as_str())
            .collect();
        println!("  {}: {}", kind, instruments.join(", "));
    }
    for key in bench.topology.substrates.keys() {
        println!("  substrate {}", key);
    }
    Ok(())
}

async fn fire(handle: &OrchestratorHandle, trigger: Trigger, expected: State) -> Result<()> {
    match handle.fire(trigger).await? {
        TransitionOutcome::Transitioned(state) if state == expected => Ok(()),
        outcome => bail!("{} did not reach {}: {:?}", trigger, expected, outcome),
    }
}

async fn run_experiment(
    config_dir: &Path,
    kind: ExperimentKind,
    time_scale: f64,
    auto_continue: bool,
) -> Result<()> {
    let bench = load(config_dir)?;
    let factory = Arc::new(BackendFactory::new(bench.app.storage_backend()?));
    let registry = InstrumentRegistry::simulated(MockOptions {
        time_scale,
        ..MockOptions::default()
    });
    let handle = Orchestrator::spawn(OrchestratorSetup::from_bench(bench, registry, factory));
    let mut events = handle.subscribe();

    handle.select_experiment(kind).await?;
    fire(&handle, Trigger::InitExperiment, State::Connecting).await?;
    let status = handle.status().await?;
    if status.state != State::Align {
        handle.shutdown().await?;
        bail!("Instruments failed to connect, state is {}", status.state);
    }
    fire(&handle, Trigger::AlignExperiment, State::SetExperiment).await?;
    fire(&handle, Trigger::ParseConfig, State::ParsingConfiguration).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let outcome = loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, aborting the run");
                handle.fire(Trigger::Abort).await?;
                continue;
            }
        };
        match event {
            Ok(UiEvent::Progress(percent)) => info!(percent, "Progress"),
            Ok(UiEvent::Ect(seconds)) => info!(seconds, "Estimated time to completion"),
            Ok(UiEvent::CalibrationStatus(status)) => info!(%status, "Calibration"),
            Ok(UiEvent::CalibrationHalf) => {
                if !auto_continue {
                    println!("Move the power sensor to position 2, then press Enter");
                    stdin.next_line().await?;
                }
                handle.fire(Trigger::ContinueExperiment).await?;
            }
            Ok(UiEvent::ReturnSetExperiment) => break Ok(()),
            Ok(UiEvent::MeasurementAborted { reason }) => {
                break Err(anyhow::anyhow!("Measurement aborted: {}", reason))
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => warn!(missed, "UI events dropped"),
            Err(RecvError::Closed) => bail!("Orchestrator stopped unexpectedly"),
        }
    };

    handle.shutdown().await?;
    outcome
}
