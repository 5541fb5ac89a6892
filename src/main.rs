//! CLI Entry Point for monet
//!
//! Starts the interactive power calibration shell:
//! - Loads configuration (defaults <- TOML <- `MONET_` environment)
//! - Initializes logging
//! - Builds the attenuator rig and loads the calibration store
//! - Reads commands from stdin until `exit` or end of input
//!
//! Ctrl+C aborts the running `calibrate` or `set` at its next step; the shell
//! keeps running.
//!
//! # Usage
//!
//! ```bash
//! monet --config config/monet.toml --log-level debug
//! (monet) config --wavelength=561
//! (monet) calibrate
//! (monet) set 4.5mW
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use monet::calibration::CalibrationStore;
use monet::config::MonetConfig;
use monet::logging::{self, OutputFormat};
use monet::session::{SessionContext, SessionSettings};
use monet::shell::{self, Command};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "monet")]
#[command(about = "Laser power calibration and control shell", long_about = None)]
struct Cli {
    /// Configuration file (default: config/monet.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Calibration store file (overrides the configuration)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: pretty, compact, json
    #[arg(long)]
    log_format: Option<OutputFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => MonetConfig::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => MonetConfig::load().context("Failed to load configuration")?,
    };
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.application.log_format = format;
    }
    if let Some(store) = cli.store {
        config.store.path = store;
        config.store.persist = true;
    }
    config.validate().context("Invalid configuration")?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    println!("🔬 {} - laser power calibration", config.application.name);
    println!();

    println!("🔧 Initializing simulated attenuator and power meter...");
    let (mount, meter) = config
        .devices
        .simulation
        .build()
        .context("Failed to initialize devices")?;

    let store = if config.store.persist {
        println!("📂 Calibration store: {}", config.store.path.display());
        CalibrationStore::load(&config.store.path).with_context(|| {
            format!(
                "Failed to load calibration store {}",
                config.store.path.display()
            )
        })?
    } else {
        println!("📂 Calibration store: in memory only");
        CalibrationStore::new()
    };
    if !store.is_empty() {
        let known: Vec<String> = store.wavelengths().iter().map(|w| format!("{w} nm")).collect();
        println!("   Calibrated: {}", known.join(", "));
    }

    let mut session = SessionContext::new(
        Arc::new(mount),
        Arc::new(meter),
        store,
        SessionSettings::from_config(&config),
    );

    let abort = session.abort_signal();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            abort.trigger("Ctrl+C");
        }
    });

    println!();
    println!("Type 'help' for commands, 'exit' or Ctrl+D to quit. Ctrl+C aborts a running command.");
    run_shell(&mut session).await?;

    println!("👋 Shutting down");
    Ok(())
}

async fn run_shell(session: &mut SessionContext) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("(monet) ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            return Ok(());
        };

        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("❌ {e}");
                continue;
            }
        };

        match shell::execute(session, command).await {
            Ok(outcome) => {
                println!("{}", outcome.message);
                if outcome.exit {
                    return Ok(());
                }
            }
            Err(e) => {
                if !e.is_recoverable() {
                    tracing::error!(error = %e, "Command failed");
                }
                eprintln!("❌ {e}");
            }
        }
    }
}
