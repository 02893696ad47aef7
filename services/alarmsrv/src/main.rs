//! Alarm Service (AlarmSrv)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use alarmsrv::{logging, ActionRegistry, AlarmConfig, AlarmService};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter, overrides the configured level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Write class and watch state back to the config file on shutdown
    #[arg(long)]
    save_state: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run in service mode
    Service,

    /// Print a starting configuration file
    DefaultConfig,

    /// List the service actions and their parameters
    Actions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();

    match args.command.take() {
        Some(Commands::DefaultConfig) => {
            print!("{}", AlarmConfig::default_yaml());
            Ok(())
        }
        Some(Commands::Actions) => {
            for spec in ActionRegistry::new().specs() {
                let params: Vec<&str> = spec.params.iter().map(|p| p.name).collect();
                println!("{:<22} {:?} [{}]", spec.name, spec.result, params.join(", "));
            }
            Ok(())
        }
        Some(Commands::Service) | None => run_service(args).await,
    }
}

async fn run_service(args: Args) -> Result<()> {
    let config = AlarmConfig::load(args.config.as_deref()).context("Failed to load config")?;
    let level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    logging::init(&level).context("Failed to initialize logging")?;

    info!("Starting Alarm Service");
    let service = AlarmService::from_config(config).await?;
    service.start().await?;
    info!(
        "Alarm Service running with {} classes",
        service.classes().len()
    );

    wait_for_shutdown().await;
    info!("Shutdown signal received");

    // Snapshot before stop clears the registry
    let snapshot = service.config_snapshot();
    service.stop().await?;

    if args.save_state {
        if let Some(path) = args.config.as_deref() {
            std::fs::write(path, snapshot.to_yaml()?)
                .with_context(|| format!("Failed to save state to {}", path.display()))?;
            info!("Saved state to {}", path.display());
        } else {
            warn!("--save-state needs --config; state not saved");
        }
    }
    Ok(())
}

/// Ctrl+C, or SIGTERM on Unix
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
