use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use infergate_bootstrap::{AppConfig, AppConfigProvider, CliArgs};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod gateway;

use gateway::Gateway;

/// Infergate Server - inference gateway backend orchestrator
#[derive(Parser)]
#[command(name = "infergate-server")]
#[command(about = "Infergate Server - inference gateway backend orchestrator")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator
    Run,
    /// Validate configuration, list available models and exit
    Check {
        /// Only list models whose name matches this regex
        #[arg(long)]
        filter: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        print_config: cli.print_config,
        verbose: cli.verbose,
    };

    // Layered config:
    // 1) defaults -> 2) YAML (if provided) -> 3) env (APP__*) -> 4) CLI overrides
    // Also normalizes + creates server.home_dir.
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config.logging.as_ref().cloned().unwrap_or_default();
    infergate_bootstrap::init_logging_unified(&logging_config, Path::new(&config.server.home_dir));

    tracing::info!("Infergate Server starting");

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Check { filter } => check_config(config, filter.as_deref()),
    }
}

async fn run_server(config: AppConfig) -> Result<()> {
    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout_sec);
    let home_dir = PathBuf::from(&config.server.home_dir);
    let provider = AppConfigProvider::new(config);

    let gateway = Gateway::from_provider(&provider, &home_dir)?;

    let preloaded = gateway.preload().await;
    tracing::info!(
        preloaded,
        requested = gateway.config().preload.len(),
        backends = gateway.registry().len(),
        "orchestrator ready"
    );
    gateway.report_usage().await;

    let signal = infergate_bootstrap::wait_for_shutdown().await;
    if let Err(e) = &signal {
        tracing::error!(error = %e, "signal handling failed; shutting down");
    }

    if !gateway.shutdown(shutdown_timeout).await {
        tracing::warn!("some backends may still be running");
    }
    tracing::info!("Infergate Server stopped");
    signal.map(|_| ())
}

fn check_config(config: AppConfig, filter: Option<&str>) -> Result<()> {
    tracing::info!("Checking configuration…");
    let filter = filter
        .map(Regex::new)
        .transpose()
        .context("invalid --filter regex")?;

    let home_dir = PathBuf::from(&config.server.home_dir);
    let yaml = config.to_yaml()?;
    let provider = AppConfigProvider::new(config);
    let gateway = Gateway::from_provider(&provider, &home_dir)?;

    println!("Configuration is valid");
    println!("{yaml}");
    match gateway.available_models(filter.as_ref()) {
        Ok(models) => {
            println!("Available models ({}):", models.len());
            for model in models {
                println!("  {model}");
            }
        }
        Err(e) => println!("Models directory not readable: {e}"),
    }
    Ok(())
}
