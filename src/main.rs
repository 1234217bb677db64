//! Warden - task worker resource layer
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use warden::cli::{Cli, Commands};
use warden::config::ConfigManager;
use warden::error::WardenResult;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> WardenResult<()> {
    let cli = Cli::parse();

    let config_manager = if let Some(ref path) = cli.config {
        ConfigManager::with_path(path.clone())
    } else {
        ConfigManager::new()
    };
    let config = config_manager.load().await?;

    // 0 = warn, 1 = info, 2+ = debug; general.verbose counts as -v
    let level = cli.verbose.max(u8::from(config.general.verbose));
    let filter = match level {
        0 => EnvFilter::new("warden=warn"),
        1 => EnvFilter::new("warden=info"),
        _ => EnvFilter::new("warden=debug"),
    };

    if cli.log_json || config.general.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .init();
    }

    debug!("Using configuration at {}", config_manager.path().display());

    match cli.command {
        Commands::Cache(args) => {
            ConfigManager::ensure_state_dirs(&config).await?;
            warden::cli::commands::cache(args, &config).await
        }
        Commands::Config(args) => {
            warden::cli::commands::config(args, &config, &config_manager).await
        }
        Commands::Ports(args) => warden::cli::commands::ports(args, &config).await,
    }
}
