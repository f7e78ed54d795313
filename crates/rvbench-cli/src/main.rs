//! rvbench - request/response load test over a subject-addressed bus

use std::path::Path;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use rvbench_cli::{cli::Cli, commands::CommandDispatcher, config::AppConfig, normalize_legacy_flags};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments, accepting the single-dash long flags too
    let cli = Cli::parse_from(normalize_legacy_flags(std::env::args()));

    // Initialize logging
    setup_logging(cli.verbose);

    // Load configuration
    let config = load_configuration(&cli)?;

    let code = match CommandDispatcher::execute(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            1
        }
    };
    std::process::exit(code);
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Load configuration from defaults, file, environment and flags
fn load_configuration(cli: &Cli) -> anyhow::Result<AppConfig> {
    match &cli.config {
        Some(config_path) => info!("Loading configuration from: {}", config_path),
        None => info!("Using default configuration layers"),
    }
    AppConfig::load_with_overrides(cli.config.as_deref().map(Path::new), &cli.command)
        .context("failed to load configuration")
}
