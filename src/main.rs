// src/main.rs

//! The main entry point for the steward agent.

use anyhow::Result;
use std::env;
use steward::config::Config;
use steward::core::agent::Agent;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("steward version {VERSION}");
        return Ok(());
    }

    // The agent takes exactly one argument: its configuration file.
    let Some(config_path) = args.get(1) else {
        eprintln!("Usage: steward /path/to/steward.toml");
        std::process::exit(1);
    };

    // Initialize logging. Defaults to a more verbose level for the HA
    // decision engine so every tick outcome is visible.
    let log_level =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,steward::core::ha=debug".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    // Load the configuration. If loading fails, print the error and exit;
    // the agent cannot run without a valid configuration.
    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    info!(
        "Starting steward for member '{}' in cluster '{}'",
        config.postgresql.name, config.scope
    );

    let agent = match Agent::new(config) {
        Ok(agent) => agent,
        Err(e) => {
            error!("Failed to construct the agent: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = agent.run().await {
        error!("Agent runtime error: {e}");
        return Err(e.into());
    }
    Ok(())
}
