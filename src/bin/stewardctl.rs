// src/bin/stewardctl.rs

//! Entry point for the operator CLI.

use clap::Parser;
use steward::ctl::{self, Ctl};
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    let args = Ctl::parse();
    if let Err(e) = ctl::run(args).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
