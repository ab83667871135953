//! # jvmscan
//!
//! Command-line entry point for the image scan reconciler.
//!
//! Configuration comes from `--config` when given, otherwise from the
//! `JVMSCAN_*` environment variables. Logs go to stderr and honour
//! `RUST_LOG`; command output goes to stdout.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use jvmscan_reconciler::ReconcilerConfig;

mod cli;
mod commands;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    debug!(call_timeout = ?config.call_timeout, "Configuration loaded");

    commands::execute_command(cli.command, config).await
}

/// Initialize tracing subscriber.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&std::path::Path>) -> Result<ReconcilerConfig> {
    match path {
        Some(path) => ReconcilerConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => ReconcilerConfig::from_env().context("Invalid JVMSCAN_* environment configuration"),
    }
}
