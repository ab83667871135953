//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// jvmscan - JVM dependency discovery for container images
#[derive(Parser, Debug)]
#[command(name = "jvmscan")]
#[command(version)]
#[command(about = "Discover JVM dependencies embedded in container images")]
#[command(
    long_about = "jvmscan reconciles image scan requests into two-step scan jobs and records the dependencies they report. The subcommands exercise the parser, the job spec builder, and a full reconcile cycle against an in-memory store."
)]
pub struct Cli {
    /// Configuration file (TOML or JSON); defaults to the environment
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parse a raw dependency result string and print the records as JSON
    Parse {
        /// Comma-separated entries of `coordinate;source;key=value...`
        result: String,
    },

    /// Print the job spec that would scan an image, as YAML
    Pipeline {
        /// Image reference to scan
        #[arg(short, long)]
        image: String,
    },

    /// Run a scan request through a full reconcile cycle in memory
    Simulate {
        /// Image reference to scan
        #[arg(short, long)]
        image: String,

        /// Namespace of the scan request
        #[arg(short, long, default_value = "default")]
        namespace: String,

        /// Name of the scan request
        #[arg(long, default_value = "scan")]
        name: String,

        /// Dependency output the simulated job reports
        #[arg(short, long)]
        dependencies: Option<String>,

        /// Image digest the simulated job reports
        #[arg(long)]
        digest: Option<String>,
    },
}
