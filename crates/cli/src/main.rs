//! # daqflow CLI
//!
//! Thin launcher over the engine:
//! - blueprint loading and validation
//! - module construction through the built-in registry
//! - run lifecycle with Ctrl-C / duration stop and an end-of-run summary

mod cli;
mod commands;
mod error;

use anyhow::Result;
use clap::Parser;
use observability::ObservabilityConfig;
use tracing::info;

use cli::{Cli, Commands};
use commands::{run_engine, run_info, run_validate};

fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    observability::init_with_config(
        ObservabilityConfig {
            log_format: cli.log_format.into(),
            metrics_port: None,
            ..ObservabilityConfig::default()
        }
        .with_verbosity(cli.verbose, cli.quiet),
    )?;

    info!(version = env!("CARGO_PKG_VERSION"), "daqflow starting");

    let result = match &cli.command {
        Commands::Run(args) => run_engine(args),
        Commands::Validate(args) => run_validate(args),
        Commands::Info(args) => run_info(args),
    };

    if let Err(ref e) = result {
        tracing::error!(error = %e, "Command failed");
    }

    result
}
