//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// daqflow - synchronized multi-device acquisition runs
#[derive(Parser, Debug)]
#[command(
    name = "daqflow",
    author,
    version,
    about = "Run synchronized acquisition modules from a blueprint",
    long_about = "Loads a run blueprint, builds its modules, wires their streams and runs\n\
                  them until Ctrl-C or the requested duration elapses. Persistent runs\n\
                  record a collection with datasets, time-sync files and a manifest."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "DAQFLOW_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "DAQFLOW_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the modules of a blueprint
    Run(RunArgs),

    /// Validate a blueprint without running
    Validate(ValidateArgs),

    /// Display blueprint information
    Info(InfoArgs),
}

/// Arguments for the `run` command
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to the blueprint (TOML or JSON)
    #[arg(short, long, default_value = "run.toml", env = "DAQFLOW_CONFIG")]
    pub config: PathBuf,

    /// Override the export directory of the blueprint
    #[arg(long, env = "DAQFLOW_EXPORT_DIR")]
    pub export_dir: Option<PathBuf>,

    /// Stop the run after this many seconds (0 = until Ctrl-C)
    #[arg(long, default_value = "0", env = "DAQFLOW_DURATION_SECS")]
    pub duration_secs: u64,

    /// Run without recording a collection
    #[arg(long)]
    pub ephemeral: bool,

    /// Base seed handed to modules (random when unset)
    #[arg(long, env = "DAQFLOW_SEED")]
    pub seed: Option<u64>,

    /// Prometheus metrics port (0 = disabled)
    #[arg(long, default_value = "0", env = "DAQFLOW_METRICS_PORT")]
    pub metrics_port: u16,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to the blueprint to validate
    #[arg(short, long, default_value = "run.toml")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `info` command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to the blueprint
    #[arg(short, long, default_value = "run.toml")]
    pub config: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Show module parameters
    #[arg(long)]
    pub params: bool,
}

/// Log output format
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}

impl From<LogFormat> for observability::LogFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Json => Self::Json,
            LogFormat::Pretty => Self::Pretty,
            LogFormat::Compact => Self::Compact,
        }
    }
}
