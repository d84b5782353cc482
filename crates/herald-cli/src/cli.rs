//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line arguments for `herald`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "herald",
    version,
    about = "Run a deferred-task trigger engine instance.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "herald.toml")]
    pub config: PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `HERALD_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Use the in-memory store instead of `[database]`. Nothing survives a
    /// restart.
    #[arg(long)]
    pub memory: bool,

    /// Register this many demo tasks, spread over the next `--demo-spread`
    /// seconds.
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub demo_tasks: usize,

    /// Window, in seconds from now, over which demo tasks are spread.
    #[arg(long, value_name = "SECONDS", default_value_t = 10)]
    pub demo_spread: i64,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}
