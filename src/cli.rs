//! Command-line interface for stackctl.
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::constants::{DEFAULT_CONFIG_FILE, DEFAULT_LOG_LINES};
use crate::logs::LogKind;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for stackctl.
#[derive(Parser)]
#[command(name = "stackctl", version, author)]
#[command(
    about = "Starts, verifies and snapshots a stack of dependent local services",
    long_about = None
)]
pub struct Cli {
    /// Path to the stack configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, global = true)]
    pub config: String,

    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for stackctl.
#[derive(Subcommand)]
pub enum Commands {
    /// Start every service in dependency order, waiting for each to become healthy.
    Start,

    /// Stop every service in reverse dependency order.
    Stop,

    /// Stop the whole stack, then start it again.
    Restart,

    /// Show process and health state of each service.
    Status {
        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,

        /// Disable ANSI colors in output.
        #[arg(long = "no-color")]
        no_color: bool,
    },

    /// Show the tail of service logs.
    Logs {
        /// The service whose logs should be displayed (default: all).
        #[arg(short, long)]
        service: Option<String>,

        /// Number of lines to show.
        #[arg(short, long, default_value_t = DEFAULT_LOG_LINES)]
        lines: usize,

        /// Kind of logs to show: stdout or stderr.
        #[arg(short = 'k', long, default_value_t = LogKind::default())]
        kind: LogKind,
    },

    /// Run corpus ingestion, refusing when no source documents are present.
    Corpus,

    /// Snapshot the configured data directories.
    Backup {
        /// Stop the stack for the copy and start it again afterwards.
        #[arg(long)]
        safe: bool,
    },

    /// Restore data directories from a snapshot. Services must be stopped.
    Restore {
        /// Identifier of the snapshot to restore.
        snapshot: String,
    },

    /// List snapshots in the snapshot store.
    Snapshots,

    /// Probe every service once and report pass/fail.
    Test,
}

impl Commands {
    /// Whether the command changes processes or data and needs the project lock.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Commands::Start
                | Commands::Stop
                | Commands::Restart
                | Commands::Corpus
                | Commands::Backup { .. }
                | Commands::Restore { .. }
        )
    }
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
