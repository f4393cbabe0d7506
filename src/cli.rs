//! Command-line interface for tradesup.
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::{logs::LogKind, registry::Backend};

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

/// Command-line interface for tradesup.
#[derive(Parser)]
#[command(name = "tradesup", version, author)]
#[command(
    about = "Runs the trading worker as a supervised, restart-capable service",
    long_about = None
)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Use the system-wide registry under /var/lib/tradesup. Requires root to change it.
    #[arg(long = "sys", global = true)]
    pub sys: bool,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for tradesup.
#[derive(Subcommand)]
pub enum Commands {
    /// Register the service with the host.
    Install {
        /// Path to the configuration file (defaults to `tradesup.yaml` when present).
        #[arg(short, long)]
        config: Option<String>,

        /// Host mechanism that owns the registration.
        #[arg(short, long, default_value_t = Backend::File)]
        backend: Backend,
    },

    /// Stop the service if it runs, then remove its registration.
    Uninstall {
        /// Path to the configuration file (defaults to `tradesup.yaml` when present).
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Start the installed service.
    Start {
        /// Path to the configuration file (defaults to `tradesup.yaml` when present).
        #[arg(short, long)]
        config: Option<String>,

        /// Run the supervisor in this process instead of detaching it.
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the running service and its worker.
    Stop {
        /// Path to the configuration file (defaults to `tradesup.yaml` when present).
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Show the state of the service and its worker.
    Status {
        /// Path to the configuration file (defaults to `tradesup.yaml` when present).
        #[arg(short, long)]
        config: Option<String>,

        /// Emit machine-readable JSON output.
        #[arg(long)]
        json: bool,
    },

    /// Show the worker or supervisor logs.
    Logs {
        /// Path to the configuration file (defaults to `tradesup.yaml` when present).
        #[arg(short, long)]
        config: Option<String>,

        /// Number of lines to show.
        #[arg(short, long, default_value = "50")]
        lines: usize,

        /// Kind of logs to show: stdout, stderr, or supervisor.
        #[arg(short = 'k', long, default_value_t = LogKind::default())]
        kind: LogKind,
    },

    /// Run the supervisor body. This is the command line registrations point at.
    Run {
        /// Path to the configuration file.
        #[arg(short, long, conflicts_with = "project_dir")]
        config: Option<String>,

        /// Run with the built-in defaults rooted at this directory.
        #[arg(long, value_name = "DIR")]
        project_dir: Option<String>,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
