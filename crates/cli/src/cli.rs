//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use contracts::DeliveryMode;
use std::path::PathBuf;

/// Telemetry Relay - multi-target telemetry delivery
#[derive(Parser, Debug)]
#[command(
    name = "telemetry-relay",
    author,
    version,
    about = "Multi-target telemetry delivery relay",
    long_about = "Delivers telemetry frames to one or more remote backends.\n\n\
                  Each backend gets its own bounded queue and worker; slow or \n\
                  unreachable backends never block the producer. Supports \n\
                  single/parallel routing, a kill switch and ack-sampled parity metrics."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "RELAY_VERBOSE")]
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
        env = "RELAY_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay
    Run(RunArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),

    /// Display configuration information
    Info(InfoArgs),
}

/// Configuration overrides shared by `run` and `info`
#[derive(Parser, Debug, Clone, Default)]
pub struct OverrideArgs {
    /// Path to configuration file (TOML or JSON); optional when backends are given
    #[arg(short, long, env = "RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Comma-separated backend addresses (ws://, wss://, log://)
    #[arg(long, env = "RELAY_BACKENDS")]
    pub backends: Option<String>,

    /// Routing mode
    #[arg(long, env = "RELAY_BACKEND_MODE")]
    pub mode: Option<DeliveryMode>,

    /// Primary backend in single mode
    #[arg(long, env = "RELAY_PRIMARY_INDEX")]
    pub primary_index: Option<usize>,

    /// Disable all delivery (env accepts 1/0, true/false, yes/no, on/off)
    #[arg(
        long,
        env = "RELAY_KILL_SWITCH",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub kill_switch: bool,

    /// Comma-separated enabled flags, e.g. `1,1,0`
    #[arg(long, env = "RELAY_TARGETS_ENABLED")]
    pub targets_enabled: Option<String>,

    /// Fraction of frames that request an acknowledgement
    #[arg(long, env = "RELAY_PARITY_SAMPLE_RATE")]
    pub sample_rate: Option<f64>,

    /// Connection timeout per backend, in milliseconds
    #[arg(long, env = "RELAY_TARGET_TIMEOUT_MS")]
    pub target_timeout_ms: Option<u64>,

    /// Send timeout per frame, in milliseconds
    #[arg(long, env = "RELAY_SEND_TIMEOUT_MS")]
    pub send_timeout_ms: Option<u64>,
}

/// Arguments for the `run` command
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub overrides: OverrideArgs,

    /// Generate mock telemetry instead of reading frames from stdin
    #[arg(long)]
    pub mock: bool,

    /// Mock telemetry rate in Hz
    #[arg(long, default_value = "10", env = "RELAY_MOCK_RATE_HZ")]
    pub rate_hz: f64,

    /// Session id announced by the mock source
    #[arg(long, env = "RELAY_SESSION_ID")]
    pub session_id: Option<String>,

    /// Maximum number of frames to read (0 = unlimited)
    #[arg(long, default_value = "0", env = "RELAY_MAX_FRAMES")]
    pub max_frames: u64,

    /// Relay timeout in seconds (0 = no timeout)
    #[arg(long, default_value = "0", env = "RELAY_TIMEOUT")]
    pub timeout: u64,

    /// Seconds between status reports (overrides config, 0 = disabled)
    #[arg(long, env = "RELAY_REPORT_INTERVAL")]
    pub report_interval: Option<u64>,

    /// Metrics server port (overrides config, 0 = disabled)
    #[arg(long, env = "RELAY_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Seconds to let queues drain before stopping
    #[arg(long, default_value = "1", env = "RELAY_DRAIN_SECS")]
    pub drain_secs: u64,

    /// Validate configuration and exit without running the relay
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "relay.toml")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `info` command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    pub overrides: OverrideArgs,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Show per-target tuning
    #[arg(long)]
    pub tuning: bool,
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
