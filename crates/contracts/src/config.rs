//! RelayConfig - Config Loader output
//!
//! Describes the delivery targets, routing mode, sampling and per-target tuning.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use validator::Validate;

/// Configuration version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigVersion {
    #[default]
    V1,
}

/// Routing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Every frame goes to the primary target only
    #[default]
    Single,
    /// Every frame goes to all enabled targets
    Parallel,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => f.write_str("single"),
            Self::Parallel => f.write_str("parallel"),
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "parallel" => Ok(Self::Parallel),
            other => Err(format!("unknown delivery mode '{other}'")),
        }
    }
}

/// Complete relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RelayConfig {
    /// Configuration version
    #[serde(default)]
    pub version: ConfigVersion,

    /// Target addresses, in routing order
    #[serde(default)]
    pub backends: Vec<String>,

    /// Per-target enabled flags; missing entries default to enabled
    #[serde(default)]
    pub targets_enabled: Vec<bool>,

    /// Routing mode
    #[serde(default)]
    pub mode: DeliveryMode,

    /// Primary target in single mode
    #[serde(default)]
    pub primary_index: usize,

    /// Disable all delivery
    #[serde(default)]
    pub kill_switch: bool,

    /// Fraction of frames that request an acknowledgement
    #[serde(default = "default_sample_rate")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub sample_rate: f64,

    /// Per-target tuning
    #[serde(default)]
    #[validate(nested)]
    pub target: TargetTuning,

    /// Status reporting
    #[serde(default)]
    pub status: StatusConfig,
}

fn default_sample_rate() -> f64 {
    0.05
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            version: ConfigVersion::default(),
            backends: Vec::new(),
            targets_enabled: Vec::new(),
            mode: DeliveryMode::default(),
            primary_index: 0,
            kill_switch: false,
            sample_rate: default_sample_rate(),
            target: TargetTuning::default(),
            status: StatusConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Enabled flag for the target at `index`
    pub fn is_enabled(&self, index: usize) -> bool {
        self.targets_enabled.get(index).copied().unwrap_or(true)
    }

    /// Parse a comma-separated address list, skipping blanks
    pub fn parse_backend_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Parse a comma-separated flag list such as `1,1,0`
    pub fn parse_enabled_list(raw: &str) -> Vec<bool> {
        if raw.trim().is_empty() {
            return Vec::new();
        }
        raw.split(',')
            .map(|flag| matches!(flag.trim(), "1" | "true" | "on"))
            .collect()
    }
}

/// Tunables shared by every target
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TargetTuning {
    /// Connection attempt deadline
    #[serde(default = "default_connect_timeout_ms")]
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,

    /// Per-frame send deadline applied by network sessions
    #[serde(default = "default_send_timeout_ms")]
    #[validate(range(min = 1))]
    pub send_timeout_ms: u64,

    /// Bounded queue capacity
    #[serde(default = "default_queue_capacity")]
    #[validate(range(min = 1))]
    pub queue_capacity: usize,

    /// Frames older than this at dequeue are dropped
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,

    /// Pending acknowledgements older than this are evicted
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    1500
}

fn default_send_timeout_ms() -> u64 {
    250
}

fn default_queue_capacity() -> usize {
    500
}

fn default_stale_after_ms() -> u64 {
    2000
}

fn default_ack_timeout_ms() -> u64 {
    30_000
}

impl Default for TargetTuning {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            stale_after_ms: default_stale_after_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

impl TargetTuning {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Status reporting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Seconds between status log lines (0 = disabled)
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,

    /// Prometheus listener port (None = disabled)
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

fn default_report_interval_secs() -> u64 {
    10
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: default_report_interval_secs(),
            metrics_port: None,
        }
    }
}
