//! # Observability
//!
//! 可观测性模块：Tracing + Prometheus 指标。
//!
//! ## 功能
//!
//! - 日志初始化：EnvFilter (`RUST_LOG`) + JSON/Pretty/Compact 格式
//! - Prometheus 指标导出 (仅监听 127.0.0.1)
//! - 目标投递计数、ACK 延迟分位数统计
//!
//! ## 使用示例
//!
//! ```ignore
//! use observability::{LogFormat, ObservabilityConfig};
//!
//! observability::init_logging(&ObservabilityConfig::from_verbosity(1, false, LogFormat::Compact))?;
//! observability::init_metrics_only(8765)?;
//!
//! observability::record_frame_sent(0);
//! ```

pub mod metrics;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// Re-exports
pub use crate::metrics::{
    record_ack_expired, record_ack_latency_ms, record_connect_attempt, record_frame_dropped,
    record_frame_failed, record_frame_sent, record_kill_switch, record_parity_totals,
    record_queue_depth, record_target_state, DropReason, LatencySummary, RunningStats,
    StatsSummary,
};

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityConfig {
    /// 输出格式
    pub log_format: LogFormat,
    /// `RUST_LOG` 未设置时使用的级别
    pub default_log_level: String,
    /// 忽略 `RUST_LOG`，始终使用 `default_log_level`
    pub ignore_env: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            default_log_level: "info".to_string(),
            ignore_env: false,
        }
    }
}

impl ObservabilityConfig {
    /// `-v` 计数与 `-q` 映射为日志级别；quiet 时只输出 warn 及以上
    pub fn from_verbosity(verbose: u8, quiet: bool, log_format: LogFormat) -> Self {
        let (level, ignore_env) = match (quiet, verbose) {
            (true, _) => ("warn", true),
            (false, 0) => ("info", false),
            (false, 1) => ("debug", false),
            (false, _) => ("trace", false),
        };
        Self {
            log_format,
            default_log_level: level.to_string(),
            ignore_env,
        }
    }

    fn filter(&self) -> EnvFilter {
        if self.ignore_env {
            return EnvFilter::new(&self.default_log_level);
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_log_level))
    }
}

/// 日志格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON 结构化日志
    Json,
    /// 人类可读格式
    #[default]
    Pretty,
    /// 紧凑单行格式
    Compact,
}

/// 初始化全局 tracing subscriber
///
/// 进程内只能成功调用一次。
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(config.filter())
        .with(fmt_layer)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}

/// 仅初始化 Prometheus 指标（不初始化 Tracing）
///
/// 端口来自中继配置，日志初始化之后调用。
pub fn init_metrics_only(port: u16) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([127, 0, 0, 1], port))
        .install()
        .context("Failed to install Prometheus recorder")?;

    tracing::info!(port = port, "Prometheus metrics endpoint initialized");
    Ok(())
}
