//! Relay 指标收集模块
//!
//! 基于 metrics facade 记录每个目标的投递计数、队列深度与 ACK 延迟，
//! 并提供内存中的在线统计与延迟分位数计算，供 parity 报告使用。

use metrics::{counter, gauge, histogram};
use serde::Serialize;

/// 帧丢弃原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// 队列满，淘汰最旧帧
    Overflow,
    /// 出队时已过期
    Stale,
}

impl DropReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Overflow => "overflow",
            Self::Stale => "stale",
        }
    }
}

/// 记录帧发送成功
pub fn record_frame_sent(target: usize) {
    counter!("relay_frames_sent_total", "target" => target.to_string()).increment(1);
}

/// 记录帧发送失败
pub fn record_frame_failed(target: usize) {
    counter!("relay_frames_failed_total", "target" => target.to_string()).increment(1);
}

/// 记录帧丢弃
pub fn record_frame_dropped(target: usize, reason: DropReason) {
    counter!(
        "relay_frames_dropped_total",
        "target" => target.to_string(),
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// 记录队列深度
pub fn record_queue_depth(target: usize, depth: usize) {
    gauge!("relay_queue_depth", "target" => target.to_string()).set(depth as f64);
}

/// 记录 ACK 往返延迟 (毫秒)
pub fn record_ack_latency_ms(target: usize, latency_ms: f64) {
    histogram!("relay_ack_latency_ms", "target" => target.to_string()).record(latency_ms);
}

/// 记录未确认而过期的 ACK 数量
pub fn record_ack_expired(target: usize, count: usize) {
    if count > 0 {
        counter!("relay_acks_expired_total", "target" => target.to_string())
            .increment(count as u64);
    }
}

/// 记录连接尝试结果
pub fn record_connect_attempt(target: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "relay_connect_attempts_total",
        "target" => target.to_string(),
        "status" => status
    )
    .increment(1);
}

/// 记录目标连接状态 (0=disconnected, 1=connecting, 2=connected, 3=backoff)
pub fn record_target_state(target: usize, state_code: u8) {
    gauge!("relay_target_state", "target" => target.to_string()).set(f64::from(state_code));
}

/// 记录 kill switch 状态
pub fn record_kill_switch(active: bool) {
    gauge!("relay_kill_switch").set(if active { 1.0 } else { 0.0 });
}

/// 记录 parity 汇总
pub fn record_parity_totals(sent: u64, acked: u64, failed: u64, dropped: u64) {
    gauge!("relay_parity_sent").set(sent as f64);
    gauge!("relay_parity_acked").set(acked as f64);
    gauge!("relay_parity_failed").set(failed as f64);
    gauge!("relay_parity_dropped").set(dropped as f64);
}

/// ACK 延迟摘要
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    /// 样本数
    pub samples: usize,
    /// 中位数 (毫秒)
    pub p50: f64,
    /// 95 分位 (毫秒)，样本不足 21 个时为 0
    pub p95: f64,
    /// 均值/极值统计
    pub stats: StatsSummary,
}

impl LatencySummary {
    /// 从样本计算摘要
    pub fn from_samples(samples: &[f64]) -> Self {
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        let p50 = sorted.get(sorted.len() / 2).copied().unwrap_or(0.0);
        let p95 = if sorted.len() > 20 {
            let idx = (sorted.len() as f64 * 0.95) as usize;
            sorted[idx.min(sorted.len() - 1)]
        } else {
            0.0
        };

        let mut stats = RunningStats::default();
        for value in samples {
            stats.push(*value);
        }

        Self {
            samples: samples.len(),
            p50,
            p95,
            stats: StatsSummary::from(&stats),
        }
    }
}

impl std::fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.samples == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "p50={:.1}ms, p95={:.1}ms, {}",
                self.p50, self.p95, self.stats
            )
        }
    }
}

/// 统计摘要
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.3}, max={:.3}, mean={:.3}, std={:.3} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// 在线统计计算器 (Welford's algorithm)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    /// 添加新值
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            let delta2 = value - self.mean;
            self.m2 += delta * delta2;
        }
    }

    /// 样本数量
    pub fn count(&self) -> u64 {
        self.count
    }

    /// 均值
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// 方差
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    /// 标准差
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// 最小值
    pub fn min(&self) -> f64 {
        self.min
    }

    /// 最大值
    pub fn max(&self) -> f64 {
        self.max
    }
}
