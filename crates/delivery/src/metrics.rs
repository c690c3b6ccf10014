//! Target metrics for observability
//!
//! Counters are plain atomics read individually; a snapshot is not atomic
//! across fields.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use observability::LatencySummary;
use serde::Serialize;

use crate::target::TargetState;

/// Samples kept per target
pub const TARGET_LATENCY_WINDOW: usize = 100;

/// Samples kept across all targets
pub const AGGREGATE_LATENCY_WINDOW: usize = 1000;

/// Aggregate samples reported in a parity snapshot
pub const PARITY_SAMPLE_COUNT: usize = 100;

/// Monotonic counters for a single target
#[derive(Debug, Default)]
pub struct TargetCounters {
    sent: AtomicU64,
    failed: AtomicU64,
    acked: AtomicU64,
    dropped: AtomicU64,
    ack_expired: AtomicU64,
}

impl TargetCounters {
    /// Create new counters
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn inc_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn inc_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_expired(&self) -> u64 {
        self.ack_expired.load(Ordering::Relaxed)
    }

    pub fn add_ack_expired(&self, count: u64) {
        self.ack_expired.fetch_add(count, Ordering::Relaxed);
    }
}

/// Rolling latency window, oldest evicted first
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, latency_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Most recent `n` samples, oldest first
    pub fn recent(&self, n: usize) -> Vec<f64> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).copied().collect()
    }
}

/// Manager-wide latency window shared with every target
#[derive(Debug)]
pub struct AggregateLatency {
    window: Mutex<LatencyWindow>,
}

impl Default for AggregateLatency {
    fn default() -> Self {
        Self {
            window: Mutex::new(LatencyWindow::new(AGGREGATE_LATENCY_WINDOW)),
        }
    }
}

impl AggregateLatency {
    pub fn push(&self, latency_ms: f64) {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(latency_ms);
    }

    pub fn recent(&self, n: usize) -> Vec<f64> {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent(n)
    }

    pub fn len(&self) -> usize {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Value snapshot of one target (address redacted)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStats {
    pub index: usize,
    pub url: String,
    pub enabled: bool,
    pub state: TargetState,
    pub sent: u64,
    pub failed: u64,
    pub acked: u64,
    pub dropped: u64,
    pub ack_expired: u64,
    pub queue_size: usize,
    pub pending_acks: usize,
    /// Unix milliseconds of the last successful send
    pub last_send_ok_ms: Option<i64>,
    pub last_ack_latency_ms: Option<f64>,
    pub last_error: Option<String>,
    /// Unix milliseconds until which connection attempts are suppressed
    pub backoff_until_ms: Option<i64>,
    pub viewers: u64,
}

impl TargetStats {
    /// Fraction of sent frames that were acknowledged
    pub fn ack_rate(&self) -> f64 {
        self.acked as f64 / self.sent.max(1) as f64
    }
}

/// Aggregate view across all targets
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParitySnapshot {
    pub targets: Vec<TargetStats>,
    pub total_sent: u64,
    pub total_acked: u64,
    pub total_failed: u64,
    pub total_dropped: u64,
    /// Last aggregate ack latencies, oldest first
    pub ack_latency_samples: Vec<f64>,
    pub ack_latency: LatencySummary,
}

impl ParitySnapshot {
    /// Build totals from per-target stats
    pub fn new(targets: Vec<TargetStats>, ack_latency_samples: Vec<f64>) -> Self {
        let ack_latency = LatencySummary::from_samples(&ack_latency_samples);
        Self {
            total_sent: targets.iter().map(|t| t.sent).sum(),
            total_acked: targets.iter().map(|t| t.acked).sum(),
            total_failed: targets.iter().map(|t| t.failed).sum(),
            total_dropped: targets.iter().map(|t| t.dropped).sum(),
            targets,
            ack_latency_samples,
            ack_latency,
        }
    }
}
