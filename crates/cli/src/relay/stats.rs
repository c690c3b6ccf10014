//! Relay run statistics and reports.

use std::time::Duration;

use delivery::{ParitySnapshot, TargetStats};
use tracing::{info, warn};

/// Statistics from a relay run
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    /// Frames taken from the source
    pub frames_read: u64,

    /// Frames accepted by at least one target
    pub frames_accepted: u64,

    /// Frames no target accepted (kill switch, unroutable, queue rejection)
    pub frames_rejected: u64,

    /// Controls frames skipped because nothing was connected
    pub controls_skipped: u64,

    /// Input lines that could not be parsed
    pub malformed_lines: u64,

    /// Total duration of the run
    pub duration: Duration,
}

impl RelayStats {
    /// Accepted frames per second
    pub fn fps(&self) -> f64 {
        if self.duration.as_secs_f64() > 0.0 {
            self.frames_accepted as f64 / self.duration.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Print detailed summary including the final parity snapshot
    pub fn print_summary(&self, snapshot: &ParitySnapshot) {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║                    Relay Statistics                          ║");
        println!("╚══════════════════════════════════════════════════════════════╝\n");

        println!("📊 Overview");
        println!("   ├─ Duration: {:.2}s", self.duration.as_secs_f64());
        println!("   ├─ Frames read: {}", self.frames_read);
        println!("   ├─ Frames accepted: {}", self.frames_accepted);
        println!("   ├─ Frames rejected: {}", self.frames_rejected);
        println!("   ├─ Controls skipped: {}", self.controls_skipped);
        println!("   ├─ Malformed lines: {}", self.malformed_lines);
        println!("   └─ Accepted/s: {:.2}", self.fps());

        println!("\n📈 Parity");
        println!("   ├─ Sent: {}", snapshot.total_sent);
        println!("   ├─ Acked: {}", snapshot.total_acked);
        println!("   ├─ Failed: {}", snapshot.total_failed);
        println!("   ├─ Dropped: {}", snapshot.total_dropped);
        println!("   └─ Ack latency: {}", snapshot.ack_latency);

        if !snapshot.targets.is_empty() {
            println!("\n📤 Targets ({})", snapshot.targets.len());
            for (i, target) in snapshot.targets.iter().enumerate() {
                let prefix = if i == snapshot.targets.len() - 1 {
                    "└─"
                } else {
                    "├─"
                };
                println!("   {} {}", prefix, target_line(target));
            }
        }

        println!();
    }
}

fn target_line(target: &TargetStats) -> String {
    let mut line = format!(
        "[{}] {} ({}{}) sent={} failed={} dropped={} acked={} ack_rate={:.1}% queue={}",
        target.index,
        target.url,
        target.state,
        if target.enabled { "" } else { ", disabled" },
        target.sent,
        target.failed,
        target.dropped,
        target.acked,
        target.ack_rate() * 100.0,
        target.queue_size,
    );
    if let Some(error) = &target.last_error {
        line.push_str(&format!(" last_error=\"{error}\""));
    }
    line
}

/// Log one status report and publish parity totals as gauges
pub fn report_status(snapshot: &ParitySnapshot, kill_switch: bool) {
    observability::record_parity_totals(
        snapshot.total_sent,
        snapshot.total_acked,
        snapshot.total_failed,
        snapshot.total_dropped,
    );

    if kill_switch {
        warn!("Kill switch active, delivery disabled");
    }
    info!(
        sent = snapshot.total_sent,
        acked = snapshot.total_acked,
        failed = snapshot.total_failed,
        dropped = snapshot.total_dropped,
        ack_p50_ms = snapshot.ack_latency.p50,
        ack_p95_ms = snapshot.ack_latency.p95,
        "Relay status"
    );
    for target in &snapshot.targets {
        info!(
            target = target.index,
            url = %target.url,
            state = %target.state,
            enabled = target.enabled,
            sent = target.sent,
            failed = target.failed,
            dropped = target.dropped,
            acked = target.acked,
            ack_expired = target.ack_expired,
            queue = target.queue_size,
            viewers = target.viewers,
            last_ack_latency_ms = target.last_ack_latency_ms,
            last_error = target.last_error.as_deref(),
            "Target status"
        );
    }
}
