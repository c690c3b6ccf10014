//! Relay orchestration: source → delivery manager, plus status reporting.

mod config;
mod source;
mod stats;

use std::sync::Arc;
use std::time::{Duration, Instant};

use contracts::{events, Connector, Frame, StreamKind};
use delivery::DeliveryManager;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use config::resolve_config;
pub use stats::RelayStats;

use source::{spawn_stdin_reader, MockSource, SOURCE_CHANNEL_CAPACITY};
use stats::report_status;

/// How frames reach the relay
#[derive(Debug, Clone)]
pub enum SourceKind {
    /// Newline-delimited JSON on stdin
    Stdin,
    /// Generated telemetry
    Mock { session_id: String, rate_hz: f64 },
}

/// Relay run options
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub source: SourceKind,

    /// Maximum number of frames to read (None = unlimited)
    pub max_frames: Option<u64>,

    /// Status report period (None = disabled)
    pub report_interval: Option<Duration>,

    /// Time given to queues to drain after the source ends
    pub drain: Duration,
}

/// Running frame source
enum SourceHandle {
    Task(JoinHandle<()>),
    /// Stdin reader thread; never joined since it may sit in a blocking read
    Thread(oneshot::Receiver<crate::error::Result<u64>>),
}

impl SourceHandle {
    /// Stop the source; returns the malformed line count if it already ended
    fn finish(self) -> u64 {
        match self {
            Self::Task(handle) => {
                handle.abort();
                0
            }
            Self::Thread(mut done) => match done.try_recv() {
                Ok(Ok(malformed)) => malformed,
                Ok(Err(e)) => {
                    warn!(error = %e, "Frame source ended with error");
                    0
                }
                Err(_) => 0,
            },
        }
    }
}

/// Route one frame to the matching manager operation
///
/// Returns `None` when the frame was deliberately skipped.
pub fn route_frame<C: Connector>(manager: &DeliveryManager<C>, frame: Frame) -> Option<bool> {
    let accepted = match frame.event.as_str() {
        events::SESSION_METADATA => manager.send_session_metadata(frame.payload),
        events::TELEMETRY => manager.send_telemetry(frame.payload),
        events::RACE_EVENT => manager.send_race_event(frame.payload),
        events::INCIDENT => manager.send_incident(frame.payload),
        tag if tag == StreamKind::Baseline.event() => manager.send_baseline_stream(frame.payload),
        tag if tag == StreamKind::Controls.event() => {
            if !manager.should_send_controls() {
                return None;
            }
            manager.send_controls_stream(frame.payload)
        }
        tag => manager.send(tag, frame.payload),
    };
    Some(accepted)
}

/// Periodically log parity status until cancelled
pub fn spawn_status_reporter<C: Connector>(
    manager: Arc<DeliveryManager<C>>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    report_status(&manager.parity_snapshot(), manager.is_kill_switch_active());
                }
            }
        }
        debug!("Status reporter stopped");
    })
}

/// Feed frames from the configured source until it ends, the frame limit is
/// hit, or `cancel` fires
pub async fn run_relay<C: Connector>(
    manager: Arc<DeliveryManager<C>>,
    options: RelayOptions,
    cancel: CancellationToken,
) -> crate::error::Result<RelayStats> {
    let start_time = Instant::now();
    let mut stats = RelayStats::default();

    let (tx, mut rx) = mpsc::channel::<Frame>(SOURCE_CHANNEL_CAPACITY);
    let source = match options.source {
        SourceKind::Stdin => {
            info!("Reading newline-delimited JSON frames from stdin");
            SourceHandle::Thread(spawn_stdin_reader(tx)?)
        }
        SourceKind::Mock {
            session_id,
            rate_hz,
        } => {
            let mock = MockSource::new(session_id, rate_hz)?;
            info!(rate_hz, "Generating mock telemetry");
            SourceHandle::Task(tokio::spawn(mock.run(tx)))
        }
    };

    let started = manager.start();
    info!(workers = started, "Delivery manager running");

    let report_cancel = cancel.child_token();
    let reporter = options
        .report_interval
        .filter(|period| !period.is_zero())
        .map(|period| spawn_status_reporter(Arc::clone(&manager), period, report_cancel.clone()));

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                warn!("Received shutdown signal, stopping relay...");
                break;
            }
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => {
                    info!("Source finished");
                    break;
                }
            },
        };

        stats.frames_read += 1;
        match route_frame(&manager, frame) {
            Some(true) => stats.frames_accepted += 1,
            Some(false) => stats.frames_rejected += 1,
            None => stats.controls_skipped += 1,
        }

        if stats.frames_read.is_multiple_of(1000) {
            debug!(frames = stats.frames_read, "Relay progress");
        }
        if let Some(max) = options.max_frames {
            if stats.frames_read >= max {
                info!(frames = stats.frames_read, "Reached max frames limit");
                break;
            }
        }
    }

    drop(rx);
    if !cancel.is_cancelled() && !options.drain.is_zero() {
        drain_queues(&manager, options.drain, &cancel).await;
    }

    stats.malformed_lines = source.finish();

    info!("Shutting down relay...");
    report_cancel.cancel();
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }
    manager.shutdown().await;

    stats.duration = start_time.elapsed();
    Ok(stats)
}

/// Give workers a bounded window to flush what is already queued
async fn drain_queues<C: Connector>(
    manager: &DeliveryManager<C>,
    limit: Duration,
    cancel: &CancellationToken,
) {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        let queued: usize = manager.targets().iter().map(|t| t.queue_len()).sum();
        if queued == 0 {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }
    debug!("Drain window elapsed with frames still queued");
}
