//! Frame sources: newline-delimited JSON on stdin, or generated mock telemetry.

use std::io::BufRead;
use std::time::Duration;

use contracts::{events, Frame, Payload, StreamKind};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{CliError, Result};

/// Buffer between the source task and the relay loop
pub const SOURCE_CHANNEL_CAPACITY: usize = 256;

/// Read `{"event": ..., "data": {...}}` lines until EOF
///
/// Blocking; run it on a dedicated thread. Blank lines are skipped, malformed
/// lines are counted and skipped. Returns the malformed line count.
pub fn read_ndjson<R: BufRead>(reader: R, tx: &mpsc::Sender<Frame>) -> Result<u64> {
    let mut malformed = 0u64;

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Frame>(line) {
            Ok(frame) if !frame.event.is_empty() => {
                if tx.blocking_send(frame).is_err() {
                    debug!("Relay loop closed, stopping input");
                    break;
                }
            }
            Ok(_) => {
                malformed += 1;
                warn!(line = line_no, "Frame without event tag");
            }
            Err(e) => {
                malformed += 1;
                warn!(line = line_no, error = %e, "Malformed input line");
            }
        }
    }
    Ok(malformed)
}

/// Read stdin on its own OS thread
///
/// A blocked stdin read must not hold up runtime shutdown, so this stays off
/// the blocking pool. The receiver yields the malformed line count at EOF.
pub fn spawn_stdin_reader(tx: mpsc::Sender<Frame>) -> Result<oneshot::Receiver<Result<u64>>> {
    let (done_tx, done_rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("relay-stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            let _ = done_tx.send(read_ndjson(stdin.lock(), &tx));
        })?;
    Ok(done_rx)
}

/// Mock telemetry generator
///
/// Emits one `session_metadata` first, then per tick a `telemetry` frame and a
/// controls stream frame, with a baseline stream frame every fourth of a
/// second. Incidents and race events show up occasionally.
#[derive(Debug, Clone)]
pub struct MockSource {
    session_id: String,
    rate_hz: f64,
    tick: u64,
}

impl MockSource {
    pub fn new(session_id: impl Into<String>, rate_hz: f64) -> Result<Self> {
        if !(rate_hz.is_finite() && rate_hz > 0.0) {
            return Err(CliError::invalid_override("rate_hz", "must be > 0"));
        }
        Ok(Self {
            session_id: session_id.into(),
            rate_hz,
            tick: 0,
        })
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }

    fn metadata(&self) -> Frame {
        Frame::new(
            events::SESSION_METADATA,
            payload(json!({
                "sessionId": self.session_id,
                "track": "Mock Raceway",
                "sessionType": "practice",
                "source": "mock",
            })),
        )
    }

    /// Frames for the next tick
    pub fn next_frames(&mut self) -> Vec<Frame> {
        let tick = self.tick;
        self.tick += 1;
        if tick == 0 {
            return vec![self.metadata()];
        }

        let t = tick as f64 / self.rate_hz;
        let lap_pct = (t / 90.0).fract();
        let speed = 45.0 + 15.0 * (t / 3.0).sin();
        let mut frames = vec![Frame::new(
            events::TELEMETRY,
            payload(json!({
                "sessionId": self.session_id,
                "lap": (t / 90.0) as u64 + 1,
                "lapDistPct": lap_pct,
                "speed": speed,
                "rpm": 4000.0 + speed * 80.0,
                "gear": ((speed / 12.0) as u64).clamp(1, 6),
            })),
        )];

        frames.push(Frame::new(
            StreamKind::Controls.event(),
            payload(json!({
                "throttle": (0.5 + 0.5 * (t * 1.3).sin()).clamp(0.0, 1.0),
                "brake": (0.5 * (t * 0.7).cos()).clamp(0.0, 1.0),
                "steering": 0.3 * (t * 0.9).sin(),
            })),
        ));

        let baseline_every = (self.rate_hz / f64::from(StreamKind::Baseline.sample_hz()))
            .round()
            .max(1.0) as u64;
        if tick.is_multiple_of(baseline_every) {
            frames.push(Frame::new(
                StreamKind::Baseline.event(),
                payload(json!({
                    "speed": speed,
                    "lapDistPct": lap_pct,
                    "fuelLevel": (60.0 - t * 0.01).max(0.0),
                })),
            ));
        }

        if tick.is_multiple_of(600) {
            frames.push(Frame::new(
                events::RACE_EVENT,
                payload(json!({ "flag": "green", "tick": tick })),
            ));
        }
        if tick.is_multiple_of(1000) {
            frames.push(Frame::new(
                events::INCIDENT,
                payload(json!({ "carIdx": 7, "type": "off_track", "lapDistPct": lap_pct })),
            ));
        }
        frames
    }

    /// Generate frames at the configured rate until the receiver goes away
    pub async fn run(mut self, tx: mpsc::Sender<Frame>) {
        let mut interval = tokio::time::interval(self.period());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            for frame in self.next_frames() {
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    }
}
