//! Target - one remote endpoint with an isolated queue and worker task
//!
//! The worker owns the target's session. Everything the manager or a metrics
//! reader can touch lives behind atomics or short-lived locks on [`Target`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use contracts::{
    events, ContractError, Frame, InboundEvent, InboundReceiver, InboundSender, Payload,
    SessionEvent, TargetTuning, TransportSession, INBOUND_CHANNEL_CAPACITY, SESSION_ID_FIELD,
};
use observability::DropReason;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::metrics::{
    AggregateLatency, LatencyWindow, TargetCounters, TargetStats, TARGET_LATENCY_WINDOW,
};
use crate::queue::{FrameQueue, QueuedFrame};
use crate::redact::{redact_address, redact_error};

/// First backoff step; doubled per consecutive failure
const BACKOFF_BASE_MS: u64 = 1000;

/// Backoff ceiling
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Idle wait on the queue, bounds how long a stop can go unnoticed
const QUEUE_POLL: Duration = Duration::from_millis(100);

/// Pause between connection checks while not connected
const RECONNECT_POLL: Duration = Duration::from_millis(500);

/// Minimum spacing of stale-drop warnings
const STALE_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Backoff delay after `attempt` consecutive failures
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(factor).min(MAX_BACKOFF_MS))
}

/// Unix milliseconds
pub(crate) fn unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TargetState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Backoff = 3,
}

impl TargetState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Backoff,
            _ => Self::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
        }
    }
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one dequeued frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Failed,
    Stale,
}

#[derive(Debug, Default)]
struct Backoff {
    attempt: u32,
    until: Option<Instant>,
    until_ms: Option<i64>,
}

#[derive(Debug)]
struct AckTracker {
    pending: HashMap<String, Instant>,
    window: LatencyWindow,
    last_latency_ms: Option<f64>,
}

impl AckTracker {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
            window: LatencyWindow::new(TARGET_LATENCY_WINDOW),
            last_latency_ms: None,
        }
    }

    /// Track a sent frame; the table never grows past `cap`
    fn register(&mut self, frame_id: &str, sent_at: Instant, cap: usize) {
        if self.pending.len() >= cap {
            let oldest = self
                .pending
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(id, _)| id.clone());
            if let Some(id) = oldest {
                self.pending.remove(&id);
            }
        }
        self.pending.insert(frame_id.to_string(), sent_at);
    }

    fn expire(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, sent_at| now.saturating_duration_since(*sent_at) <= ttl);
        before - self.pending.len()
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Throttles a repeated warning
#[derive(Debug, Default)]
struct RateLimit {
    last: Option<Instant>,
}

impl RateLimit {
    fn ready(&mut self, now: Instant, interval: Duration) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One configured remote endpoint
pub struct Target {
    index: usize,
    address: String,
    safe_address: String,
    tuning: TargetTuning,
    enabled: AtomicBool,
    state: AtomicU8,
    session_id: RwLock<Option<String>>,
    pub(crate) queue: FrameQueue,
    counters: TargetCounters,
    acks: Mutex<AckTracker>,
    backoff: Mutex<Backoff>,
    last_error: Mutex<Option<String>>,
    last_send_ok_ms: AtomicI64,
    viewers: AtomicU64,
    aggregate: Arc<AggregateLatency>,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("index", &self.index)
            .field("address", &self.safe_address)
            .field("state", &self.state())
            .field("queue", &self.queue)
            .finish()
    }
}

impl Target {
    /// Create a disconnected, idle target
    pub fn new(
        index: usize,
        address: impl Into<String>,
        enabled: bool,
        tuning: TargetTuning,
        aggregate: Arc<AggregateLatency>,
    ) -> Self {
        let address = address.into();
        let safe_address = redact_address(&address);
        Self {
            index,
            queue: FrameQueue::new(tuning.queue_capacity),
            address,
            safe_address,
            tuning,
            enabled: AtomicBool::new(enabled),
            state: AtomicU8::new(TargetState::Disconnected as u8),
            session_id: RwLock::new(None),
            counters: TargetCounters::new(),
            acks: Mutex::new(AckTracker::new()),
            backoff: Mutex::new(Backoff::default()),
            last_error: Mutex::new(None),
            last_send_ok_ms: AtomicI64::new(0),
            viewers: AtomicU64::new(0),
            aggregate,
            worker: Mutex::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Raw address, for session construction only
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Address with credentials removed
    pub fn safe_address(&self) -> &str {
        &self.safe_address
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn state(&self) -> TargetState {
        TargetState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TargetState) {
        self.state.store(state as u8, Ordering::Release);
        observability::record_target_state(self.index, state as u8);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TargetState::Connected
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_session_id(&self, session_id: Option<String>) {
        *self
            .session_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = session_id;
    }

    pub fn counters(&self) -> &TargetCounters {
        &self.counters
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Event tags currently queued, oldest first
    pub fn queued_events(&self) -> Vec<String> {
        self.queue.events()
    }

    pub fn pending_acks(&self) -> usize {
        lock(&self.acks).pending.len()
    }

    /// Consecutive connection failures so far
    pub fn backoff_attempt(&self) -> u32 {
        lock(&self.backoff).attempt
    }

    /// Last recorded error, already redacted
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    pub(crate) fn record_error(&self, message: &str) {
        let scrubbed = redact_error(&message.replace(&self.address, &self.safe_address));
        *lock(&self.last_error) = Some(scrubbed);
    }

    /// Queue a frame without blocking
    ///
    /// A full queue gives up its oldest frame. Returns false if the target is
    /// disabled, or if the frame could not be queued even after that eviction.
    pub fn enqueue(&self, frame: Arc<Frame>) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let outcome = self.queue.push(QueuedFrame::new(frame));
        if outcome.evicted {
            self.counters.inc_dropped();
            observability::record_frame_dropped(self.index, DropReason::Overflow);
        }
        if !outcome.accepted {
            self.counters.inc_dropped();
            observability::record_frame_dropped(self.index, DropReason::Overflow);
            warn!(target = self.index, "Queue rejected frame after eviction");
        }
        outcome.accepted
    }

    /// Make sure the session is connected
    ///
    /// Returns false without touching the session while a backoff window is
    /// still open.
    #[instrument(
        name = "target_connect_if_needed",
        skip(self, session, inbound),
        fields(target = self.index, address = %self.safe_address)
    )]
    pub async fn connect_if_needed<S: TransportSession>(
        &self,
        session: &mut S,
        inbound: &InboundSender,
    ) -> bool {
        match self.state() {
            TargetState::Connected => return true,
            TargetState::Backoff if !self.backoff_elapsed(Instant::now()) => return false,
            _ => {}
        }

        self.set_state(TargetState::Connecting);
        let timeout = self.tuning.connect_timeout();
        let result =
            match tokio::time::timeout(timeout, session.connect(&self.address, inbound.clone()))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ContractError::ConnectTimeout {
                    address: self.safe_address.clone(),
                    timeout_ms: self.tuning.connect_timeout_ms,
                }),
            };

        match result {
            Ok(()) => {
                self.set_state(TargetState::Connected);
                *lock(&self.backoff) = Backoff::default();
                observability::record_connect_attempt(self.index, true);
                info!(target = self.index, address = %self.safe_address, "Connected");
                self.register_session(session).await;
                true
            }
            Err(e) => {
                self.set_state(TargetState::Backoff);
                self.record_error(&e.to_string());
                let delay = self.apply_backoff();
                observability::record_connect_attempt(self.index, false);
                error!(
                    target = self.index,
                    error = self.last_error().as_deref().unwrap_or("unknown"),
                    backoff_ms = delay.as_millis() as u64,
                    "Connection failed"
                );
                false
            }
        }
    }

    fn backoff_elapsed(&self, now: Instant) -> bool {
        lock(&self.backoff).until.is_none_or(|until| now >= until)
    }

    fn apply_backoff(&self) -> Duration {
        let mut backoff = lock(&self.backoff);
        backoff.attempt = backoff.attempt.saturating_add(1);
        let delay = backoff_delay(backoff.attempt);
        backoff.until = Some(Instant::now() + delay);
        backoff.until_ms = Some(unix_ms() + delay.as_millis() as i64);
        debug!(
            target = self.index,
            attempt = backoff.attempt,
            delay_ms = delay.as_millis() as u64,
            "Backoff applied"
        );
        delay
    }

    async fn register_session<S: TransportSession>(&self, session: &mut S) {
        let Some(session_id) = self.session_id() else {
            return;
        };
        let mut payload = Payload::new();
        payload.insert(SESSION_ID_FIELD.to_string(), session_id.into());
        let frame = Frame::new(events::REGISTER, payload);
        if let Err(e) = session.send(&frame).await {
            warn!(
                target = self.index,
                error = %redact_error(&e.to_string()),
                "Session registration failed"
            );
        }
    }

    /// Send one dequeued frame, or drop it if it sat in the queue too long
    pub async fn deliver<S: TransportSession>(
        &self,
        session: &mut S,
        entry: QueuedFrame,
    ) -> Delivery {
        let age = entry.enqueued_at.elapsed();
        if age > self.tuning.stale_after() {
            self.counters.inc_dropped();
            observability::record_frame_dropped(self.index, DropReason::Stale);
            return Delivery::Stale;
        }

        match session.send(&entry.frame).await {
            Ok(()) => {
                self.counters.inc_sent();
                self.last_send_ok_ms.store(unix_ms(), Ordering::Relaxed);
                observability::record_frame_sent(self.index);
                if let Some(frame_id) = entry.frame.ack_frame_id() {
                    lock(&self.acks).register(
                        frame_id,
                        Instant::now(),
                        self.tuning.queue_capacity.max(1),
                    );
                }
                Delivery::Sent
            }
            Err(e) => {
                self.counters.inc_failed();
                observability::record_frame_failed(self.index);
                if matches!(e, ContractError::NotConnected) {
                    self.set_state(TargetState::Disconnected);
                }
                self.record_error(&e.to_string());
                debug!(
                    target = self.index,
                    event = %entry.frame.event,
                    error = self.last_error().as_deref().unwrap_or("unknown"),
                    "Send failed"
                );
                Delivery::Failed
            }
        }
    }

    /// Resolve a pending acknowledgement
    ///
    /// Unknown ids are expected (already acked, expired, previous connection)
    /// and ignored. Returns whether an entry matched.
    pub fn on_acknowledgement(&self, frame_id: &str, received_at: Instant) -> bool {
        let latency_ms = {
            let mut acks = lock(&self.acks);
            let Some(sent_at) = acks.pending.remove(frame_id) else {
                return false;
            };
            let latency_ms = received_at.saturating_duration_since(sent_at).as_secs_f64() * 1000.0;
            acks.last_latency_ms = Some(latency_ms);
            acks.window.push(latency_ms);
            latency_ms
        };
        self.counters.inc_acked();
        self.aggregate.push(latency_ms);
        observability::record_ack_latency_ms(self.index, latency_ms);
        true
    }

    /// Evict pending acknowledgements older than the ack timeout
    pub fn expire_pending_acks(&self, now: Instant) -> usize {
        let expired = lock(&self.acks).expire(now, self.tuning.ack_timeout());
        if expired > 0 {
            self.counters.add_ack_expired(expired as u64);
            observability::record_ack_expired(self.index, expired);
        }
        expired
    }

    /// Apply one event pushed by the session
    pub fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Message {
                event,
                payload,
                received_at,
            } => match InboundEvent::parse(&event, &payload) {
                Some(InboundEvent::Ack { frame_id }) => {
                    self.on_acknowledgement(&frame_id, received_at);
                }
                Some(InboundEvent::Viewers { count }) => {
                    self.viewers.store(count, Ordering::Relaxed);
                }
                None => debug!(target = self.index, event = %event, "Ignoring inbound message"),
            },
            SessionEvent::Closed { reason } => {
                if self.state() == TargetState::Connected {
                    self.set_state(TargetState::Disconnected);
                }
                if let Some(reason) = reason {
                    self.record_error(&reason);
                }
                warn!(target = self.index, address = %self.safe_address, "Disconnected");
            }
        }
    }

    fn drain_session_events(&self, inbound: &mut InboundReceiver) {
        while let Ok(event) = inbound.try_recv() {
            self.handle_session_event(event);
        }
    }

    /// Value snapshot
    pub fn stats(&self) -> TargetStats {
        let (last_ack_latency_ms, pending_acks) = {
            let acks = lock(&self.acks);
            (acks.last_latency_ms, acks.pending.len())
        };
        let last_send_ok_ms = match self.last_send_ok_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        };
        TargetStats {
            index: self.index,
            url: self.safe_address.clone(),
            enabled: self.is_enabled(),
            state: self.state(),
            sent: self.counters.sent(),
            failed: self.counters.failed(),
            acked: self.counters.acked(),
            dropped: self.counters.dropped(),
            ack_expired: self.counters.ack_expired(),
            queue_size: self.queue.len(),
            pending_acks,
            last_send_ok_ms,
            last_ack_latency_ms,
            last_error: self.last_error(),
            backoff_until_ms: lock(&self.backoff).until_ms,
            viewers: self.viewers.load(Ordering::Relaxed),
        }
    }

    /// Recent ack latencies of this target, oldest first
    pub fn ack_latencies(&self) -> Vec<f64> {
        lock(&self.acks).window.recent(TARGET_LATENCY_WINDOW)
    }

    /// Spawn the worker task; no-op if one is already running
    pub fn start<S: TransportSession + 'static>(self: &Arc<Self>, session: S) -> bool {
        let mut worker = lock(&self.worker);
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let target = Arc::clone(self);
        let handle = tokio::spawn(async move {
            target_worker(target, session, token).await;
        });
        *worker = Some(Worker { cancel, handle });
        true
    }

    /// Whether a worker task is alive
    pub fn is_running(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Signal the worker to exit and disconnect; does not wait
    pub fn stop(&self) {
        if let Some(worker) = lock(&self.worker).as_ref() {
            worker.cancel.cancel();
        }
    }

    /// Stop and wait for the worker to finish
    #[instrument(name = "target_shutdown", skip(self), fields(target = self.index))]
    pub async fn shutdown(&self) {
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                error!(target = self.index, error = ?e, "Worker task panicked");
            }
        }
        debug!(target = self.index, "Target shutdown complete");
    }
}

/// Worker task: connect, drain the queue, resolve acks
#[instrument(
    name = "target_worker_loop",
    skip(target, session, cancel),
    fields(target = target.index)
)]
async fn target_worker<S: TransportSession>(
    target: Arc<Target>,
    mut session: S,
    cancel: CancellationToken,
) {
    debug!(target = target.index, session = session.kind(), "Target worker started");

    let (mut inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    let mut stale_log = RateLimit::default();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        target.drain_session_events(&mut inbound_rx);
        target.expire_pending_acks(Instant::now());

        if !target.is_connected() {
            // Each connection gets its own channel so a late close notice
            // from the previous socket never reaches the new one
            (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        }

        if !target.connect_if_needed(&mut session, &inbound_tx).await {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_POLL) => continue,
            }
        }

        let entry = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(event) = inbound_rx.recv() => {
                target.handle_session_event(event);
                continue;
            }
            entry = target.queue.pop_timeout(QUEUE_POLL) => entry,
        };
        let Some(entry) = entry else {
            continue;
        };
        observability::record_queue_depth(target.index, target.queue.len());

        let age = entry.enqueued_at.elapsed();
        if target.deliver(&mut session, entry).await == Delivery::Stale
            && stale_log.ready(Instant::now(), STALE_LOG_INTERVAL)
        {
            warn!(
                target = target.index,
                lag_ms = age.as_millis() as u64,
                "Dropping stale frames"
            );
        }
    }

    if let Err(e) = session.disconnect().await {
        debug!(target = target.index, error = %redact_error(&e.to_string()), "Disconnect failed");
    }
    target.set_state(TargetState::Disconnected);
    debug!(target = target.index, "Target worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockState {
        connects: AtomicUsize,
        sent: Mutex<Vec<Frame>>,
        inbound: Mutex<Option<InboundSender>>,
        /// On reconnect, report a close on the previous connection's channel
        late_close: AtomicBool,
    }

    /// Mock session for testing
    struct MockSession {
        state: Arc<MockState>,
        fail_connect: Arc<AtomicBool>,
        fail_send: bool,
    }

    impl MockSession {
        fn new() -> (Self, Arc<MockState>, Arc<AtomicBool>) {
            let state = Arc::new(MockState::default());
            let fail_connect = Arc::new(AtomicBool::new(false));
            let session = Self {
                state: Arc::clone(&state),
                fail_connect: Arc::clone(&fail_connect),
                fail_send: false,
            };
            (session, state, fail_connect)
        }
    }

    impl TransportSession for MockSession {
        fn kind(&self) -> &'static str {
            "mock"
        }

        async fn connect(
            &mut self,
            address: &str,
            inbound: InboundSender,
        ) -> Result<(), ContractError> {
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(ContractError::connection(address, "connection refused"));
            }
            let previous = self.state.inbound.lock().unwrap().replace(inbound);
            if let Some(previous) = previous {
                if self.state.late_close.load(Ordering::SeqCst) {
                    let _ = previous.try_send(SessionEvent::Closed {
                        reason: Some("old socket closed".into()),
                    });
                }
            }
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), ContractError> {
            Ok(())
        }

        async fn send(&mut self, frame: &Frame) -> Result<(), ContractError> {
            if self.fail_send {
                return Err(ContractError::send(&frame.event, "mock failure"));
            }
            self.state.sent.lock().unwrap().push(frame.clone());
            Ok(())
        }
    }

    fn target_with(tuning: TargetTuning) -> Arc<Target> {
        Arc::new(Target::new(
            0,
            "ws://relay:pw@localhost:9000",
            true,
            tuning,
            Arc::new(AggregateLatency::default()),
        ))
    }

    fn target() -> Arc<Target> {
        target_with(TargetTuning::default())
    }

    fn frame(event: &str) -> Arc<Frame> {
        Arc::new(Frame::new(event, Payload::new()))
    }

    fn inbound() -> (InboundSender, InboundReceiver) {
        mpsc::channel(INBOUND_CHANNEL_CAPACITY)
    }

    #[test]
    fn test_backoff_delays() {
        let delays: Vec<u64> = (1..=6)
            .map(|n| backoff_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(backoff_delay(u32::MAX), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[test]
    fn test_enqueue_overflow_drops_exact_excess() {
        let target = target();
        for i in 0..520 {
            assert!(target.enqueue(frame(&format!("f{i}"))));
            assert!(target.queue_len() <= 500);
        }
        assert_eq!(target.queue_len(), 500);
        assert_eq!(target.counters().dropped(), 20);

        let events = target.queued_events();
        assert_eq!(events.first().map(String::as_str), Some("f20"));
        assert_eq!(events.last().map(String::as_str), Some("f519"));
    }

    #[test]
    fn test_disabled_target_rejects_without_mutation() {
        let target = target();
        target.set_enabled(false);
        assert!(!target.enqueue(frame("telemetry")));
        assert_eq!(target.queue_len(), 0);
        assert_eq!(target.counters().dropped(), 0);
    }

    #[test]
    fn test_stats_redact_address() {
        let stats = target().stats();
        assert_eq!(stats.url, "ws://localhost:9000");
        assert_eq!(stats.state, TargetState::Disconnected);
        assert_eq!(stats.last_send_ok_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_frame_is_dropped_not_sent() {
        let target = target();
        let (mut session, state, _) = MockSession::new();
        target.enqueue(frame("telemetry"));

        tokio::time::advance(Duration::from_millis(2001)).await;
        let entry = target.queue.try_pop().unwrap();
        assert_eq!(target.deliver(&mut session, entry).await, Delivery::Stale);

        assert_eq!(target.counters().dropped(), 1);
        assert_eq!(target.counters().sent(), 0);
        assert_eq!(target.counters().failed(), 0);
        assert!(state.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_frame_is_sent_and_ack_tracked() {
        let target = target();
        let (mut session, state, _) = MockSession::new();
        let sampled = Frame::new("telemetry", Payload::new()).with_ack_request("f1-1");
        target.enqueue(Arc::new(sampled));

        tokio::time::advance(Duration::from_millis(1999)).await;
        let entry = target.queue.try_pop().unwrap();
        assert_eq!(target.deliver(&mut session, entry).await, Delivery::Sent);
        assert_eq!(target.counters().sent(), 1);
        assert_eq!(target.pending_acks(), 1);
        assert_eq!(state.sent.lock().unwrap().len(), 1);
        assert!(target.stats().last_send_ok_ms.is_some());
    }

    #[tokio::test]
    async fn test_send_failure_counts_and_continues() {
        let target = target();
        let (mut session, _, _) = MockSession::new();
        session.fail_send = true;
        target.enqueue(frame("telemetry"));

        let entry = target.queue.try_pop().unwrap();
        assert_eq!(target.deliver(&mut session, entry).await, Delivery::Failed);
        assert_eq!(target.counters().failed(), 1);
        assert_eq!(target.counters().sent(), 0);
        assert_eq!(target.last_error().as_deref(), Some("send of 'telemetry' failed: mock failure"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_latency_recorded() {
        let target = target();
        let (mut session, _, _) = MockSession::new();
        let sampled = Frame::new("telemetry", Payload::new()).with_ack_request("f7-1");
        target.enqueue(Arc::new(sampled));
        let entry = target.queue.try_pop().unwrap();
        target.deliver(&mut session, entry).await;

        tokio::time::advance(Duration::from_millis(40)).await;
        assert!(target.on_acknowledgement("f7-1", Instant::now()));
        assert!(!target.on_acknowledgement("f7-1", Instant::now()));

        let stats = target.stats();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.pending_acks, 0);
        let latency = stats.last_ack_latency_ms.unwrap();
        assert!((40.0..41.0).contains(&latency));
        assert_eq!(target.ack_latencies().len(), 1);
    }

    #[test]
    fn test_unmatched_ack_is_noop() {
        let target = target();
        let before = target.stats();
        assert!(!target.on_acknowledgement("nope", Instant::now()));
        let after = target.stats();
        assert_eq!(before.sent, after.sent);
        assert_eq!(before.failed, after.failed);
        assert_eq!(before.acked, after.acked);
        assert_eq!(before.dropped, after.dropped);
        assert_eq!(after.last_ack_latency_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_acks_expire() {
        let target = target();
        let (mut session, _, _) = MockSession::new();
        let sampled = Frame::new("telemetry", Payload::new()).with_ack_request("f2-1");
        target.enqueue(Arc::new(sampled));
        let entry = target.queue.try_pop().unwrap();
        target.deliver(&mut session, entry).await;

        assert_eq!(target.expire_pending_acks(Instant::now()), 0);
        tokio::time::advance(Duration::from_millis(30_001)).await;
        assert_eq!(target.expire_pending_acks(Instant::now()), 1);
        assert_eq!(target.stats().ack_expired, 1);
        assert!(!target.on_acknowledgement("f2-1", Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_backoff_and_reset() {
        let target = target();
        let (mut session, state, fail_connect) = MockSession::new();
        let (tx, _rx) = inbound();
        fail_connect.store(true, Ordering::SeqCst);

        assert!(!target.connect_if_needed(&mut session, &tx).await);
        assert_eq!(target.state(), TargetState::Backoff);
        assert_eq!(target.backoff_attempt(), 1);
        assert_eq!(state.connects.load(Ordering::SeqCst), 1);
        assert!(target.stats().backoff_until_ms.is_some());

        // Still inside the 2000ms window: no attempt is made
        assert!(!target.connect_if_needed(&mut session, &tx).await);
        assert_eq!(state.connects.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(2001)).await;
        assert!(!target.connect_if_needed(&mut session, &tx).await);
        assert_eq!(target.backoff_attempt(), 2);
        assert_eq!(state.connects.load(Ordering::SeqCst), 2);

        fail_connect.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_millis(4001)).await;
        assert!(target.connect_if_needed(&mut session, &tx).await);
        assert_eq!(target.state(), TargetState::Connected);
        assert_eq!(target.backoff_attempt(), 0);

        // Already connected: no further attempt
        assert!(target.connect_if_needed(&mut session, &tx).await);
        assert_eq!(state.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connect_sends_registration_when_session_known() {
        let target = target();
        target.set_session_id(Some("sess-42".to_string()));
        let (mut session, state, _) = MockSession::new();
        let (tx, _rx) = inbound();

        assert!(target.connect_if_needed(&mut session, &tx).await);
        let sent = state.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, events::REGISTER);
        assert_eq!(sent[0].payload["sessionId"], json!("sess-42"));
        // Registration is not a delivered frame
        assert_eq!(target.counters().sent(), 0);
    }

    #[test]
    fn test_session_events() {
        let target = target();
        target.set_state(TargetState::Connected);

        let mut payload = Payload::new();
        payload.insert("count".to_string(), json!(3));
        target.handle_session_event(SessionEvent::message(events::VIEWERS, payload));
        assert_eq!(target.stats().viewers, 3);

        target.handle_session_event(SessionEvent::Closed {
            reason: Some("reset by peer".to_string()),
        });
        assert_eq!(target.state(), TargetState::Disconnected);
        assert_eq!(target.last_error().as_deref(), Some("reset by peer"));
    }

    #[tokio::test]
    async fn test_worker_delivers_and_stops() {
        let target = target();
        let (session, state, _) = MockSession::new();

        assert!(target.start(session));
        for i in 0..5 {
            target.enqueue(frame(&format!("f{i}")));
        }

        for _ in 0..100 {
            if target.counters().sent() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(target.counters().sent(), 5);
        assert!(target.is_connected());

        target.shutdown().await;
        assert!(!target.is_running());
        assert_eq!(target.state(), TargetState::Disconnected);
        let events: Vec<String> = state
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.event.clone())
            .collect();
        assert_eq!(events, vec!["f0", "f1", "f2", "f3", "f4"]);
    }

    #[tokio::test]
    async fn test_late_close_from_old_socket_keeps_new_connection() {
        let target = target();
        let (session, state, _) = MockSession::new();
        state.late_close.store(true, Ordering::SeqCst);
        assert!(target.start(session));

        async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
            for _ in 0..200 {
                if check() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("timed out waiting for {what}");
        }

        wait_for("first connect", || target.is_connected()).await;
        assert_eq!(state.connects.load(Ordering::SeqCst), 1);

        // Link loss on the live connection
        let live = state.inbound.lock().unwrap().clone().unwrap();
        live.send(SessionEvent::Closed { reason: None }).await.unwrap();
        wait_for("reconnect", || state.connects.load(Ordering::SeqCst) == 2).await;
        wait_for("connected again", || target.is_connected()).await;

        // The old socket's close notice must not tear down the new link
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(target.is_connected());
        assert_eq!(state.connects.load(Ordering::SeqCst), 2);

        // Frames still flow on the new connection
        target.enqueue(frame("after"));
        wait_for("delivery", || target.counters().sent() == 1).await;

        target.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let target = target();
        let (first, _, _) = MockSession::new();
        let (second, _, _) = MockSession::new();
        assert!(target.start(first));
        assert!(!target.start(second));
        target.stop();
        target.stop();
        target.shutdown().await;
    }
}
