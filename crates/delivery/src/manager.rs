//! DeliveryManager - routes frames to targets
//!
//! One manager is built per relay process and shared by `Arc`. `send` only
//! enqueues; all network work happens in the per-target workers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use contracts::{
    events, Connector, DeliveryMode, Frame, Payload, RelayConfig, StreamEnvelope, StreamKind,
    SESSION_ID_FIELD,
};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::error::DeliveryError;
use crate::metrics::{AggregateLatency, ParitySnapshot, TargetStats, PARITY_SAMPLE_COUNT};
use crate::sessions::DefaultConnector;
use crate::target::{unix_ms, Target};

/// Multi-target delivery manager
pub struct DeliveryManager<C: Connector = DefaultConnector> {
    connector: C,
    targets: Vec<Arc<Target>>,
    mode: DeliveryMode,
    primary_index: usize,
    kill_switch: bool,
    sample_rate: f64,
    config_error: Option<DeliveryError>,
    session_id: RwLock<Option<String>>,
    frame_counter: AtomicU64,
    aggregate: Arc<AggregateLatency>,
    running: AtomicBool,
    kill_switch_logged: AtomicBool,
}

impl<C: Connector> std::fmt::Debug for DeliveryManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryManager")
            .field("mode", &self.mode)
            .field("primary_index", &self.primary_index)
            .field("kill_switch", &self.kill_switch)
            .field("targets", &self.targets)
            .finish()
    }
}

impl DeliveryManager<DefaultConnector> {
    /// Build with the scheme-based connector
    pub fn from_config(config: &RelayConfig) -> Self {
        let connector = DefaultConnector::new(config.target.send_timeout());
        Self::configure(config, connector)
    }
}

impl<C: Connector> DeliveryManager<C> {
    /// Build targets in address order
    ///
    /// Configuration problems are logged once and kept in [`config_error`];
    /// the manager is still returned and refuses to route while the error
    /// holds.
    ///
    /// [`config_error`]: Self::config_error
    #[instrument(
        name = "delivery_manager_configure",
        skip(config, connector),
        fields(targets = config.backends.len(), mode = %config.mode)
    )]
    pub fn configure(config: &RelayConfig, connector: C) -> Self {
        let aggregate = Arc::new(AggregateLatency::default());

        let mut tuning = config.target.clone();
        if tuning.queue_capacity == 0 {
            error!("queue_capacity must be at least 1, using 1");
            tuning.queue_capacity = 1;
        }
        let sample_rate = if (0.0..=1.0).contains(&config.sample_rate) {
            config.sample_rate
        } else {
            let clamped = if config.sample_rate.is_nan() {
                0.0
            } else {
                config.sample_rate.clamp(0.0, 1.0)
            };
            error!(
                sample_rate = config.sample_rate,
                clamped, "sample_rate outside [0, 1]"
            );
            clamped
        };

        let targets: Vec<Arc<Target>> = config
            .backends
            .iter()
            .enumerate()
            .map(|(index, address)| {
                Arc::new(Target::new(
                    index,
                    address.as_str(),
                    config.is_enabled(index),
                    tuning.clone(),
                    Arc::clone(&aggregate),
                ))
            })
            .collect();

        let config_error = if targets.is_empty() {
            Some(DeliveryError::NoTargets)
        } else if config.mode == DeliveryMode::Single && config.primary_index >= targets.len() {
            Some(DeliveryError::PrimaryOutOfRange {
                index: config.primary_index,
                count: targets.len(),
            })
        } else {
            None
        };
        if let Some(e) = &config_error {
            error!(error = %e, "Delivery configuration error");
        }

        info!(
            targets = targets.len(),
            mode = %config.mode,
            primary = config.primary_index,
            kill_switch = config.kill_switch,
            sample_rate,
            "Delivery manager configured"
        );
        for target in &targets {
            info!(
                target = target.index(),
                address = %target.safe_address(),
                enabled = target.is_enabled(),
                "Target"
            );
        }

        Self {
            connector,
            targets,
            mode: config.mode,
            primary_index: config.primary_index,
            kill_switch: config.kill_switch,
            sample_rate,
            config_error,
            session_id: RwLock::new(None),
            frame_counter: AtomicU64::new(0),
            aggregate,
            running: AtomicBool::new(false),
            kill_switch_logged: AtomicBool::new(false),
        }
    }

    pub fn config_error(&self) -> Option<&DeliveryError> {
        self.config_error.as_ref()
    }

    pub fn targets(&self) -> &[Arc<Target>] {
        &self.targets
    }

    pub fn target(&self, index: usize) -> Option<&Arc<Target>> {
        self.targets.get(index)
    }

    pub fn is_kill_switch_active(&self) -> bool {
        self.kill_switch
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn primary_index(&self) -> usize {
        self.primary_index
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Frames offered to `send` so far (kill-switched sends excluded)
    pub fn frames_offered(&self) -> u64 {
        self.frame_counter.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the worker of every enabled target
    ///
    /// Returns how many workers were started. Under the kill switch nothing
    /// starts and the condition is logged once.
    #[instrument(name = "delivery_manager_start", skip(self))]
    pub fn start(&self) -> usize {
        observability::record_kill_switch(self.kill_switch);
        if self.kill_switch {
            if !self.kill_switch_logged.swap(true, Ordering::Relaxed) {
                warn!("Kill switch active, no targets will be connected");
            }
            return 0;
        }

        self.running.store(true, Ordering::Release);
        let started = self
            .targets
            .iter()
            .filter(|t| t.is_enabled())
            .filter(|t| self.start_target(t).is_ok())
            .count();
        info!(started, "Delivery manager started");
        started
    }

    fn start_target(&self, target: &Arc<Target>) -> Result<bool, DeliveryError> {
        match self.connector.session_for(target.address()) {
            Ok(session) => Ok(target.start(session)),
            Err(e) => {
                let err = DeliveryError::session_creation(target.index(), e.to_string());
                target.record_error(&e.to_string());
                error!(target = target.index(), error = %err, "Target not started");
                Err(err)
            }
        }
    }

    /// Signal every worker to stop; does not wait
    #[instrument(name = "delivery_manager_stop", skip(self))]
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        for target in &self.targets {
            target.stop();
        }
        debug!("Stop signalled to all targets");
    }

    /// Stop and wait for every worker to exit
    #[instrument(name = "delivery_manager_shutdown", skip(self))]
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        for target in &self.targets {
            target.shutdown().await;
        }
        info!("Delivery manager shutdown complete");
    }

    /// Toggle a target at runtime
    ///
    /// Enabling a target while the manager runs starts its worker. A disabled
    /// target keeps its connection but receives no new frames.
    pub fn set_target_enabled(&self, index: usize, enabled: bool) -> Result<(), DeliveryError> {
        let target = self
            .targets
            .get(index)
            .ok_or(DeliveryError::UnknownTarget { index })?;
        target.set_enabled(enabled);
        info!(target = index, enabled, "Target toggled");

        if enabled && self.is_running() && !self.kill_switch && !target.is_running() {
            self.start_target(target)?;
        }
        Ok(())
    }

    /// Store the session id and hand it to every target
    pub fn set_session_id(&self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        for target in &self.targets {
            target.set_session_id(Some(session_id.clone()));
        }
        debug!(session_id = %session_id, "Session id set");
        *self
            .session_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(session_id);
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Route one frame; never blocks
    ///
    /// Returns true if at least one target accepted it.
    pub fn send(&self, event: &str, payload: Payload) -> bool {
        if self.kill_switch {
            return false;
        }

        let counter = self.frame_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let mut frame = Frame::new(event, payload);
        if self.sample_rate > 0.0 && rand::random::<f64>() < self.sample_rate {
            frame = frame.with_ack_request(format!("f{counter}-{}", unix_ms()));
        }

        if self.config_error.is_some() {
            return false;
        }
        let frame = Arc::new(frame);

        match self.mode {
            DeliveryMode::Parallel => {
                let mut accepted = false;
                for target in self.targets.iter().filter(|t| t.is_enabled()) {
                    accepted |= target.enqueue(Arc::clone(&frame));
                }
                accepted
            }
            DeliveryMode::Single => match self.targets.get(self.primary_index) {
                Some(target) if target.is_enabled() => target.enqueue(frame),
                _ => false,
            },
        }
    }

    /// Session metadata; adopts its `sessionId` first when present
    pub fn send_session_metadata(&self, metadata: Payload) -> bool {
        if let Some(session_id) = metadata
            .get(SESSION_ID_FIELD)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
        {
            self.set_session_id(session_id);
        }
        self.send(events::SESSION_METADATA, metadata)
    }

    pub fn send_telemetry(&self, telemetry: Payload) -> bool {
        self.send(events::TELEMETRY, telemetry)
    }

    pub fn send_race_event(&self, event: Payload) -> bool {
        self.send(events::RACE_EVENT, event)
    }

    pub fn send_incident(&self, incident: Payload) -> bool {
        self.send(events::INCIDENT, incident)
    }

    /// 4 Hz car state, wrapped in a v2 stream envelope
    pub fn send_baseline_stream(&self, car_data: Payload) -> bool {
        self.send_stream(StreamKind::Baseline, car_data)
    }

    /// 15 Hz driver inputs, wrapped in a v2 stream envelope
    pub fn send_controls_stream(&self, car_data: Payload) -> bool {
        self.send_stream(StreamKind::Controls, car_data)
    }

    fn send_stream(&self, kind: StreamKind, car_data: Payload) -> bool {
        let Some(session_id) = self.session_id() else {
            return false;
        };
        let envelope = StreamEnvelope::new(kind, &session_id, unix_ms(), car_data);
        match envelope.into_payload() {
            Ok(payload) => self.send(kind.event(), payload),
            Err(e) => {
                warn!(stream = kind.stream_type(), error = %e, "Stream envelope encoding failed");
                false
            }
        }
    }

    /// Whether routing currently reaches a connected target
    pub fn is_connected(&self) -> bool {
        if self.kill_switch {
            return false;
        }
        match self.mode {
            DeliveryMode::Parallel => self
                .targets
                .iter()
                .any(|t| t.is_enabled() && t.is_connected()),
            DeliveryMode::Single => self
                .targets
                .get(self.primary_index)
                .is_some_and(|t| t.is_enabled() && t.is_connected()),
        }
    }

    /// Controls are only worth producing while someone can receive them
    pub fn should_send_controls(&self) -> bool {
        self.is_connected()
    }

    pub fn target_stats(&self) -> Vec<TargetStats> {
        self.targets.iter().map(|t| t.stats()).collect()
    }

    /// Totals plus recent aggregate ack latency
    pub fn parity_snapshot(&self) -> ParitySnapshot {
        ParitySnapshot::new(
            self.target_stats(),
            self.aggregate.recent(PARITY_SAMPLE_COUNT),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{
        ContractError, InboundSender, TargetTuning, TransportSession, ACK_REQUESTED_FIELD,
        FRAME_ID_FIELD,
    };
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Session that records how many sessions were created and accepts everything
    struct MockSession;

    impl TransportSession for MockSession {
        fn kind(&self) -> &'static str {
            "mock"
        }

        async fn connect(
            &mut self,
            _address: &str,
            _inbound: InboundSender,
        ) -> Result<(), ContractError> {
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), ContractError> {
            Ok(())
        }

        async fn send(&mut self, _frame: &Frame) -> Result<(), ContractError> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct MockConnector {
        created: Arc<AtomicUsize>,
    }

    impl Connector for MockConnector {
        type Session = MockSession;

        fn session_for(&self, address: &str) -> Result<MockSession, ContractError> {
            if address.starts_with("bad://") {
                return Err(ContractError::UnsupportedScheme {
                    address: address.to_string(),
                });
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(MockSession)
        }
    }

    fn config(backends: &[&str]) -> RelayConfig {
        RelayConfig {
            backends: backends.iter().map(|s| s.to_string()).collect(),
            sample_rate: 0.0,
            ..RelayConfig::default()
        }
    }

    fn manager(config: &RelayConfig) -> (DeliveryManager<MockConnector>, MockConnector) {
        let connector = MockConnector::default();
        (DeliveryManager::configure(config, connector.clone()), connector)
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn queue_sizes(manager: &DeliveryManager<MockConnector>) -> Vec<usize> {
        manager.targets().iter().map(|t| t.queue_len()).collect()
    }

    #[test]
    fn test_parallel_fans_out_to_enabled_only() {
        let mut cfg = config(&["ws://a", "ws://b", "ws://c"]);
        cfg.mode = DeliveryMode::Parallel;
        cfg.targets_enabled = vec![true, false, true];
        let (manager, _) = manager(&cfg);

        assert!(manager.send_telemetry(payload(json!({"speed": 1}))));
        assert_eq!(queue_sizes(&manager), vec![1, 0, 1]);
    }

    #[test]
    fn test_single_routes_to_primary_only() {
        let mut cfg = config(&["ws://a", "ws://b"]);
        cfg.primary_index = 1;
        let (manager, _) = manager(&cfg);

        assert!(manager.send("telemetry", Payload::new()));
        assert_eq!(queue_sizes(&manager), vec![0, 1]);
    }

    #[test]
    fn test_single_with_disabled_primary_is_unroutable() {
        let mut cfg = config(&["ws://a", "ws://b"]);
        cfg.targets_enabled = vec![false, true];
        let (manager, _) = manager(&cfg);

        assert!(!manager.send("telemetry", Payload::new()));
        assert_eq!(queue_sizes(&manager), vec![0, 0]);
        assert!(!manager.is_connected());
    }

    #[test]
    fn test_single_with_disabled_second_primary_leaves_queues_alone() {
        let mut cfg = config(&["ws://a", "ws://b"]);
        cfg.primary_index = 1;
        cfg.targets_enabled = vec![true, false];
        let (manager, _) = manager(&cfg);

        assert!(!manager.send("telemetry", Payload::new()));
        assert_eq!(queue_sizes(&manager), vec![0, 0]);

        // Disabling the primary at runtime keeps what it already holds
        manager.set_target_enabled(1, true).unwrap();
        assert!(manager.send("telemetry", Payload::new()));
        manager.set_target_enabled(1, false).unwrap();
        assert!(!manager.send("telemetry", Payload::new()));
        assert_eq!(queue_sizes(&manager), vec![0, 1]);
        assert_eq!(manager.target(0).unwrap().counters().dropped(), 0);
    }

    #[test]
    fn test_primary_out_of_range_is_retained_not_fatal() {
        let mut cfg = config(&["ws://a"]);
        cfg.primary_index = 3;
        let (manager, _) = manager(&cfg);

        assert_eq!(
            manager.config_error(),
            Some(&DeliveryError::PrimaryOutOfRange { index: 3, count: 1 })
        );
        assert!(!manager.send("telemetry", Payload::new()));
        assert_eq!(queue_sizes(&manager), vec![0]);
        assert_eq!(manager.target_stats().len(), 1);
    }

    #[test]
    fn test_primary_index_ignored_in_parallel() {
        let mut cfg = config(&["ws://a"]);
        cfg.mode = DeliveryMode::Parallel;
        cfg.primary_index = 3;
        let (manager, _) = manager(&cfg);
        assert!(manager.config_error().is_none());
        assert!(manager.send("telemetry", Payload::new()));
    }

    #[test]
    fn test_empty_backends() {
        let (manager, _) = manager(&config(&[]));
        assert_eq!(manager.config_error(), Some(&DeliveryError::NoTargets));
        assert!(!manager.send("telemetry", Payload::new()));
        assert_eq!(manager.parity_snapshot().total_sent, 0);
    }

    #[tokio::test]
    async fn test_kill_switch_disables_everything() {
        let mut cfg = config(&["ws://a", "ws://b"]);
        cfg.mode = DeliveryMode::Parallel;
        cfg.kill_switch = true;
        let (manager, connector) = manager(&cfg);

        assert_eq!(manager.start(), 0);
        assert_eq!(manager.start(), 0);
        assert_eq!(connector.created.load(Ordering::SeqCst), 0);
        assert!(manager.targets().iter().all(|t| !t.is_running()));

        assert!(!manager.send("telemetry", Payload::new()));
        assert_eq!(queue_sizes(&manager), vec![0, 0]);
        assert_eq!(manager.frames_offered(), 0);
        assert!(!manager.is_connected());
        assert!(!manager.should_send_controls());

        // Stats are still readable
        assert_eq!(manager.target_stats().len(), 2);
        manager.shutdown().await;
    }

    #[test]
    fn test_sample_rate_one_tags_every_frame() {
        let mut cfg = config(&["ws://a"]);
        cfg.sample_rate = 1.0;
        cfg.target = TargetTuning {
            queue_capacity: 50,
            ..TargetTuning::default()
        };
        let (manager, _) = manager(&cfg);

        for _ in 0..50 {
            assert!(manager.send("telemetry", Payload::new()));
        }

        let target = manager.target(0).unwrap();
        let mut ids = HashSet::new();
        for _ in 0..50 {
            let entry = target.queue.try_pop().unwrap();
            assert!(entry.frame.ack_requested());
            assert_eq!(entry.frame.payload[ACK_REQUESTED_FIELD], json!(true));
            let id = entry.frame.frame_id().unwrap().to_string();
            assert!(id.starts_with('f'));
            ids.insert(id);
        }
        assert_eq!(ids.len(), 50);
    }

    #[test]
    fn test_sample_rate_zero_never_tags() {
        let (manager, _) = manager(&config(&["ws://a"]));
        for _ in 0..20 {
            manager.send("telemetry", Payload::new());
        }
        let target = manager.target(0).unwrap();
        while let Some(entry) = target.queue.try_pop() {
            assert!(!entry.frame.payload.contains_key(ACK_REQUESTED_FIELD));
            assert!(!entry.frame.payload.contains_key(FRAME_ID_FIELD));
        }
        assert_eq!(manager.frames_offered(), 20);
    }

    #[test]
    fn test_out_of_range_sample_rate_is_clamped() {
        let mut cfg = config(&["ws://a"]);
        cfg.sample_rate = 3.5;
        let (manager, _) = manager(&cfg);
        assert_eq!(manager.sample_rate(), 1.0);
    }

    #[test]
    fn test_session_metadata_adopts_session_id() {
        let (manager, _) = manager(&config(&["ws://a", "ws://b"]));
        assert!(manager.session_id().is_none());
        assert!(!manager.send_baseline_stream(Payload::new()));

        assert!(manager.send_session_metadata(payload(json!({"sessionId": "s-1", "track": "Spa"}))));
        assert_eq!(manager.session_id().as_deref(), Some("s-1"));
        assert!(manager
            .targets()
            .iter()
            .all(|t| t.session_id().as_deref() == Some("s-1")));
    }

    #[test]
    fn test_stream_envelopes() {
        let (manager, _) = manager(&config(&["ws://a"]));
        manager.set_session_id("s-9");

        assert!(manager.send_baseline_stream(payload(json!({"speed": 51.2}))));
        assert!(manager.send_controls_stream(payload(json!({"throttle": 0.8}))));

        let target = manager.target(0).unwrap();
        assert_eq!(
            target.queued_events(),
            vec!["telemetry:baseline", "telemetry:controls"]
        );

        let baseline = target.queue.try_pop().unwrap();
        let data = &baseline.frame.payload;
        assert_eq!(data["v"], json!(2));
        assert_eq!(data["type"], json!("telemetry:baseline"));
        assert_eq!(data["sessionId"], json!("s-9"));
        assert_eq!(data["streamType"], json!("baseline"));
        assert_eq!(data["sampleHz"], json!(4));
        assert_eq!(data["payload"]["speed"], json!(51.2));

        let controls = target.queue.try_pop().unwrap();
        assert_eq!(controls.frame.payload["sampleHz"], json!(15));
    }

    #[test]
    fn test_set_target_enabled_unknown_index() {
        let (manager, _) = manager(&config(&["ws://a"]));
        assert_eq!(
            manager.set_target_enabled(5, true),
            Err(DeliveryError::UnknownTarget { index: 5 })
        );
    }

    #[tokio::test]
    async fn test_enable_while_running_starts_worker() {
        let mut cfg = config(&["ws://a", "ws://b"]);
        cfg.mode = DeliveryMode::Parallel;
        cfg.targets_enabled = vec![true, false];
        let (manager, connector) = manager(&cfg);

        assert_eq!(manager.start(), 1);
        assert!(!manager.target(1).unwrap().is_running());

        manager.set_target_enabled(1, true).unwrap();
        assert!(manager.target(1).unwrap().is_running());
        assert_eq!(connector.created.load(Ordering::SeqCst), 2);

        for _ in 0..100 {
            if manager.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.is_connected());

        manager.shutdown().await;
        assert!(manager.targets().iter().all(|t| !t.is_running()));
    }

    #[tokio::test]
    async fn test_session_creation_failure_is_recorded() {
        let mut cfg = config(&["bad://a", "ws://b"]);
        cfg.mode = DeliveryMode::Parallel;
        let (manager, _) = manager(&cfg);

        assert_eq!(manager.start(), 1);
        let stats = manager.target_stats();
        assert!(stats[0].last_error.is_some());
        assert!(stats[1].last_error.is_none());
        manager.shutdown().await;
    }

    #[test]
    fn test_parity_snapshot_totals() {
        let mut cfg = config(&["ws://a", "ws://b"]);
        cfg.mode = DeliveryMode::Parallel;
        cfg.target = TargetTuning {
            queue_capacity: 2,
            ..TargetTuning::default()
        };
        let (manager, _) = manager(&cfg);
        for _ in 0..5 {
            manager.send("telemetry", Payload::new());
        }

        let snapshot = manager.parity_snapshot();
        assert_eq!(snapshot.targets.len(), 2);
        assert_eq!(snapshot.total_dropped, 6);
        assert_eq!(snapshot.total_sent, 0);
        assert!(snapshot.ack_latency_samples.is_empty());
        assert_eq!(snapshot.ack_latency.p95, 0.0);
    }
}
