//! # Integration Tests
//!
//! 集成测试与端到端测试。
//!
//! 负责：
//! - 配置加载到投递管理器的端到端流程
//! - 本地 WebSocket 后端的投递与确认测试（无需外部服务）

#[cfg(test)]
mod e2e_tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use contracts::{events, Frame, Payload, FRAME_ID_FIELD};
    use delivery::{DeliveryManager, TargetState};
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Events received by a local backend, in arrival order
    type Received = Arc<Mutex<Vec<Frame>>>;

    /// Local WebSocket backend that acknowledges sampled frames
    ///
    /// Accepts connections one after another and answers every frame that
    /// requested an ack with a `relay:ack` message.
    async fn spawn_backend() -> (String, Received) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("ws://{}", listener.local_addr().unwrap());
        let received: Received = Arc::default();

        let log = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                while let Some(Ok(message)) = ws.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
                        continue;
                    };
                    let ack = frame.ack_frame_id().map(|id| {
                        let mut payload = Payload::new();
                        payload.insert(FRAME_ID_FIELD.to_string(), json!(id));
                        Frame::new(events::ACK, payload)
                    });
                    log.lock().unwrap().push(frame);
                    if let Some(ack) = ack {
                        let text = serde_json::to_string(&ack).unwrap();
                        if ws.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        (address, received)
    }

    /// Address nothing listens on
    async fn refused_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);
        address
    }

    async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "Timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn telemetry(seq: u64) -> Payload {
        json!({ "seq": seq, "speed": 42.5 })
            .as_object()
            .cloned()
            .unwrap()
    }

    fn manager_from_toml(toml: &str) -> DeliveryManager {
        let config =
            config_loader::ConfigLoader::load_from_str(toml, config_loader::ConfigFormat::Toml)
                .unwrap();
        DeliveryManager::from_config(&config)
    }

    /// End-to-end: config -> manager -> two WebSocket backends with acks
    ///
    /// 验证完整的数据流：
    /// 1. 连接后先发送注册帧，随后是排队的会话元数据
    /// 2. 并行模式下每个后端按顺序收到全部帧
    /// 3. 每个采样帧都被确认，确认延迟计入统计
    #[tokio::test]
    async fn test_parallel_delivery_with_acks() {
        let (addr_a, received_a) = spawn_backend().await;
        let (addr_b, received_b) = spawn_backend().await;

        let manager = manager_from_toml(&format!(
            "backends = [\"{addr_a}\", \"{addr_b}\"]\n\
             mode = \"parallel\"\n\
             sample_rate = 1.0\n"
        ));
        assert!(manager.config_error().is_none());

        assert!(manager.send_session_metadata(
            json!({ "sessionId": "e2e-1", "track": "Test" })
                .as_object()
                .cloned()
                .unwrap()
        ));
        assert_eq!(manager.start(), 2);

        let total = 20u64;
        for seq in 0..total {
            assert!(manager.send_telemetry(telemetry(seq)));
        }

        wait_until("acks from both backends", || {
            manager
                .target_stats()
                .iter()
                .all(|t| t.acked == total + 1)
        })
        .await;

        for received in [&received_a, &received_b] {
            let frames = received.lock().unwrap().clone();
            let seqs: Vec<u64> = frames
                .iter()
                .filter(|f| f.event == events::TELEMETRY)
                .filter_map(|f| f.payload.get("seq").and_then(|v| v.as_u64()))
                .collect();
            assert_eq!(seqs, (0..total).collect::<Vec<_>>());
            assert_eq!(frames[0].event, events::REGISTER);
            assert_eq!(frames[1].event, events::SESSION_METADATA);
            assert!(frames[1..].iter().all(|f| f.ack_requested()));
        }

        let snapshot = manager.parity_snapshot();
        assert_eq!(snapshot.total_sent, 2 * (total + 1));
        assert_eq!(snapshot.total_acked, 2 * (total + 1));
        assert_eq!(snapshot.total_failed, 0);
        assert_eq!(snapshot.ack_latency.samples, (2 * (total + 1)) as usize);
        assert!(manager.is_connected());
        assert!(manager.should_send_controls());

        manager.shutdown().await;
        assert!(manager
            .targets()
            .iter()
            .all(|t| t.state() == TargetState::Disconnected));
    }

    /// Registration is sent on connect when the session id is already known
    #[tokio::test]
    async fn test_register_on_connect() {
        let (address, received) = spawn_backend().await;
        let manager = manager_from_toml(&format!(
            "backends = [\"{address}\"]\nsample_rate = 0.0\n"
        ));
        manager.set_session_id("e2e-2");
        manager.start();

        wait_until("registration", || !received.lock().unwrap().is_empty()).await;
        let first = received.lock().unwrap()[0].clone();
        assert_eq!(first.event, events::REGISTER);
        assert_eq!(first.payload["sessionId"], json!("e2e-2"));

        manager.shutdown().await;
    }

    /// Single mode routes only to the primary, even when it is unreachable
    #[tokio::test]
    async fn test_single_mode_unreachable_primary() {
        let refused = refused_address().await;
        let (healthy, received) = spawn_backend().await;

        let manager = manager_from_toml(&format!(
            "backends = [\"{refused}\", \"{healthy}\"]\n\
             mode = \"single\"\n\
             primary_index = 0\n\
             sample_rate = 0.0\n"
        ));
        manager.start();

        for seq in 0..5 {
            assert!(manager.send_telemetry(telemetry(seq)));
        }

        let primary = Arc::clone(manager.target(0).unwrap());
        wait_until("primary backoff", || primary.state() == TargetState::Backoff).await;
        assert!(primary.last_error().is_some());
        assert_eq!(primary.counters().sent(), 0);
        assert_eq!(primary.queue_len(), 5);

        // The healthy secondary connects but never receives frames
        let secondary = Arc::clone(manager.target(1).unwrap());
        wait_until("secondary connect", || secondary.is_connected()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(received.lock().unwrap().is_empty());
        assert_eq!(secondary.counters().sent(), 0);

        manager.shutdown().await;
    }

    /// Kill switch turns every send into a no-op and starts no workers
    #[tokio::test]
    async fn test_kill_switch_from_config() {
        let manager = manager_from_toml(
            "backends = [\"log://a\", \"log://b\"]\n\
             mode = \"parallel\"\n\
             kill_switch = true\n",
        );
        assert_eq!(manager.start(), 0);
        assert!(!manager.send_telemetry(telemetry(0)));
        assert!(!manager.send("custom", Payload::new()));
        assert_eq!(manager.frames_offered(), 0);
        assert!(manager.targets().iter().all(|t| t.queue_len() == 0));
        manager.shutdown().await;
    }

    /// Log backends accept everything, and disabling one mid-run stops it receiving
    #[tokio::test]
    async fn test_log_backends_and_runtime_disable() {
        let manager = manager_from_toml(
            "backends = [\"log://a\", \"log://b\"]\n\
             mode = \"parallel\"\n\
             sample_rate = 0.0\n",
        );
        manager.start();

        for seq in 0..10 {
            assert!(manager.send_telemetry(telemetry(seq)));
        }
        wait_until("log delivery", || {
            manager.target_stats().iter().all(|t| t.sent == 10)
        })
        .await;

        manager.set_target_enabled(1, false).unwrap();
        for seq in 10..15 {
            assert!(manager.send_telemetry(telemetry(seq)));
        }
        wait_until("first target delivery", || {
            manager.target(0).unwrap().counters().sent() == 15
        })
        .await;
        assert_eq!(manager.target(1).unwrap().counters().sent(), 10);
        assert!(manager.set_target_enabled(7, true).is_err());

        manager.shutdown().await;
    }
}
