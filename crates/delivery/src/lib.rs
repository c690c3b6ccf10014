//! # Delivery
//!
//! 多目标遥测投递模块。
//!
//! 负责：
//! - 按 single / parallel 模式路由帧到目标
//! - 每个目标独立队列与 worker，慢目标不阻塞调用方
//! - 连接退避、过期丢弃、ack 采样与延迟统计
//! - Kill switch：一键停用所有投递

pub mod error;
pub mod manager;
pub mod metrics;
pub mod queue;
pub mod redact;
pub mod sessions;
pub mod target;

pub use contracts::{Connector, DeliveryMode, Frame, Payload, TransportSession};
pub use error::DeliveryError;
pub use manager::DeliveryManager;
pub use metrics::{AggregateLatency, ParitySnapshot, TargetCounters, TargetStats};
pub use queue::{FrameQueue, QueuedFrame};
pub use redact::{redact_address, redact_error};
pub use sessions::{DefaultConnector, LogSession, RelaySession, WebSocketSession};
pub use target::{backoff_delay, Delivery, Target, TargetState};
