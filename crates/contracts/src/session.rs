//! TransportSession trait - Target output interface
//!
//! A session is one client connection to one remote endpoint. Remote pushes are
//! delivered as [`SessionEvent`]s over a channel owned by the target, so no
//! callback ever touches target state from the session's own tasks.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::{events, ContractError, Frame, Payload, FRAME_ID_FIELD};

/// Channel a session pushes inbound events into
pub type InboundSender = mpsc::Sender<SessionEvent>;

/// Receiving half owned by the target worker
pub type InboundReceiver = mpsc::Receiver<SessionEvent>;

/// Capacity of the per-target inbound channel
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Event emitted by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Remote endpoint pushed a named message
    Message {
        event: String,
        payload: Payload,
        received_at: Instant,
    },
    /// Link lost; the target must reconnect
    Closed { reason: Option<String> },
}

impl SessionEvent {
    /// Stamp an inbound message with the current instant
    pub fn message(event: impl Into<String>, payload: Payload) -> Self {
        Self::Message {
            event: event.into(),
            payload,
            received_at: Instant::now(),
        }
    }
}

/// Inbound messages a target understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Acknowledgement of a sampled frame
    Ack { frame_id: String },
    /// Viewer count for this relay
    Viewers { count: u64 },
}

impl InboundEvent {
    /// Resolve an inbound message; unknown tags and malformed payloads yield `None`
    pub fn parse(event: &str, payload: &Payload) -> Option<Self> {
        match event {
            events::ACK => payload
                .get(FRAME_ID_FIELD)
                .and_then(Value::as_str)
                .map(|id| Self::Ack {
                    frame_id: id.to_string(),
                }),
            events::VIEWERS => payload
                .get("count")
                .and_then(Value::as_u64)
                .map(|count| Self::Viewers { count }),
            _ => None,
        }
    }
}

/// Session trait
///
/// All transport implementations must implement this trait.
#[trait_variant::make(TransportSession: Send)]
pub trait LocalTransportSession {
    /// Session kind (used for logging)
    fn kind(&self) -> &'static str;

    /// Establish the session
    ///
    /// The caller bounds this with its own connect timeout.
    ///
    /// # Errors
    /// Returns a connection error (should include context)
    async fn connect(&mut self, address: &str, inbound: InboundSender)
        -> Result<(), ContractError>;

    /// Close the session
    async fn disconnect(&mut self) -> Result<(), ContractError>;

    /// Send one frame, fire-and-forget
    async fn send(&mut self, frame: &Frame) -> Result<(), ContractError>;
}

/// Creates one session per target
pub trait Connector: Send + Sync + 'static {
    type Session: TransportSession + 'static;

    /// Build an unconnected session for `address`
    fn session_for(&self, address: &str) -> Result<Self::Session, ContractError>;
}
