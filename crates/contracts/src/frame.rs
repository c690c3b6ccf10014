//! Frame - the unit handed to the delivery manager
//!
//! A frame is a named event plus a key-ordered JSON payload. Frames are not
//! persisted; they live in target queues until sent, dropped or evicted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key-ordered field map carried by every frame
pub type Payload = Map<String, Value>;

/// Payload field set on ack-sampled frames
pub const ACK_REQUESTED_FIELD: &str = "ackRequested";

/// Payload field carrying the sampled frame's unique id
pub const FRAME_ID_FIELD: &str = "frameId";

/// Payload field carrying the relay session id
pub const SESSION_ID_FIELD: &str = "sessionId";

/// Well-known event tags
pub mod events {
    /// Periodic telemetry snapshot
    pub const TELEMETRY: &str = "telemetry";
    /// Session description, carries `sessionId`
    pub const SESSION_METADATA: &str = "session_metadata";
    /// Flag / phase changes
    pub const RACE_EVENT: &str = "race_event";
    /// Incident reports
    pub const INCIDENT: &str = "incident";
    /// Sent by a target right after its session connects
    pub const REGISTER: &str = "relay:register";
    /// Inbound acknowledgement of a sampled frame
    pub const ACK: &str = "relay:ack";
    /// Inbound viewer count update
    pub const VIEWERS: &str = "relay:viewers";
}

/// Outbound frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Event tag
    pub event: String,

    /// Opaque payload
    #[serde(rename = "data", default)]
    pub payload: Payload,
}

impl Frame {
    /// Create a frame from an event tag and payload
    pub fn new(event: impl Into<String>, payload: Payload) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Whether the manager sampled this frame for acknowledgement
    pub fn ack_requested(&self) -> bool {
        self.payload
            .get(ACK_REQUESTED_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Sampled frame id, if any
    pub fn frame_id(&self) -> Option<&str> {
        self.payload
            .get(FRAME_ID_FIELD)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Attach the ack request fields
    pub fn with_ack_request(mut self, frame_id: impl Into<String>) -> Self {
        self.payload
            .insert(ACK_REQUESTED_FIELD.to_string(), Value::Bool(true));
        self.payload
            .insert(FRAME_ID_FIELD.to_string(), Value::String(frame_id.into()));
        self
    }

    /// Frame id to track for acknowledgement: only set when ack was requested
    pub fn ack_frame_id(&self) -> Option<&str> {
        if self.ack_requested() {
            self.frame_id()
        } else {
            None
        }
    }
}

/// Versioned stream kinds wrapped in a [`StreamEnvelope`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Low-rate car state (4 Hz)
    Baseline,
    /// Driver inputs (15 Hz)
    Controls,
}

impl StreamKind {
    /// Event tag used on the wire
    pub fn event(self) -> &'static str {
        match self {
            Self::Baseline => "telemetry:baseline",
            Self::Controls => "telemetry:controls",
        }
    }

    /// Stream type label inside the envelope
    pub fn stream_type(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Controls => "controls",
        }
    }

    /// Nominal sample rate
    pub fn sample_hz(self) -> u32 {
        match self {
            Self::Baseline => 4,
            Self::Controls => 15,
        }
    }
}

/// v2 stream packet
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEnvelope {
    pub v: u8,
    #[serde(rename = "type")]
    pub kind: String,
    /// Wall clock, unix milliseconds
    pub ts: i64,
    pub session_id: String,
    pub stream_type: String,
    pub sample_hz: u32,
    pub payload: Payload,
}

impl StreamEnvelope {
    /// Wrap car data for the given stream
    pub fn new(kind: StreamKind, session_id: &str, ts: i64, payload: Payload) -> Self {
        Self {
            v: 2,
            kind: kind.event().to_string(),
            ts,
            session_id: session_id.to_string(),
            stream_type: kind.stream_type().to_string(),
            sample_hz: kind.sample_hz(),
            payload,
        }
    }

    /// Convert into a frame payload
    pub fn into_payload(self) -> Result<Payload, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Ok(Payload::new()),
        }
    }
}
