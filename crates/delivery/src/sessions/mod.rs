//! Session implementations
//!
//! Contains LogSession and WebSocketSession, plus the connector that picks
//! one from the address scheme.

mod log;
mod websocket;

use std::time::Duration;

use contracts::{ContractError, Connector, Frame, InboundSender, TransportSession};

pub use self::log::LogSession;
pub use self::websocket::WebSocketSession;

use crate::redact::redact_address;

/// Session selected by address scheme
#[derive(Debug)]
pub enum RelaySession {
    Log(LogSession),
    WebSocket(WebSocketSession),
}

impl TransportSession for RelaySession {
    fn kind(&self) -> &'static str {
        match self {
            Self::Log(s) => s.kind(),
            Self::WebSocket(s) => s.kind(),
        }
    }

    async fn connect(&mut self, address: &str, inbound: InboundSender) -> Result<(), ContractError> {
        match self {
            Self::Log(s) => s.connect(address, inbound).await,
            Self::WebSocket(s) => s.connect(address, inbound).await,
        }
    }

    async fn disconnect(&mut self) -> Result<(), ContractError> {
        match self {
            Self::Log(s) => s.disconnect().await,
            Self::WebSocket(s) => s.disconnect().await,
        }
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), ContractError> {
        match self {
            Self::Log(s) => s.send(frame).await,
            Self::WebSocket(s) => s.send(frame).await,
        }
    }
}

/// Connector for `ws://`, `wss://` and `log://` addresses
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    send_timeout: Duration,
}

impl DefaultConnector {
    pub fn new(send_timeout: Duration) -> Self {
        Self { send_timeout }
    }
}

impl Default for DefaultConnector {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

impl Connector for DefaultConnector {
    type Session = RelaySession;

    fn session_for(&self, address: &str) -> Result<RelaySession, ContractError> {
        let scheme = address
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase());
        match scheme.as_deref() {
            Some("ws" | "wss") => Ok(RelaySession::WebSocket(WebSocketSession::new(
                self.send_timeout,
            ))),
            Some("log") => Ok(RelaySession::Log(LogSession::new())),
            _ => Err(ContractError::UnsupportedScheme {
                address: redact_address(address),
            }),
        }
    }
}
