//! WebSocketSession - JSON event frames over ws:// or wss://
//!
//! Each outbound frame is one text message `{"event": ..., "data": {...}}`.
//! Inbound text messages with the same shape are forwarded to the target as
//! [`SessionEvent::Message`]; a close or read error becomes
//! [`SessionEvent::Closed`].

use std::time::Duration;

use contracts::{ContractError, Frame, InboundSender, SessionEvent, TransportSession};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, instrument, warn};

use crate::redact::{redact_address, redact_error};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Session over a single WebSocket connection
pub struct WebSocketSession {
    send_timeout: Duration,
    writer: Option<SplitSink<WsStream, Message>>,
    reader: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WebSocketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSession")
            .field("send_timeout", &self.send_timeout)
            .field("connected", &self.writer.is_some())
            .finish()
    }
}

impl WebSocketSession {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            send_timeout,
            writer: None,
            reader: None,
        }
    }

    fn close_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for WebSocketSession {
    fn drop(&mut self) {
        self.close_reader();
    }
}

/// Forward inbound messages until the socket closes
async fn read_loop(mut stream: SplitStream<WsStream>, inbound: InboundSender) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                Ok(frame) => {
                    let event = SessionEvent::message(frame.event, frame.payload);
                    if inbound.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => debug!(error = %e, "Ignoring malformed inbound message"),
            },
            Some(Ok(Message::Close(frame))) => {
                break frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break Some(redact_error(&e.to_string())),
            None => break None,
        }
    };
    let _ = inbound.send(SessionEvent::Closed { reason }).await;
}

impl TransportSession for WebSocketSession {
    fn kind(&self) -> &'static str {
        "websocket"
    }

    #[instrument(
        name = "websocket_session_connect",
        skip(self, address, inbound),
        fields(address = %redact_address(address))
    )]
    async fn connect(&mut self, address: &str, inbound: InboundSender) -> Result<(), ContractError> {
        self.close_reader();
        self.writer = None;

        let (stream, _response) = tokio_tungstenite::connect_async(address)
            .await
            .map_err(|e| ContractError::connection(redact_address(address), e.to_string()))?;
        let (writer, reader) = stream.split();
        self.writer = Some(writer);
        self.reader = Some(tokio::spawn(read_loop(reader, inbound)));
        debug!("WebSocket open");
        Ok(())
    }

    #[instrument(name = "websocket_session_disconnect", skip(self))]
    async fn disconnect(&mut self) -> Result<(), ContractError> {
        self.close_reader();
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.close().await {
                warn!(error = %redact_error(&e.to_string()), "WebSocket close failed");
            }
        }
        Ok(())
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), ContractError> {
        let writer = self.writer.as_mut().ok_or(ContractError::NotConnected)?;
        let text = serde_json::to_string(frame)?;
        let result = tokio::time::timeout(self.send_timeout, writer.send(Message::Text(text))).await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.writer = None;
                Err(ContractError::send(&frame.event, e.to_string()))
            }
            Err(_) => Err(ContractError::send(
                &frame.event,
                format!("timed out after {}ms", self.send_timeout.as_millis()),
            )),
        }
    }
}
