//! LogSession - logs frame summaries via tracing
//!
//! Selected with a `log://<label>` address. Useful for dry runs and for
//! comparing what each target would have received.

use contracts::{ContractError, Frame, InboundSender, TransportSession};
use tracing::{debug, info, instrument};

/// Session that never leaves the process
#[derive(Debug, Default)]
pub struct LogSession {
    label: Option<String>,
    frames: u64,
}

impl LogSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames logged since the last connect
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl TransportSession for LogSession {
    fn kind(&self) -> &'static str {
        "log"
    }

    #[instrument(name = "log_session_connect", skip(self, _inbound))]
    async fn connect(
        &mut self,
        address: &str,
        _inbound: InboundSender,
    ) -> Result<(), ContractError> {
        let label = address.strip_prefix("log://").unwrap_or(address);
        self.label = Some(label.to_string());
        self.frames = 0;
        info!(label, "LogSession opened");
        Ok(())
    }

    #[instrument(name = "log_session_disconnect", skip(self))]
    async fn disconnect(&mut self) -> Result<(), ContractError> {
        if let Some(label) = self.label.take() {
            info!(label = %label, frames = self.frames, "LogSession closed");
        }
        Ok(())
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), ContractError> {
        let Some(label) = self.label.as_deref() else {
            return Err(ContractError::NotConnected);
        };
        self.frames += 1;
        debug!(
            label,
            event = %frame.event,
            fields = frame.payload.len(),
            ack = frame.ack_requested(),
            "Frame"
        );
        Ok(())
    }
}
