//! Delivery error types

use thiserror::Error;

/// Delivery-specific errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// No target addresses configured
    #[error("no delivery targets configured")]
    NoTargets,

    /// Single mode points at a target that does not exist
    #[error("primary index {index} out of range for {count} target(s)")]
    PrimaryOutOfRange { index: usize, count: usize },

    /// Target index passed to a runtime operation does not exist
    #[error("unknown target index {index}")]
    UnknownTarget { index: usize },

    /// Session could not be created for a target
    #[error("failed to create session for target {index}: {message}")]
    SessionCreation { index: usize, message: String },
}

impl DeliveryError {
    /// Create a session creation error
    pub fn session_creation(index: usize, message: impl Into<String>) -> Self {
        Self::SessionCreation {
            index,
            message: message.into(),
        }
    }
}
