//! Layered error definitions
//!
//! Categorized by source: config / connection / send / transport

use thiserror::Error;

/// Unified error type
#[derive(Debug, Error)]
pub enum ContractError {
    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    // ===== Session Errors =====
    /// Could not establish a session with the endpoint
    #[error("connection to '{address}' failed: {message}")]
    Connection { address: String, message: String },

    /// Connection attempt exceeded its deadline
    #[error("connection to '{address}' timed out after {timeout_ms}ms")]
    ConnectTimeout { address: String, timeout_ms: u64 },

    /// Session rejected or failed an outbound frame
    #[error("send of '{event}' failed: {message}")]
    Send { event: String, message: String },

    /// Operation requires an open session
    #[error("session not connected")]
    NotConnected,

    /// Unsupported address scheme
    #[error("unsupported transport scheme in '{address}'")]
    UnsupportedScheme { address: String },

    // ===== General Errors =====
    /// Payload (de)serialization error
    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContractError {
    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create connection error
    pub fn connection(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Create send error
    pub fn send(event: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Send {
            event: event.into(),
            message: message.into(),
        }
    }

    /// Whether this error belongs to the configuration category
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::ConfigParse { .. } | Self::ConfigValidation { .. }
        )
    }
}
