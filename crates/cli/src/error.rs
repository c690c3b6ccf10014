//! Error types for CLI operations.

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration file could not be loaded
    #[error("Failed to load configuration: {0}")]
    ConfigLoad(#[from] contracts::ContractError),

    /// Neither a config file nor backends were given
    #[error("No configuration: pass --config or --backends (RELAY_BACKENDS)")]
    NoConfiguration,

    /// A command-line or environment override is unusable
    #[error("Invalid override for {name}: {message}")]
    InvalidOverride { name: &'static str, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::ConfigNotFound { path: path.into() }
    }

    pub fn invalid_override(name: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidOverride {
            name,
            message: message.into(),
        }
    }
}

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
