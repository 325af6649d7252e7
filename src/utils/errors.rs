//! Error types and handling for peerline.
//!
//! This module provides a unified error type across discovery, transport and
//! the relay, with nested enums per subsystem so callers can match on the
//! failure class without string inspection.

use thiserror::Error;

/// Result type alias for the peerline library
pub type Result<T> = std::result::Result<T, PeerlineError>;

/// Top-level error type for all peerline operations
#[derive(Error, Debug, Clone)]
pub enum PeerlineError {
    /// Network and transport layer errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Wire-level errors (datagrams, relay payloads)
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Relay request errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error for unexpected conditions
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Network and transport layer errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// A listening or discovery socket could not be bound
    #[error("Failed to bind {address}: {reason}")]
    BindFailed { address: String, reason: String },

    /// Public address detection exhausted every endpoint
    #[error("Public IP detection failed: {reason}")]
    PublicIpUnavailable { reason: String },

    /// Network transport error
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// Timeout during network operation
    #[error("Network timeout: {operation}")]
    Timeout { operation: String },

    /// Invalid network address
    #[error("Invalid address: {address}")]
    InvalidAddress { address: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Wire-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Payload could not be decoded
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// Field present but outside its allowed range
    #[error("Invalid value for {field}: {value}")]
    InvalidField { field: String, value: String },
}

/// Errors produced while handling a relay request.
///
/// Every variant except [`RelayError::Internal`] is a client error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Request body was not a JSON object
    #[error("No JSON data")]
    NoJson,

    /// `action` missing or not recognised
    #[error("Unknown action")]
    UnknownAction,

    /// A required field is missing or empty
    #[error("Missing {0}")]
    MissingField(String),

    /// Relay answered with an error payload or a non-success status
    #[error("Relay rejected request: {0}")]
    Rejected(String),

    /// Unexpected server-side fault
    #[error("{0}")]
    Internal(String),
}

impl PeerlineError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Returns true if retrying the same operation later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(NetworkError::Timeout { .. })
                | Self::Network(NetworkError::Transport { .. })
                | Self::Relay(RelayError::Internal(_))
        )
    }
}

impl RelayError {
    /// Returns true for errors caused by the request rather than the server
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }
}

impl From<std::io::Error> for PeerlineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PeerlineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for PeerlineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Network(NetworkError::Timeout {
                operation: err
                    .url()
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "http request".to_string()),
            })
        } else {
            Self::Network(NetworkError::Transport {
                reason: err.to_string(),
            })
        }
    }
}
