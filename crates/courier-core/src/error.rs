//! Error types for Courier.
//!
//! Every fallible operation in the library returns [`CourierError`]. The
//! variants are grouped by how a caller should react to them, and each one
//! maps onto a JSON-RPC error code through [`CourierError::to_rpc_error_code`].

use std::time::Duration;
use thiserror::Error;

/// Main error type for the Courier library.
#[derive(Debug, Error)]
pub enum CourierError {
    // Protocol errors
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    // Rate governor hard limits
    #[error("rate limiting paused: {reason}")]
    RateLimitPaused { reason: String },

    #[error(
        "new contacts limit exceeded: {count} new contacts/day (max: {max}) - try again tomorrow"
    )]
    NewContactLimit { count: u32, max: u32 },

    #[error("admission would wait {needed:?} but only {remaining:?} of the wait budget remains")]
    AdmissionTimeout {
        needed: Duration,
        remaining: Duration,
    },

    #[error("Operation was cancelled")]
    Cancelled,

    // Transport errors
    #[error("messaging transport is not connected")]
    NotConnected,

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("message not found or expired (message_id: {message_id}, cached: {cached})")]
    MessageNotCached { message_id: String, cached: usize },

    #[error("message {message_id} does not carry downloadable media")]
    NoMedia { message_id: String },

    #[error("No QR available")]
    NoPairingCode,

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Courier operations.
pub type Result<T> = std::result::Result<T, CourierError>;

impl From<std::io::Error> for CourierError {
    fn from(err: std::io::Error) -> Self {
        CourierError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        CourierError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for CourierError {
    fn from(err: rusqlite::Error) -> Self {
        CourierError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl CourierError {
    /// Shorthand for an [`CourierError::InvalidParams`] error.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        CourierError::InvalidParams {
            message: message.into(),
        }
    }

    /// Shorthand for a [`CourierError::Transport`] error.
    pub fn transport(message: impl Into<String>) -> Self {
        CourierError::Transport {
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Application-defined codes:
    /// - -32000: Operation failed (rate limits, transport, cache misses)
    /// - -32001: No pairing code available
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            CourierError::ParseError(_) => -32700,
            CourierError::InvalidRequest(_) => -32600,
            CourierError::MethodNotFound(_) => -32601,
            CourierError::InvalidParams { .. } => -32602,

            CourierError::RateLimitPaused { .. }
            | CourierError::NewContactLimit { .. }
            | CourierError::AdmissionTimeout { .. }
            | CourierError::Cancelled
            | CourierError::NotConnected
            | CourierError::Transport { .. }
            | CourierError::MessageNotCached { .. }
            | CourierError::NoMedia { .. } => -32000,

            CourierError::NoPairingCode => -32001,

            _ => -32603,
        }
    }

    /// True for governor rejections that waiting cannot resolve.
    pub fn is_hard_limit(&self) -> bool {
        matches!(
            self,
            CourierError::RateLimitPaused { .. } | CourierError::NewContactLimit { .. }
        )
    }
}
