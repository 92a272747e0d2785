//! Domain error types for the Firetower gateway.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use std::time::Duration;

use thiserror::Error;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// Hot-topic shard count must be at least 1.
    #[error("shard_count must be at least 1, got {0}")]
    InvalidShardCount(u32),

    /// A queue or buffer capacity was zero.
    #[error("{name} must be greater than zero")]
    InvalidCapacity { name: &'static str },

    /// Backoff bounds are inverted or zero.
    #[error("invalid backoff: initial {initial_ms}ms, max {max_ms}ms")]
    InvalidBackoff { initial_ms: u64, max_ms: u64 },
}

/// Errors produced while framing a message for the wire.
///
/// Decoding never surfaces these: malformed input is skipped and the stream
/// resynchronizes on the next header.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A required field (kind, topic or content) was empty or absent.
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    /// A header field contains a space or newline, which would shift the
    /// positional fields on decode.
    #[error("{field} contains a delimiter: {value:?}")]
    InvalidField { field: &'static str, value: String },

    /// Body would not fit the signed 32-bit length prefix.
    #[error("frame body of {size} bytes exceeds the length prefix")]
    FrameTooLarge { size: usize },
}

/// Errors that occur during gateway operation.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The transport is not live.
    #[error("connection closed")]
    ConnectionClosed,

    /// The outbound queue did not accept the payload in time.
    #[error("send timed out after {timeout:?}")]
    SendTimeout { timeout: Duration },

    /// Dial failure.
    #[error("failed to connect to {address}: {message}")]
    Connect { address: String, message: String },

    /// The subscribe hook rejected the subscription.
    #[error("subscription denied for session {session_id}")]
    SubscribeDenied { session_id: String },

    /// No session with the given id is open.
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// Frame could not be built.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// TCP/IO connection error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// A client sent a request that is not valid JSON or has an unknown type.
    #[error("malformed client request: {message}")]
    FrontProtocol { message: String },

    /// Shutdown signal received.
    #[error("gateway shutting down")]
    Shutdown,
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::FrontProtocol {
            message: err.to_string(),
        }
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for framing operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
