//! Error types for the Quizcast client.

use thiserror::Error;

use crate::error_codes::ErrorCode;
use crate::round::GamePhase;

/// Errors that can occur when using the Quizcast client.
#[derive(Debug, Error)]
pub enum QuizcastError {
    /// The realtime token was missing or rejected by the service.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Attempted an operation that requires an active connection, but the client is not connected.
    #[error("not connected to the realtime service")]
    NotConnected,

    /// The channel exists but is not ready for the requested operation yet.
    #[error("channel not ready: {0}")]
    NotReady(String),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The service rejected a channel-level operation (publish, attach, presence).
    #[error("channel error: {message}")]
    Channel {
        /// Human-readable rejection message.
        message: String,
        /// Structured error code, if provided by the service.
        error_code: Option<ErrorCode>,
    },

    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a frame or payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A REST call to the quiz backend failed.
    #[error("backend error: {message}")]
    Backend {
        /// HTTP status, when the failure came from a response.
        status: Option<u16>,
        /// Human-readable failure description.
        message: String,
    },

    /// Topic names must be non-empty.
    #[error("invalid topic: {0:?}")]
    InvalidTopic(String),

    /// The game action is not permitted in the current phase.
    #[error("{action} is not allowed while {phase:?}")]
    Rejected {
        /// The action that was attempted.
        action: &'static str,
        /// The phase the round was in.
        phase: GamePhase,
    },

    /// Another operator action is still in flight.
    #[error("another action is in progress")]
    Busy,
}

impl QuizcastError {
    /// Build a [`QuizcastError::Backend`] without an HTTP status.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            status: None,
            message: message.into(),
        }
    }
}

/// A specialized [`Result`] type for Quizcast client operations.
pub type Result<T> = std::result::Result<T, QuizcastError>;
