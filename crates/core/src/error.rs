//! Error taxonomy for the call-core runtime.
//!
//! Variants are organized by kind, not by the component that raises them —
//! `Config` errors are surfaced synchronously at construction, `Transport`
//! errors are caught and retried while connecting, `Media` errors abort a
//! `play()` without tearing down the call itself. See the propagation
//! policy docs on each variant.

use thiserror::Error;

/// Result type alias for call-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the call-core runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration value, reported synchronously at construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation requires the component to be started first.
    #[error("not running: {0}")]
    NotRunning(String),

    /// Duplicate lifecycle start (e.g. `FastStreamBuffer::start` while already filling).
    #[error("already active: {0}")]
    AlreadyActive(String),

    /// Call-state precondition violated: operation requires an active call.
    #[error("not in call: chat {chat_id}")]
    NotInCall {
        /// Chat the operation was attempted against.
        chat_id: i64,
    },

    /// Call-state precondition violated: operation requires no existing call.
    #[error("already in call: chat {chat_id}")]
    AlreadyInCall {
        /// Chat the operation was attempted against.
        chat_id: i64,
    },

    /// Source missing, invalid source URI, transcoder spawn failure, or
    /// abnormal child exit.
    #[error("media error: {0}")]
    Media(String),

    /// Signalling or frame-delivery failure; may be recoverable via reconnect.
    #[error("transport error: {0}")]
    Transport(String),

    /// Retry budget exhausted, or a handshake did not complete in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Cooperative cancellation of an in-flight operation.
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation — always a bug, never an expected runtime condition.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O failure talking to a transcoder's pipes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl Error {
    /// Whether retrying the operation that produced this error could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout(_) | Error::Io(_))
    }
}
