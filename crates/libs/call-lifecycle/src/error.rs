//! Errors specific to call lifecycle operations.

use thiserror::Error;

/// Result alias for call-lifecycle operations.
pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

/// Errors raised by `CallLifecycle` operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The operation requires no existing session for this chat.
    #[error("already in call: chat {0}")]
    AlreadyInCall(i64),

    /// The operation requires an existing connected session for this chat.
    #[error("not in call: chat {0}")]
    NotInCall(i64),

    /// A lower-level core error (buffer, transport, retry).
    #[error(transparent)]
    Core(#[from] callcore::Error),

    /// A fleet-level error admitting or removing the chat's buffer.
    #[error(transparent)]
    Fleet(#[from] callcore_buffer_fleet::FleetError),
}
