//! Errors specific to fleet-level buffer management.

use thiserror::Error;

/// Result alias for buffer-fleet operations.
pub type FleetResult<T> = std::result::Result<T, FleetError>;

/// Errors raised while admitting, removing, or tuning fleet members.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The fleet is at `max_buffers` and no evictable (non-critical) buffer exists.
    #[error("fleet is full and no buffer below critical priority can be evicted")]
    FleetFull,

    /// Construction of the underlying buffer failed (invalid config).
    #[error("buffer construction failed: {0}")]
    Config(#[from] callcore::Error),

    /// No buffer registered under the given id.
    #[error("no buffer registered with id {0:?}")]
    NotFound(String),
}
