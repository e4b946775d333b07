//! Per-chat call lifecycle controller: connect/reconnect state machine,
//! participant bookkeeping, and the stream control surface that wires a
//! `FastStreamBuffer` to transport.

pub mod error;
pub mod lifecycle;

pub use error::{LifecycleError, LifecycleResult};
pub use lifecycle::{CallLifecycle, CallSession};
