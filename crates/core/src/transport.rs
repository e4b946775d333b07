//! Capability-typed interfaces the core consumes rather than binding to a
//! concrete protocol. Any concrete binding (MTProto voice calls, a local
//! test double) implements these traits; the core treats them as an
//! opaque boundary.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ChatId, Frame};

/// Update pushed from transport to the core, routed onward through the
/// `EventDispatcher`.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A participant joined, left, or changed state.
    ParticipantUpdate {
        /// Chat the update concerns.
        chat_id: ChatId,
        /// Participant identity.
        user_id: i64,
    },
    /// The local client was kicked from the call.
    Kicked {
        /// Chat the client was kicked from.
        chat_id: ChatId,
    },
    /// The call ended for everyone.
    CallEnded {
        /// Chat whose call ended.
        chat_id: ChatId,
    },
    /// Transport-observed health degradation (packet loss, jitter spike, ...).
    HealthDegraded {
        /// Chat the degradation was observed on.
        chat_id: ChatId,
        /// Opaque reason string for diagnostics.
        reason: String,
    },
}

/// Signalling/frame-delivery capability consumed by `CallLifecycle`.
///
/// The core treats this as an opaque boundary; any concrete binding is
/// external (§1, §6).
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Acquire a transport handle for `chat_id`.
    async fn connect(&self, chat_id: ChatId) -> Result<()>;

    /// Release the transport handle for `chat_id`.
    async fn disconnect(&self, chat_id: ChatId) -> Result<()>;

    /// Deliver one frame into the conference.
    async fn send_frame(&self, chat_id: ChatId, frame: Frame) -> Result<()>;

    /// Register to receive `TransportEvent`s for any chat.
    fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<TransportEvent>;
}

/// An asynchronous, possibly infinite, non-restartable sequence of raw byte
/// blocks. Finite sources produce end-of-stream by returning `None`; live
/// sources do not. The core does not assume a specific byte format — the
/// `StreamProcessor` is what interprets it.
#[async_trait]
pub trait SourceProducer: Send {
    /// Pull the next raw block, or `None` at end-of-stream.
    async fn next_block(&mut self) -> Result<Option<bytes::Bytes>>;
}

/// Pure, non-blocking, never-panicking chunk transform applied outside the
/// buffer's own quality adapter (optional, consumed).
pub trait MediaFilter: Send + Sync {
    /// Apply the filter to one chunk, returning the (possibly unchanged) result.
    fn apply(&self, chunk: crate::model::StreamChunk) -> crate::model::StreamChunk;
}
