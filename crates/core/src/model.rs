//! Plain, immutable value types shared by every component: chunks, frames,
//! buffer/call configuration and state, participants, and cached peer
//! descriptors.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a conference (one Telegram-style group-call chat).
pub type ChatId = i64;

/// Either side of an audio/video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    /// Audio payload.
    Audio,
    /// Video payload.
    Video,
}

/// Free-form metadata value attached to a chunk (quality level, compression
/// ratio, original size, ...). Kept as JSON values so arbitrary producers
/// can stash diagnostic data without a schema change here.
pub type Metadata = HashMap<String, serde_json::Value>;

/// One immutable unit of buffered media: bytes plus a monotonic production
/// timestamp and a per-buffer sequence number.
///
/// `sequence` is assigned by the buffer that produces the chunk and is
/// strictly increasing within that buffer's lifetime (invariant I3).
#[derive(Debug, Clone)]
pub struct StreamChunk {
    /// Raw byte payload.
    pub data: bytes::Bytes,
    /// Monotonic time of production.
    pub produced_at: Instant,
    /// Monotonically increasing counter, unique within one buffer's lifetime.
    pub sequence: u64,
    /// Audio or video.
    pub kind: MediaKind,
    /// Nominal duration of media the payload represents.
    pub duration_ms: u32,
    /// Free-form key/value metadata (quality level, compression ratio, ...).
    pub metadata: Metadata,
}

impl StreamChunk {
    /// Construct a new chunk stamped with `now`.
    pub fn new(
        data: bytes::Bytes,
        sequence: u64,
        kind: MediaKind,
        duration_ms: u32,
        now: Instant,
    ) -> Self {
        Self {
            data,
            produced_at: now,
            sequence,
            kind,
            duration_ms,
            metadata: Metadata::new(),
        }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Age of this chunk against a monotonic clock, in milliseconds.
    ///
    /// Always computed against `Instant`, never wall time — a chunk's age
    /// must not jump when the system clock is adjusted.
    pub fn age_ms(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.produced_at).as_secs_f64() * 1000.0
    }
}

/// Per-frame delivery metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FrameInfo {
    /// Milliseconds since the stream started.
    pub timestamp_ms: u64,
    /// Frame width in pixels, video only.
    pub width: Option<u32>,
    /// Frame height in pixels, video only.
    pub height: Option<u32>,
    /// Rotation in degrees, video only.
    pub rotation: Option<u16>,
    /// Sample rate in Hz, audio only.
    pub sample_rate: Option<u32>,
    /// Channel count, audio only.
    pub channels: Option<u8>,
}

/// One unit handed to transport. May be carried inside a chunk's payload,
/// or computed from one; frames and chunks are distinct units.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Synchronization source identifier, as required by `TransportClient`.
    pub ssrc: u32,
    /// Encoded payload.
    pub data: bytes::Bytes,
    /// Delivery metadata.
    pub info: FrameInfo,
    /// Audio or video.
    pub kind: MediaKind,
}

/// Scalars governing one `FastStreamBuffer`.
///
/// Invariant: `0 < min_size <= target_size <= max_size`; `max_latency_ms > 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Hard cap on chunk count.
    pub max_size: usize,
    /// Minimum fill level before the buffer leaves `filling`.
    pub min_size: usize,
    /// Fill level the buffer aims to re-reach after an underrun.
    pub target_size: usize,
    /// Nominal duration represented by one chunk, in milliseconds.
    pub chunk_duration_ms: u32,
    /// Latency past which a chunk is considered stale.
    pub max_latency_ms: u32,
    /// Level at or below which the buffer transitions to `underrun`.
    pub underrun_threshold: usize,
    /// Whether the quality adapter degrades chunks under poor health.
    pub adaptive_quality: bool,
    /// When full: drop oldest and append (`true`) or drop the incoming chunk (`false`).
    pub drop_on_overflow: bool,
    /// Dequeue newest-first (`true`) or oldest-first (`false`).
    pub prioritize_recent: bool,
    /// Bound on chunks being wrapped/enqueued concurrently by the producer.
    pub max_concurrent_chunks: usize,
}

impl Default for BufferConfig {
    /// Mirrors the original implementation's defaults.
    fn default() -> Self {
        Self {
            max_size: 50,
            min_size: 5,
            target_size: 20,
            chunk_duration_ms: 20,
            max_latency_ms: 100,
            underrun_threshold: 3,
            adaptive_quality: true,
            drop_on_overflow: true,
            prioritize_recent: true,
            max_concurrent_chunks: 10,
        }
    }
}

impl BufferConfig {
    /// Validate the sizing invariant, returning a `Config` error description on failure.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.min_size == 0 {
            return Err("min_size must be > 0".into());
        }
        if self.min_size > self.target_size {
            return Err("min_size must be <= target_size".into());
        }
        if self.target_size > self.max_size {
            return Err("target_size must be <= max_size".into());
        }
        if self.max_latency_ms == 0 {
            return Err("max_latency_ms must be > 0".into());
        }
        Ok(())
    }
}

/// Lifecycle state of a `FastStreamBuffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferState {
    /// Not yet started.
    Idle,
    /// Started, below `min_size`.
    Filling,
    /// Reached `min_size`, not yet at `target_size`.
    Ready,
    /// At or above `target_size`; steady-state delivery.
    Streaming,
    /// At or below `underrun_threshold` while streaming.
    Underrun,
    /// Transient: observed as an event at the moment of a dropped enqueue.
    Overflow,
    /// Unrecoverable producer/consumer failure.
    Error,
}

/// Relative importance of a buffer, used for admission and eviction order.
///
/// Eviction order is lowest first; `Critical` is never evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum BufferPriority {
    /// Evicted first.
    Low = 1,
    /// Default priority.
    Normal = 2,
    /// Evicted only after all `Normal`/`Low` buffers.
    High = 3,
    /// Never evicted.
    Critical = 4,
}

/// State of a `CallSession`. Terminal states: `Ended`, `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No session exists yet.
    Idle,
    /// Session object created, transport handle not yet acquired.
    Initializing,
    /// Acquiring the transport handle.
    Connecting,
    /// Transport handle acquired.
    Connected,
    /// A stream is attached and flowing.
    Active,
    /// Stream attached but temporarily suspended.
    Paused,
    /// Tearing down.
    Ending,
    /// Torn down. Terminal.
    Ended,
    /// Unrecoverable failure. Terminal except for a final transition to `Ended`.
    Error,
}

/// One participant in a call, keyed externally by `user_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    /// Participant identity.
    pub user_id: i64,
    /// Self-muted.
    pub muted: bool,
    /// Muted by a chat admin (distinct from self-mute).
    pub muted_by_admin: bool,
    /// Camera stream present.
    pub has_camera: bool,
    /// Screen-share stream present.
    pub is_screen_sharing: bool,
    /// When the participant joined, as reported by transport.
    pub joined_at: chrono::DateTime<chrono::Utc>,
    /// Free-form per-participant metadata.
    pub metadata: Metadata,
}

impl Participant {
    /// A participant has video iff they have a camera or are screen-sharing.
    pub fn has_video(&self) -> bool {
        self.has_camera || self.is_screen_sharing
    }
}

/// Kind of peer a `PeerDescriptor` resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerKind {
    /// A single user.
    User,
    /// A basic group chat.
    Chat,
    /// A broadcast channel or supergroup.
    Channel,
}

/// Resolved identity of a conference participant or chat, as cached by
/// `PeerCache`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Opaque peer handle as seen by transport.
    pub peer_id: i64,
    /// Access hash required by some transport bindings to address the peer.
    pub access_hash: Option<i64>,
    /// Peer kind.
    pub kind: PeerKind,
    /// Display title, if known.
    pub title: Option<String>,
    /// Username, if known.
    pub username: Option<String>,
    /// When this descriptor was cached.
    pub cached_at: chrono::DateTime<chrono::Utc>,
}

/// Peer descriptor cache entries expire after this many seconds.
pub const PEER_TTL_SECS: i64 = 86_400;

impl PeerDescriptor {
    /// Whether this descriptor has outlived `PEER_TTL_SECS`.
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        (now - self.cached_at).num_seconds() > PEER_TTL_SECS
    }
}
