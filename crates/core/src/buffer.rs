//! Bounded, priority-aware asynchronous chunk queue with underrun/overflow
//! policies, adaptive quality degradation, and health monitoring.
//!
//! Grounded on spec §4.B and the original `FastStreamBuffer`/
//! `QualityController`: the quality table's exact thresholds and the EMA
//! smoothing factor (`alpha = 0.1`) are carried over unchanged.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{BufferConfig, BufferState, MediaKind, Metadata, StreamChunk};
use crate::transport::SourceProducer;

/// One of the four adaptive-quality tiers, chosen from current health and latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QualityLevel {
    /// Health > 80%, latency < 50ms.
    Ultra,
    /// Health > 60%, latency < 100ms.
    High,
    /// Health > 40%, latency < 200ms.
    Medium,
    /// Anything worse.
    Low,
}

impl QualityLevel {
    /// Fraction of the original bitrate this level targets.
    pub fn bitrate_factor(self) -> f64 {
        match self {
            QualityLevel::Ultra => 1.0,
            QualityLevel::High => 0.8,
            QualityLevel::Medium => 0.6,
            QualityLevel::Low => 0.4,
        }
    }

    /// Fraction of payload bytes the adapter aims to shed at this level.
    pub fn compression(self) -> f64 {
        match self {
            QualityLevel::Ultra => 0.0,
            QualityLevel::High => 0.1,
            QualityLevel::Medium => 0.2,
            QualityLevel::Low => 0.3,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            QualityLevel::Ultra => "ultra",
            QualityLevel::High => "high",
            QualityLevel::Medium => "medium",
            QualityLevel::Low => "low",
        }
    }
}

/// Selects a `QualityLevel` from health/latency and (optionally) shrinks a
/// chunk's payload to match it.
#[derive(Debug, Default, Clone, Copy)]
pub struct QualityController;

impl QualityController {
    /// Choose the active level per the health/latency table (§4.B.1).
    pub fn level_for(&self, health_percent: f64, avg_latency_ms: f64) -> QualityLevel {
        if health_percent > 80.0 && avg_latency_ms < 50.0 {
            QualityLevel::Ultra
        } else if health_percent > 60.0 && avg_latency_ms < 100.0 {
            QualityLevel::High
        } else if health_percent > 40.0 && avg_latency_ms < 200.0 {
            QualityLevel::Medium
        } else {
            QualityLevel::Low
        }
    }

    /// Degrade a chunk's payload to the given ratio, tagging its metadata
    /// with the chosen level. Modeled as an opaque, codec-independent hook
    /// per §4.B.1 — the byte-level shrink is a uniform truncation
    /// placeholder standing in for a real codec-aware implementation.
    ///
    /// A degradation failure is non-fatal: the caller falls back to
    /// forwarding the original chunk unchanged.
    pub fn degrade(&self, mut chunk: StreamChunk, level: QualityLevel) -> StreamChunk {
        let ratio = 1.0 - level.compression();
        if ratio < 1.0 {
            let keep = ((chunk.data.len() as f64) * ratio).round() as usize;
            chunk.data = chunk.data.slice(0..keep.min(chunk.data.len()));
        }
        chunk
            .metadata
            .insert("quality_level".to_string(), serde_json::json!(level.as_str()));
        chunk
    }
}

/// Point-in-time statistics for one `FastStreamBuffer`.
#[derive(Debug, Clone, Default)]
pub struct BufferStats {
    /// Chunks successfully enqueued.
    pub chunks_produced: u64,
    /// Chunks successfully dequeued.
    pub chunks_consumed: u64,
    /// Chunks dropped by the overflow policy.
    pub chunks_dropped: u64,
    /// Times the consumer found the buffer empty while streaming.
    pub underruns: u64,
    /// Times the overflow policy was invoked.
    pub overflows: u64,
    /// Exponential moving average (alpha=0.1) of dequeued chunk age, in ms.
    pub avg_latency_ms: f64,
}

/// Full read-only snapshot of a buffer's state.
#[derive(Debug, Clone)]
pub struct BufferInfo {
    /// Current lifecycle state.
    pub state: BufferState,
    /// Current chunk count.
    pub level: usize,
    /// Percentage of target fill level: `min(100, level / target_size * 100)`.
    pub health_percent: f64,
    /// Latest statistics.
    pub stats: BufferStats,
    /// Config in effect.
    pub config: BufferConfig,
}

#[derive(Debug)]
struct Inner {
    state: BufferState,
    deque: VecDeque<StreamChunk>,
    stats: BufferStats,
}

/// Bounded producer/consumer chunk queue, exclusively owned by one
/// `BufferManager` slot.
#[derive(Debug)]
pub struct FastStreamBuffer {
    config: Mutex<BufferConfig>,
    inner: Mutex<Inner>,
    sequence: AtomicU64,
    quality: QualityController,
    chunk_tx: broadcast::Sender<StreamChunk>,
    state_tx: broadcast::Sender<BufferState>,
    stats_tx: broadcast::Sender<BufferStats>,
    producer: Mutex<Option<JoinHandle<()>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    dequeuer: Mutex<Option<JoinHandle<()>>>,
}

impl FastStreamBuffer {
    /// Construct a buffer under `config`. Returns `Config` if the sizing
    /// invariant (`0 < min_size <= target_size <= max_size`) is violated.
    pub fn new(config: BufferConfig) -> Result<Arc<Self>> {
        config.validate().map_err(Error::Config)?;
        let (chunk_tx, _) = broadcast::channel(256);
        let (state_tx, _) = broadcast::channel(32);
        let (stats_tx, _) = broadcast::channel(32);
        Ok(Arc::new(Self {
            config: Mutex::new(config),
            inner: Mutex::new(Inner {
                state: BufferState::Idle,
                deque: VecDeque::new(),
                stats: BufferStats::default(),
            }),
            sequence: AtomicU64::new(0),
            quality: QualityController,
            chunk_tx,
            state_tx,
            stats_tx,
            producer: Mutex::new(None),
            consumer: Mutex::new(None),
            dequeuer: Mutex::new(None),
        }))
    }

    /// Current effective config (may have been auto-tuned by a `BufferManager`).
    pub fn config(&self) -> BufferConfig {
        self.config.lock().clone()
    }

    /// Replace the effective config (used by `BufferManager` optimization).
    pub fn set_config(&self, config: BufferConfig) {
        *self.config.lock() = config;
    }

    /// Subscribe to individual dequeued chunks.
    pub fn on_chunk(&self) -> broadcast::Receiver<StreamChunk> {
        self.chunk_tx.subscribe()
    }

    /// Subscribe to state transitions.
    pub fn on_state(&self) -> broadcast::Receiver<BufferState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to statistics snapshots, published on every dequeue.
    pub fn on_stats(&self) -> broadcast::Receiver<BufferStats> {
        self.stats_tx.subscribe()
    }

    /// Current chunk count.
    pub fn level(&self) -> usize {
        self.inner.lock().deque.len()
    }

    /// Buffer health: `min(100, level / target_size * 100)`.
    pub fn health_percent(&self) -> f64 {
        let level = self.level() as f64;
        let target = self.config.lock().target_size as f64;
        if target == 0.0 {
            return 0.0;
        }
        (level / target * 100.0).min(100.0)
    }

    /// EMA of dequeued chunk age in milliseconds.
    pub fn avg_latency_ms(&self) -> f64 {
        self.inner.lock().stats.avg_latency_ms
    }

    /// Full read-only snapshot.
    pub fn info(&self) -> BufferInfo {
        let inner = self.inner.lock();
        BufferInfo {
            state: inner.state,
            level: inner.deque.len(),
            health_percent: self.health_percent(),
            stats: inner.stats.clone(),
            config: self.config.lock().clone(),
        }
    }

    fn set_state(&self, state: BufferState) {
        { use std::io::Write; let mut f = std::fs::OpenOptions::new().create(true).append(true).open("/tmp/dbg.log").unwrap(); writeln!(f, "set_state enter {:?}", state).unwrap(); }
        let mut inner = self.inner.lock();
        if inner.state != state {
            inner.state = state;
            let _ = self.state_tx.send(state);
        }
    }

    /// Begin consuming from `source`. Fails with `AlreadyActive` unless the
    /// buffer is `idle`. On success, state becomes `filling`.
    pub fn start(self: &Arc<Self>, mut source: Box<dyn SourceProducer>) -> Result<()> {
        {
            let inner = self.inner.lock();
            if inner.state != BufferState::Idle {
                return Err(Error::AlreadyActive("buffer is not idle".into()));
            }
        }
        self.set_state(BufferState::Filling);

        let (block_tx, mut block_rx) = tokio::sync::mpsc::channel::<bytes::Bytes>(
            self.config.lock().max_concurrent_chunks.max(1),
        );

        let producer_handle = tokio::spawn(async move {
            loop {
                match source.next_block().await {
                    Ok(Some(block)) => {
                        if block_tx.send(block).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(%err, "source producer failed");
                        break;
                    }
                }
            }
        });
        *self.producer.lock() = Some(producer_handle);

        let this = self.clone();
        let consumer_handle = tokio::spawn(async move {
            while let Some(block) = block_rx.recv().await {
                this.enqueue(block);
            }
        });
        *self.consumer.lock() = Some(consumer_handle);

        // Dequeuer loop (§4.B): repeatedly dequeue one chunk so chunk/stats
        // subscribers and any downstream forwarder actually receive data,
        // yielding briefly on an empty buffer instead of busy-spinning.
        let this = self.clone();
        let dequeuer_handle = tokio::spawn(async move {
            loop {
                if this.dequeue_one().is_none() {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        });
        *self.dequeuer.lock() = Some(dequeuer_handle);

        Ok(())
    }

    fn enqueue(self: &Arc<Self>, data: bytes::Bytes) {
        { use std::io::Write; let mut f = std::fs::OpenOptions::new().create(true).append(true).open("/tmp/dbg.log").unwrap(); writeln!(f, "enqueue enter").unwrap(); }
        let now = Instant::now();
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let duration_ms = self.config.lock().chunk_duration_ms;
        let chunk = StreamChunk::new(data, seq, MediaKind::Audio, duration_ms, now);

        let max_size = self.config.lock().max_size;
        let drop_on_overflow = self.config.lock().drop_on_overflow;

        let mut inner = self.inner.lock();
        if inner.deque.len() < max_size {
            inner.deque.push_back(chunk);
            inner.stats.chunks_produced += 1;
        } else {
            inner.stats.chunks_dropped += 1;
            inner.stats.overflows += 1;
            if drop_on_overflow {
                inner.deque.pop_front();
                inner.deque.push_back(chunk);
                inner.stats.chunks_produced += 1;
            }
            drop(inner);
            self.set_state(BufferState::Overflow);
            let level = self.level();
            self.resettle_state(level);
            return;
        }

        let level = inner.deque.len();
        let min_size = self.config.lock().min_size;
        let target_size = self.config.lock().target_size;
        let current_state = inner.state;
        drop(inner);

        match current_state {
            BufferState::Filling if level >= min_size => self.set_state(BufferState::Ready),
            BufferState::Ready | BufferState::Streaming | BufferState::Underrun
                if level >= target_size =>
            {
                self.set_state(BufferState::Streaming)
            }
            _ => {}
        }
    }

    fn resettle_state(&self, level: usize) {
        let target_size = self.config.lock().target_size;
        if level >= target_size {
            self.set_state(BufferState::Streaming);
        } else {
            let min_size = self.config.lock().min_size;
            if level >= min_size {
                self.set_state(BufferState::Ready);
            } else {
                self.set_state(BufferState::Filling);
            }
        }
    }

    /// Dequeue one chunk per `prioritize_recent`, running it through the
    /// quality adapter, updating EMA latency, and publishing to subscribers.
    ///
    /// Returns `None` if the buffer was empty (the caller decides whether
    /// that constitutes an underrun based on current state).
    pub fn dequeue_one(&self) -> Option<StreamChunk> {
        { use std::io::Write; let mut f = std::fs::OpenOptions::new().create(true).append(true).open("/tmp/dbg.log").unwrap(); writeln!(f, "dequeue_one enter").unwrap(); }
        let prioritize_recent = self.config.lock().prioritize_recent;
        let underrun_threshold = self.config.lock().underrun_threshold;
        let target_size = self.config.lock().target_size;
        let max_latency_ms = self.config.lock().max_latency_ms;
        let adaptive = self.config.lock().adaptive_quality;

        let chunk = {
            let mut inner = self.inner.lock();
            let chunk = if prioritize_recent {
                inner.deque.pop_back()
            } else {
                inner.deque.pop_front()
            };
            match chunk {
                Some(chunk) => {
                    inner.stats.chunks_consumed += 1;
                    if inner.state == BufferState::Streaming && inner.deque.len() <= underrun_threshold
                    {
                        inner.state = BufferState::Underrun;
                        inner.stats.underruns += 1;
                        let _ = self.state_tx.send(BufferState::Underrun);
                    }
                    Some(chunk)
                }
                None => {
                    if inner.state == BufferState::Streaming {
                        inner.state = BufferState::Underrun;
                        inner.stats.underruns += 1;
                        let _ = self.state_tx.send(BufferState::Underrun);
                    }
                    None
                }
            }
        };

        let chunk = chunk?;
        let now = Instant::now();
        let age_ms = chunk.age_ms(now);
        if age_ms > max_latency_ms as f64 {
            warn!(age_ms, max_latency_ms, "chunk exceeded max latency");
        }

        let health = self.health_percent();
        let level = if age_ms > max_latency_ms as f64 {
            QualityLevel::Low
        } else {
            self.quality.level_for(health, self.avg_latency_ms())
        };
        let chunk = if adaptive {
            self.quality.degrade(chunk, level)
        } else {
            chunk
        };

        {
            let mut inner = self.inner.lock();
            let alpha = 0.1;
            inner.stats.avg_latency_ms = if inner.stats.chunks_consumed <= 1 {
                age_ms
            } else {
                alpha * age_ms + (1.0 - alpha) * inner.stats.avg_latency_ms
            };
            let level_now = inner.deque.len();
            if inner.state == BufferState::Underrun && level_now >= target_size {
                inner.state = BufferState::Streaming;
                let _ = self.state_tx.send(BufferState::Streaming);
            }
            let _ = self.stats_tx.send(inner.stats.clone());
        }

        let _ = self.chunk_tx.send(chunk.clone());
        debug!(sequence = chunk.sequence, age_ms, "dequeued chunk");
        Some(chunk)
    }

    /// Cancel producer, consumer, and any monitor; drain buffered chunks;
    /// return to `idle`. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.producer.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.consumer.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.dequeuer.lock().take() {
            handle.abort();
        }
        let mut inner = self.inner.lock();
        inner.deque.clear();
        inner.state = BufferState::Idle;
        let _ = self.state_tx.send(BufferState::Idle);
    }
}

/// Free-form metadata helper for tests and callers constructing chunks by hand.
pub fn empty_metadata() -> Metadata {
    Metadata::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BufferConfig;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct VecSource {
        blocks: StdMutex<VecDeque<bytes::Bytes>>,
    }

    #[async_trait]
    impl SourceProducer for VecSource {
        async fn next_block(&mut self) -> Result<Option<bytes::Bytes>> {
            Ok(self.blocks.lock().unwrap().pop_front())
        }
    }

    fn source(blocks: Vec<&'static [u8]>) -> Box<dyn SourceProducer> {
        Box::new(VecSource {
            blocks: StdMutex::new(blocks.into_iter().map(bytes::Bytes::from_static).collect()),
        })
    }

    #[tokio::test]
    async fn basic_flow_enqueues_and_dequeues_in_order() {
        let cfg = BufferConfig {
            max_size: 4,
            min_size: 2,
            target_size: 3,
            prioritize_recent: false,
            drop_on_overflow: true,
            adaptive_quality: false,
            ..BufferConfig::default()
        };
        let buffer = FastStreamBuffer::new(cfg).unwrap();
        let mut chunks = buffer.on_chunk();
        buffer.start(source(vec![b"A", b"B", b"C"])).unwrap();

        let a = tokio::time::timeout(std::time::Duration::from_secs(1), chunks.recv())
            .await
            .expect("chunk A not dequeued in time")
            .unwrap();
        let b = tokio::time::timeout(std::time::Duration::from_secs(1), chunks.recv())
            .await
            .expect("chunk B not dequeued in time")
            .unwrap();
        let c = tokio::time::timeout(std::time::Duration::from_secs(1), chunks.recv())
            .await
            .expect("chunk C not dequeued in time")
            .unwrap();

        assert_eq!(&a.data[..], b"A");
        assert_eq!(&b.data[..], b"B");
        assert_eq!(&c.data[..], b"C");
        assert_eq!(buffer.info().stats.overflows, 0);
        buffer.stop();
    }

    #[test]
    fn overflow_with_prioritize_recent_keeps_newest() {
        let cfg = BufferConfig {
            max_size: 2,
            min_size: 1,
            target_size: 2,
            prioritize_recent: true,
            drop_on_overflow: true,
            adaptive_quality: false,
            ..BufferConfig::default()
        };
        let buffer = FastStreamBuffer::new(cfg).unwrap();
        for data in [b"A" as &[u8], b"B", b"C", b"D"] {
            buffer.enqueue(bytes::Bytes::from_static(data));
        }

        assert_eq!(buffer.info().stats.chunks_dropped, 2);
        assert_eq!(buffer.info().stats.overflows, 2);

        let first = buffer.dequeue_one().unwrap();
        let second = buffer.dequeue_one().unwrap();
        assert_eq!(&first.data[..], b"D");
        assert_eq!(&second.data[..], b"C");
    }

    #[test]
    fn quality_levels_match_the_health_latency_table() {
        let qc = QualityController;
        assert_eq!(qc.level_for(85.0, 10.0), QualityLevel::Ultra);
        assert_eq!(qc.level_for(65.0, 90.0), QualityLevel::High);
        assert_eq!(qc.level_for(45.0, 150.0), QualityLevel::Medium);
        assert_eq!(qc.level_for(10.0, 500.0), QualityLevel::Low);
    }

    #[test]
    fn invalid_config_rejected_at_construction() {
        let cfg = BufferConfig {
            min_size: 10,
            target_size: 5,
            max_size: 20,
            ..BufferConfig::default()
        };
        assert!(FastStreamBuffer::new(cfg).is_err());
    }
}
