//! Fleet of `FastStreamBuffer`s keyed by opaque string id: admission,
//! eviction, aggregated telemetry, and deterministic auto-tuning.
//!
//! Grounded on the original `BufferManager`: the priority-config synthesis
//! table, the monitor/optimization cadence (2s / 30s), and the
//! optimization thresholds are carried over with the same numbers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use callcore::buffer::{BufferInfo, FastStreamBuffer};
use callcore::model::{BufferConfig, BufferPriority, BufferState, Metadata};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{FleetError, FleetResult};

/// Fleet-wide knobs (§6 configuration table).
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Upper bound on concurrent buffers.
    pub max_buffers: usize,
    /// Soft ceiling on estimated total memory; triggers optimization when exceeded.
    pub memory_limit_mb: f64,
    /// Telemetry cadence.
    pub monitor_interval: Duration,
    /// Minimum spacing between auto-tuning runs.
    pub optimization_interval: Duration,
    /// Whether autonomic tuning is enabled at all.
    pub auto_optimize: bool,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_buffers: 50,
            memory_limit_mb: 500.0,
            monitor_interval: Duration::from_secs(2),
            optimization_interval: Duration::from_secs(30),
            auto_optimize: true,
        }
    }
}

/// One fleet-managed buffer plus its bookkeeping.
pub struct FleetEntry {
    /// The managed buffer itself.
    pub buffer: Arc<FastStreamBuffer>,
    /// Admission priority; governs eviction order.
    pub priority: BufferPriority,
    /// Free-form metadata supplied at creation, updated with the latest
    /// observed state on every monitoring pass.
    pub metadata: Metadata,
}

/// Aggregate statistics across the whole fleet, published on each monitor tick.
#[derive(Debug, Clone, Default)]
pub struct AggregateStats {
    /// Total managed buffers.
    pub total_buffers: usize,
    /// Buffers with health > 70%.
    pub healthy_buffers: usize,
    /// Buffers currently underrunning.
    pub underrun_buffers: usize,
    /// Buffers currently overflowing.
    pub overflow_buffers: usize,
    /// Mean health across all buffers.
    pub avg_health: f64,
    /// Mean latency across all buffers, in ms.
    pub avg_latency_ms: f64,
    /// Sum of per-buffer throughput estimates (chunks/sec equivalent via consumed count).
    pub total_throughput: f64,
    /// Estimated total memory in MB (`chunks_in_buffer * 0.1`).
    pub estimated_memory_mb: f64,
}

/// Synthesize a per-priority config when the caller doesn't supply one
/// (scenario S3): critical gets the smallest size/tightest latency, low
/// the largest size/loosest latency.
fn config_for_priority(priority: BufferPriority) -> BufferConfig {
    let (max_size, target_size, chunk_duration_ms, max_latency_ms) = match priority {
        BufferPriority::Critical => (100, 40, 10, 50),
        BufferPriority::High => (80, 30, 15, 80),
        BufferPriority::Normal => (50, 20, 20, 100),
        BufferPriority::Low => (30, 10, 30, 200),
    };
    BufferConfig {
        max_size,
        min_size: (target_size / 4).max(1),
        target_size,
        chunk_duration_ms,
        max_latency_ms,
        ..BufferConfig::default()
    }
}

struct Fleet {
    entries: HashMap<String, FleetEntry>,
    last_optimization: Option<Instant>,
}

/// Fleet-wide scheduler that multiplexes many buffers under a memory
/// budget, evicts low-priority streams when exhausted, and auto-tunes
/// per-stream parameters based on aggregate health.
pub struct BufferManager {
    config: FleetConfig,
    fleet: Mutex<Fleet>,
    stats_tx: broadcast::Sender<AggregateStats>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl BufferManager {
    /// Construct a manager under `config`.
    pub fn new(config: FleetConfig) -> Arc<Self> {
        let (stats_tx, _) = broadcast::channel(32);
        Arc::new(Self {
            config,
            fleet: Mutex::new(Fleet {
                entries: HashMap::new(),
                last_optimization: None,
            }),
            stats_tx,
            monitor: Mutex::new(None),
        })
    }

    /// Subscribe to aggregate statistics, published once per monitor tick.
    pub fn on_stats(&self) -> broadcast::Receiver<AggregateStats> {
        self.stats_tx.subscribe()
    }

    /// Number of currently managed buffers.
    pub fn buffer_count(&self) -> usize {
        self.fleet.lock().entries.len()
    }

    /// Admit a new buffer under `id`. If the fleet is at `max_buffers`,
    /// attempts to evict the lowest-priority non-critical buffer first;
    /// refuses (returns `FleetFull`) if none is evictable.
    pub fn create_buffer(
        &self,
        id: impl Into<String>,
        cfg: Option<BufferConfig>,
        priority: BufferPriority,
        metadata: Option<Metadata>,
    ) -> FleetResult<Arc<FastStreamBuffer>> {
        let id = id.into();
        {
            let mut fleet = self.fleet.lock();
            if fleet.entries.len() >= self.config.max_buffers {
                let victim = fleet
                    .entries
                    .iter()
                    .filter(|(_, entry)| entry.priority < BufferPriority::Critical)
                    .min_by_key(|(_, entry)| entry.priority)
                    .map(|(id, _)| id.clone());
                match victim {
                    Some(victim_id) => {
                        if let Some(entry) = fleet.entries.remove(&victim_id) {
                            entry.buffer.stop();
                            info!(buffer_id = %victim_id, "evicted to admit new buffer");
                        }
                    }
                    None => return Err(FleetError::FleetFull),
                }
            }
        }

        let config = cfg.unwrap_or_else(|| config_for_priority(priority));
        let buffer = FastStreamBuffer::new(config)?;

        let mut fleet = self.fleet.lock();
        fleet.entries.insert(
            id,
            FleetEntry {
                buffer: buffer.clone(),
                priority,
                metadata: metadata.unwrap_or_default(),
            },
        );
        Ok(buffer)
    }

    /// Remove and stop a buffer. Returns whether one was found.
    pub fn remove_buffer(&self, id: &str) -> bool {
        let removed = self.fleet.lock().entries.remove(id);
        if let Some(entry) = removed {
            entry.buffer.stop();
            true
        } else {
            false
        }
    }

    /// Look up a managed buffer by id.
    pub fn get_buffer(&self, id: &str) -> Option<Arc<FastStreamBuffer>> {
        self.fleet.lock().entries.get(id).map(|entry| entry.buffer.clone())
    }

    /// All currently managed buffer ids.
    pub fn list_buffers(&self) -> Vec<String> {
        self.fleet.lock().entries.keys().cloned().collect()
    }

    /// Full info snapshot for one managed buffer.
    pub fn get_buffer_info(&self, id: &str) -> Option<BufferInfo> {
        self.fleet.lock().entries.get(id).map(|entry| entry.buffer.info())
    }

    /// Stop and remove every managed buffer.
    pub fn cleanup_all(&self) {
        let mut fleet = self.fleet.lock();
        for (_, entry) in fleet.entries.drain() {
            entry.buffer.stop();
        }
    }

    /// One pass of the monitoring loop: categorize buffers, publish
    /// aggregate stats, and run optimization if warranted.
    fn monitor_tick(&self) {
        let mut total_health = 0.0;
        let mut total_latency = 0.0;
        let mut total_throughput = 0.0;
        let mut estimated_memory_mb = 0.0;
        let mut healthy = 0;
        let mut underrun = 0;
        let mut overflow = 0;

        let mut fleet = self.fleet.lock();
        let total_buffers = fleet.entries.len();
        for entry in fleet.entries.values_mut() {
            let info = entry.buffer.info();
            total_health += info.health_percent;
            total_latency += info.stats.avg_latency_ms;
            total_throughput += info.stats.chunks_consumed as f64;
            estimated_memory_mb += info.level as f64 * 0.1;
            if info.health_percent > 70.0 {
                healthy += 1;
            }
            match info.state {
                BufferState::Underrun => underrun += 1,
                BufferState::Overflow => overflow += 1,
                _ => {}
            }
            entry
                .metadata
                .insert("last_state".to_string(), serde_json::json!(format!("{:?}", info.state)));
            entry.metadata.insert(
                "last_state_time".to_string(),
                serde_json::json!(chrono::Utc::now().to_rfc3339()),
            );
        }

        let avg_health = if total_buffers > 0 { total_health / total_buffers as f64 } else { 0.0 };
        let avg_latency_ms = if total_buffers > 0 { total_latency / total_buffers as f64 } else { 0.0 };

        let stats = AggregateStats {
            total_buffers,
            healthy_buffers: healthy,
            underrun_buffers: underrun,
            overflow_buffers: overflow,
            avg_health,
            avg_latency_ms,
            total_throughput,
            estimated_memory_mb,
        };
        let _ = self.stats_tx.send(stats.clone());

        if !self.config.auto_optimize {
            return;
        }
        let should_optimize = fleet
            .last_optimization
            .map(|at| at.elapsed() >= self.config.optimization_interval)
            .unwrap_or(true)
            && (avg_health < 60.0
                || avg_latency_ms > 150.0
                || underrun > 0
                || estimated_memory_mb > self.config.memory_limit_mb);

        if should_optimize {
            for entry in fleet.entries.values_mut() {
                optimize_entry(entry);
            }
            fleet.last_optimization = Some(Instant::now());
            debug!("ran fleet optimization pass");
        }
    }

    /// Start the background monitoring task. Idempotent: a second call
    /// while already running is a no-op.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }
        let this = self.clone();
        let interval = self.config.monitor_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.monitor_tick();
            }
        });
        *monitor = Some(handle);
    }

    /// Stop the background monitoring task, if running.
    pub fn stop_monitoring(&self) {
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
    }
}

/// Deterministic per-buffer optimization step (§4.D):
/// - health < 50: widen `max_size` by 20 (cap 200), `target_size <- 0.6 * max_size`.
/// - else health > 90 and priority low: shrink `max_size` by 10 (floor 20).
/// - latency > 200ms: widen `max_latency_ms` by 20 (cap 300) and `chunk_duration_ms` by 5 (cap 50).
fn optimize_entry(entry: &mut FleetEntry) {
    let info = entry.buffer.info();
    let mut cfg = info.config;

    if info.health_percent < 50.0 {
        cfg.max_size = (cfg.max_size + 20).min(200);
        cfg.target_size = ((cfg.max_size as f64) * 0.6) as usize;
    } else if info.health_percent > 90.0 && entry.priority == BufferPriority::Low {
        cfg.max_size = cfg.max_size.saturating_sub(10).max(20);
    }

    if info.stats.avg_latency_ms > 200.0 {
        cfg.max_latency_ms = (cfg.max_latency_ms + 20).min(300);
        cfg.chunk_duration_ms = (cfg.chunk_duration_ms + 5).min(50);
    }

    entry.buffer.set_config(cfg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_config_matches_scenario_s3() {
        let critical = config_for_priority(BufferPriority::Critical);
        assert_eq!(critical.max_size, 100);
        assert_eq!(critical.target_size, 40);
        assert_eq!(critical.chunk_duration_ms, 10);
        assert_eq!(critical.max_latency_ms, 50);

        let low = config_for_priority(BufferPriority::Low);
        assert_eq!(low.max_size, 30);
        assert_eq!(low.target_size, 10);
        assert_eq!(low.chunk_duration_ms, 30);
        assert_eq!(low.max_latency_ms, 200);
    }

    #[test]
    fn eviction_admits_higher_priority_buffer() {
        let manager = BufferManager::new(FleetConfig {
            max_buffers: 2,
            ..FleetConfig::default()
        });

        manager.create_buffer("a", None, BufferPriority::Normal, None).unwrap();
        manager.create_buffer("b", None, BufferPriority::Low, None).unwrap();
        manager.create_buffer("c", None, BufferPriority::High, None).unwrap();

        let mut ids = manager.list_buffers();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn fleet_full_refuses_when_everything_is_critical() {
        let manager = BufferManager::new(FleetConfig {
            max_buffers: 1,
            ..FleetConfig::default()
        });
        manager.create_buffer("a", None, BufferPriority::Critical, None).unwrap();
        let err = manager
            .create_buffer("b", None, BufferPriority::Critical, None)
            .unwrap_err();
        assert!(matches!(err, FleetError::FleetFull));
    }

    #[test]
    fn create_buffer_never_exceeds_max_buffers() {
        let manager = BufferManager::new(FleetConfig {
            max_buffers: 3,
            ..FleetConfig::default()
        });
        for i in 0..5 {
            let _ = manager.create_buffer(format!("b{i}"), None, BufferPriority::Normal, None);
            assert!(manager.buffer_count() <= 3);
        }
    }
}
