//! Bounded LRU cache from opaque peer handles to resolved descriptors,
//! with a secondary username index and best-effort TTL expiry.
//!
//! Grounded on the original implementation's `CacheManager`: eviction picks
//! the entry with the lowest access count, breaking ties by oldest
//! timestamp; hit/miss/eviction counters are exposed via `stats()`.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use async_trait::async_trait;

use crate::error::Result;
use crate::model::PeerDescriptor;

/// External resolver consulted on cache miss.
#[async_trait]
pub trait PeerResolver: Send + Sync {
    /// Resolve a peer handle to its descriptor.
    async fn resolve(&self, peer_id: i64) -> Result<PeerDescriptor>;
}

struct Entry {
    descriptor: PeerDescriptor,
    access_count: u64,
    inserted_at: chrono::DateTime<chrono::Utc>,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Cache hits.
    pub hits: u64,
    /// Cache misses (expired or absent).
    pub misses: u64,
    /// Resolver errors encountered.
    pub errors: u64,
    /// Evictions performed to stay under `max_size`.
    pub evictions: u64,
    /// Current entry count.
    pub size: usize,
}

/// Bounded LRU cache over `peer_id -> PeerDescriptor`, TTL 24h (§4.G).
pub struct PeerCache {
    max_size: usize,
    entries: DashMap<i64, Mutex<Entry>>,
    username_index: DashMap<String, i64>,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    evictions: AtomicU64,
}

impl PeerCache {
    /// Construct a cache holding at most `max_size` descriptors.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            entries: DashMap::new(),
            username_index: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Resolve `peer_id`, consulting the cache first.
    ///
    /// On a cache hit within TTL, returns the cached descriptor without
    /// calling `resolver` (law L4). On miss or expiry, calls `resolver`,
    /// caches the result, and returns it.
    pub async fn resolve(
        &self,
        peer_id: i64,
        resolver: &dyn PeerResolver,
    ) -> Result<PeerDescriptor> {
        let now = chrono::Utc::now();
        if let Some(entry) = self.entries.get(&peer_id) {
            let mut guard = entry.lock();
            if !guard.descriptor.is_expired(now) {
                guard.access_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(guard.descriptor.clone());
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        drop(self.entries.remove(&peer_id));

        match resolver.resolve(peer_id).await {
            Ok(descriptor) => {
                self.insert(descriptor.clone());
                Ok(descriptor)
            }
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Insert or replace a descriptor directly, without resolving.
    pub fn insert(&self, descriptor: PeerDescriptor) {
        if self.entries.len() >= self.max_size && !self.entries.contains_key(&descriptor.peer_id) {
            self.evict_lru();
        }
        if let Some(username) = descriptor.username.clone() {
            self.username_index.insert(username, descriptor.peer_id);
        }
        self.entries.insert(
            descriptor.peer_id,
            Mutex::new(Entry {
                descriptor,
                access_count: 0,
                inserted_at: chrono::Utc::now(),
            }),
        );
    }

    /// Look up a peer id by username, without touching hit/miss counters.
    pub fn peer_id_for_username(&self, username: &str) -> Option<i64> {
        self.username_index.get(username).map(|v| *v)
    }

    fn evict_lru(&self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| {
                let guard = entry.value().lock();
                (guard.access_count, guard.inserted_at)
            })
            .map(|entry| *entry.key());
        if let Some(peer_id) = victim {
            self.entries.remove(&peer_id);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop all entries whose TTL has elapsed. Best-effort, intended to run
    /// on a low-frequency timer.
    pub fn clear_expired(&self) {
        let now = chrono::Utc::now();
        let expired: Vec<i64> = self
            .entries
            .iter()
            .filter(|entry| entry.value().lock().descriptor.is_expired(now))
            .map(|entry| *entry.key())
            .collect();
        for peer_id in expired {
            self.entries.remove(&peer_id);
        }
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PeerKind;
    use std::sync::atomic::AtomicU64 as Counter;
    use std::sync::Arc;

    struct CountingResolver {
        calls: Arc<Counter>,
    }

    #[async_trait]
    impl PeerResolver for CountingResolver {
        async fn resolve(&self, peer_id: i64) -> Result<PeerDescriptor> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PeerDescriptor {
                peer_id,
                access_hash: None,
                kind: PeerKind::User,
                title: None,
                username: None,
                cached_at: chrono::Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn resolve_twice_within_ttl_calls_resolver_once() {
        let cache = PeerCache::new(10);
        let calls = Arc::new(Counter::new(0));
        let resolver = CountingResolver { calls: calls.clone() };

        cache.resolve(1, &resolver).await.unwrap();
        cache.resolve(1, &resolver).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn eviction_respects_max_size() {
        let cache = PeerCache::new(2);
        let calls = Arc::new(Counter::new(0));
        let resolver = CountingResolver { calls };

        cache.resolve(1, &resolver).await.unwrap();
        cache.resolve(2, &resolver).await.unwrap();
        cache.resolve(3, &resolver).await.unwrap();

        assert_eq!(cache.stats().size, 2);
        assert_eq!(cache.stats().evictions, 1);
    }
}
