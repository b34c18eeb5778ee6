//! TTL and size bounded key/value store.
//!
//! [`CacheStore`] knows nothing about endpoints or tables: keys are opaque
//! strings and values are encoded payloads. It owns expiry, the byte budget,
//! the entry-count budget and the hit/miss counters.
//!
//! ## Eviction
//!
//! When a `set` pushes the store over either budget, entries are removed in
//! **insertion order** (oldest first) until the store is back under
//! `eviction_target_ratio` of both budgets. This is not LRU: reads do not
//! refresh an entry's position, and overwriting a key moves it to the back as
//! a fresh insertion. The entry written by the triggering `set` is never
//! evicted by it, so a single value larger than the whole budget is accepted
//! and leaves the store holding only that value.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::CacheSettings;
use crate::metrics;

/// Limits applied by a [`CacheStore`].
#[derive(Debug, Clone)]
pub struct StoreLimits {
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    pub max_size_bytes: usize,
    pub max_entries: usize,
    pub eviction_target_ratio: f64,
}

impl StoreLimits {
    /// TTL for a `set`, clamped to `max_ttl`.
    fn effective_ttl(&self, ttl: Option<Duration>) -> Duration {
        ttl.unwrap_or(self.default_ttl).min(self.max_ttl)
    }

    fn target_size_bytes(&self) -> usize {
        (self.max_size_bytes as f64 * self.eviction_target_ratio) as usize
    }

    fn target_entries(&self) -> usize {
        ((self.max_entries as f64 * self.eviction_target_ratio) as usize).max(1)
    }
}

impl From<&CacheSettings> for StoreLimits {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            default_ttl: settings.default_ttl(),
            max_ttl: settings.max_ttl(),
            max_size_bytes: settings.max_size_bytes,
            max_entries: settings.max_entries,
            eviction_target_ratio: settings.eviction_target_ratio,
        }
    }
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

/// A cached entry with TTL support.
///
/// The data is wrapped in `Arc` so hits hand out the payload without copying.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub value: Arc<Vec<u8>>,
    pub created_at: Instant,
    pub ttl: Duration,
    /// Key length plus encoded payload length.
    pub size_bytes: usize,
}

impl CacheEntry {
    fn new(value: Vec<u8>, ttl: Duration, size_bytes: usize) -> Self {
        Self {
            value: Arc::new(value),
            created_at: Instant::now(),
            ttl,
            size_bytes,
        }
    }

    /// Check if this entry has expired.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

/// Point-in-time view of one entry, for diagnostics.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub key: String,
    pub size_bytes: usize,
    pub age: Duration,
    pub expired: bool,
}

/// Cache statistics counters.
///
/// Only the store's own set/get/del/expire/clear paths mutate these.
#[derive(Debug, Default)]
struct CacheStatistics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    total_cached: AtomicUsize,
    current_size_bytes: AtomicUsize,
}

impl CacheStatistics {
    fn snapshot(&self) -> CacheStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStatsSnapshot {
            hits,
            misses,
            total_cached: self.total_cached.load(Ordering::Relaxed),
            current_size_bytes: self.current_size_bytes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
        self.total_cached.store(0, Ordering::Relaxed);
        self.current_size_bytes.store(0, Ordering::Relaxed);
    }
}

/// A point-in-time snapshot of cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Number of entries currently held.
    pub total_cached: usize,
    pub current_size_bytes: usize,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_ratio: f64,
}

struct StoreInner {
    entries: IndexMap<String, CacheEntry>,
    size_bytes: usize,
}

/// Thread-safe TTL + size bounded store with insertion-order eviction.
///
/// A single mutex guards the entry map because eviction order is global
/// across all keys; every operation under it is in-memory and short.
pub struct CacheStore {
    inner: Mutex<StoreInner>,
    limits: StoreLimits,
    stats: CacheStatistics,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("limits", &self.limits)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl CacheStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entries: IndexMap::new(),
                size_bytes: 0,
            }),
            limits,
            stats: CacheStatistics::default(),
        }
    }

    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    /// Get a value from the store.
    ///
    /// Expired entries count as a miss and are removed on the spot.
    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let lookup = inner
            .entries
            .get(key)
            .map(|entry| (entry.is_expired(now), Arc::clone(&entry.value)));

        match lookup {
            Some((false, value)) => {
                drop(inner);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_hit();
                Some(value)
            }
            Some((true, _)) => {
                self.remove_locked(&mut inner, key);
                self.sync_usage(&inner);
                drop(inner);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_expirations(1);
                metrics::record_cache_miss();
                None
            }
            None => {
                drop(inner);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_miss();
                None
            }
        }
    }

    /// Insert or overwrite an entry. Returns the number of entries evicted to
    /// get back under budget.
    pub fn set(&self, key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) -> usize {
        let key = key.into();
        let ttl = self.limits.effective_ttl(ttl);
        let size_bytes = key.len() + value.len();

        let mut inner = self.inner.lock();
        self.remove_locked(&mut inner, &key);
        inner.size_bytes += size_bytes;
        inner
            .entries
            .insert(key, CacheEntry::new(value, ttl, size_bytes));

        let evicted = if inner.size_bytes > self.limits.max_size_bytes
            || inner.entries.len() > self.limits.max_entries
        {
            self.evict_locked(&mut inner)
        } else {
            0
        };
        self.sync_usage(&inner);
        drop(inner);

        if evicted > 0 {
            tracing::debug!(evicted, "cache over budget, evicted oldest entries");
            metrics::record_evictions(evicted);
        }
        evicted
    }

    /// Remove one entry. Returns whether it existed.
    pub fn del(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let removed = self.remove_locked(&mut inner, key).is_some();
        self.sync_usage(&inner);
        removed
    }

    /// Remove every entry whose key matches `predicate`. Returns the count.
    pub fn del_where(&self, mut predicate: impl FnMut(&str) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        let mut freed = 0;
        inner.entries.retain(|key, entry| {
            if predicate(key.as_str()) {
                removed += 1;
                freed += entry.size_bytes;
                false
            } else {
                true
            }
        });
        inner.size_bytes -= freed;
        self.sync_usage(&inner);
        removed
    }

    /// Drop every entry and reset all statistics to zero.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.size_bytes = 0;
        self.stats.reset();
        metrics::set_cache_usage(0, 0);
        removed
    }

    /// Remove expired entries. Returns the count.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut removed = 0;
        let mut freed = 0;
        inner.entries.retain(|_, entry| {
            if entry.is_expired(now) {
                removed += 1;
                freed += entry.size_bytes;
                false
            } else {
                true
            }
        });
        inner.size_bytes -= freed;
        self.sync_usage(&inner);
        drop(inner);

        if removed > 0 {
            self.stats
                .expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            metrics::record_expirations(removed);
        }
        removed
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.lock().size_bytes
    }

    /// Keys in insertion order (oldest first).
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    /// Diagnostic view of all entries in insertion order.
    pub fn entries(&self) -> Vec<EntryInfo> {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(key, entry)| EntryInfo {
                key: key.clone(),
                size_bytes: entry.size_bytes,
                age: now.saturating_duration_since(entry.created_at),
                expired: entry.is_expired(now),
            })
            .collect()
    }

    fn remove_locked(&self, inner: &mut StoreInner, key: &str) -> Option<CacheEntry> {
        let entry = inner.entries.shift_remove(key)?;
        inner.size_bytes -= entry.size_bytes;
        Some(entry)
    }

    /// Drops the oldest entries until both budgets are back under their
    /// target. The newest entry always survives.
    fn evict_locked(&self, inner: &mut StoreInner) -> usize {
        let target_size = self.limits.target_size_bytes();
        let target_entries = self.limits.target_entries();
        let len = inner.entries.len();

        let mut size = inner.size_bytes;
        let mut count = 0;
        for entry in inner.entries.values().take(len.saturating_sub(1)) {
            if size <= target_size && len - count <= target_entries {
                break;
            }
            size -= entry.size_bytes;
            count += 1;
        }

        inner.entries.drain(..count);
        inner.size_bytes = size;
        self.stats
            .evictions
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    fn sync_usage(&self, inner: &StoreInner) {
        self.stats
            .total_cached
            .store(inner.entries.len(), Ordering::Relaxed);
        self.stats
            .current_size_bytes
            .store(inner.size_bytes, Ordering::Relaxed);
        metrics::set_cache_usage(inner.entries.len(), inner.size_bytes);
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(StoreLimits::default())
    }
}
