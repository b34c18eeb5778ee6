//! Endpoint- and entity-aware cache façade.
//!
//! [`ResponseCache`] combines a [`CacheStore`] with a [`CacheKeyBuilder`]
//! and the table ownership declared in [`InvalidationRules`]. Payloads are
//! stored MessagePack-encoded; any encoding problem makes that one response
//! uncacheable instead of failing the caller.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CacheSettings;
use crate::error::{CacheError, CacheResult};
use crate::invalidation::{
    CacheInvalidator, EMPLOYMENT_STATUS_TABLES, InvalidationRules, KeyPattern, VISIBILITY_TABLES,
};
use crate::key::{CacheKey, CacheKeyBuilder};
use crate::memory::{MemoryGuard, MemoryReading};
use crate::metrics;
use crate::store::{CacheStatsSnapshot, CacheStore, StoreLimits};

/// Entry count and size for one endpoint or entity type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStats {
    pub entries: usize,
    pub size_bytes: usize,
}

/// Limits the cache was configured with.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsView {
    pub default_ttl_secs: u64,
    pub max_ttl_secs: u64,
    pub max_size_bytes: usize,
    pub max_entries: usize,
    pub eviction_target_ratio: f64,
}

impl From<&StoreLimits> for LimitsView {
    fn from(limits: &StoreLimits) -> Self {
        Self {
            default_ttl_secs: limits.default_ttl.as_secs(),
            max_ttl_secs: limits.max_ttl.as_secs(),
            max_size_bytes: limits.max_size_bytes,
            max_entries: limits.max_entries,
            eviction_target_ratio: limits.eviction_target_ratio,
        }
    }
}

/// Operator diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedCacheStats {
    #[serde(flatten)]
    pub stats: CacheStatsSnapshot,
    pub version: String,
    pub groups: BTreeMap<String, GroupStats>,
    pub oldest_entry_age_secs: Option<u64>,
    pub expired_pending: usize,
    pub stale_version_entries: usize,
    pub limits: LimitsView,
    pub memory: Option<MemoryReading>,
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub stale_version: usize,
}

/// Response cache shared by request handlers and the invalidation layer.
pub struct ResponseCache {
    store: CacheStore,
    keys: CacheKeyBuilder,
    rules: Arc<InvalidationRules>,
    memory_guard: Option<Arc<MemoryGuard>>,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("version", &self.keys.version())
            .field("store", &self.store)
            .field("memory_guard", &self.memory_guard)
            .finish()
    }
}

impl ResponseCache {
    pub fn new(settings: &CacheSettings, rules: Arc<InvalidationRules>) -> CacheResult<Self> {
        settings.validate()?;
        rules.validate()?;
        Ok(Self {
            store: CacheStore::new(StoreLimits::from(settings)),
            keys: CacheKeyBuilder::new(settings.version.clone()),
            rules,
            memory_guard: None,
        })
    }

    /// Flush the cache before writes while `guard` reports pressure.
    pub fn with_memory_guard(mut self, guard: Arc<MemoryGuard>) -> Self {
        self.memory_guard = Some(guard);
        self
    }

    /// The underlying key/value store.
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn rules(&self) -> &InvalidationRules {
        &self.rules
    }

    pub fn memory_guard(&self) -> Option<&Arc<MemoryGuard>> {
        self.memory_guard.as_ref()
    }

    pub fn version(&self) -> Arc<String> {
        self.keys.version()
    }

    /// Switches the key version. Entries written under the previous version
    /// are no longer reachable and are removed by the next sweep.
    pub fn set_version(&self, version: impl Into<String>) -> CacheResult<Arc<String>> {
        let previous = self.keys.set_version(version)?;
        tracing::info!(
            previous = %previous,
            current = %self.keys.version(),
            "Cache version changed"
        );
        Ok(previous)
    }

    pub fn get_api_response<P, R>(&self, endpoint: &str, params: &P) -> Option<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let key = self.api_key(endpoint, params)?;
        self.read(&key)
    }

    /// Stores a response with the default TTL. Returns whether it was cached.
    pub fn set_api_response<P, R>(&self, endpoint: &str, params: &P, response: &R) -> bool
    where
        P: Serialize + ?Sized,
        R: Serialize + ?Sized,
    {
        self.set_api_response_with_ttl(endpoint, params, response, None)
    }

    pub fn set_api_response_with_ttl<P, R>(
        &self,
        endpoint: &str,
        params: &P,
        response: &R,
        ttl: Option<Duration>,
    ) -> bool
    where
        P: Serialize + ?Sized,
        R: Serialize + ?Sized,
    {
        let Some(key) = self.api_key(endpoint, params) else {
            return false;
        };
        self.write(endpoint, key, response, ttl)
    }

    /// Returns the cached response, or runs `compute` and caches its result.
    /// Errors from `compute` are returned as-is and nothing is cached.
    pub async fn get_or_compute<P, R, E, F, Fut>(
        &self,
        endpoint: &str,
        params: &P,
        compute: F,
    ) -> Result<R, E>
    where
        P: Serialize + ?Sized,
        R: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let key = self.api_key(endpoint, params);
        if let Some(hit) = key.as_deref().and_then(|key| self.read::<R>(key)) {
            return Ok(hit);
        }
        let response = compute().await?;
        if let Some(key) = key {
            self.write(endpoint, key, &response, None);
        }
        Ok(response)
    }

    pub fn get_entity_field<R>(&self, entity_type: &str, entity_id: &str, field: &str) -> Option<R>
    where
        R: DeserializeOwned,
    {
        let key = self.entity_key(entity_type, entity_id, field)?;
        self.read(&key)
    }

    pub fn set_entity_field<R>(
        &self,
        entity_type: &str,
        entity_id: &str,
        field: &str,
        value: &R,
    ) -> bool
    where
        R: Serialize + ?Sized,
    {
        let Some(key) = self.entity_key(entity_type, entity_id, field) else {
            return false;
        };
        self.write(entity_type, key, value, None)
    }

    /// Removes entries owned by `table` (or only those matching `patterns`)
    /// plus the entity entries of `record_id`. Returns the count removed.
    pub fn clear_by_table(
        &self,
        table: &str,
        record_id: Option<&str>,
        patterns: Option<&[KeyPattern]>,
    ) -> usize {
        let Some(owned) = self.rules.owned_patterns(table) else {
            if let Some(patterns) = patterns {
                return self.clear_matching(table, record_id, patterns, &[]);
            }
            tracing::warn!(table = %table, "No key ownership declared for table, nothing cleared");
            return 0;
        };
        let entity_kinds: Vec<&str> = self.rules.entity_kinds(table).collect();
        self.clear_matching(table, record_id, patterns.unwrap_or(owned), &entity_kinds)
    }

    fn clear_matching(
        &self,
        table: &str,
        record_id: Option<&str>,
        patterns: &[KeyPattern],
        entity_kinds: &[&str],
    ) -> usize {
        let removed = self.store.del_where(|key| {
            let Some(parsed) = CacheKey::parse(key) else {
                return false;
            };
            if patterns.iter().any(|pattern| pattern.matches(&parsed)) {
                return true;
            }
            match (record_id, parsed) {
                (
                    Some(record_id),
                    CacheKey::Entity {
                        entity_type,
                        entity_id,
                        ..
                    },
                ) => entity_id == record_id && entity_kinds.contains(&entity_type),
                _ => false,
            }
        });
        tracing::debug!(
            table = %table,
            record_id = ?record_id,
            patterns = patterns.len(),
            removed,
            "Cleared cache entries by table"
        );
        removed
    }

    /// Drops everything and resets statistics.
    pub fn clear_all(&self, reason: &str) -> usize {
        let removed = self.store.clear();
        tracing::info!(reason = %reason, removed, "Response cache cleared");
        removed
    }

    /// Clears the student listings and the lookup aggregates, whose result
    /// sets depend on who is employed.
    pub fn clear_employment_status_cache(&self) -> usize {
        EMPLOYMENT_STATUS_TABLES
            .iter()
            .map(|table| self.clear_by_table(table, None, None))
            .sum()
    }

    /// Clears the company listings, whose result sets depend on visibility.
    pub fn clear_visibility_cache(&self) -> usize {
        VISIBILITY_TABLES
            .iter()
            .map(|table| self.clear_by_table(table, None, None))
            .sum()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.store.stats()
    }

    pub fn detailed_stats(&self) -> DetailedCacheStats {
        let version = self.keys.version();
        let entries = self.store.entries();

        let mut groups: BTreeMap<String, GroupStats> = BTreeMap::new();
        let mut expired_pending = 0;
        let mut stale_version_entries = 0;
        for entry in &entries {
            let parsed = CacheKey::parse(&entry.key);
            let group = parsed
                .as_ref()
                .map(CacheKey::group)
                .unwrap_or_else(|| "other".to_string());
            let slot = groups.entry(group).or_default();
            slot.entries += 1;
            slot.size_bytes += entry.size_bytes;

            if entry.expired {
                expired_pending += 1;
            }
            if matches!(parsed, Some(CacheKey::Api { version: v, .. }) if v != version.as_str()) {
                stale_version_entries += 1;
            }
        }

        DetailedCacheStats {
            stats: self.store.stats(),
            version: version.to_string(),
            groups,
            oldest_entry_age_secs: entries.iter().map(|e| e.age.as_secs()).max(),
            expired_pending,
            stale_version_entries,
            limits: LimitsView::from(self.store.limits()),
            memory: self.memory_guard.as_ref().map(|guard| guard.reading()),
        }
    }

    /// Removes expired entries and endpoint entries of old versions.
    pub fn purge_expired(&self) -> SweepReport {
        let expired = self.store.purge_expired();
        let version = self.keys.version();
        let stale_version = self.store.del_where(|key| {
            matches!(
                CacheKey::parse(key),
                Some(CacheKey::Api { version: v, .. }) if v != version.as_str()
            )
        });
        let report = SweepReport {
            expired,
            stale_version,
        };
        if expired > 0 || stale_version > 0 {
            tracing::debug!(expired, stale_version, "Cache sweep removed entries");
        }
        report
    }

    /// Spawns the periodic sweep.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.purge_expired();
                    }
                }
            }
            tracing::debug!("Cache sweeper stopped");
        })
    }

    fn api_key<P>(&self, endpoint: &str, params: &P) -> Option<String>
    where
        P: Serialize + ?Sized,
    {
        self.keys
            .api_key(endpoint, params)
            .map_err(|e| self.uncacheable(endpoint, &e))
            .ok()
    }

    fn entity_key(&self, entity_type: &str, entity_id: &str, field: &str) -> Option<String> {
        CacheKeyBuilder::entity_key(entity_type, entity_id, field)
            .map_err(|e| self.uncacheable(entity_type, &e))
            .ok()
    }

    fn read<R: DeserializeOwned>(&self, key: &str) -> Option<R> {
        let bytes = self.store.get(key)?;
        match rmp_serde::from_slice::<R>(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    error = %CacheError::from(e),
                    "Dropping undecodable cache entry"
                );
                self.store.del(key);
                None
            }
        }
    }

    fn write<R>(&self, label: &str, key: String, value: &R, ttl: Option<Duration>) -> bool
    where
        R: Serialize + ?Sized,
    {
        let bytes = match rmp_serde::to_vec_named(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.uncacheable(label, &CacheError::from(e));
                return false;
            }
        };
        if let Some(guard) = &self.memory_guard {
            guard.relieve_if_needed(self);
        }
        self.store.set(key, bytes, ttl);
        true
    }

    fn uncacheable(&self, label: &str, error: &CacheError) {
        metrics::record_uncacheable(label);
        tracing::warn!(
            endpoint = %label,
            error = %error,
            category = %error.category(),
            "Response not cacheable, passing through"
        );
    }
}

impl CacheInvalidator for ResponseCache {
    fn clear_by_table(
        &self,
        table: &str,
        record_id: Option<&str>,
        patterns: Option<&[KeyPattern]>,
    ) -> usize {
        ResponseCache::clear_by_table(self, table, record_id, patterns)
    }

    fn clear_all(&self, reason: &str) -> usize {
        ResponseCache::clear_all(self, reason)
    }
}

/// Default reason for operator-initiated clears.
pub const OPERATOR_CLEAR_REASON: &str = "operator request";
