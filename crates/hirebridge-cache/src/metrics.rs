//! Metric recording for the response cache.
//!
//! Uses the `metrics` facade; the hosting process decides which recorder
//! (if any) is installed.

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "hirebridge_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "hirebridge_cache_misses_total";
    pub const CACHE_EVICTIONS_TOTAL: &str = "hirebridge_cache_evictions_total";
    pub const CACHE_EXPIRATIONS_TOTAL: &str = "hirebridge_cache_expirations_total";
    pub const CACHE_UNCACHEABLE_TOTAL: &str = "hirebridge_cache_uncacheable_total";
    pub const CACHE_ENTRIES: &str = "hirebridge_cache_entries";
    pub const CACHE_SIZE_BYTES: &str = "hirebridge_cache_size_bytes";

    pub const INVALIDATIONS_TOTAL: &str = "hirebridge_invalidations_total";
    pub const INVALIDATED_ENTRIES_TOTAL: &str = "hirebridge_invalidated_entries_total";

    pub const MEMORY_RESIDENT_BYTES: &str = "hirebridge_memory_resident_bytes";
    pub const MEMORY_PRESSURE_CLEARS_TOTAL: &str = "hirebridge_memory_pressure_clears_total";
}

pub fn record_cache_hit() {
    counter!(names::CACHE_HITS_TOTAL).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn record_evictions(count: usize) {
    if count > 0 {
        counter!(names::CACHE_EVICTIONS_TOTAL).increment(count as u64);
    }
}

pub fn record_expirations(count: usize) {
    if count > 0 {
        counter!(names::CACHE_EXPIRATIONS_TOTAL).increment(count as u64);
    }
}

/// A response skipped caching because it could not be encoded.
pub fn record_uncacheable(endpoint: &str) {
    counter!(names::CACHE_UNCACHEABLE_TOTAL, "endpoint" => endpoint.to_string()).increment(1);
}

pub fn set_cache_usage(entries: usize, size_bytes: usize) {
    gauge!(names::CACHE_ENTRIES).set(entries as f64);
    gauge!(names::CACHE_SIZE_BYTES).set(size_bytes as f64);
}

/// Record one invalidation decision. `mode` is `full` or `targeted`.
pub fn record_invalidation(mode: &'static str, table: &str, removed: usize) {
    counter!(names::INVALIDATIONS_TOTAL, "mode" => mode, "table" => table.to_string())
        .increment(1);
    counter!(names::INVALIDATED_ENTRIES_TOTAL, "mode" => mode).increment(removed as u64);
}

pub fn set_resident_memory(bytes: u64) {
    gauge!(names::MEMORY_RESIDENT_BYTES).set(bytes as f64);
}

pub fn record_memory_pressure_clear() {
    counter!(names::MEMORY_PRESSURE_CLEARS_TOTAL).increment(1);
}
