use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CacheError, CacheResult};

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Version tag embedded in every API key. Changing it makes all
    /// previously cached API responses unreachable.
    #[serde(default = "default_version")]
    pub version: String,

    /// TTL used when a `set` does not pass its own
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Upper bound for per-call TTL overrides
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,

    /// Total byte budget for keys plus encoded payloads
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: usize,

    /// Maximum number of entries
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Fraction of the limits eviction shrinks the cache down to
    #[serde(default = "default_eviction_target_ratio")]
    pub eviction_target_ratio: f64,

    /// Interval of the background expiry sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_version() -> String {
    "v1".into()
}
fn default_ttl_secs() -> u64 {
    300
}
fn default_max_ttl_secs() -> u64 {
    3600
}
fn default_max_size_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_max_entries() -> usize {
    5000
}
fn default_eviction_target_ratio() -> f64 {
    0.8
}
fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            version: default_version(),
            default_ttl_secs: default_ttl_secs(),
            max_ttl_secs: default_max_ttl_secs(),
            max_size_bytes: default_max_size_bytes(),
            max_entries: default_max_entries(),
            eviction_target_ratio: default_eviction_target_ratio(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheSettings {
    pub fn validate(&self) -> CacheResult<()> {
        if self.version.trim().is_empty() || self.version.contains(':') {
            return Err(CacheError::configuration(
                "cache.version must be non-empty and must not contain ':'",
            ));
        }
        if self.default_ttl_secs == 0 {
            return Err(CacheError::configuration("cache.default_ttl_secs must be > 0"));
        }
        if self.max_ttl_secs < self.default_ttl_secs {
            return Err(CacheError::configuration(
                "cache.max_ttl_secs must be >= cache.default_ttl_secs",
            ));
        }
        if self.max_size_bytes == 0 {
            return Err(CacheError::configuration("cache.max_size_bytes must be > 0"));
        }
        if self.max_entries == 0 {
            return Err(CacheError::configuration("cache.max_entries must be > 0"));
        }
        if !(self.eviction_target_ratio > 0.0 && self.eviction_target_ratio <= 1.0) {
            return Err(CacheError::configuration(
                "cache.eviction_target_ratio must be in (0, 1]",
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(CacheError::configuration("cache.sweep_interval_secs must be > 0"));
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Memory guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    /// Assumed memory ceiling for the process. Required.
    #[serde(default)]
    pub ceiling_bytes: u64,

    /// Fraction of the ceiling above which the cache is flushed
    #[serde(default = "default_high_water_ratio")]
    pub high_water_ratio: f64,

    /// Interval of the periodic memory check
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Minimum spacing between samples taken on the write path
    #[serde(default = "default_min_sample_interval_ms")]
    pub min_sample_interval_ms: u64,
}

fn default_high_water_ratio() -> f64 {
    0.85
}
fn default_check_interval_secs() -> u64 {
    30
}
fn default_min_sample_interval_ms() -> u64 {
    1000
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            ceiling_bytes: 0,
            high_water_ratio: default_high_water_ratio(),
            check_interval_secs: default_check_interval_secs(),
            min_sample_interval_ms: default_min_sample_interval_ms(),
        }
    }
}

impl MemorySettings {
    pub fn validate(&self) -> CacheResult<()> {
        if self.ceiling_bytes == 0 {
            return Err(CacheError::configuration(
                "memory.ceiling_bytes is required and must be > 0",
            ));
        }
        if !(self.high_water_ratio > 0.0 && self.high_water_ratio <= 1.0) {
            return Err(CacheError::configuration(
                "memory.high_water_ratio must be in (0, 1]",
            ));
        }
        if self.check_interval_secs == 0 {
            return Err(CacheError::configuration("memory.check_interval_secs must be > 0"));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn min_sample_interval(&self) -> Duration {
        Duration::from_millis(self.min_sample_interval_ms)
    }
}
