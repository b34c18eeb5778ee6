//! In-process response cache for the hirebridge API.
//!
//! - [`CacheStore`]: TTL and size bounded key/value store with statistics
//! - [`CacheKeyBuilder`]: deterministic endpoint and entity keys
//! - [`ResponseCache`]: typed façade with table-scoped bulk clears
//! - [`InvalidationCoordinator`]: maps row changes to cache clears
//! - [`MemoryGuard`]: flushes the cache when process memory runs high

pub mod config;
pub mod error;
pub mod invalidation;
pub mod key;
pub mod memory;
pub mod metrics;
pub mod response;
pub mod store;

pub use config::{CacheSettings, MemorySettings};
pub use error::{CacheError, CacheResult};
pub use invalidation::{
    CacheInvalidator, CoordinatorStatsSnapshot, InvalidationCoordinator, InvalidationPlan,
    InvalidationRules, KeyPattern, TableClear, TableRules, plan_invalidation,
};
pub use key::{CacheKey, CacheKeyBuilder};
pub use memory::{MemoryGuard, MemoryReading, MemorySampler, ProcessMemorySampler};
pub use response::{DetailedCacheStats, OPERATOR_CLEAR_REASON, ResponseCache, SweepReport};
pub use store::{CacheStatsSnapshot, CacheStore, StoreLimits};
