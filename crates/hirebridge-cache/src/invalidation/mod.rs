//! Change-driven cache invalidation.
//!
//! [`rules`] holds the static column to key mapping; [`coordinator`] turns
//! each [`hirebridge_core::ChangeEvent`] into calls on a [`CacheInvalidator`].

pub mod coordinator;
pub mod rules;

pub use coordinator::{
    CoordinatorStatsSnapshot, InvalidationCoordinator, InvalidationPlan, OVERFLOW_REASON,
    RECONNECT_REASON, TableClear, plan_invalidation,
};
pub use rules::{
    ColumnTarget, EMPLOYMENT_STATUS_TABLES, InvalidationRules, KeyPattern, LOOKUPS_TABLE,
    TableRules, VISIBILITY_TABLES,
};

/// Bulk-clear operations the invalidation layer needs from a cache.
pub trait CacheInvalidator: Send + Sync {
    /// Removes entries owned by `table`, narrowed to `patterns` when given,
    /// plus entity entries embedding `record_id`. Returns the count removed.
    fn clear_by_table(
        &self,
        table: &str,
        record_id: Option<&str>,
        patterns: Option<&[KeyPattern]>,
    ) -> usize;

    /// Removes everything. `reason` is only logged.
    fn clear_all(&self, reason: &str) -> usize;
}
