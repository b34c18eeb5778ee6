//! Translates row changes into cache clears.
//!
//! ## Decision order
//!
//! 1. Deletes, and updates missing a row image, clear the table
//!    comprehensively (plus its dependent tables): there is nothing to diff.
//! 2. Otherwise the watched columns are diffed. No difference means no clear.
//! 3. Any high-impact column among the differences triggers `clear_all`. This
//!    supersedes targeted clearing for the whole event.
//! 4. Otherwise each changed column's targets are merged per table and
//!    cleared once per table; aggregate-feeding columns also clear the
//!    dependent lookup tables.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use hirebridge_core::{ChangeEvent, EventKind, FeedMessage, OverflowSignal};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::CacheInvalidator;
use super::rules::{InvalidationRules, KeyPattern, TableRules};
use crate::metrics;

/// Reason used when change events were dropped on a full queue.
pub const OVERFLOW_REASON: &str = "invalidation queue overflow";

/// Reason used after the change feed was re-established.
pub const RECONNECT_REASON: &str = "change feed reconnected";

/// One `clear_by_table` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableClear {
    pub table: String,
    pub record_id: Option<String>,
    /// `None` clears everything the table owns.
    pub patterns: Option<Vec<KeyPattern>>,
}

impl TableClear {
    fn comprehensive(table: &str, record_id: Option<String>) -> Self {
        Self {
            table: table.to_string(),
            record_id,
            patterns: None,
        }
    }

    fn merge(&mut self, patterns: Option<&[KeyPattern]>) {
        let Some(new) = patterns else {
            self.patterns = None;
            return;
        };
        if let Some(existing) = self.patterns.as_mut() {
            for pattern in new {
                if !existing.contains(pattern) {
                    existing.push(pattern.clone());
                }
            }
        }
    }
}

/// What to do about one change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationPlan {
    Skip { reason: String },
    FullClear { reason: String },
    Targeted(Vec<TableClear>),
}

/// Decides how `event` invalidates the cache under `rules`.
pub fn plan_invalidation(rules: &InvalidationRules, event: &ChangeEvent) -> InvalidationPlan {
    let table = event.table.as_str();
    let Some(table_rules) = rules.table_rules(table) else {
        if rules.owned_patterns(table).is_some() {
            return InvalidationPlan::Targeted(vec![TableClear::comprehensive(
                table,
                event.record_id(),
            )]);
        }
        return InvalidationPlan::Skip {
            reason: format!("table '{table}' is not watched"),
        };
    };

    let images_missing = match event.kind {
        EventKind::Delete => true,
        EventKind::Update => event.old_row.is_none() || event.new_row.is_none(),
        EventKind::Insert => event.new_row.is_none(),
    };
    if images_missing {
        return comprehensive(table, table_rules, event.record_id());
    }

    let changed = event.changed_columns(&table_rules.watched);
    if changed.is_empty() {
        return InvalidationPlan::Skip {
            reason: "no watched column changed".into(),
        };
    }

    let high_impact: Vec<&str> = changed
        .iter()
        .copied()
        .filter(|column| table_rules.is_high_impact(column))
        .collect();
    if !high_impact.is_empty() {
        return InvalidationPlan::FullClear {
            reason: format!("high-impact change {table}.{}", high_impact.join(",")),
        };
    }

    let record_id = event.record_id();
    let mut clears: Vec<TableClear> = Vec::new();
    let mut push = |target_table: &str, patterns: Option<&[KeyPattern]>| {
        if let Some(existing) = clears.iter_mut().find(|c| c.table == target_table) {
            existing.merge(patterns);
            return;
        }
        clears.push(TableClear {
            table: target_table.to_string(),
            record_id: (target_table == table).then(|| record_id.clone()).flatten(),
            patterns: patterns.map(<[KeyPattern]>::to_vec),
        });
    };

    for column in &changed {
        match table_rules.targets(column) {
            Some(targets) => {
                for target in targets {
                    push(target.table.as_str(), Some(target.patterns.as_slice()));
                }
            }
            None => {
                tracing::warn!(
                    table = %table,
                    column = %column,
                    "No invalidation mapping for changed column, skipping"
                );
            }
        }
        if table_rules.feeds_aggregates(column) {
            for dependent in &table_rules.dependents {
                push(dependent.as_str(), None);
            }
        }
    }

    if clears.is_empty() {
        return InvalidationPlan::Skip {
            reason: format!("no mapping for changed columns {}", changed.join(",")),
        };
    }
    InvalidationPlan::Targeted(clears)
}

fn comprehensive(table: &str, rules: &TableRules, record_id: Option<String>) -> InvalidationPlan {
    let mut clears = vec![TableClear::comprehensive(table, record_id)];
    clears.extend(
        rules
            .dependents
            .iter()
            .map(|dependent| TableClear::comprehensive(dependent, None)),
    );
    InvalidationPlan::Targeted(clears)
}

#[derive(Debug, Default)]
struct CoordinatorStats {
    events: AtomicU64,
    skipped: AtomicU64,
    full_clears: AtomicU64,
    targeted_clears: AtomicU64,
    entries_removed: AtomicU64,
    overflow_clears: AtomicU64,
    reconnect_clears: AtomicU64,
    events_by_table: DashMap<String, u64>,
}

/// Counters of processed change events.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatsSnapshot {
    pub events: u64,
    pub skipped: u64,
    pub full_clears: u64,
    pub targeted_clears: u64,
    pub entries_removed: u64,
    pub overflow_clears: u64,
    pub reconnect_clears: u64,
    pub events_by_table: Vec<(String, u64)>,
}

/// Consumes change events and clears the affected cache entries.
pub struct InvalidationCoordinator {
    cache: Arc<dyn CacheInvalidator>,
    rules: Arc<InvalidationRules>,
    overflow: OverflowSignal,
    clear_on_reconnect: bool,
    stats: CoordinatorStats,
}

impl InvalidationCoordinator {
    pub fn new(cache: Arc<dyn CacheInvalidator>, rules: Arc<InvalidationRules>) -> Self {
        Self {
            cache,
            rules,
            overflow: OverflowSignal::new(),
            clear_on_reconnect: true,
            stats: CoordinatorStats::default(),
        }
    }

    /// Shares the overflow flag raised by the producer side of the queue.
    pub fn with_overflow_signal(mut self, overflow: OverflowSignal) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_clear_on_reconnect(mut self, enabled: bool) -> Self {
        self.clear_on_reconnect = enabled;
        self
    }

    pub fn rules(&self) -> &InvalidationRules {
        &self.rules
    }

    /// Processes one event. Returns the number of entries removed.
    pub fn handle_event(&self, event: &ChangeEvent) -> usize {
        self.stats.events.fetch_add(1, Ordering::Relaxed);
        *self
            .stats
            .events_by_table
            .entry(event.table.clone())
            .or_insert(0) += 1;

        match plan_invalidation(&self.rules, event) {
            InvalidationPlan::Skip { reason } => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    table = %event.table,
                    kind = %event.kind,
                    reason = %reason,
                    "Change requires no invalidation"
                );
                0
            }
            InvalidationPlan::FullClear { reason } => {
                let removed = self.cache.clear_all(&reason);
                self.stats.full_clears.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .entries_removed
                    .fetch_add(removed as u64, Ordering::Relaxed);
                metrics::record_invalidation("full", &event.table, removed);
                tracing::info!(
                    table = %event.table,
                    kind = %event.kind,
                    reason = %reason,
                    removed,
                    "Full cache invalidation"
                );
                removed
            }
            InvalidationPlan::Targeted(clears) => {
                let removed: usize = clears
                    .iter()
                    .map(|clear| {
                        self.cache.clear_by_table(
                            &clear.table,
                            clear.record_id.as_deref(),
                            clear.patterns.as_deref(),
                        )
                    })
                    .sum();
                self.stats.targeted_clears.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .entries_removed
                    .fetch_add(removed as u64, Ordering::Relaxed);
                metrics::record_invalidation("targeted", &event.table, removed);
                tracing::info!(
                    table = %event.table,
                    kind = %event.kind,
                    record_id = ?event.record_id(),
                    tables = ?clears.iter().map(|c| c.table.as_str()).collect::<Vec<_>>(),
                    removed,
                    "Targeted cache invalidation"
                );
                removed
            }
        }
    }

    pub fn handle_message(&self, message: &FeedMessage) -> usize {
        match message {
            FeedMessage::Change(event) => self.handle_event(event),
            FeedMessage::Resubscribed if self.clear_on_reconnect => {
                self.stats.reconnect_clears.fetch_add(1, Ordering::Relaxed);
                let removed = self.cache.clear_all(RECONNECT_REASON);
                metrics::record_invalidation("full", "*", removed);
                removed
            }
            FeedMessage::Resubscribed => 0,
        }
    }

    /// Full clear if the producer dropped events since the last check.
    pub fn compensate_overflow(&self) -> Option<usize> {
        if !self.overflow.take() {
            return None;
        }
        self.stats.overflow_clears.fetch_add(1, Ordering::Relaxed);
        let removed = self.cache.clear_all(OVERFLOW_REASON);
        metrics::record_invalidation("full", "*", removed);
        tracing::warn!(
            dropped_total = self.overflow.dropped(),
            removed,
            "Change events were dropped, cache flushed"
        );
        Some(removed)
    }

    pub fn stats(&self) -> CoordinatorStatsSnapshot {
        let mut events_by_table: Vec<(String, u64)> = self
            .stats
            .events_by_table
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        events_by_table.sort();
        CoordinatorStatsSnapshot {
            events: self.stats.events.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
            full_clears: self.stats.full_clears.load(Ordering::Relaxed),
            targeted_clears: self.stats.targeted_clears.load(Ordering::Relaxed),
            entries_removed: self.stats.entries_removed.load(Ordering::Relaxed),
            overflow_clears: self.stats.overflow_clears.load(Ordering::Relaxed),
            reconnect_clears: self.stats.reconnect_clears.load(Ordering::Relaxed),
            events_by_table,
        }
    }

    /// Drains `rx` until it closes or `cancel` fires.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<FeedMessage>, cancel: CancellationToken) {
        tracing::info!(tables = ?self.rules.watched_tables(), "Invalidation coordinator started");
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = rx.recv() => message,
            };
            let Some(message) = message else {
                tracing::info!("Change feed queue closed");
                break;
            };
            self.compensate_overflow();
            self.handle_message(&message);
        }
        self.compensate_overflow();
        tracing::info!("Invalidation coordinator stopped");
    }

    pub fn spawn(
        self: Arc<Self>,
        rx: mpsc::Receiver<FeedMessage>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(rx, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hirebridge_core::Row;
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Table(TableClear),
        All(String),
    }

    #[derive(Default)]
    struct RecordingCache {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingCache {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    impl CacheInvalidator for RecordingCache {
        fn clear_by_table(
            &self,
            table: &str,
            record_id: Option<&str>,
            patterns: Option<&[KeyPattern]>,
        ) -> usize {
            self.calls.lock().push(Call::Table(TableClear {
                table: table.to_string(),
                record_id: record_id.map(str::to_string),
                patterns: patterns.map(<[KeyPattern]>::to_vec),
            }));
            1
        }

        fn clear_all(&self, reason: &str) -> usize {
            self.calls.lock().push(Call::All(reason.to_string()));
            10
        }
    }

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("row must be an object"),
        }
    }

    fn student(overrides: Value) -> Row {
        let mut base = row(json!({
            "id": "s-1",
            "first_name": "Ada",
            "last_name": "Lovelace",
            "university": "NTNU",
            "major": "CS",
            "graduation_year": 2026,
            "skills": ["rust"],
            "city": "Oslo",
            "bio": "hello",
            "avatar_url": null,
            "is_employed": false,
            "is_public": true,
            "updated_at": "2026-01-01T00:00:00Z"
        }));
        base.extend(row(overrides));
        base
    }

    fn setup() -> (Arc<RecordingCache>, InvalidationCoordinator) {
        let cache = Arc::new(RecordingCache::default());
        let coordinator = InvalidationCoordinator::new(
            cache.clone(),
            Arc::new(InvalidationRules::hirebridge()),
        );
        (cache, coordinator)
    }

    #[test]
    fn test_delete_clears_table_comprehensively() {
        let (cache, coordinator) = setup();
        // Old row without any watched columns.
        coordinator.handle_event(&ChangeEvent::delete("students", Some(row(json!({"id": "s-9"})))));

        assert_eq!(
            cache.calls(),
            vec![
                Call::Table(TableClear::comprehensive("students", Some("s-9".into()))),
                Call::Table(TableClear::comprehensive("lookups", None)),
            ]
        );
    }

    #[test]
    fn test_delete_without_old_row_still_clears() {
        let (cache, coordinator) = setup();
        coordinator.handle_event(&ChangeEvent::delete("companies", None));
        assert!(matches!(
            cache.calls().first(),
            Some(Call::Table(TableClear { table, record_id: None, patterns: None })) if table == "companies"
        ));
    }

    #[test]
    fn test_unchanged_row_makes_no_calls() {
        let (cache, coordinator) = setup();
        let event = ChangeEvent::update(
            "students",
            student(json!({})),
            student(json!({"updated_at": "2026-02-02T00:00:00Z"})),
        );
        assert_eq!(coordinator.handle_event(&event), 0);
        assert!(cache.calls().is_empty());
        assert_eq!(coordinator.stats().skipped, 1);
    }

    #[test]
    fn test_high_impact_supersedes_targeted() {
        let (cache, coordinator) = setup();
        let event = ChangeEvent::update(
            "students",
            student(json!({})),
            student(json!({"is_public": false, "bio": "changed", "city": "Bergen"})),
        );
        coordinator.handle_event(&event);

        let calls = cache.calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            Call::All(reason) => assert!(reason.contains("students.is_public")),
            other => panic!("expected full clear, got {other:?}"),
        }
    }

    #[test]
    fn test_profile_only_column_targets_own_record() {
        let (cache, coordinator) = setup();
        let event = ChangeEvent::update(
            "students",
            student(json!({})),
            student(json!({"bio": "new bio"})),
        );
        coordinator.handle_event(&event);

        assert_eq!(
            cache.calls(),
            vec![Call::Table(TableClear {
                table: "students".into(),
                record_id: Some("s-1".into()),
                patterns: Some(vec![
                    KeyPattern::endpoint("students.profile"),
                    KeyPattern::entity("student"),
                ]),
            })]
        );
    }

    #[test]
    fn test_aggregate_column_also_clears_lookups() {
        let (cache, coordinator) = setup();
        let event = ChangeEvent::update(
            "students",
            student(json!({})),
            student(json!({"city": "Bergen", "first_name": "Grace"})),
        );
        coordinator.handle_event(&event);

        let calls = cache.calls();
        // One call per distinct table.
        assert_eq!(calls.len(), 2);
        let Call::Table(students) = &calls[0] else {
            panic!("expected table clear");
        };
        assert_eq!(students.table, "students");
        let patterns = students.patterns.as_ref().unwrap();
        assert!(patterns.contains(&KeyPattern::endpoint("students.list")));
        assert!(patterns.contains(&KeyPattern::endpoint("students.profile")));
        assert_eq!(
            calls[1],
            Call::Table(TableClear::comprehensive("lookups", None))
        );
    }

    #[test]
    fn test_update_without_old_row_is_comprehensive() {
        let (cache, coordinator) = setup();
        let event = ChangeEvent {
            table: "students".into(),
            kind: EventKind::Update,
            old_row: None,
            new_row: Some(student(json!({}))),
        };
        coordinator.handle_event(&event);
        assert_eq!(
            cache.calls()[0],
            Call::Table(TableClear::comprehensive("students", Some("s-1".into())))
        );
    }

    #[test]
    fn test_insert_of_public_row_is_high_impact() {
        let (cache, coordinator) = setup();
        coordinator.handle_event(&ChangeEvent::insert("students", student(json!({}))));
        assert!(matches!(cache.calls().as_slice(), [Call::All(_)]));
    }

    #[test]
    fn test_unmapped_column_is_skipped() {
        let rules = InvalidationRules::new()
            .own("jobs", &[KeyPattern::endpoint("jobs.list")])
            .table("jobs", TableRules::new().watch(&["title", "notes"]).target(
                &["title"],
                "jobs",
                &[KeyPattern::endpoint("jobs.list")],
            ));
        let event = ChangeEvent::update(
            "jobs",
            row(json!({"id": 1, "title": "a", "notes": "x"})),
            row(json!({"id": 1, "title": "a", "notes": "y"})),
        );
        assert!(matches!(
            plan_invalidation(&rules, &event),
            InvalidationPlan::Skip { .. }
        ));
    }

    #[test]
    fn test_unknown_table_is_skipped() {
        let (cache, coordinator) = setup();
        coordinator.handle_event(&ChangeEvent::delete("audit_log", None));
        assert!(cache.calls().is_empty());
    }

    #[test]
    fn test_resubscribed_clears_when_enabled() {
        let (cache, coordinator) = setup();
        coordinator.handle_message(&FeedMessage::Resubscribed);
        assert_eq!(cache.calls(), vec![Call::All(RECONNECT_REASON.into())]);

        let (cache, coordinator) = setup();
        let coordinator = coordinator.with_clear_on_reconnect(false);
        coordinator.handle_message(&FeedMessage::Resubscribed);
        assert!(cache.calls().is_empty());
    }

    #[tokio::test]
    async fn test_run_compensates_overflow_and_stops_on_close() {
        let cache = Arc::new(RecordingCache::default());
        let overflow = OverflowSignal::new();
        let coordinator = Arc::new(
            InvalidationCoordinator::new(cache.clone(), Arc::new(InvalidationRules::hirebridge()))
                .with_overflow_signal(overflow.clone()),
        );
        let (tx, rx) = mpsc::channel(8);

        overflow.raise();
        tx.send(FeedMessage::Change(ChangeEvent::delete("companies", None)))
            .await
            .unwrap();
        drop(tx);

        coordinator
            .clone()
            .run(rx, CancellationToken::new())
            .await;

        let calls = cache.calls();
        assert_eq!(calls[0], Call::All(OVERFLOW_REASON.into()));
        assert!(matches!(&calls[1], Call::Table(clear) if clear.table == "companies"));

        let stats = coordinator.stats();
        assert_eq!(stats.overflow_clears, 1);
        assert_eq!(stats.events, 1);
        assert_eq!(stats.events_by_table, vec![("companies".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_cache, coordinator) = setup();
        let (_tx, rx) = mpsc::channel::<FeedMessage>(1);
        let cancel = CancellationToken::new();
        let handle = Arc::new(coordinator).spawn(rx, cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
