//! Row-change events flowing from the change feed to the invalidation layer.
//!
//! A [`ChangeEvent`] is built per notification, handed to the invalidation
//! coordinator through a bounded queue as a [`FeedMessage`], and dropped once
//! processed. Nothing here is persisted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A database row image as delivered by the change feed.
pub type Row = serde_json::Map<String, Value>;

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

impl EventKind {
    /// Parses a database operation name (`INSERT`, `update`, ...).
    ///
    /// Unknown operations are treated as `Update`, which always goes through
    /// column diffing and therefore never skips a needed invalidation.
    pub fn from_operation(operation: &str) -> Self {
        match operation.to_ascii_uppercase().as_str() {
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            other => {
                tracing::warn!(operation = %other, "Unknown operation type, treating as Update");
                Self::Update
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized row mutation for one watched table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: EventKind,
    #[serde(default)]
    pub old_row: Option<Row>,
    #[serde(default)]
    pub new_row: Option<Row>,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, new_row: Row) -> Self {
        Self {
            table: table.into(),
            kind: EventKind::Insert,
            old_row: None,
            new_row: Some(new_row),
        }
    }

    pub fn update(table: impl Into<String>, old_row: Row, new_row: Row) -> Self {
        Self {
            table: table.into(),
            kind: EventKind::Update,
            old_row: Some(old_row),
            new_row: Some(new_row),
        }
    }

    pub fn delete(table: impl Into<String>, old_row: Option<Row>) -> Self {
        Self {
            table: table.into(),
            kind: EventKind::Delete,
            old_row,
            new_row: None,
        }
    }

    /// Primary key of the affected row, read from the `id` column of the new
    /// row image, falling back to the old one.
    pub fn record_id(&self) -> Option<String> {
        [self.new_row.as_ref(), self.old_row.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|row| match row.get("id") {
                Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
                Some(Value::Number(id)) => Some(id.to_string()),
                _ => None,
            })
    }

    /// Returns the watched columns whose value differs between the old and new
    /// row images, in the order they are listed in `watched`.
    ///
    /// A missing row image or a missing column reads as `null`, so an insert
    /// reports every non-null watched column as changed.
    pub fn changed_columns<'a>(&self, watched: &'a [String]) -> Vec<&'a str> {
        watched
            .iter()
            .filter(|column| {
                let old = column_value(self.old_row.as_ref(), column);
                let new = column_value(self.new_row.as_ref(), column);
                old != new
            })
            .map(String::as_str)
            .collect()
    }
}

fn column_value<'r>(row: Option<&'r Row>, column: &str) -> &'r Value {
    static NULL: Value = Value::Null;
    row.and_then(|r| r.get(column)).unwrap_or(&NULL)
}

/// Message carried from the change listener to the invalidation coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// A row changed in a watched table.
    Change(ChangeEvent),
    /// The feed was re-established after a disconnect; events may have been
    /// missed in between.
    Resubscribed,
}

/// Shared flag raised when a change event had to be dropped because the
/// invalidation queue stayed full.
///
/// The producer raises it; the consumer takes it and compensates with a full
/// clear, since it cannot know which entries the dropped event covered.
#[derive(Debug, Clone, Default)]
pub struct OverflowSignal {
    raised: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl OverflowSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one dropped event and raises the flag.
    pub fn raise(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.raised.store(true, Ordering::Release);
    }

    /// Clears the flag, returning whether it was raised.
    pub fn take(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Total number of events dropped since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
