//! Wire payload of row-change notifications.
//!
//! The notify trigger shipped with `hirebridge-realtime` emits one JSON
//! document per row mutation:
//!
//! ```json
//! {"table": "students", "type": "UPDATE", "record": {...}, "old_record": {...}}
//! ```
//!
//! `record` is absent for deletes and `old_record` for inserts. Both may be
//! absent when the row image did not fit into a single notification.

use serde::Deserialize;

use crate::error::{CoreError, Result};
use crate::events::{ChangeEvent, EventKind, Row};

/// Payload from the database notify trigger.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeNotification {
    /// Table the row belongs to.
    pub table: String,
    /// Database operation (INSERT, UPDATE, DELETE).
    #[serde(rename = "type")]
    pub operation: String,
    /// Row image after the change.
    #[serde(default)]
    pub record: Option<Row>,
    /// Row image before the change.
    #[serde(default)]
    pub old_record: Option<Row>,
}

impl ChangeNotification {
    /// Parses a raw notification payload.
    pub fn parse(payload: &str) -> Result<Self> {
        let parsed: Self = serde_json::from_str(payload)?;
        if parsed.table.trim().is_empty() {
            return Err(CoreError::invalid_notification("empty table name"));
        }
        Ok(parsed)
    }

    /// Converts PostgreSQL operation name to `EventKind`.
    pub fn kind(&self) -> EventKind {
        EventKind::from_operation(&self.operation)
    }

    /// Converts to a `ChangeEvent`.
    pub fn into_event(self) -> ChangeEvent {
        let kind = self.kind();
        let (old_row, new_row) = match kind {
            EventKind::Insert => (None, self.record),
            EventKind::Update => (self.old_record, self.record),
            EventKind::Delete => (self.old_record, None),
        };
        ChangeEvent {
            table: self.table,
            kind,
            old_row,
            new_row,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update_notification() {
        let json = r#"{
            "table": "students",
            "type": "UPDATE",
            "record": {"id": "s-1", "city": "Bergen"},
            "old_record": {"id": "s-1", "city": "Oslo"}
        }"#;
        let event = ChangeNotification::parse(json).unwrap().into_event();

        assert_eq!(event.table, "students");
        assert_eq!(event.kind, EventKind::Update);
        assert_eq!(event.record_id().as_deref(), Some("s-1"));
        assert_eq!(event.old_row.unwrap()["city"], "Oslo");
        assert_eq!(event.new_row.unwrap()["city"], "Bergen");
    }

    #[test]
    fn test_parse_delete_drops_new_image() {
        let json = r#"{"table":"companies","type":"delete","record":{"id":"c-9"},"old_record":{"id":"c-9"}}"#;
        let event = ChangeNotification::parse(json).unwrap().into_event();

        assert_eq!(event.kind, EventKind::Delete);
        assert!(event.new_row.is_none());
        assert_eq!(event.record_id().as_deref(), Some("c-9"));
    }

    #[test]
    fn test_parse_insert_ignores_old_image() {
        let json = r#"{"table":"students","type":"INSERT","record":{"id":"s-2"}}"#;
        let event = ChangeNotification::parse(json).unwrap().into_event();

        assert_eq!(event.kind, EventKind::Insert);
        assert!(event.old_row.is_none());
        assert!(event.new_row.is_some());
    }

    #[test]
    fn test_parse_without_row_images() {
        let json = r#"{"table":"students","type":"UPDATE"}"#;
        let event = ChangeNotification::parse(json).unwrap().into_event();

        assert_eq!(event.kind, EventKind::Update);
        assert!(event.old_row.is_none());
        assert!(event.new_row.is_none());
    }

    #[test]
    fn test_parse_rejects_empty_table() {
        let err = ChangeNotification::parse(r#"{"table":" ","type":"INSERT"}"#).unwrap_err();
        assert!(matches!(err, CoreError::InvalidNotification(_)));
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        let err = ChangeNotification::parse("not json").unwrap_err();
        assert!(matches!(err, CoreError::JsonError(_)));
    }
}
