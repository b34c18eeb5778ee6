use metrics::{counter, gauge};

pub mod names {
    pub const FEED_EVENTS_TOTAL: &str = "hirebridge_feed_events_total";
    pub const FEED_DROPPED_EVENTS_TOTAL: &str = "hirebridge_feed_dropped_events_total";
    pub const FEED_RECONNECTS_TOTAL: &str = "hirebridge_feed_reconnects_total";
    pub const FEED_CONNECT_FAILURES_TOTAL: &str = "hirebridge_feed_connect_failures_total";
    pub const FEED_CONNECTED: &str = "hirebridge_feed_connected";
}

pub fn record_feed_event(table: &str) {
    counter!(names::FEED_EVENTS_TOTAL, "table" => table.to_string()).increment(1);
}

pub fn record_dropped_event() {
    counter!(names::FEED_DROPPED_EVENTS_TOTAL).increment(1);
}

pub fn record_reconnect() {
    counter!(names::FEED_RECONNECTS_TOTAL).increment(1);
}

pub fn record_connect_failure() {
    counter!(names::FEED_CONNECT_FAILURES_TOTAL).increment(1);
}

pub fn set_connected(connected: bool) {
    gauge!(names::FEED_CONNECTED).set(if connected { 1.0 } else { 0.0 });
}
