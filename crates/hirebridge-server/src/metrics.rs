//! Prometheus exporter for the cache and change-feed metrics.
//!
//! The library crates only talk to the `metrics` facade; this module installs
//! the recorder and renders the text format served at `GET /metrics`.

use metrics::{Unit, describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

use hirebridge_cache::metrics::names as cache;
use hirebridge_realtime::metrics::names as feed;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the Prometheus recorder.
///
/// Returns `false` if it was already installed or installation failed.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: the admin server renders /metrics itself
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            describe_metrics();
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Renders all metrics in Prometheus text format, `None` before [`init_metrics`].
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

fn describe_metrics() {
    describe_counter!(cache::CACHE_HITS_TOTAL, "Cache lookups that returned a value");
    describe_counter!(cache::CACHE_MISSES_TOTAL, "Cache lookups that found nothing usable");
    describe_counter!(cache::CACHE_EVICTIONS_TOTAL, "Entries evicted to stay within limits");
    describe_counter!(cache::CACHE_EXPIRATIONS_TOTAL, "Entries removed after their TTL");
    describe_counter!(cache::CACHE_UNCACHEABLE_TOTAL, "Responses that could not be encoded");
    describe_gauge!(cache::CACHE_ENTRIES, "Live cache entries");
    describe_gauge!(cache::CACHE_SIZE_BYTES, Unit::Bytes, "Bytes held by keys and payloads");
    describe_counter!(cache::INVALIDATIONS_TOTAL, "Invalidations by mode and table");
    describe_counter!(cache::INVALIDATED_ENTRIES_TOTAL, "Entries removed by invalidation");
    describe_gauge!(cache::MEMORY_RESIDENT_BYTES, Unit::Bytes, "Last sampled resident memory");
    describe_counter!(cache::MEMORY_PRESSURE_CLEARS_TOTAL, "Full clears due to memory pressure");

    describe_counter!(feed::FEED_EVENTS_TOTAL, "Change events received per table");
    describe_counter!(feed::FEED_DROPPED_EVENTS_TOTAL, "Change events dropped on a full queue");
    describe_counter!(feed::FEED_RECONNECTS_TOTAL, "Successful change feed reconnects");
    describe_counter!(feed::FEED_CONNECT_FAILURES_TOTAL, "Failed or lost subscriptions");
    describe_gauge!(feed::FEED_CONNECTED, "1 while the change feed is subscribed");
}
