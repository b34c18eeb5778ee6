//! Operator admin endpoints.
//!
//! Served on the admin listener only (localhost by default), never on the
//! public API.
//!
//! # Endpoints
//!
//! - `GET /healthz` - Liveness plus change feed state
//! - `GET /metrics` - Prometheus text format
//! - `GET /admin/cache/stats` - Hit/miss counters and usage
//! - `GET /admin/cache/stats/detailed` - Per-group usage, limits, memory reading
//! - `POST /admin/cache/clear` - Clear everything, one table, or a composite scope
//! - `PUT /admin/cache/version` - Switch the API key version
//! - `GET /admin/realtime/status` - Supervisor, listener and coordinator state

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post, put},
};
use hirebridge_cache::{
    CacheStatsSnapshot, CoordinatorStatsSnapshot, DetailedCacheStats, InvalidationCoordinator,
    OPERATOR_CLEAR_REASON, ResponseCache,
};
use hirebridge_realtime::{ConnectionSupervisor, ListenerState, SupervisorState, SupervisorStatus};
use serde::{Deserialize, Serialize};

use crate::error::AdminError;

// =============================================================================
// Types
// =============================================================================

/// Shared state of the admin routes.
#[derive(Clone)]
pub struct AdminState {
    pub cache: Arc<ResponseCache>,
    pub coordinator: Option<Arc<InvalidationCoordinator>>,
    pub supervisor: Option<Arc<ConnectionSupervisor>>,
}

impl AdminState {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self {
            cache,
            coordinator: None,
            supervisor: None,
        }
    }

    pub fn with_realtime(
        mut self,
        coordinator: Arc<InvalidationCoordinator>,
        supervisor: Arc<ConnectionSupervisor>,
    ) -> Self {
        self.coordinator = Some(coordinator);
        self.supervisor = Some(supervisor);
        self
    }
}

/// What `POST /admin/cache/clear` removes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearScope {
    #[default]
    All,
    /// Entries owned by `table`, optionally plus one record's entity entries
    Table,
    EmploymentStatus,
    Visibility,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearRequest {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub scope: ClearScope,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub record_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearResponse {
    pub scope: ClearScope,
    pub removed: usize,
}

#[derive(Debug, Deserialize)]
pub struct VersionRequest {
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub previous: String,
    pub current: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerView {
    pub state: ListenerState,
    pub tables: Vec<String>,
    pub forwarded: u64,
    pub dropped: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeStatus {
    pub enabled: bool,
    pub supervisor: Option<SupervisorStatus>,
    pub listener: Option<ListenerView>,
    pub coordinator: Option<CoordinatorStatsSnapshot>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub cache_entries: usize,
    pub realtime: Option<SupervisorState>,
}

// =============================================================================
// Router
// =============================================================================

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/admin/cache/stats", get(cache_stats))
        .route("/admin/cache/stats/detailed", get(cache_stats_detailed))
        .route("/admin/cache/clear", post(clear_cache))
        .route("/admin/cache/version", put(set_version))
        .route("/admin/realtime/status", get(realtime_status))
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

/// The cache keeps serving while the change feed is down, so a failed feed
/// reports `degraded` rather than an error status.
pub async fn healthz(State(state): State<AdminState>) -> Json<HealthResponse> {
    let realtime = state.supervisor.as_ref().map(|s| s.status().state);
    let status = match realtime {
        Some(SupervisorState::Failed) => "degraded",
        _ => "ok",
    };
    Json(HealthResponse {
        status,
        cache_entries: state.cache.store().len(),
        realtime,
    })
}

pub async fn metrics() -> Result<impl IntoResponse, AdminError> {
    let body = crate::metrics::render_metrics()
        .ok_or_else(|| AdminError::Unavailable("metrics recorder not installed".into()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

pub async fn cache_stats(State(state): State<AdminState>) -> Json<CacheStatsSnapshot> {
    Json(state.cache.stats())
}

pub async fn cache_stats_detailed(State(state): State<AdminState>) -> Json<DetailedCacheStats> {
    Json(state.cache.detailed_stats())
}

pub async fn clear_cache(
    State(state): State<AdminState>,
    Json(request): Json<ClearRequest>,
) -> Result<impl IntoResponse, AdminError> {
    let cache = &state.cache;
    let removed = match request.scope {
        ClearScope::All => {
            let reason = match request.reason.as_deref().map(str::trim) {
                Some(reason) if !reason.is_empty() => format!("{OPERATOR_CLEAR_REASON}: {reason}"),
                _ => OPERATOR_CLEAR_REASON.to_string(),
            };
            cache.clear_all(&reason)
        }
        ClearScope::Table => {
            let table = request
                .table
                .as_deref()
                .ok_or_else(|| AdminError::bad_request("scope 'table' requires 'table'"))?;
            if cache.rules().owned_patterns(table).is_none() {
                return Err(AdminError::bad_request(format!(
                    "no cache entries are owned by table '{table}'"
                )));
            }
            cache.clear_by_table(table, request.record_id.as_deref(), None)
        }
        ClearScope::EmploymentStatus => cache.clear_employment_status_cache(),
        ClearScope::Visibility => cache.clear_visibility_cache(),
    };

    tracing::info!(
        scope = ?request.scope,
        table = ?request.table,
        reason = ?request.reason,
        removed,
        "Operator cleared cache"
    );

    Ok((
        StatusCode::OK,
        Json(ClearResponse {
            scope: request.scope,
            removed,
        }),
    ))
}

pub async fn set_version(
    State(state): State<AdminState>,
    Json(request): Json<VersionRequest>,
) -> Result<Json<VersionResponse>, AdminError> {
    let previous = state.cache.set_version(request.version)?;
    Ok(Json(VersionResponse {
        previous: previous.to_string(),
        current: state.cache.version().to_string(),
    }))
}

pub async fn realtime_status(State(state): State<AdminState>) -> Json<RealtimeStatus> {
    let listener = state.supervisor.as_ref().map(|supervisor| {
        let listener = supervisor.listener();
        ListenerView {
            state: listener.state(),
            tables: listener.tables().to_vec(),
            forwarded: listener.forwarded(),
            dropped: listener.dropped(),
        }
    });

    Json(RealtimeStatus {
        enabled: state.supervisor.is_some(),
        supervisor: state.supervisor.as_ref().map(|s| s.status()),
        listener,
        coordinator: state.coordinator.as_ref().map(|c| c.stats()),
    })
}
