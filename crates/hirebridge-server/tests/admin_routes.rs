use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use hirebridge_cache::{CacheSettings, InvalidationCoordinator, InvalidationRules, ResponseCache};
use hirebridge_core::OverflowSignal;
use hirebridge_realtime::{
    BackoffPolicy, ChangeListener, ChangeSource, ChangeStream, ConnectionSupervisor, ListenerError,
};
use hirebridge_server::{AdminState, build_app};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower::ServiceExt;

fn cache() -> Arc<ResponseCache> {
    Arc::new(
        ResponseCache::new(
            &CacheSettings::default(),
            Arc::new(InvalidationRules::hirebridge()),
        )
        .expect("cache"),
    )
}

fn seeded_cache() -> Arc<ResponseCache> {
    let cache = cache();
    let page = json!({ "page": 1 });
    assert!(cache.set_api_response("students.list", &page, &json!(["s-1", "s-2"])));
    assert!(cache.set_api_response("students.profile", &json!({ "id": "s-1" }), &json!({ "id": "s-1" })));
    assert!(cache.set_api_response("companies.list", &page, &json!(["c-1"])));
    assert!(cache.set_api_response("lookups.cities", &json!({}), &json!(["Oslo"])));
    assert!(cache.set_entity_field("student", "s-1", "avatar_url", &"a.png"));
    cache
}

async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .oneshot(builder.body(body).unwrap())
        .await
        .expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn stats_report_hits_and_misses() {
    let cache = seeded_cache();
    let page = json!({ "page": 1 });
    let hit: Option<Value> = cache.get_api_response("students.list", &page);
    assert!(hit.is_some());
    let miss: Option<Value> = cache.get_api_response("students.search", &page);
    assert!(miss.is_none());

    let app = build_app(AdminState::new(cache));
    let (status, body) = send(app, Method::GET, "/admin/cache/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["hits"], 1);
    assert_eq!(body["misses"], 1);
    assert_eq!(body["totalCached"], 5);
}

#[tokio::test]
async fn detailed_stats_group_by_endpoint_and_entity() {
    let app = build_app(AdminState::new(seeded_cache()));
    let (status, body) = send(app, Method::GET, "/admin/cache/stats/detailed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], "v1");
    assert_eq!(body["groups"]["api:students.list"]["entries"], 1);
    assert_eq!(body["groups"]["entity:student"]["entries"], 1);
    assert_eq!(body["limits"]["maxEntries"], 5000);
    assert_eq!(body["staleVersionEntries"], 0);
    assert!(body["memory"].is_null());
}

#[tokio::test]
async fn clear_all_with_reason() {
    let cache = seeded_cache();
    let app = build_app(AdminState::new(cache.clone()));
    let (status, body) = send(
        app,
        Method::POST,
        "/admin/cache/clear",
        Some(json!({ "reason": "bad deploy" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scope"], "all");
    assert_eq!(body["removed"], 5);
    assert!(cache.store().is_empty());
}

#[tokio::test]
async fn clear_single_table_keeps_other_tables() {
    let cache = seeded_cache();
    let app = build_app(AdminState::new(cache.clone()));
    let (status, body) = send(
        app,
        Method::POST,
        "/admin/cache/clear",
        Some(json!({ "scope": "table", "table": "students", "recordId": "s-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // Both student endpoints plus the entity field
    assert_eq!(body["removed"], 3);

    let companies: Option<Value> = cache.get_api_response("companies.list", &json!({ "page": 1 }));
    assert!(companies.is_some());
}

#[tokio::test]
async fn clear_table_scope_validates_table() {
    let app = build_app(AdminState::new(seeded_cache()));
    let (status, body) = send(
        app.clone(),
        Method::POST,
        "/admin/cache/clear",
        Some(json!({ "scope": "table" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid");

    let (status, _) = send(
        app,
        Method::POST,
        "/admin/cache/clear",
        Some(json!({ "scope": "table", "table": "invoices" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn composite_scopes() {
    let cache = seeded_cache();
    let app = build_app(AdminState::new(cache.clone()));

    let (_, body) = send(
        app.clone(),
        Method::POST,
        "/admin/cache/clear",
        Some(json!({ "scope": "visibility" })),
    )
    .await;
    assert_eq!(body["removed"], 1);

    // Student endpoints, the entity field and the lookup aggregate
    let (_, body) = send(
        app,
        Method::POST,
        "/admin/cache/clear",
        Some(json!({ "scope": "employment_status" })),
    )
    .await;
    assert_eq!(body["removed"], 4);
    assert!(cache.store().is_empty());
}

#[tokio::test]
async fn version_switch() {
    let cache = seeded_cache();
    let app = build_app(AdminState::new(cache.clone()));

    let (status, _) = send(
        app.clone(),
        Method::PUT,
        "/admin/cache/version",
        Some(json!({ "version": "v2:beta" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        app.clone(),
        Method::PUT,
        "/admin/cache/version",
        Some(json!({ "version": "v2" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["previous"], "v1");
    assert_eq!(body["current"], "v2");

    let (_, body) = send(app, Method::GET, "/admin/cache/stats/detailed", None).await;
    assert_eq!(body["staleVersionEntries"], 4);
}

#[tokio::test]
async fn realtime_status_when_disabled() {
    let app = build_app(AdminState::new(cache()));
    let (status, body) = send(app.clone(), Method::GET, "/admin/realtime/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);
    assert!(body["supervisor"].is_null());

    let (status, body) = send(app, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["realtime"].is_null());
}

struct UnreachableSource;

#[async_trait]
impl ChangeSource for UnreachableSource {
    async fn subscribe(&self, _tables: &[String]) -> Result<ChangeStream, ListenerError> {
        Err(ListenerError::Closed)
    }

    fn name(&self) -> &str {
        "unreachable"
    }
}

#[tokio::test]
async fn realtime_status_reports_supervisor_and_listener() {
    let cache = cache();
    let rules = Arc::new(InvalidationRules::hirebridge());
    let (tx, _rx) = mpsc::channel(8);
    let overflow = OverflowSignal::new();
    let coordinator = Arc::new(
        InvalidationCoordinator::new(cache.clone(), rules).with_overflow_signal(overflow.clone()),
    );
    let listener = Arc::new(ChangeListener::new(
        Arc::new(UnreachableSource),
        vec!["students".into(), "companies".into()],
        tx,
        overflow,
        Duration::from_millis(50),
    ));
    let supervisor = Arc::new(ConnectionSupervisor::new(
        listener,
        BackoffPolicy::default(),
        Duration::from_secs(1),
    ));

    let app = build_app(AdminState::new(cache).with_realtime(coordinator, supervisor));
    let (status, body) = send(app, Method::GET, "/admin/realtime/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], true);
    assert_eq!(body["supervisor"]["state"]["state"], "idle");
    assert_eq!(body["supervisor"]["maxAttempts"], 5);
    assert_eq!(body["listener"]["state"], "disconnected");
    assert_eq!(body["listener"]["tables"], json!(["students", "companies"]));
    assert_eq!(body["coordinator"]["events"], 0);
}

#[tokio::test]
async fn metrics_endpoint_renders_prometheus_text() {
    hirebridge_server::metrics::init_metrics();
    let cache = seeded_cache();
    let _: Option<Value> = cache.get_api_response("students.list", &json!({ "page": 1 }));

    let app = build_app(AdminState::new(cache));
    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("hirebridge_cache_hits_total"));
}
