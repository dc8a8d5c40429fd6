//! HTTP API tests against the axum router.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use labfeed_core::gateway::NOT_FOUND_TEXT;
use labfeed_core::{
    AppState, Collection, DocumentStore, MemoryStore, ServerConfig, StoreError, StoreSession, router,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

fn app(store: &MemoryStore) -> axum::Router {
    app_with(Arc::new(store.clone()), None)
}

fn app_with(store: Arc<dyn DocumentStore>, static_dir: Option<&std::path::Path>) -> axum::Router {
    router(AppState::new(store, &ServerConfig::default()), static_dir)
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let resp = ServiceExt::<Request<Body>>::oneshot(app, req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 1_000_000)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn list_experiments_returns_success_envelope() {
    let store = MemoryStore::new();
    store.insert(Collection::Experiments, json!({"id": "e1", "createdAt": 100}));

    let (status, body) = get_json(app(&store), "/experiments").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "responseCode": 0,
            "responseDesc": "Success",
            "data": [{"id": "e1", "createdAt": 100}]
        })
    );
    assert_eq!(store.open_sessions(), 0);
}

#[tokio::test]
async fn routes_are_also_served_under_api_prefix() {
    let store = MemoryStore::new();
    store.insert(Collection::Experiments, json!({"id": "e1", "createdAt": 100}));

    let (status, body) = get_json(app(&store), "/api/experiments").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["id"], "e1");

    let (_, body) = get_json(app(&store), "/api/experiments/e1").await;
    assert_eq!(body["data"]["id"], "e1");
}

#[tokio::test]
async fn get_experiment_joins_children() {
    let store = MemoryStore::new();
    store.insert(Collection::Experiments, json!({"id": "e1", "createdAt": 100}));
    store.insert(
        Collection::Transformations,
        json!({"id": "t1", "experiment_id": "e1"}),
    );
    store.insert(
        Collection::Transformations,
        json!({"id": "t2", "experiment_id": "other"}),
    );

    let (status, body) = get_json(app(&store), "/experiments/e1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["responseCode"], 0);
    assert_eq!(body["data"]["id"], "e1");
    assert_eq!(body["data"]["createdAt"], 100);
    assert_eq!(
        body["data"]["transformations"],
        json!([{"id": "t1", "experiment_id": "e1"}])
    );
    assert_eq!(body["data"]["tests"], json!([]));
    assert_eq!(body["data"]["analytics"], json!([]));
    assert_eq!(store.open_sessions(), 0);
}

#[tokio::test]
async fn missing_experiment_is_success_with_null_data() {
    let store = MemoryStore::new();
    let (status, body) = get_json(app(&store), "/experiments/ghost").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"responseCode": 0, "responseDesc": "Success", "data": null})
    );
}

#[tokio::test]
async fn unavailable_store_is_failure_envelope_with_200() {
    let store = MemoryStore::new();
    store.set_unavailable(true);

    let (status, body) = get_json(app(&store), "/experiments").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["responseCode"], 1);
    assert!(
        body["responseDesc"]
            .as_str()
            .unwrap()
            .contains("Store unavailable")
    );
    assert!(body.get("data").is_none());
}

#[tokio::test]
async fn store_failing_mid_listing_is_failure_envelope_with_200() {
    let store = MemoryStore::new();
    store.insert(Collection::Experiments, json!({"id": "e1"}));
    store.fail_queries_on(Collection::Experiments);

    let (status, body) = get_json(app(&store), "/experiments").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["responseCode"], 1);
    assert!(
        body["responseDesc"]
            .as_str()
            .unwrap()
            .contains("Query on 'experiments' failed")
    );
    assert!(body.get("data").is_none());
    assert_eq!(store.open_sessions(), 0);
}

#[tokio::test]
async fn failing_child_scan_fails_whole_detail() {
    let store = MemoryStore::new();
    store.insert(Collection::Experiments, json!({"id": "e1"}));
    store.fail_queries_on(Collection::Analytics);

    let (status, body) = get_json(app(&store), "/experiments/e1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["responseCode"], 1);
    assert!(body["responseDesc"].as_str().unwrap().contains("analytics"));
    assert_eq!(store.open_sessions(), 0);
}

#[tokio::test]
async fn unmatched_route_is_plain_404() {
    let store = MemoryStore::new();
    let (status, body) = get(app(&store), "/nope/at/all").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(String::from_utf8(body).unwrap(), NOT_FOUND_TEXT);
}

#[tokio::test]
async fn static_dir_serves_files_then_404s() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>labfeed</h1>").unwrap();
    let store = MemoryStore::new();

    let (status, body) = get(app_with(Arc::new(store.clone()), Some(dir.path())), "/index.html").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap(), "<h1>labfeed</h1>");

    let (status, body) = get(app_with(Arc::new(store.clone()), Some(dir.path())), "/missing.js").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(String::from_utf8(body).unwrap(), NOT_FOUND_TEXT);

    // API routes win over the static fallback.
    let (_, body) = get_json(app_with(Arc::new(store), Some(dir.path())), "/experiments").await;
    assert_eq!(body["responseCode"], 0);
}

/// A store whose sessions blow up, to exercise the panic boundary.
struct PanickingStore;

#[async_trait]
impl DocumentStore for PanickingStore {
    async fn open_session(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        panic!("store exploded");
    }

    fn backend(&self) -> &'static str {
        "panicking"
    }
}

#[tokio::test]
async fn handler_panic_becomes_500_with_err_body() {
    let (status, body) = get_json(app_with(Arc::new(PanickingStore), None), "/experiments").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({"err": "store exploded"}));
}

#[tokio::test]
async fn health_reports_backend() {
    let store = MemoryStore::new();
    let (status, body) = get_json(app(&store), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "memory");
    assert_eq!(body["connections"], 0);
}
