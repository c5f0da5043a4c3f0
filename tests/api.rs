//! HTTP surface tests: the full router over in-memory stores.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use queuedesk::config::Config;
use queuedesk::events::RoomHub;
use queuedesk::store::memory::{MemoryCatalog, MemoryFastStore, MemoryLedger};
use queuedesk::store::{ConnectionState, Stores};
use queuedesk::{api, AppState};

fn app_with(connection: ConnectionState) -> Router {
    let catalog = MemoryCatalog::new()
        .with_service("DEP", "Deposit", true)
        .with_service("WDL", "Withdrawal", true)
        .with_service("LOAN", "Loans", false)
        .with_counter(1, "Counter 1", &["DEP"], true)
        .with_counter(2, "Counter 2", &["WDL"], false);
    let stores = Stores::new(
        Arc::new(catalog),
        Arc::new(MemoryLedger::new()),
        Arc::new(MemoryFastStore::new()),
        connection,
    );
    let state = AppState::new(stores, RoomHub::new(16), Config::default());
    api::app(Arc::new(state))
}

fn app() -> Router {
    app_with(ConnectionState::new(true))
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

mod tokens {
    use super::*;

    #[tokio::test]
    async fn test_create_returns_201_with_summary() {
        let app = app();
        let (status, body) = send(&app, post_json("/api/v1/tokens", json!({ "service_id": "DEP" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["display_number"], "DEP-001");
        assert_eq!(body["counter_id"], 1);
        assert_eq!(body["counter_name"], "Counter 1");
        assert_eq!(body["service_name"], "Deposit");
    }

    #[tokio::test]
    async fn test_create_without_service_is_400() {
        let app = app();
        let (status, body) = send(&app, post_json("/api/v1/tokens", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "validation_error");
        assert_eq!(body["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let app = app();
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/tokens")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "validation_error");
    }

    #[tokio::test]
    async fn test_no_open_counter_is_409() {
        let app = app();
        let (status, body) = send(&app, post_json("/api/v1/tokens", json!({ "service": "withdrawal" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "no_available_counter");
        assert_eq!(body["error"]["type"], "domain_error");
    }

    #[tokio::test]
    async fn test_queue_down_is_503_with_retry_after() {
        let app = app_with(ConnectionState::new(false));
        let resp = app
            .clone()
            .oneshot(post_json("/api/v1/tokens", json!({ "service_id": "DEP" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "5");
    }

    #[tokio::test]
    async fn test_full_lifecycle_over_http() {
        let app = app();
        let (_, created) = send(&app, post_json("/api/v1/tokens", json!({ "service_id": "DEP" }))).await;
        let token_id = created["token_id"].as_str().unwrap().to_string();

        let (status, called) = send(&app, post("/api/v1/counters/1/next")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(called["token_id"], token_id.as_str());
        assert_eq!(called["status"], "called");

        let (status, served) = send(&app, post(&format!("/api/v1/tokens/{}/serve", token_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(served["status"], "served");

        let (status, body) = send(&app, post(&format!("/api/v1/tokens/{}/skip", token_id))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "invalid_transition");
    }

    #[tokio::test]
    async fn test_skip_then_recall() {
        let app = app();
        let (_, created) = send(&app, post_json("/api/v1/tokens", json!({ "service_id": "DEP" }))).await;
        let token_id = created["token_id"].as_str().unwrap().to_string();

        let (status, skipped) = send(&app, post(&format!("/api/v1/tokens/{}/skip", token_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(skipped["token"]["status"], "skipped");
        assert!(skipped.get("warning").is_none());

        let (status, recalled) = send(
            &app,
            post_json(&format!("/api/v1/tokens/{}/recall", token_id), json!({ "counter_id": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(recalled["status"], "called");
    }

    #[tokio::test]
    async fn test_unknown_token_is_404() {
        let app = app();
        let (status, body) = send(&app, get("/api/v1/tokens/20251220-999")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "token_not_found");
    }

    #[tokio::test]
    async fn test_history_rejects_unknown_status() {
        let app = app();
        let (status, _) = send(&app, get("/api/v1/tokens?status=finished")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, get("/api/v1/tokens?status=pending&limit=10")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
    }
}

mod counters {
    use super::*;

    #[tokio::test]
    async fn test_empty_queue_message() {
        let app = app();
        let (status, body) = send(&app, post("/api/v1/counters/1/next")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "No tokens in queue");
    }

    #[tokio::test]
    async fn test_closed_counter_is_409() {
        let app = app();
        let (status, body) = send(&app, post("/api/v1/counters/2/next")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "counter_closed");
    }

    #[tokio::test]
    async fn test_overview_embeds_queue() {
        let app = app();
        send(&app, post_json("/api/v1/tokens", json!({ "service_id": "DEP" }))).await;

        let (status, body) = send(&app, get("/api/v1/counters")).await;
        assert_eq!(status, StatusCode::OK);
        let counters = body.as_array().unwrap();
        assert_eq!(counters.len(), 2);
        assert_eq!(counters[0]["counter_id"], 1);
        assert_eq!(counters[0]["queue"].as_array().unwrap().len(), 1);
        assert!(counters[0]["current"].is_null());
    }

    #[tokio::test]
    async fn test_resync_reports_counts() {
        let app = app();
        send(&app, post_json("/api/v1/tokens", json!({ "service_id": "DEP" }))).await;

        let (status, body) = send(&app, post("/api/v1/queue/resync")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "counters": 2, "tokens": 1, "daily_sequence": 1 }));
    }

    #[tokio::test]
    async fn test_services_lists_active_only() {
        let app = app();
        let (status, body) = send(&app, get("/api/v1/services")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
    }
}

mod probes {
    use super::*;

    #[tokio::test]
    async fn test_readiness_follows_connection_flag() {
        let connection = ConnectionState::new(true);
        let app = app_with(connection.clone());
        let resp = app.clone().oneshot(get("/readyz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        connection.mark_disconnected();
        let resp = app.clone().oneshot(get("/readyz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_api_route_is_404() {
        let app = app();
        let resp = app.clone().oneshot(get("/api/v1/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
