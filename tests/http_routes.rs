//! Module Server Route Tests
//!
//! Requests go through the full router with `tower::ServiceExt::oneshot`;
//! other modules are served by a static client.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use ctxmesh::aggregator::{ModuleError, StaticModuleClient};
use ctxmesh::auth::Identity;
use ctxmesh::config::AppConfig;
use ctxmesh::http_server::{AppState, ModuleServer};
use serde_json::{json, Value};
use tower::ServiceExt;

// =============================================================================
// Test Utilities
// =============================================================================

fn build(client: StaticModuleClient) -> (Router, AppState) {
    let mut config = AppConfig::default();
    config.server.module = "finbot".into();
    config.aggregation.timeout_ms = 100;
    let server = ModuleServer::with_client(config, Arc::new(client)).unwrap();
    (server.router(), server.state().clone())
}

fn bearer(state: &AppState) -> String {
    let token = state
        .jwt
        .issue(&Identity {
            user_id: "u-1".into(),
            email: "ops@example.com".into(),
            role: "admin".into(),
        })
        .unwrap();
    format!("Bearer {}", token)
}

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post(uri: &str, auth: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::get(uri);
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::empty()).unwrap()
}

// =============================================================================
// Health and auth
// =============================================================================

#[tokio::test]
async fn test_health_needs_no_credential() {
    let (router, _) = build(StaticModuleClient::new());
    let (status, body) = call(&router, get("/finbot/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "finbot");
}

#[tokio::test]
async fn test_routes_are_module_prefixed() {
    let (router, _) = build(StaticModuleClient::new());
    let (status, _) = call(&router, get("/mubot/health", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_missing_and_forged_credentials() {
    let (router, state) = build(StaticModuleClient::new());

    let (status, body) = call(&router, post("/finbot/aggregate", None, json!({"query": "q"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "authentication_error");

    let (status, _) = call(&router, get("/finbot/context", Some("Bearer forged"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(state.metrics.snapshot().auth_failures, 1);
}

// =============================================================================
// Aggregation
// =============================================================================

#[tokio::test]
async fn test_aggregate_partial_failure_is_ok() {
    let client = StaticModuleClient::new()
        .respond("finbot", json!({"context": {"balance": 100}}))
        .respond("mubot", json!({"ingested": 4}))
        .delay("dese", Duration::from_secs(5));
    let (router, state) = build(client);
    let auth = bearer(&state);

    let (status, body) = call(
        &router,
        post(
            "/finbot/aggregate",
            Some(&auth),
            json!({"query": "month end", "modules": ["finbot", "mubot", "dese"]}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["query"], "month end");
    let aggregated = &body["aggregated"];
    assert_eq!(aggregated["context"]["finbot"]["balance"], 100);
    assert_eq!(aggregated["context"]["mubot"]["ingested"], 4);
    assert_eq!(aggregated["errors"].as_array().unwrap().len(), 1);
    assert_eq!(aggregated["errors"][0]["module"], "dese");
    assert_eq!(aggregated["metadata"]["totalModules"], 3);
    assert_eq!(aggregated["metadata"]["succeeded"], 2);
    assert_eq!(aggregated["priorities"]["finbot"], 9);
}

#[tokio::test]
async fn test_aggregate_total_failure_is_502() {
    let client = StaticModuleClient::new()
        .fail("finbot", ModuleError::Status(500))
        .fail("mubot", ModuleError::Unavailable("connection refused".into()));
    let (router, state) = build(client);
    let auth = bearer(&state);

    let (status, body) = call(
        &router,
        post(
            "/finbot/aggregate",
            Some(&auth),
            json!({"query": "q", "modules": ["finbot", "mubot"]}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "total_failure");
    assert_eq!(body["errors"].as_array().unwrap().len(), 2);
    assert_eq!(body["errors"][1]["code"], "unavailable");
    assert_eq!(body["errors"][1]["error"], "Module unreachable");
    assert!(!body.to_string().contains("connection refused"));
}

#[tokio::test]
async fn test_aggregate_validation() {
    let (router, state) = build(StaticModuleClient::new());
    let auth = bearer(&state);

    let (status, body) = call(
        &router,
        post("/finbot/aggregate", Some(&auth), json!({"query": "q", "modules": ["payroll"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, _) = call(&router, post("/finbot/aggregate", Some(&auth), json!({"modules": []}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::post("/finbot/aggregate")
        .header(header::AUTHORIZATION, auth.as_str())
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = call(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

// =============================================================================
// Ingestion, context and metrics
// =============================================================================

#[tokio::test]
async fn test_ingest_then_context() {
    let (router, state) = build(StaticModuleClient::new());
    let auth = bearer(&state);

    let (status, body) = call(
        &router,
        post(
            "/finbot/events",
            Some(&auth),
            json!({
                "id": "tx-1",
                "type": "finbot.transactions.created",
                "source": "finbot",
                "timestamp": "2026-03-01T12:00:00Z",
                "data": {"amount": 30}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["stream"], "finbot.events");
    assert_eq!(body["id"], "tx-1");

    let (status, body) = call(&router, get("/finbot/context?query=recent", Some(&auth))).await;
    assert_eq!(status, StatusCode::OK);
    let context = &body["context"];
    assert_eq!(context["query"], "recent");
    assert_eq!(context["recentEvents"][0]["event"]["id"], "tx-1");
}

#[tokio::test]
async fn test_ingest_rejects_invalid_event() {
    let (router, state) = build(StaticModuleClient::new());
    let auth = bearer(&state);

    let (status, body) = call(
        &router,
        post("/finbot/events", Some(&auth), json!({"fields": {"id": "x"}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    assert!(state.log.range("finbot.events", 0, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_metrics_snapshot() {
    let (router, state) = build(StaticModuleClient::new());
    let auth = bearer(&state);

    let (status, body) = call(&router, get("/finbot/metrics", Some(&auth))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["module"], "finbot");
    assert!(body["counters"]["eventsAppended"].is_u64());
    assert!(body["cache"]["entries"].is_u64());
}
