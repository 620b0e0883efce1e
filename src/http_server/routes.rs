//! Module Server Routes
//!
//! Endpoints of one module, nested under `/{module}`:
//!
//! - `GET  /ws` - real-time WebSocket endpoint
//! - `POST /aggregate` - cross-module context aggregation
//! - `GET  /context` - this module's context (cached)
//! - `GET  /metrics` - this module's counters (cached)
//! - `GET  /health` - liveness, no credential
//! - `POST /events` - event ingestion into `{module}.events`

use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::errors::ApiError;
use super::state::AppState;
use crate::aggregator::{AggregateError, AggregateRequest};
use crate::auth::{extract_bearer_token, AuthError, Identity};
use crate::cache::{CONTEXT_TTL, METRICS_TTL};
use crate::event_log::Event;

/// Routes of one module, to be nested under `/{module}`
pub fn module_routes(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/aggregate", post(aggregate_handler))
        .route("/context", get(context_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/events", post(ingest_handler))
        .with_state(state)
}

/// Validate the bearer credential, returning the caller and the raw token
fn authenticate<'h>(state: &AppState, headers: &'h HeaderMap) -> Result<(Identity, &'h str), ApiError> {
    let token = extract_bearer_token(headers).ok_or(AuthError::MissingToken)?;
    match state.jwt.authenticate(token) {
        Ok(identity) => Ok((identity, token)),
        Err(e) => {
            state.metrics.increment_auth_failures();
            Err(e.into())
        }
    }
}

fn parse_body(body: &[u8]) -> Result<Value, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))
}

// ==================
// Real-time
// ==================

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| gateway.serve_socket(socket))
}

// ==================
// Aggregation
// ==================

async fn aggregate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let (identity, token) = authenticate(&state, &headers)?;

    let request: AggregateRequest = serde_json::from_value(parse_body(&body)?)
        .map_err(|e| AggregateError::InvalidRequest(e.to_string()))?;
    debug!(user_id = %identity.user_id, query = %request.query, "aggregation requested");

    let response = state.aggregator.aggregate(&request, Some(token)).await?;
    Ok((StatusCode::OK, Json(response)))
}

// ==================
// Module context and metrics
// ==================

#[derive(Debug, Deserialize)]
struct ContextParams {
    #[serde(default)]
    query: Option<String>,
}

async fn context_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ContextParams>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(&state, &headers)?;

    let query = params.query.unwrap_or_default();
    let key = format!("ctxmesh:context:{}:{}", state.module, query);
    let context: Value = state
        .cache
        .get_stale_on_error_json(&key, CONTEXT_TTL, || async {
            state.module_context(&query).await.map_err(ApiError::from)
        })
        .await?;

    Ok(Json(json!({
        "module": state.module,
        "context": context,
    })))
}

async fn metrics_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(&state, &headers)?;

    let key = format!("ctxmesh:metrics:{}", state.module);
    let metrics: Value = state
        .cache
        .get_or_compute_json(&key, METRICS_TTL, || async {
            Ok::<_, ApiError>(state.module_metrics())
        })
        .await?;
    Ok(Json(metrics))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "module": state.module,
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "realtime": state.gateway.stats_json(),
    }))
}

// ==================
// Ingestion
// ==================

/// Decode an ingestion body: a JSON event or `{"fields": {...}}`
///
/// Non-string field values are stored as their JSON text.
pub fn parse_ingest_body(body: Value) -> Result<Event, ApiError> {
    if let Some(fields) = body.get("fields").and_then(Value::as_object) {
        let flat: BTreeMap<String, String> = fields
            .iter()
            .map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), text)
            })
            .collect();
        return Ok(Event::from_fields(&flat)?);
    }
    Ok(Event::parse(body)?)
}

async fn ingest_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let (identity, _) = authenticate(&state, &headers)?;
    let event = parse_ingest_body(parse_body(&body)?)?;

    let stream = state.events_stream();
    let id = event.id.clone();
    let offset = state.log.append(&stream, event).await?;
    state.metrics.increment_events_appended();
    info!(stream = %stream, offset, id = %id, user_id = %identity.user_id, "event ingested");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "stream": stream,
            "offset": offset,
            "id": id,
        })),
    ))
}
