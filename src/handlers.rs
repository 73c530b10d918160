//! HTTP handlers: infrastructure probes, accounting endpoints and the
//! proxied companion API surface.

use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::downstream::{UpstreamResponse, AGENT, COGNITIVE, MEMORY};
use crate::error::Result;
use crate::identity::{Identity, Tier};
use crate::metrics::RequestOutcome;
use crate::server::AppState;

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

fn claimed_tier(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-tier")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Aggregate gateway health with the latest downstream sweep
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = SystemTime::now()
        .duration_since(*START_TIME)
        .unwrap_or_default()
        .as_secs();

    let store_status = match &state.store {
        Some(store) => match store.ping().await {
            Ok(()) => "connected",
            Err(_) => "unreachable",
        },
        None => "not_configured",
    };

    Json(json!({
        "status": state.monitor.overall().as_str(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "store": store_status,
        "services": state.monitor.report(),
    }))
}

/// Readiness never fails over a missing store; the gateway degrades to
/// process-local accounting instead
pub async fn readiness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.store {
        Some(store) => match store.ping().await {
            Ok(()) => Json(json!({ "status": "ready", "store": "connected" })),
            Err(_) => Json(json!({
                "status": "ready",
                "store": "unreachable",
                "note": "running on process-local accounting",
            })),
        },
        None => Json(json!({
            "status": "ready",
            "store": "not_configured",
            "note": "running on process-local accounting",
        })),
    }
}

pub async fn liveness() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}

/// Request accounting, cache counters and breaker states
pub async fn metrics_report(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "global": state.metrics.global().await,
        "callers": state.metrics.all().await,
        "cache": state.cache.stats(),
        "breakers": state.breakers.snapshots(),
    }))
}

/// Daily quota snapshot for the calling identity
pub async fn quota_usage(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    headers: HeaderMap,
) -> impl IntoResponse {
    let tier = Tier::for_identity(&identity, claimed_tier(&headers).as_deref());
    let usage = state.quota.usage(&identity, tier).await;
    Json(json!({
        "identity": identity.key(),
        "usage": usage,
    }))
}

/// Chat entry point. The quota check runs before the agent call and the
/// message is only counted once the agent has answered, so a failed call
/// costs the caller nothing.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response> {
    let tier = Tier::for_identity(&identity, claimed_tier(&headers).as_deref());
    if let Err(err) = state.quota.check(&identity, tier).await {
        state
            .metrics
            .record(&identity.key(), RequestOutcome::QuotaRejected)
            .await;
        return Err(err);
    }

    let upstream = state.downstream.post_json(AGENT, "/api/chat", &payload).await?;

    state.quota.record_message(&identity).await;
    // A delivered message makes this caller's cached reads stale
    state.cache.invalidate_identity(&identity.key());

    Ok(relay(upstream))
}

pub async fn list_memories(State(state): State<Arc<AppState>>) -> Result<Response> {
    let upstream = state.downstream.get(MEMORY, "/api/memories").await?;
    Ok(relay(upstream))
}

pub async fn list_conversations(State(state): State<Arc<AppState>>) -> Result<Response> {
    let upstream = state.downstream.get(MEMORY, "/api/conversations").await?;
    Ok(relay(upstream))
}

pub async fn cognitive_profile(State(state): State<Arc<AppState>>) -> Result<Response> {
    let upstream = state.downstream.get(COGNITIVE, "/api/cognitive/profile").await?;
    Ok(relay(upstream))
}

/// Circuit breaker states for operators
pub async fn breaker_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "breakers": state.breakers.snapshots() }))
}

fn relay(upstream: UpstreamResponse) -> Response {
    let mut response = Response::builder()
        .status(upstream.status)
        .body(Body::from(upstream.body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());

    if let Some(content_type) = upstream
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        response.headers_mut().insert("content-type", content_type);
    }
    response
}
