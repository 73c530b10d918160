//! Request middlewares: logging, response cache, rate limiting.
//!
//! Layer order matters. The cache sits outside the rate limiter so a
//! cache hit is served without consuming any rate-limit budget; only
//! requests that reach downstream pay.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::info;

use crate::cache::{cache_key, should_cache, ttl_for, CachedResponse};
use crate::error::GatewayError;
use crate::identity::Identity;
use crate::metrics::RequestOutcome;
use crate::rate_limiter::{is_exempt_path, RateLimitDecision};
use crate::server::AppState;

/// Request/response logging with a correlation id
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let identity = Identity::from_request(&request);
    let request_id = uuid::Uuid::new_v4();

    info!(
        target: "gateway::middleware",
        %request_id,
        method = %method,
        uri = %uri,
        identity = %identity,
        "incoming request"
    );

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }

    info!(
        target: "gateway::middleware",
        %request_id,
        method = %method,
        uri = %uri,
        status = %response.status(),
        "request completed"
    );

    response
}

/// Per-minute rate limiting. OPTIONS and infrastructure paths bypass the
/// limiter and consume no budget.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS || is_exempt_path(request.uri().path()) {
        return next.run(request).await;
    }

    let identity = Identity::from_request(&request);
    let decision = state.rate_limiter.check_and_record(&identity).await;

    match decision {
        RateLimitDecision::Allowed { limit, remaining } => {
            state.metrics.record(&identity.key(), RequestOutcome::Allowed).await;
            let mut response = next.run(request).await;
            set_rate_limit_headers(&mut response, limit, remaining);
            response
        }
        RateLimitDecision::Limited { limit, retry_after_secs } => {
            state
                .metrics
                .record(&identity.key(), RequestOutcome::RateLimited)
                .await;
            let mut response = GatewayError::RateLimited { retry_after_secs }.into_response();
            set_rate_limit_headers(&mut response, limit, 0);
            response
        }
    }
}

fn set_rate_limit_headers(response: &mut Response, limit: u32, remaining: u32) {
    if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
        response.headers_mut().insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        response.headers_mut().insert("x-ratelimit-remaining", value);
    }
}

/// Response cache for allow-listed GET endpoints. Hits are served before
/// the rate limiter runs; misses populate the cache from successful JSON
/// responses.
pub async fn cache_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if !should_cache(request.method(), request.uri().path(), request.headers()) {
        return next.run(request).await;
    }

    let identity = Identity::from_request(&request);
    let path = request.uri().path().to_string();
    let key = cache_key(&path, &identity.key(), request.uri().query());

    if let Some(cached) = state.cache.get(&key) {
        return replay_cached(cached, "HIT");
    }

    let response = next.run(request).await;
    if response.status() != StatusCode::OK {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_CACHED_BODY).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, path, "failed to buffer response for cache");
            return GatewayError::Internal("response buffering failed".to_string())
                .into_response();
        }
    };

    let content_type = parts
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    state.cache.put(
        key,
        identity.key(),
        CachedResponse {
            status: parts.status.as_u16(),
            content_type,
            body: bytes.to_vec(),
        },
        ttl_for(&path),
    );

    let mut response = Response::from_parts(parts, Body::from(bytes));
    response
        .headers_mut()
        .insert("x-cache", HeaderValue::from_static("MISS"));
    response
}

const MAX_CACHED_BODY: usize = 4 * 1024 * 1024;

fn replay_cached(cached: CachedResponse, verdict: &'static str) -> Response {
    let mut response = Response::builder()
        .status(cached.status)
        .body(Body::from(cached.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());

    if let Some(content_type) = cached
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        response.headers_mut().insert("content-type", content_type);
    }
    response
        .headers_mut()
        .insert("x-cache", HeaderValue::from_static(verdict));
    response
}
