use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::identity::Tier;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error taxonomy.
///
/// Rejections (rate limit, quota, open circuit) are deliberate control-flow
/// signals converted into structured user-visible responses. Infrastructure
/// faults (`Store`) never reach a caller directly; they trigger fallback
/// behavior and are only logged.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("daily message quota exceeded")]
    QuotaExceeded {
        limit: u32,
        used: u32,
        tier: Tier,
        reset_in_hours: u64,
    },

    #[error("circuit breaker is open for service '{service}'")]
    CircuitOpen { service: String },

    #[error("upstream service '{service}' error: {message}")]
    Upstream { service: String, message: String },

    #[error("backing store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        GatewayError::Store(err.to_string())
    }
}

/// Structured error body returned to callers
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RateLimited { .. } | GatewayError::QuotaExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Store(_) | GatewayError::Config(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            GatewayError::RateLimited { retry_after_secs } => ErrorBody {
                error: "rate_limited",
                message: "Too many requests, please try again later".to_string(),
                details: Some(json!({ "retry_after_seconds": retry_after_secs })),
            },
            GatewayError::QuotaExceeded {
                limit,
                used,
                tier,
                reset_in_hours,
            } => ErrorBody {
                error: "quota_exceeded",
                message: format!(
                    "Daily message limit reached for the {} tier",
                    tier.as_str()
                ),
                details: Some(json!({
                    "limit": limit,
                    "used": used,
                    "tier": tier.as_str(),
                    "reset_in_hours": reset_in_hours,
                })),
            },
            GatewayError::CircuitOpen { service } => ErrorBody {
                error: "service_unavailable",
                message: format!("Service '{}' is temporarily unavailable", service),
                details: Some(json!({ "service": service })),
            },
            GatewayError::Upstream { service, message } => ErrorBody {
                error: "upstream_error",
                message: message.clone(),
                details: Some(json!({ "service": service })),
            },
            // Store faults are contained by the callers; if one ever
            // surfaces here, hide the substrate detail from the client.
            GatewayError::Store(_) | GatewayError::Internal(_) => ErrorBody {
                error: "internal_error",
                message: "An internal error occurred".to_string(),
                details: None,
            },
            GatewayError::Config(message) => ErrorBody {
                error: "configuration_error",
                message: message.clone(),
                details: None,
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, Json(self.body())).into_response();

        if let GatewayError::RateLimited { retry_after_secs } = &self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            GatewayError::RateLimited { retry_after_secs: 30 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::CircuitOpen { service: "agent".into() }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Store("down".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_quota_exceeded_body() {
        let err = GatewayError::QuotaExceeded {
            limit: 50,
            used: 50,
            tier: Tier::Free,
            reset_in_hours: 3,
        };
        let body = err.body();
        assert_eq!(body.error, "quota_exceeded");
        let details = body.details.unwrap();
        assert_eq!(details["limit"], 50);
        assert_eq!(details["reset_in_hours"], 3);
    }

    #[test]
    fn test_store_error_is_hidden() {
        let body = GatewayError::Store("redis timeout".into()).body();
        assert_eq!(body.error, "internal_error");
        assert!(!body.message.contains("redis"));
    }
}
