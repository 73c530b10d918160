//! Breaker-wrapped HTTP client for the backend services.
//!
//! Every call runs under the circuit breaker registered for its service.
//! Transport failures and 5xx responses count against the breaker; any
//! other response is passed through to the caller, body and status
//! intact.

use std::sync::Arc;

use serde_json::Value;

use crate::circuit_breaker::BreakerRegistry;
use crate::config::Config;
use crate::error::{GatewayError, Result};

pub const AGENT: &str = "agent";
pub const MEMORY: &str = "memory";
pub const COGNITIVE: &str = "cognitive";
pub const SECURITY: &str = "security";
pub const WALLET: &str = "wallet";

/// Response relayed from a downstream service
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

pub struct DownstreamClient {
    client: reqwest::Client,
    breakers: Arc<BreakerRegistry>,
    agent_url: String,
    memory_url: String,
    cognitive_url: String,
    security_url: String,
    wallet_url: String,
}

impl DownstreamClient {
    pub fn new(config: &Config, client: reqwest::Client, breakers: Arc<BreakerRegistry>) -> Self {
        DownstreamClient {
            client,
            breakers,
            agent_url: config.agent_service_url.clone(),
            memory_url: config.memory_service_url.clone(),
            cognitive_url: config.cognitive_service_url.clone(),
            security_url: config.security_service_url.clone(),
            wallet_url: config.wallet_service_url.clone(),
        }
    }

    fn base_url(&self, service: &str) -> Result<&str> {
        match service {
            AGENT => Ok(&self.agent_url),
            MEMORY => Ok(&self.memory_url),
            COGNITIVE => Ok(&self.cognitive_url),
            SECURITY => Ok(&self.security_url),
            WALLET => Ok(&self.wallet_url),
            other => Err(GatewayError::Internal(format!(
                "no route for service '{}'",
                other
            ))),
        }
    }

    pub async fn get(&self, service: &str, path: &str) -> Result<UpstreamResponse> {
        self.request(service, reqwest::Method::GET, path, None).await
    }

    pub async fn post_json(
        &self,
        service: &str,
        path: &str,
        body: &Value,
    ) -> Result<UpstreamResponse> {
        self.request(service, reqwest::Method::POST, path, Some(body.clone()))
            .await
    }

    async fn request(
        &self,
        service: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<UpstreamResponse> {
        let url = format!("{}{}", self.base_url(service)?.trim_end_matches('/'), path);
        let breaker = self.breakers.get(service);

        breaker
            .call(|| async {
                let mut request = self.client.request(method, &url);
                if let Some(json) = &body {
                    request = request.json(json);
                }

                let response = request.send().await.map_err(|err| GatewayError::Upstream {
                    service: service.to_string(),
                    message: err.to_string(),
                })?;

                let status = response.status();
                if status.is_server_error() {
                    return Err(GatewayError::Upstream {
                        service: service.to_string(),
                        message: format!("upstream returned {}", status),
                    });
                }

                let content_type = response
                    .headers()
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = response.bytes().await.map_err(|err| GatewayError::Upstream {
                    service: service.to_string(),
                    message: err.to_string(),
                })?;

                Ok(UpstreamResponse {
                    status: status.as_u16(),
                    content_type,
                    body: body.to_vec(),
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with(config: Config) -> DownstreamClient {
        let breakers = Arc::new(BreakerRegistry::new(&config));
        DownstreamClient::new(&config, reqwest::Client::new(), breakers)
    }

    #[test]
    fn test_unknown_service_has_no_route() {
        let client = client_with(Config::default());
        assert!(matches!(
            client.base_url("billing"),
            Err(GatewayError::Internal(_))
        ));
        assert_eq!(client.base_url(AGENT).unwrap(), "http://localhost:9000");
    }

    #[tokio::test]
    async fn test_transport_failure_is_upstream_error() {
        let config = Config {
            agent_service_url: "http://127.0.0.1:1".to_string(),
            ..Config::default()
        };
        let client = client_with(config);

        let result = client.get(AGENT, "/api/chat").await;
        assert!(matches!(
            result,
            Err(GatewayError::Upstream { service, .. }) if service == "agent"
        ));
    }

    #[tokio::test]
    async fn test_repeated_failures_open_the_breaker() {
        let config = Config {
            agent_service_url: "http://127.0.0.1:1".to_string(),
            breaker_failure_threshold: 2,
            ..Config::default()
        };
        let client = client_with(config);

        for _ in 0..2 {
            let result = client.get(AGENT, "/health").await;
            assert!(matches!(result, Err(GatewayError::Upstream { .. })));
        }

        let rejected = client.get(AGENT, "/health").await;
        assert!(matches!(
            rejected,
            Err(GatewayError::CircuitOpen { service }) if service == "agent"
        ));
    }
}
