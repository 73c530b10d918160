//! Router assembly, shared state and server lifecycle.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{middleware, Router};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cache::ResponseCache;
use crate::circuit_breaker::BreakerRegistry;
use crate::config::Config;
use crate::downstream::DownstreamClient;
use crate::error::{GatewayError, Result};
use crate::handlers;
use crate::health::HealthMonitor;
use crate::metrics::MetricsCollector;
use crate::middleware::{cache_middleware, logging_middleware, rate_limit_middleware};
use crate::quota::QuotaTracker;
use crate::rate_limiter::RateLimiter;
use crate::redis::SharedStore;

/// Everything the handlers and middlewares need, constructed once at
/// startup and injected through the router
pub struct AppState {
    pub config: Config,
    pub store: Option<Arc<SharedStore>>,
    pub rate_limiter: RateLimiter,
    pub quota: QuotaTracker,
    pub breakers: Arc<BreakerRegistry>,
    pub downstream: DownstreamClient,
    pub monitor: Arc<HealthMonitor>,
    pub cache: ResponseCache,
    pub metrics: MetricsCollector,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let store = if config.has_redis() {
            Some(Arc::new(SharedStore::new(&config.redis_url).map_err(
                |err| GatewayError::Config(format!("redis: {}", err)),
            )?))
        } else {
            None
        };

        let breakers = Arc::new(BreakerRegistry::new(&config));
        let http_client = reqwest::Client::new();

        Ok(AppState {
            rate_limiter: RateLimiter::new(&config, store.clone()),
            quota: QuotaTracker::new(&config, store.clone()),
            downstream: DownstreamClient::new(&config, http_client.clone(), breakers.clone()),
            monitor: Arc::new(HealthMonitor::new(&config, http_client)),
            cache: ResponseCache::new(config.cache_max_entries),
            metrics: MetricsCollector::new(),
            breakers,
            store,
            config,
        })
    }
}

/// Build the router. Layer order is outermost first: tracing, CORS,
/// request logging, response cache, rate limiter. The cache sits outside
/// the limiter so cache hits consume no rate-limit budget.
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::readiness))
        .route("/live", get(handlers::liveness))
        .route("/metrics", get(handlers::metrics_report))
        .route("/api/quota", get(handlers::quota_usage))
        .route("/api/chat", post(handlers::chat))
        .route("/api/memories", get(handlers::list_memories))
        .route("/api/conversations", get(handlers::list_conversations))
        .route("/api/cognitive/profile", get(handlers::cognitive_profile))
        .route("/api/breakers", get(handlers::breaker_status))
        .with_state(state.clone())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware))
                .layer(middleware::from_fn_with_state(state.clone(), cache_middleware))
                .layer(middleware::from_fn_with_state(state, rate_limit_middleware)),
        )
}

pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        Ok(Server {
            state: Arc::new(AppState::new(config)?),
        })
    }

    pub async fn run(self) -> Result<()> {
        let app = create_app(self.state.clone());

        self.state.monitor.start();
        let pruner = spawn_window_pruner(self.state.clone());

        let bind_addr = self.state.config.bind_addr;
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|err| GatewayError::Config(format!("cannot bind {}: {}", bind_addr, err)))?;

        tracing::info!(
            %bind_addr,
            store = self.state.store.is_some(),
            "gateway listening"
        );

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|err| GatewayError::Internal(format!("server error: {}", err)));

        pruner.abort();
        self.state.monitor.stop();
        result
    }
}

/// Periodically drop idle process-local rate-limit windows so the
/// fallback map does not accumulate one entry per identity forever
fn spawn_window_pruner(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        tick.tick().await;
        loop {
            tick.tick().await;
            let removed = state.rate_limiter.prune_local();
            if removed > 0 {
                tracing::debug!(removed, "pruned idle rate-limit windows");
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            tracing::info!("received terminate signal, shutting down");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_without_redis_runs_local() {
        let state = AppState::new(Config::default()).unwrap();
        assert!(state.store.is_none());
    }

    #[test]
    fn test_state_with_redis_url() {
        let config = Config {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            ..Config::default()
        };
        let state = AppState::new(config).unwrap();
        assert!(state.store.is_some());
    }

    #[test]
    fn test_invalid_redis_url_is_config_error() {
        let config = Config {
            redis_url: "not a url".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            AppState::new(config),
            Err(GatewayError::Config(_))
        ));
    }
}
