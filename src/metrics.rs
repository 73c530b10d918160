//! Per-caller request accounting exposed on the metrics endpoint.
//!
//! Counters are advisory; admission decisions never depend on them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::RwLock;

/// How a request left the admission pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Allowed,
    RateLimited,
    QuotaRejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallerMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub rate_limited: u64,
    pub quota_rejected: u64,
    pub last_request: u64,
}

impl Default for CallerMetrics {
    fn default() -> Self {
        CallerMetrics {
            total_requests: 0,
            allowed_requests: 0,
            rate_limited: 0,
            quota_rejected: 0,
            last_request: now_secs(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    callers: Arc<RwLock<HashMap<String, CallerMetrics>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, identity_key: &str, outcome: RequestOutcome) {
        let mut callers = self.callers.write().await;
        let metrics = callers.entry(identity_key.to_string()).or_default();

        metrics.total_requests += 1;
        metrics.last_request = now_secs();
        match outcome {
            RequestOutcome::Allowed => metrics.allowed_requests += 1,
            RequestOutcome::RateLimited => metrics.rate_limited += 1,
            RequestOutcome::QuotaRejected => metrics.quota_rejected += 1,
        }
    }

    pub async fn caller(&self, identity_key: &str) -> Option<CallerMetrics> {
        let callers = self.callers.read().await;
        callers.get(identity_key).cloned()
    }

    pub async fn all(&self) -> HashMap<String, CallerMetrics> {
        let callers = self.callers.read().await;
        callers.clone()
    }

    /// Rollup across every caller
    pub async fn global(&self) -> CallerMetrics {
        let callers = self.callers.read().await;
        let mut global = CallerMetrics::default();

        for metrics in callers.values() {
            global.total_requests += metrics.total_requests;
            global.allowed_requests += metrics.allowed_requests;
            global.rate_limited += metrics.rate_limited;
            global.quota_rejected += metrics.quota_rejected;
            global.last_request = global.last_request.max(metrics.last_request);
        }

        global
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_read_back() {
        let collector = MetricsCollector::new();

        collector.record("user:alice", RequestOutcome::Allowed).await;
        collector.record("user:alice", RequestOutcome::RateLimited).await;
        collector.record("user:alice", RequestOutcome::QuotaRejected).await;

        let metrics = collector.caller("user:alice").await.unwrap();
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.allowed_requests, 1);
        assert_eq!(metrics.rate_limited, 1);
        assert_eq!(metrics.quota_rejected, 1);
    }

    #[tokio::test]
    async fn test_unknown_caller_is_none() {
        let collector = MetricsCollector::new();
        assert!(collector.caller("user:nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_global_rollup() {
        let collector = MetricsCollector::new();

        collector.record("user:alice", RequestOutcome::Allowed).await;
        collector.record("ip:10.0.0.1", RequestOutcome::Allowed).await;
        collector.record("ip:10.0.0.1", RequestOutcome::RateLimited).await;

        let global = collector.global().await;
        assert_eq!(global.total_requests, 3);
        assert_eq!(global.allowed_requests, 2);
        assert_eq!(global.rate_limited, 1);
        assert_eq!(collector.all().await.len(), 2);
    }
}
