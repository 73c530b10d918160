//! Background health monitoring of downstream services.
//!
//! Each service exposes GET /health. The monitor sweeps all services
//! concurrently on a fixed cadence and keeps the latest status per
//! service: a 2xx probe is healthy, any other HTTP response is degraded,
//! and a timeout or connection failure is unhealthy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl ServiceHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceHealth::Healthy => "healthy",
            ServiceHealth::Degraded => "degraded",
            ServiceHealth::Unhealthy => "unhealthy",
            ServiceHealth::Unknown => "unknown",
        }
    }
}

/// Latest probe result for one downstream service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub health: ServiceHealth,
    /// Probe round-trip; absent when the probe never completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_checked: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

enum ProbeOutcome {
    Ok,
    HttpError(u16),
    Unreachable(String),
}

fn next_status(
    service: &str,
    outcome: ProbeOutcome,
    prior: Option<&ServiceStatus>,
    latency_ms: Option<u64>,
) -> ServiceStatus {
    let prior_failures = prior.map(|s| s.consecutive_failures).unwrap_or(0);
    let prior_success = prior.and_then(|s| s.last_success);
    let now = now_secs();

    let (health, failures, last_success, last_error) = match outcome {
        ProbeOutcome::Ok => (ServiceHealth::Healthy, 0, Some(now), None),
        ProbeOutcome::HttpError(code) => {
            tracing::warn!(service, status = code, "health probe returned error status");
            (
                ServiceHealth::Degraded,
                prior_failures + 1,
                prior_success,
                Some(format!("http status {}", code)),
            )
        }
        ProbeOutcome::Unreachable(reason) => {
            tracing::warn!(service, %reason, "health probe failed");
            (
                ServiceHealth::Unhealthy,
                prior_failures + 1,
                prior_success,
                Some(reason),
            )
        }
    };

    ServiceStatus {
        service: service.to_string(),
        health,
        latency_ms,
        consecutive_failures: failures,
        last_checked: now,
        last_success,
        last_error,
    }
}

/// Worst-of aggregation over the latest sweep
pub fn aggregate(statuses: &[ServiceStatus]) -> ServiceHealth {
    if statuses.is_empty() {
        return ServiceHealth::Unknown;
    }
    if statuses.iter().any(|s| s.health == ServiceHealth::Unhealthy) {
        return ServiceHealth::Unhealthy;
    }
    if statuses.iter().any(|s| s.health == ServiceHealth::Degraded) {
        return ServiceHealth::Degraded;
    }
    ServiceHealth::Healthy
}

pub struct HealthMonitor {
    client: reqwest::Client,
    targets: Vec<(String, String)>,
    interval: Duration,
    timeout: Duration,
    statuses: RwLock<HashMap<String, ServiceStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: &Config, client: reqwest::Client) -> Self {
        let targets = vec![
            ("agent".to_string(), config.agent_service_url.clone()),
            ("memory".to_string(), config.memory_service_url.clone()),
            ("cognitive".to_string(), config.cognitive_service_url.clone()),
            ("security".to_string(), config.security_service_url.clone()),
            ("wallet".to_string(), config.wallet_service_url.clone()),
        ];
        HealthMonitor {
            client,
            targets,
            interval: config.health_check_interval(),
            timeout: config.health_check_timeout(),
            statuses: RwLock::new(HashMap::new()),
            task: Mutex::new(None),
        }
    }

    /// Probe one service and fold the outcome into its status history
    async fn check_service(&self, service: &str, base_url: &str) -> ServiceStatus {
        let url = format!("{}/health", base_url.trim_end_matches('/'));
        let prior = self.read_statuses().get(service).cloned();

        let started = Instant::now();
        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(response) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                if response.status().is_success() {
                    next_status(service, ProbeOutcome::Ok, prior.as_ref(), Some(latency_ms))
                } else {
                    next_status(
                        service,
                        ProbeOutcome::HttpError(response.status().as_u16()),
                        prior.as_ref(),
                        Some(latency_ms),
                    )
                }
            }
            Err(err) => next_status(
                service,
                ProbeOutcome::Unreachable(err.to_string()),
                prior.as_ref(),
                None,
            ),
        }
    }

    /// Sweep every target concurrently and store the results
    pub async fn sweep(&self) {
        let probes = self
            .targets
            .iter()
            .map(|(service, url)| self.check_service(service, url));
        let results = join_all(probes).await;

        let mut statuses = match self.statuses.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for status in results {
            statuses.insert(status.service.clone(), status);
        }
    }

    /// Spawn the background sweep loop. Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if task.is_some() {
            return;
        }

        let monitor = Arc::clone(self);
        tracing::info!(
            interval_secs = monitor.interval.as_secs(),
            services = monitor.targets.len(),
            "health monitor started"
        );
        *task = Some(tokio::spawn(async move {
            loop {
                monitor.sweep().await;
                tokio::time::sleep(monitor.interval).await;
            }
        }));
    }

    /// Stop the background loop. Calling without a running loop is a no-op.
    pub fn stop(&self) {
        let mut task = match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = task.take() {
            handle.abort();
            tracing::info!("health monitor stopped");
        }
    }

    /// Latest statuses, sorted by service name
    pub fn report(&self) -> Vec<ServiceStatus> {
        let mut statuses: Vec<_> = self.read_statuses().values().cloned().collect();
        statuses.sort_by(|a, b| a.service.cmp(&b.service));
        statuses
    }

    /// Aggregate health across the latest sweep
    pub fn overall(&self) -> ServiceHealth {
        aggregate(&self.report())
    }

    fn read_statuses(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ServiceStatus>> {
        match self.statuses.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
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

    fn status(service: &str, health: ServiceHealth) -> ServiceStatus {
        ServiceStatus {
            service: service.to_string(),
            health,
            latency_ms: None,
            consecutive_failures: 0,
            last_checked: 0,
            last_success: None,
            last_error: None,
        }
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let prior = ServiceStatus {
            consecutive_failures: 4,
            ..status("agent", ServiceHealth::Unhealthy)
        };
        let healthy = next_status("agent", ProbeOutcome::Ok, Some(&prior), Some(12));
        assert_eq!(healthy.health, ServiceHealth::Healthy);
        assert_eq!(healthy.consecutive_failures, 0);
        assert_eq!(healthy.latency_ms, Some(12));
        assert!(healthy.last_success.is_some());
        assert_eq!(healthy.last_error, None);
    }

    #[test]
    fn test_http_error_is_degraded() {
        let prior = ServiceStatus {
            consecutive_failures: 1,
            last_success: Some(1_700_000_000),
            ..status("agent", ServiceHealth::Degraded)
        };
        let degraded = next_status("agent", ProbeOutcome::HttpError(503), Some(&prior), Some(8));
        assert_eq!(degraded.health, ServiceHealth::Degraded);
        assert_eq!(degraded.consecutive_failures, 2);
        assert_eq!(degraded.last_error.as_deref(), Some("http status 503"));
        // Failures keep the last known success timestamp
        assert_eq!(degraded.last_success, Some(1_700_000_000));
    }

    #[test]
    fn test_unreachable_is_unhealthy_without_latency() {
        let down = next_status(
            "agent",
            ProbeOutcome::Unreachable("connection refused".to_string()),
            None,
            None,
        );
        assert_eq!(down.health, ServiceHealth::Unhealthy);
        assert_eq!(down.consecutive_failures, 1);
        assert_eq!(down.latency_ms, None);
        assert_eq!(down.last_error.as_deref(), Some("connection refused"));
        assert_eq!(down.last_success, None);
    }

    #[test]
    fn test_aggregation_order() {
        assert_eq!(aggregate(&[]), ServiceHealth::Unknown);
        assert_eq!(
            aggregate(&[status("a", ServiceHealth::Healthy)]),
            ServiceHealth::Healthy
        );
        assert_eq!(
            aggregate(&[
                status("a", ServiceHealth::Healthy),
                status("b", ServiceHealth::Degraded),
            ]),
            ServiceHealth::Degraded
        );
        assert_eq!(
            aggregate(&[
                status("a", ServiceHealth::Degraded),
                status("b", ServiceHealth::Unhealthy),
            ]),
            ServiceHealth::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_sweep_marks_unreachable_services() {
        let config = Config {
            agent_service_url: "http://127.0.0.1:1".to_string(),
            memory_service_url: "http://127.0.0.1:1".to_string(),
            cognitive_service_url: "http://127.0.0.1:1".to_string(),
            security_service_url: "http://127.0.0.1:1".to_string(),
            wallet_service_url: "http://127.0.0.1:1".to_string(),
            health_check_timeout_secs: 1,
            ..Config::default()
        };
        let monitor = HealthMonitor::new(&config, reqwest::Client::new());

        monitor.sweep().await;

        let report = monitor.report();
        assert_eq!(report.len(), 5);
        assert!(report.iter().all(|s| s.health == ServiceHealth::Unhealthy));
        assert_eq!(monitor.overall(), ServiceHealth::Unhealthy);

        // Second sweep grows the failure streak
        monitor.sweep().await;
        assert!(monitor.report().iter().all(|s| s.consecutive_failures == 2));
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let config = Config {
            health_check_interval_secs: 3600,
            ..Config::default()
        };
        let monitor = Arc::new(HealthMonitor::new(&config, reqwest::Client::new()));

        monitor.start();
        monitor.start();
        monitor.stop();
        monitor.stop();
    }
}
