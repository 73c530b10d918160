//! Per-service circuit breakers for downstream calls.
//!
//! State machine: Closed counts consecutive failures and opens at the
//! failure threshold. Open rejects every call until the timeout elapses,
//! then the next attempt flips to HalfOpen. HalfOpen closes again after
//! enough consecutive successes; a single failure reopens it. Breaker
//! state is per-process, each gateway instance learns independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::Config;
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of one breaker, for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    service: String,
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(
        service: impl Into<String>,
        failure_threshold: u32,
        success_threshold: u32,
        timeout: Duration,
    ) -> Self {
        CircuitBreaker {
            service: service.into(),
            failure_threshold,
            success_threshold,
            timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a call may proceed right now. An Open breaker whose timeout
    /// has elapsed transitions to HalfOpen as a side effect.
    pub fn can_attempt(&self) -> bool {
        self.can_attempt_at(Instant::now())
    }

    fn can_attempt_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.timeout {
                    tracing::info!(service = %self.service, "circuit breaker half-open, probing");
                    inner.state = CircuitState::HalfOpen;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    tracing::info!(service = %self.service, "circuit breaker closed");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                }
            }
            // A success racing the timeout check has no window to act on
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    tracing::warn!(
                        service = %self.service,
                        failures = inner.failure_count,
                        "circuit breaker opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(service = %self.service, "probe failed, circuit breaker reopened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            service: self.service.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
        }
    }

    /// Run `op` under this breaker. Rejected immediately with `CircuitOpen`
    /// when the breaker disallows attempts; otherwise the outcome of `op`
    /// is recorded. The guard lock is released before the future runs.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.can_attempt() {
            return Err(GatewayError::CircuitOpen {
                service: self.service.clone(),
            });
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Lazily-populated collection of breakers, one per downstream service
pub struct BreakerRegistry {
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: &Config) -> Self {
        BreakerRegistry {
            failure_threshold: config.breaker_failure_threshold,
            success_threshold: config.breaker_success_threshold,
            timeout: config.breaker_timeout(),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    service,
                    self.failure_threshold,
                    self.success_threshold,
                    self.timeout,
                ))
            })
            .clone()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut snapshots: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn breaker(timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new("agent", 3, 2, Duration::from_millis(timeout_ms))
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = breaker(1000);
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_attempt());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let breaker = breaker(1000);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_timeout() {
        let breaker = breaker(10);
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(!breaker.can_attempt());

        thread::sleep(Duration::from_millis(20));
        assert!(breaker.can_attempt());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_successes() {
        let breaker = breaker(10);
        for _ in 0..3 {
            breaker.record_failure();
        }
        thread::sleep(Duration::from_millis(20));
        assert!(breaker.can_attempt());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = breaker(10);
        for _ in 0..3 {
            breaker.record_failure();
        }
        thread::sleep(Duration::from_millis(20));
        assert!(breaker.can_attempt());

        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_attempt());
    }

    #[tokio::test]
    async fn test_call_records_outcomes() {
        let breaker = CircuitBreaker::new("memory", 1, 1, Duration::from_secs(60));

        let failed: Result<()> = breaker
            .call(|| async {
                Err(GatewayError::Upstream {
                    service: "memory".to_string(),
                    message: "boom".to_string(),
                })
            })
            .await;
        assert!(failed.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected: Result<()> = breaker.call(|| async { Ok(()) }).await;
        assert!(matches!(rejected, Err(GatewayError::CircuitOpen { service }) if service == "memory"));
    }

    #[test]
    fn test_registry_returns_same_breaker() {
        let registry = BreakerRegistry::new(&Config::default());
        let first = registry.get("agent");
        let second = registry.get("agent");
        assert!(Arc::ptr_eq(&first, &second));

        first.record_failure();
        assert_eq!(second.snapshot().failure_count, 1);
    }

    #[test]
    fn test_registry_snapshots_sorted() {
        let registry = BreakerRegistry::new(&Config::default());
        registry.get("wallet");
        registry.get("agent");

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].service, "agent");
        assert_eq!(snapshots[1].service, "wallet");
    }
}
