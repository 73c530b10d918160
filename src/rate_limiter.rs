//! Per-minute sliding-window rate limiter.
//!
//! Every caller identity gets a 60 second window. When a shared store is
//! configured the window lives in Redis so all gateway instances see the
//! same counts; a store failure fails OPEN, since refusing traffic over a
//! Redis blip is worse than briefly over-admitting. Without a store the
//! limiter keeps per-process windows in memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::identity::Identity;
use crate::redis::{SharedStore, WindowOutcome};

const WINDOW_MS: u64 = 60_000;

/// Paths that never consume rate-limit budget
const EXEMPT_PATHS: &[&str] = &["/health", "/ready", "/live", "/metrics"];

pub fn is_exempt_path(path: &str) -> bool {
    EXEMPT_PATHS.contains(&path)
}

/// Decision for a single request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { limit: u32, remaining: u32 },
    Limited { limit: u32, retry_after_secs: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

pub struct RateLimiter {
    enabled: bool,
    anonymous_limit: u32,
    authenticated_limit: u32,
    store: Option<Arc<SharedStore>>,
    local: Mutex<HashMap<String, Vec<u64>>>,
}

impl RateLimiter {
    pub fn new(config: &Config, store: Option<Arc<SharedStore>>) -> Self {
        RateLimiter {
            enabled: config.rate_limit_enabled,
            anonymous_limit: config.rate_limit_per_minute,
            authenticated_limit: config.authenticated_rate_limit(),
            store,
            local: Mutex::new(HashMap::new()),
        }
    }

    /// Ceiling applied to this identity's window
    pub fn limit_for(&self, identity: &Identity) -> u32 {
        if identity.is_authenticated() {
            self.authenticated_limit
        } else {
            self.anonymous_limit
        }
    }

    /// Check the caller's window and record the request if admitted
    pub async fn check_and_record(&self, identity: &Identity) -> RateLimitDecision {
        let limit = self.limit_for(identity);
        if !self.enabled {
            return RateLimitDecision::Allowed { limit, remaining: limit };
        }

        let key = identity.key();
        let now_ms = now_millis();

        if let Some(store) = &self.store {
            match store
                .window_check_and_record(&key, now_ms, WINDOW_MS, limit)
                .await
            {
                Ok(WindowOutcome::Recorded { count }) => {
                    return RateLimitDecision::Allowed {
                        limit,
                        remaining: (limit as u64).saturating_sub(count) as u32,
                    };
                }
                Ok(WindowOutcome::Limited { retry_after_ms }) => {
                    return RateLimitDecision::Limited {
                        limit,
                        retry_after_secs: ms_to_retry_secs(retry_after_ms),
                    };
                }
                Err(err) => {
                    tracing::warn!(
                        identity = %key,
                        error = %err,
                        "rate limit store unavailable, failing open"
                    );
                    return RateLimitDecision::Allowed { limit, remaining: limit };
                }
            }
        }

        self.check_local(&key, limit, now_ms)
    }

    fn check_local(&self, key: &str, limit: u32, now_ms: u64) -> RateLimitDecision {
        let mut windows = match self.local.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let timestamps = windows.entry(key.to_string()).or_default();
        let window_start = now_ms.saturating_sub(WINDOW_MS);
        timestamps.retain(|&ts| ts > window_start);

        if timestamps.len() >= limit as usize {
            let retry_after_ms = timestamps
                .first()
                .map(|&oldest| (oldest + WINDOW_MS).saturating_sub(now_ms))
                .unwrap_or(WINDOW_MS);
            return RateLimitDecision::Limited {
                limit,
                retry_after_secs: ms_to_retry_secs(retry_after_ms),
            };
        }

        timestamps.push(now_ms);
        RateLimitDecision::Allowed {
            limit,
            remaining: limit - timestamps.len() as u32,
        }
    }

    /// Drop local windows with no activity inside the current window
    pub fn prune_local(&self) -> usize {
        let mut windows = match self.local.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let window_start = now_millis().saturating_sub(WINDOW_MS);
        let before = windows.len();
        windows.retain(|_, timestamps| timestamps.iter().any(|&ts| ts > window_start));
        before - windows.len()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Round up to whole seconds, never telling a limited caller to retry now
fn ms_to_retry_secs(ms: u64) -> u64 {
    ((ms + 999) / 1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn limiter_with(limit: u32) -> RateLimiter {
        let config = Config {
            rate_limit_per_minute: limit,
            auth_rate_multiplier: 150,
            ..Config::default()
        };
        RateLimiter::new(&config, None)
    }

    #[tokio::test]
    async fn test_allows_under_limit() {
        let limiter = limiter_with(3);
        let identity = Identity::Ip("10.0.0.1".to_string());

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check_and_record(&identity).await;
            assert_eq!(
                decision,
                RateLimitDecision::Allowed { limit: 3, remaining: expected_remaining }
            );
        }
    }

    #[tokio::test]
    async fn test_limits_over_limit() {
        let limiter = limiter_with(2);
        let identity = Identity::Ip("10.0.0.2".to_string());

        limiter.check_and_record(&identity).await;
        limiter.check_and_record(&identity).await;

        let decision = limiter.check_and_record(&identity).await;
        match decision {
            RateLimitDecision::Limited { limit, retry_after_secs } => {
                assert_eq!(limit, 2);
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
            }
            other => panic!("expected limited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_identities_do_not_share_windows() {
        let limiter = limiter_with(1);
        let first = Identity::Ip("10.0.0.3".to_string());
        let second = Identity::Ip("10.0.0.4".to_string());

        assert!(limiter.check_and_record(&first).await.is_allowed());
        assert!(limiter.check_and_record(&second).await.is_allowed());
        assert!(!limiter.check_and_record(&first).await.is_allowed());
    }

    #[tokio::test]
    async fn test_authenticated_ceiling_is_higher() {
        let limiter = limiter_with(2);
        let user = Identity::User("alice".to_string());
        assert_eq!(limiter.limit_for(&user), 300);

        let anon = Identity::Ip("10.0.0.5".to_string());
        assert_eq!(limiter.limit_for(&anon), 2);
    }

    #[tokio::test]
    async fn test_disabled_limiter_always_allows() {
        let config = Config {
            rate_limit_enabled: false,
            rate_limit_per_minute: 1,
            ..Config::default()
        };
        let limiter = RateLimiter::new(&config, None);
        let identity = Identity::Ip("10.0.0.6".to_string());

        for _ in 0..5 {
            assert!(limiter.check_and_record(&identity).await.is_allowed());
        }
    }

    #[tokio::test]
    async fn test_fails_open_when_store_unreachable() {
        let config = Config {
            rate_limit_per_minute: 1,
            ..Config::default()
        };
        let store = SharedStore::new("redis://127.0.0.1:1").unwrap();
        let limiter = RateLimiter::new(&config, Some(Arc::new(store)));
        let identity = Identity::Ip("10.0.0.7".to_string());

        for _ in 0..3 {
            assert!(limiter.check_and_record(&identity).await.is_allowed());
        }
    }

    #[test]
    fn test_sliding_window_expiry() {
        let limiter = limiter_with(2);
        let now = 1_000_000;

        assert!(limiter.check_local("ip:1.2.3.4", 2, now).is_allowed());
        assert!(limiter.check_local("ip:1.2.3.4", 2, now + 1).is_allowed());
        assert!(!limiter.check_local("ip:1.2.3.4", 2, now + 2).is_allowed());

        // Oldest entry ages out after the window passes
        assert!(limiter
            .check_local("ip:1.2.3.4", 2, now + WINDOW_MS + 1)
            .is_allowed());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(ms_to_retry_secs(1), 1);
        assert_eq!(ms_to_retry_secs(1000), 1);
        assert_eq!(ms_to_retry_secs(1001), 2);
        assert_eq!(ms_to_retry_secs(0), 1);
    }

    #[test]
    fn test_prune_local_drops_idle_windows() {
        let limiter = limiter_with(5);
        limiter.check_local("ip:9.9.9.9", 5, 1);
        assert_eq!(limiter.prune_local(), 1);
    }

    #[test]
    fn test_exempt_paths() {
        assert!(is_exempt_path("/health"));
        assert!(is_exempt_path("/metrics"));
        assert!(!is_exempt_path("/api/chat"));
    }
}
