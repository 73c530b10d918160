//! Daily message quota tracking per subscription tier.
//!
//! Quotas use a 24 hour rolling window anchored to the caller's first
//! message, not a calendar day. Checking and recording are separate
//! steps: the gateway checks before calling the agent and records only
//! after the call succeeds, so failed requests cost nothing. Unlike the
//! rate limiter, a store failure here does NOT fail open: quota protects
//! paid capacity, so the tracker falls back to a persistent
//! process-local window instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::identity::{Identity, Tier};
use crate::redis::SharedStore;

const DAY_MS: u64 = 86_400_000;
const HOUR_MS: u64 = 3_600_000;

/// Point-in-time usage snapshot for a caller
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QuotaUsage {
    pub tier: Tier,
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
    pub reset_in_hours: u64,
}

#[derive(Debug, Clone, Copy)]
struct QuotaWindow {
    start_ms: u64,
    count: u32,
}

impl QuotaWindow {
    fn active_at(&self, now_ms: u64) -> bool {
        now_ms < self.start_ms + DAY_MS
    }
}

/// Fold one recorded message into a window. Expired or missing windows
/// restart anchored at `now_ms`.
fn advance_window(existing: Option<QuotaWindow>, now_ms: u64) -> QuotaWindow {
    match existing {
        Some(window) if window.active_at(now_ms) => QuotaWindow {
            start_ms: window.start_ms,
            count: window.count.saturating_add(1),
        },
        _ => QuotaWindow { start_ms: now_ms, count: 1 },
    }
}

/// Hours until the window expires, rounded up, never reported as zero
fn hours_until_reset(start_ms: u64, now_ms: u64) -> u64 {
    let remaining_ms = (start_ms + DAY_MS).saturating_sub(now_ms);
    ((remaining_ms + HOUR_MS - 1) / HOUR_MS).max(1)
}

pub struct QuotaTracker {
    free_limit: u32,
    plus_limit: u32,
    pro_limit: u32,
    store: Option<Arc<SharedStore>>,
    local: Mutex<HashMap<String, QuotaWindow>>,
}

impl QuotaTracker {
    pub fn new(config: &Config, store: Option<Arc<SharedStore>>) -> Self {
        QuotaTracker {
            free_limit: config.quota_free_daily,
            plus_limit: config.quota_plus_daily,
            pro_limit: config.quota_pro_daily,
            store,
            local: Mutex::new(HashMap::new()),
        }
    }

    /// Daily ceiling for a tier
    pub fn limit_for(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Free => self.free_limit,
            Tier::Plus => self.plus_limit,
            Tier::Pro => self.pro_limit,
        }
    }

    /// Read-only admission check. Errors with `QuotaExceeded` when the
    /// caller's active window is full; never consumes quota.
    pub async fn check(&self, identity: &Identity, tier: Tier) -> Result<QuotaUsage> {
        let limit = self.limit_for(tier);
        let now_ms = now_millis();
        let usage = self.snapshot(identity, tier, limit, now_ms).await;

        if usage.used >= limit {
            return Err(GatewayError::QuotaExceeded {
                limit,
                used: usage.used,
                tier,
                reset_in_hours: usage.reset_in_hours.max(1),
            });
        }
        Ok(usage)
    }

    /// Count one delivered message against the caller's daily window.
    /// Call only after the costly action has succeeded.
    pub async fn record_message(&self, identity: &Identity) {
        let key = identity.key();
        let now_ms = now_millis();

        if let Some(store) = &self.store {
            match self.record_shared(store, &key, now_ms).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!(
                        identity = %key,
                        error = %err,
                        "quota store unavailable, recording in local window"
                    );
                }
            }
        }

        self.record_local(&key, now_ms);
    }

    async fn record_shared(&self, store: &SharedStore, key: &str, now_ms: u64) -> Result<()> {
        let existing = store
            .quota_fetch(key)
            .await?
            .map(|(start_ms, count)| QuotaWindow { start_ms, count });
        let window = advance_window(existing, now_ms);
        store.quota_store(key, window.start_ms, window.count).await
    }

    fn record_local(&self, key: &str, now_ms: u64) {
        let mut windows = self.lock_local();
        let window = advance_window(windows.get(key).copied(), now_ms);
        windows.insert(key.to_string(), window);
    }

    /// Usage snapshot for the quota endpoint. `reset_in_hours` is zero
    /// when the caller has no active window.
    pub async fn usage(&self, identity: &Identity, tier: Tier) -> QuotaUsage {
        let limit = self.limit_for(tier);
        self.snapshot(identity, tier, limit, now_millis()).await
    }

    async fn snapshot(
        &self,
        identity: &Identity,
        tier: Tier,
        limit: u32,
        now_ms: u64,
    ) -> QuotaUsage {
        let key = identity.key();
        let window = match &self.store {
            Some(store) => match store.quota_fetch(&key).await {
                Ok(found) => found.map(|(start_ms, count)| QuotaWindow { start_ms, count }),
                Err(err) => {
                    tracing::warn!(
                        identity = %key,
                        error = %err,
                        "quota store unavailable, reading local window"
                    );
                    self.lock_local().get(&key).copied()
                }
            },
            None => self.lock_local().get(&key).copied(),
        };

        match window {
            Some(window) if window.active_at(now_ms) => QuotaUsage {
                tier,
                limit,
                used: window.count,
                remaining: limit.saturating_sub(window.count),
                reset_in_hours: hours_until_reset(window.start_ms, now_ms),
            },
            _ => QuotaUsage {
                tier,
                limit,
                used: 0,
                remaining: limit,
                reset_in_hours: 0,
            },
        }
    }

    fn lock_local(&self) -> std::sync::MutexGuard<'_, HashMap<String, QuotaWindow>> {
        match self.local.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
