//! Shared Redis store for cross-instance rate-limit and quota state.
//!
//! All commands run over a multiplexed async connection. Callers decide
//! what a store failure means: the rate limiter fails open, the quota
//! tracker falls back to its process-local map.

use redis::AsyncCommands;

use crate::error::{GatewayError, Result};

const RATE_LIMIT_PREFIX: &str = "gateway:ratelimit:";
const QUOTA_PREFIX: &str = "gateway:quota:";

/// Outcome of a sliding-window check against the shared store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowOutcome {
    /// Request admitted and recorded; `count` includes this request
    Recorded { count: u64 },
    /// Window is full; retry once the oldest entry ages out
    Limited { retry_after_ms: u64 },
}

/// Thin wrapper over the Redis client used by the limiter and quota tracker
#[derive(Clone)]
pub struct SharedStore {
    client: redis::Client,
}

impl SharedStore {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|err| GatewayError::Store(format!("invalid redis url: {}", err)))?;
        Ok(SharedStore { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Round-trip check used by the readiness probe
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    /// Check the sliding window for `identity_key` and record the request
    /// if it fits. Prunes entries older than `window_ms`, counts the rest,
    /// and only admits when the count is below `ceiling`.
    pub async fn window_check_and_record(
        &self,
        identity_key: &str,
        now_ms: u64,
        window_ms: u64,
        ceiling: u32,
    ) -> Result<WindowOutcome> {
        let mut conn = self.connection().await?;
        let key = format!("{}{}", RATE_LIMIT_PREFIX, identity_key);
        let window_start = now_ms.saturating_sub(window_ms);

        redis::cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(window_start)
            .query_async::<_, ()>(&mut conn)
            .await?;

        let count: u64 = conn.zcard(&key).await?;

        if count >= ceiling as u64 {
            // Oldest surviving entry tells us when a slot frees up
            let oldest: Vec<(String, u64)> = redis::cmd("ZRANGE")
                .arg(&key)
                .arg(0)
                .arg(0)
                .arg("WITHSCORES")
                .query_async(&mut conn)
                .await?;
            let retry_after_ms = oldest
                .first()
                .map(|(_, score)| (score + window_ms).saturating_sub(now_ms))
                .unwrap_or(window_ms);
            return Ok(WindowOutcome::Limited { retry_after_ms });
        }

        // Member carries a uuid so concurrent requests in the same
        // millisecond do not collapse into one entry.
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4().simple());
        redis::cmd("ZADD")
            .arg(&key)
            .arg(now_ms)
            .arg(&member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        redis::cmd("EXPIRE")
            .arg(&key)
            .arg(window_ms / 1000 + 60)
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(WindowOutcome::Recorded { count: count + 1 })
    }

    /// Fetch a quota window: (window_start_ms, used_count), if one exists
    pub async fn quota_fetch(&self, identity_key: &str) -> Result<Option<(u64, u32)>> {
        let mut conn = self.connection().await?;
        let key = format!("{}{}", QUOTA_PREFIX, identity_key);
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&key)
            .arg("window_start")
            .arg("count")
            .query_async(&mut conn)
            .await?;

        match (values.first(), values.get(1)) {
            (Some(Some(start)), Some(Some(count))) => {
                let start = start
                    .parse::<u64>()
                    .map_err(|_| GatewayError::Store(format!("corrupt quota window for {}", key)))?;
                let count = count
                    .parse::<u32>()
                    .map_err(|_| GatewayError::Store(format!("corrupt quota count for {}", key)))?;
                Ok(Some((start, count)))
            }
            _ => Ok(None),
        }
    }

    /// Store a quota window. The key expires well after the 24h window so
    /// stale identities do not accumulate.
    pub async fn quota_store(
        &self,
        identity_key: &str,
        window_start_ms: u64,
        count: u32,
    ) -> Result<()> {
        let mut conn = self.connection().await?;
        let key = format!("{}{}", QUOTA_PREFIX, identity_key);
        redis::cmd("HSET")
            .arg(&key)
            .arg("window_start")
            .arg(window_start_ms)
            .arg("count")
            .arg(count)
            .query_async::<_, ()>(&mut conn)
            .await?;
        redis::cmd("EXPIRE")
            .arg(&key)
            .arg(2 * 86_400u64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore").finish_non_exhaustive()
    }
}
