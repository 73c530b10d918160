//! In-memory response cache for read-heavy GET endpoints.
//!
//! Only allow-listed path prefixes are cached, keyed by path, caller
//! identity and the sorted query string, so one caller never sees
//! another caller's data. TTLs vary by endpoint class; conversation
//! lists churn fastest and get the shortest TTL. At capacity the oldest
//! entry is evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, Method};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Path prefixes eligible for caching
const CACHEABLE_PREFIXES: &[&str] = &["/api/memories", "/api/conversations", "/api/cognitive"];

/// Infrastructure paths, never cached
const EXCLUDED_PATHS: &[&str] = &["/health", "/ready", "/live", "/metrics"];

const TTL_CONVERSATIONS: Duration = Duration::from_secs(60);
const TTL_LIST: Duration = Duration::from_secs(120);
const TTL_ITEM: Duration = Duration::from_secs(300);
const TTL_DEFAULT: Duration = Duration::from_secs(180);

/// Cached upstream response, replayed verbatim on a hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: CachedResponse,
    identity_key: String,
    inserted_at_ms: u64,
    ttl_ms: u64,
}

impl CacheEntry {
    fn expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.inserted_at_ms + self.ttl_ms
    }
}

/// Counters exposed on the metrics endpoint
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct ResponseCache {
    max_entries: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Whether this request is eligible for the cache at all
pub fn should_cache(method: &Method, path: &str, headers: &HeaderMap) -> bool {
    if method != Method::GET {
        return false;
    }
    if EXCLUDED_PATHS.contains(&path) {
        return false;
    }
    if let Some(control) = headers.get("cache-control").and_then(|v| v.to_str().ok()) {
        let control = control.to_ascii_lowercase();
        if control.contains("no-cache") || control.contains("no-store") {
            return false;
        }
    }
    CACHEABLE_PREFIXES.iter().any(|prefix| {
        path == *prefix || path.starts_with(&format!("{}/", prefix))
    })
}

/// TTL class for a cacheable path. Collection roots age faster than
/// individual items; conversations churn fastest of all.
pub fn ttl_for(path: &str) -> Duration {
    if path == "/api/conversations" || path.starts_with("/api/conversations/") {
        return TTL_CONVERSATIONS;
    }
    for prefix in CACHEABLE_PREFIXES {
        if path == *prefix {
            return TTL_LIST;
        }
        if path.starts_with(&format!("{}/", prefix)) {
            return TTL_ITEM;
        }
    }
    TTL_DEFAULT
}

/// Cache key: digest of path, identity and query with sorted parameters,
/// so parameter order does not fragment the cache
pub fn cache_key(path: &str, identity_key: &str, query: Option<&str>) -> String {
    let mut params: Vec<&str> = query
        .unwrap_or("")
        .split('&')
        .filter(|p| !p.is_empty())
        .collect();
    params.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b"|");
    hasher.update(identity_key.as_bytes());
    hasher.update(b"|");
    hasher.update(params.join("&").as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        ResponseCache {
            max_entries,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        self.get_at(key, now_millis())
    }

    fn get_at(&self, key: &str, now_ms: u64) -> Option<CachedResponse> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if !entry.expired_at(now_ms) => {
                let response = entry.response.clone();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(response)
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: String, identity_key: String, response: CachedResponse, ttl: Duration) {
        self.put_at(key, identity_key, response, ttl, now_millis());
    }

    fn put_at(
        &self,
        key: String,
        identity_key: String,
        response: CachedResponse,
        ttl: Duration,
        now_ms: u64,
    ) {
        let mut entries = self.lock();

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at_ms)
                .map(|(k, _)| k.clone());
            if let Some(oldest_key) = oldest {
                entries.remove(&oldest_key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                response,
                identity_key,
                inserted_at_ms: now_ms,
                ttl_ms: ttl.as_millis() as u64,
            },
        );
    }

    /// Drop every entry belonging to one caller, e.g. after a write that
    /// makes their cached reads stale
    pub fn invalidate_identity(&self, identity_key: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.identity_key != identity_key);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(identity = identity_key, removed, "cache invalidated");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.lock().len(),
            max_entries: self.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        match self.entries.lock() {
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
