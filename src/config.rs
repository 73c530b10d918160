use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Gateway configuration loaded from environment variables.
///
/// Every option has a default suitable for local development; production
/// deployments override via the environment (or a .env file loaded in main).
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address
    pub bind_addr: SocketAddr,

    /// Redis connection URL; empty disables the shared store and the
    /// limiter/quota tracker run on their process-local fallbacks
    pub redis_url: String,

    /// Master switch for per-minute rate limiting
    pub rate_limit_enabled: bool,

    /// Per-minute ceiling for anonymous (IP-keyed) callers
    pub rate_limit_per_minute: u32,

    /// Multiplier applied to the anonymous ceiling for authenticated
    /// callers, so background polling does not eat into paid quota
    pub auth_rate_multiplier: u32,

    /// Daily message ceilings per subscription tier
    pub quota_free_daily: u32,
    pub quota_plus_daily: u32,
    pub quota_pro_daily: u32,

    /// Circuit breaker thresholds
    pub breaker_failure_threshold: u32,
    pub breaker_success_threshold: u32,
    pub breaker_timeout_secs: u64,

    /// Health monitoring cadence
    pub health_check_interval_secs: u64,
    pub health_check_timeout_secs: u64,

    /// Response cache capacity
    pub cache_max_entries: usize,

    /// Downstream service base URLs
    pub agent_service_url: String,
    pub memory_service_url: String,
    pub cognitive_service_url: String,
    pub security_service_url: String,
    pub wallet_service_url: String,

    /// Default log level when RUST_LOG is unset
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Config {
            bind_addr: env_parse("BIND_ADDR", "0.0.0.0:8000"),
            redis_url: env_or("REDIS_URL", ""),
            rate_limit_enabled: env_parse("RATE_LIMIT_ENABLED", "true"),
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE", "60"),
            auth_rate_multiplier: env_parse("AUTH_RATE_MULTIPLIER", "150"),
            quota_free_daily: env_parse("QUOTA_FREE_DAILY", "50"),
            quota_plus_daily: env_parse("QUOTA_PLUS_DAILY", "2000"),
            quota_pro_daily: env_parse("QUOTA_PRO_DAILY", "10000"),
            breaker_failure_threshold: env_parse("BREAKER_FAILURE_THRESHOLD", "5"),
            breaker_success_threshold: env_parse("BREAKER_SUCCESS_THRESHOLD", "2"),
            breaker_timeout_secs: env_parse("BREAKER_TIMEOUT_SECS", "60"),
            health_check_interval_secs: env_parse("HEALTH_CHECK_INTERVAL_SECS", "30"),
            health_check_timeout_secs: env_parse("HEALTH_CHECK_TIMEOUT_SECS", "5"),
            cache_max_entries: env_parse("CACHE_MAX_ENTRIES", "1000"),
            agent_service_url: env_or("AGENT_SERVICE_URL", "http://localhost:9000"),
            memory_service_url: env_or("MEMORY_SERVICE_URL", "http://localhost:8002"),
            cognitive_service_url: env_or("COGNITIVE_SERVICE_URL", "http://localhost:8003"),
            security_service_url: env_or("SECURITY_SERVICE_URL", "http://localhost:8004"),
            wallet_service_url: env_or("WALLET_SERVICE_URL", "http://localhost:8005"),
            log_level: env_or("LOG_LEVEL", "info"),
        }
    }

    /// Per-minute ceiling for an authenticated caller
    pub fn authenticated_rate_limit(&self) -> u32 {
        self.rate_limit_per_minute.saturating_mul(self.auth_rate_multiplier)
    }

    pub fn breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.breaker_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    /// True when a shared Redis store is configured
    pub fn has_redis(&self) -> bool {
        !self.redis_url.is_empty()
    }
}

impl Default for Config {
    fn default() -> Self {
        // Defaults only; does not consult the process environment.
        Config {
            bind_addr: "127.0.0.1:8000".parse().expect("valid default bind addr"),
            redis_url: String::new(),
            rate_limit_enabled: true,
            rate_limit_per_minute: 60,
            auth_rate_multiplier: 150,
            quota_free_daily: 50,
            quota_plus_daily: 2000,
            quota_pro_daily: 10000,
            breaker_failure_threshold: 5,
            breaker_success_threshold: 2,
            breaker_timeout_secs: 60,
            health_check_interval_secs: 30,
            health_check_timeout_secs: 5,
            cache_max_entries: 1000,
            agent_service_url: "http://localhost:9000".to_string(),
            memory_service_url: "http://localhost:8002".to_string(),
            cognitive_service_url: "http://localhost:8003".to_string(),
            security_service_url: "http://localhost:8004".to_string(),
            wallet_service_url: "http://localhost:8005".to_string(),
            log_level: "info".to_string(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: &str) -> T {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse().unwrap_or_else(|_| {
        default
            .parse()
            .unwrap_or_else(|_| panic!("invalid built-in default for {}", key))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.rate_limit_per_minute, 60);
        assert_eq!(config.auth_rate_multiplier, 150);
        assert_eq!(config.quota_free_daily, 50);
        assert!(!config.has_redis());
    }

    #[test]
    fn test_authenticated_rate_limit() {
        let config = Config {
            rate_limit_per_minute: 20,
            auth_rate_multiplier: 150,
            ..Config::default()
        };
        assert_eq!(config.authenticated_rate_limit(), 3000);
    }

    #[test]
    fn test_durations() {
        let config = Config::default();
        assert_eq!(config.breaker_timeout(), Duration::from_secs(60));
        assert_eq!(config.health_check_interval(), Duration::from_secs(30));
    }
}
