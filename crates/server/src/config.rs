//! Application configuration loaded from environment variables.

use std::time::Duration;

use messaging::{RetryPolicy, WorkerPoolConfig};

/// Output format of the fmt tracing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `pretty` or `json` (default: `pretty`)
/// - `DATABASE_URL`: Postgres connection string; unset means in-memory store
/// - `WORKER_CONCURRENCY`: step worker tasks (default: `4`)
/// - `STEP_MAX_ATTEMPTS`: attempts per step, including the first (default: `3`)
/// - `STEP_BACKOFF_SECS`: delay between step attempts (default: `60`)
/// - `WORKER_POLL_INTERVAL_MS`: idle worker sleep (default: `250`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub worker_concurrency: usize,
    pub step_max_attempts: u32,
    pub step_backoff: Duration,
    pub worker_poll_interval: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup. Unparseable values
    /// fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            worker_concurrency: parsed("WORKER_CONCURRENCY")
                .map(|n| n as usize)
                .filter(|n| *n > 0)
                .unwrap_or(defaults.worker_concurrency),
            step_max_attempts: parsed("STEP_MAX_ATTEMPTS")
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.step_max_attempts),
            step_backoff: parsed("STEP_BACKOFF_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.step_backoff),
            worker_poll_interval: parsed("WORKER_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.worker_poll_interval),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.step_max_attempts, self.step_backoff)
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: self.worker_concurrency,
            poll_interval: self.worker_poll_interval,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            worker_concurrency: 4,
            step_max_attempts: RetryPolicy::DEFAULT_MAX_ATTEMPTS,
            step_backoff: RetryPolicy::DEFAULT_BACKOFF,
            worker_poll_interval: Duration::from_millis(250),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = from_pairs(&[]);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.database_url, None);
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.worker_poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("PORT", "8080"),
            ("LOG_FORMAT", "JSON"),
            ("DATABASE_URL", "postgres://localhost/workflows"),
            ("WORKER_CONCURRENCY", "8"),
            ("STEP_MAX_ATTEMPTS", "5"),
            ("STEP_BACKOFF_SECS", "10"),
        ]);

        assert_eq!(config.port, 8080);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/workflows"));
        assert_eq!(config.worker_pool_config().concurrency, 8);
        assert_eq!(
            config.retry_policy(),
            RetryPolicy::new(5, Duration::from_secs(10))
        );
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_pairs(&[
            ("PORT", "http"),
            ("WORKER_CONCURRENCY", "0"),
            ("STEP_MAX_ATTEMPTS", "-1"),
            ("DATABASE_URL", ""),
        ]);

        assert_eq!(config.port, 3000);
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.step_max_attempts, 3);
        assert_eq!(config.database_url, None);
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }
}
