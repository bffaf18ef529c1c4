//! Application configuration loaded from environment variables.

use std::time::Duration;

/// Server and background job configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL connection string; the in-memory store is used when unset
/// - `RETRY_DRAIN_INTERVAL_SECS`: retry queue drain period (default: `300`)
/// - `RECONCILIATION_INTERVAL_SECS`: full sweep period (default: `86400`)
/// - `RECONCILIATION_WINDOW_HOURS`: legacy record look-back (default: `168`)
/// - `RETRY_BATCH_SIZE`: tasks claimed per drain (default: `50`)
/// - `SNAPSHOT_BATCH_SIZE`: agreements projected per sweep (default: `100`)
/// - `RETRY_MAX_ATTEMPTS`: attempts before a task fails (default: `5`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub retry_drain_interval: Duration,
    pub reconciliation_interval: Duration,
    pub reconciliation_window_hours: i64,
    pub retry_batch_size: usize,
    pub snapshot_batch_size: usize,
    pub retry_max_attempts: u32,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            retry_drain_interval: Duration::from_secs(env_or("RETRY_DRAIN_INTERVAL_SECS", 300)),
            reconciliation_interval: Duration::from_secs(env_or(
                "RECONCILIATION_INTERVAL_SECS",
                86_400,
            )),
            reconciliation_window_hours: env_or(
                "RECONCILIATION_WINDOW_HOURS",
                defaults.reconciliation_window_hours,
            ),
            retry_batch_size: env_or("RETRY_BATCH_SIZE", defaults.retry_batch_size),
            snapshot_batch_size: env_or("SNAPSHOT_BATCH_SIZE", defaults.snapshot_batch_size),
            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Sweep settings derived from this configuration.
    pub fn sweep_config(&self) -> reconciliation::SweepConfig {
        reconciliation::SweepConfig {
            window: chrono::Duration::hours(self.reconciliation_window_hours),
            snapshot_batch: self.snapshot_batch_size,
            ..Default::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            retry_drain_interval: Duration::from_secs(300),
            reconciliation_interval: Duration::from_secs(86_400),
            reconciliation_window_hours: 168,
            retry_batch_size: 50,
            snapshot_batch_size: 100,
            retry_max_attempts: domain::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert!(config.database_url.is_none());
        assert_eq!(config.retry_drain_interval, Duration::from_secs(300));
        assert_eq!(config.retry_max_attempts, 5);
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

    #[test]
    fn test_sweep_window_follows_hours() {
        let config = Config {
            reconciliation_window_hours: 24,
            snapshot_batch_size: 10,
            ..Config::default()
        };
        let sweep = config.sweep_config();
        assert_eq!(sweep.window, chrono::Duration::days(1));
        assert_eq!(sweep.snapshot_batch, 10);
    }
}
