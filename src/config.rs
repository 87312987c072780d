//! Configuration module
//!
//! Loads engine configuration from environment variables.

use std::env;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard cap on the byte size of one delivery frame
    pub transport_max_frame_bytes: u64,

    /// Snapshot retention: minimum number of snapshots always kept
    pub snapshot_min_keep: u32,

    /// Snapshot retention: protected height window (0 disables)
    pub snapshot_keep_window: u64,

    /// Read cache entry time-to-live
    pub cache_ttl: Duration,

    /// Read cache capacity (entries)
    pub cache_capacity: usize,

    /// Delivery retry backoff: initial delay
    pub retry_base_delay: Duration,

    /// Delivery retry backoff: maximum delay
    pub retry_max_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport_max_frame_bytes: 1024 * 1024,
            snapshot_min_keep: 2,
            snapshot_keep_window: 0,
            cache_ttl: Duration::from_secs(60),
            cache_capacity: 1000,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(8),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let transport_max_frame_bytes =
            parse_env("TRANSPORT_MAX_FRAME_BYTES", defaults.transport_max_frame_bytes)?;

        let snapshot_min_keep = parse_env("SNAPSHOT_MIN_KEEP", defaults.snapshot_min_keep)?;

        let snapshot_keep_window =
            parse_env("SNAPSHOT_KEEP_WINDOW", defaults.snapshot_keep_window)?;

        let cache_ttl_secs = parse_env("READ_CACHE_TTL_SECS", defaults.cache_ttl.as_secs())?;

        let cache_capacity = parse_env("READ_CACHE_CAPACITY", defaults.cache_capacity)?;

        let retry_base_ms = parse_env(
            "DELIVERY_RETRY_BASE_MS",
            defaults.retry_base_delay.as_millis() as u64,
        )?;

        let retry_max_ms = parse_env(
            "DELIVERY_RETRY_MAX_MS",
            defaults.retry_max_delay.as_millis() as u64,
        )?;

        if transport_max_frame_bytes == 0 {
            return Err(ConfigError::InvalidValue("TRANSPORT_MAX_FRAME_BYTES"));
        }

        Ok(Self {
            transport_max_frame_bytes,
            snapshot_min_keep,
            snapshot_keep_window,
            cache_ttl: Duration::from_secs(cache_ttl_secs),
            cache_capacity,
            retry_base_delay: Duration::from_millis(retry_base_ms),
            retry_max_delay: Duration::from_millis(retry_max_ms),
        })
    }
}

/// Parse an environment variable, using the default when unset
fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.transport_max_frame_bytes, 1024 * 1024);
        assert_eq!(config.snapshot_min_keep, 2);
        assert_eq!(config.snapshot_keep_window, 0);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.cache_capacity, 1000);
        assert_eq!(config.retry_base_delay, Duration::from_secs(1));
        assert_eq!(config.retry_max_delay, Duration::from_secs(8));
    }
}
