//! Optimizer configuration.

use std::time::Duration;

use rallypoint_protocol::ConfigError;
use serde::{Deserialize, Serialize};

use crate::compression::CompressionScheme;
use crate::retry::RetryPolicy;

/// Settings for every stage of the [`TransportOptimizer`](crate::TransportOptimizer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// A batch is flushed as soon as it holds this many messages.
    pub max_batch_size: usize,
    /// ...or once its oldest message has waited this long.
    pub batch_timeout: Duration,

    pub compression: CompressionScheme,
    /// Payloads strictly larger than this many bytes are compressed.
    pub compression_threshold: usize,

    pub pool: PoolConfig,

    /// Lifetime of cached responses.
    pub cache_ttl: Duration,
    /// How often expired cache entries are purged.
    pub cache_sweep_interval: Duration,

    pub retry: RetryPolicy,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            batch_timeout: Duration::from_millis(100),
            compression: CompressionScheme::Lz4,
            compression_threshold: 1024,
            pool: PoolConfig::default(),
            cache_ttl: Duration::from_secs(300),
            cache_sweep_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl OptimizerConfig {
    /// Rejects values the optimizer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::invalid("optimizer.max_batch_size", "must be at least 1"));
        }
        if self.batch_timeout.is_zero() {
            return Err(ConfigError::invalid("optimizer.batch_timeout", "must be non-zero"));
        }
        self.pool.validate()
    }
}

/// Settings for the [`ConnectionPool`](crate::ConnectionPool).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on simultaneously checked-out connections.
    pub max_connections: usize,
    /// How long `acquire` waits for a release before giving up.
    pub connection_timeout: Duration,
    /// Idle connections older than this are recycled on next use.
    pub idle_timeout: Duration,
    /// Connections are recycled after serving this many requests.
    pub max_requests_per_connection: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connection_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            max_requests_per_connection: 10_000,
        }
    }
}

impl PoolConfig {
    pub fn with_capacity(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::invalid(
                "optimizer.pool.max_connections",
                "a pool of capacity zero can never serve a request",
            ));
        }
        if self.max_requests_per_connection == 0 {
            return Err(ConfigError::invalid(
                "optimizer.pool.max_requests_per_connection",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OptimizerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_batch_size, 10);
        assert_eq!(config.batch_timeout, Duration::from_millis(100));
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.retry.max_retry_attempts, 3);
    }

    #[test]
    fn test_zero_capacity_pool_is_rejected() {
        let config = OptimizerConfig {
            pool: PoolConfig::with_capacity(0),
            ..OptimizerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("optimizer.pool.max_connections"));
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let config = OptimizerConfig {
            max_batch_size: 0,
            ..OptimizerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
