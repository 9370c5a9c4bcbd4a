//! Pool tuning parameters.

use std::time::Duration;

use rowgate_core::PoolConfig;

use crate::error::{PoolError, PoolResult};

#[derive(Clone, Debug, PartialEq)]
pub struct PoolSettings {
    /// Floor the cleanup task tops the pool up to (default: 4).
    pub minimum_size: usize,
    /// Hard ceiling on connections, idle plus checked out (default: 8).
    pub maximum_size: usize,
    /// Total time a checkout may wait for a free connection (default: 2s).
    pub checkout_timeout: Duration,
    /// Longest single wait between checkout retries (default: 50ms).
    pub maximum_retry_wait: Duration,
    /// Idle connections older than this are closed above the minimum (default: 60s).
    pub idle_timeout: Duration,
    /// Period of the cleanup task (default: 20s).
    pub cleanup_interval: Duration,
    /// Record size/in-use samples at every checkout.
    pub collect_fine_grained: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

impl From<&PoolConfig> for PoolSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            minimum_size: config.minimum_size,
            maximum_size: config.maximum_size,
            checkout_timeout: Duration::from_millis(config.checkout_timeout_ms),
            maximum_retry_wait: Duration::from_millis(config.maximum_retry_wait_ms),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            cleanup_interval: Duration::from_millis(config.cleanup_interval_ms),
            collect_fine_grained: config.collect_fine_grained,
        }
    }
}

impl PoolSettings {
    pub fn validate(&self) -> PoolResult<()> {
        if self.maximum_size < 1 {
            return Err(PoolError::InvalidSettings(
                "maximum size must be at least 1".into(),
            ));
        }
        if self.minimum_size > self.maximum_size {
            return Err(PoolError::InvalidSettings(format!(
                "minimum size {} exceeds maximum size {}",
                self.minimum_size, self.maximum_size
            )));
        }
        if self.cleanup_interval.is_zero() {
            return Err(PoolError::InvalidSettings(
                "cleanup interval must be positive".into(),
            ));
        }
        if self.maximum_retry_wait.is_zero() {
            return Err(PoolError::InvalidSettings(
                "maximum retry wait must be positive".into(),
            ));
        }
        Ok(())
    }
}
