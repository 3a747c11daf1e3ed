//! Engine configuration.

use std::time::Duration;

use crate::config::{env_value, ConfigError};

/// Configuration for the workflow engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Number of task bodies that may execute at once across all workflows.
    pub worker_pool_size: usize,
    /// Delay before the first retry of a failed task.
    pub retry_base_delay: Duration,
    /// Upper bound on the retry delay.
    pub retry_max_delay: Duration,
    /// How long `stop` waits for running tasks before giving up.
    pub shutdown_grace_period: Duration,
    /// Fallback wake-up interval of the dispatch loop.
    pub dispatch_tick: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            shutdown_grace_period: Duration::from_secs(30),
            dispatch_tick: Duration::from_millis(250),
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `QUOTEFLOW_WORKER_POOL_SIZE`: Concurrent task bodies (default: 4)
    /// - `QUOTEFLOW_RETRY_BASE_DELAY_MS`: First retry delay in ms (default: 1000)
    /// - `QUOTEFLOW_RETRY_MAX_DELAY_MS`: Retry delay cap in ms (default: 60000)
    /// - `QUOTEFLOW_SHUTDOWN_GRACE_SECS`: Stop grace period (default: 30)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(size) = env_value("QUOTEFLOW_WORKER_POOL_SIZE")? {
            config.worker_pool_size = size;
        }
        if let Some(ms) = env_value("QUOTEFLOW_RETRY_BASE_DELAY_MS")? {
            config.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value("QUOTEFLOW_RETRY_MAX_DELAY_MS")? {
            config.retry_max_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_value("QUOTEFLOW_SHUTDOWN_GRACE_SECS")? {
            config.shutdown_grace_period = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_pool_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_pool_size must be greater than 0".to_string(),
            ));
        }

        if self.retry_base_delay > self.retry_max_delay {
            return Err(ConfigError::ValidationFailed(
                "retry_base_delay cannot exceed retry_max_delay".to_string(),
            ));
        }

        if self.dispatch_tick.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "dispatch_tick must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Delay before retry number `attempt` (1-based):
    /// `base * 2^(attempt - 1)`, capped at `retry_max_delay`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.retry_base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.retry_max_delay, |d| d.min(self.retry_max_delay))
    }

    /// Builder method to set the worker pool size.
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Builder method to set the retry delays.
    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    /// Builder method to set the shutdown grace period.
    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    /// Builder method to set the dispatch tick.
    pub fn with_dispatch_tick(mut self, tick: Duration) -> Self {
        self.dispatch_tick = tick;
        self
    }
}
