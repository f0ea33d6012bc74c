//! Engine configuration.

use std::time::Duration;

use thiserror::Error;

use crate::circuit::BreakerConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must not exceed {max}")]
    TooLarge { field: &'static str, max: String },

    #[error("breaker base cooldown {base:?} exceeds max cooldown {max:?}")]
    CooldownOrder { base: Duration, max: Duration },
}

/// Tuning of the scheduler, reconciler and circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Interval between two scheduler ticks.
    pub tick_interval: Duration,
    /// Global cap on concurrently running reconciliations.
    pub max_concurrent: usize,
    /// Hard wall-clock budget of one attempt.
    pub attempt_timeout: Duration,
    /// Consecutive authentication failures before the error becomes fatal.
    pub auth_retry_limit: u32,
    /// Number of recent attempts summarized by `get_state`.
    pub history_summary_len: usize,
    pub breaker: BreakerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            max_concurrent: 4,
            attempt_timeout: Duration::from_secs(180),
            auth_retry_limit: 3,
            history_summary_len: 20,
            breaker: BreakerConfig::default(),
        }
    }
}

const MAX_CONCURRENT: usize = 1024;

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "tick_interval",
            });
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Zero {
                field: "max_concurrent",
            });
        }
        if self.max_concurrent > MAX_CONCURRENT {
            return Err(ConfigError::TooLarge {
                field: "max_concurrent",
                max: MAX_CONCURRENT.to_string(),
            });
        }
        if self.attempt_timeout.is_zero() {
            return Err(ConfigError::Zero {
                field: "attempt_timeout",
            });
        }
        if self.auth_retry_limit == 0 {
            return Err(ConfigError::Zero {
                field: "auth_retry_limit",
            });
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Zero {
                field: "breaker.failure_threshold",
            });
        }
        if self.breaker.base_cooldown.is_zero() {
            return Err(ConfigError::Zero {
                field: "breaker.base_cooldown",
            });
        }
        if self.breaker.base_cooldown > self.breaker.max_cooldown {
            return Err(ConfigError::CooldownOrder {
                base: self.breaker.base_cooldown,
                max: self.breaker.max_cooldown,
            });
        }
        if self.breaker.max_cooldown > Duration::from_secs(24 * 3600) {
            return Err(ConfigError::TooLarge {
                field: "breaker.max_cooldown",
                max: "24h".to_string(),
            });
        }
        Ok(())
    }
}
