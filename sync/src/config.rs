//! Replayer configuration.

use std::env;

/// Tuning knobs for the background replayer, loaded from environment
/// variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum concurrent in-flight operations (always one per entity at most).
    pub max_in_flight: usize,
    /// Total attempts before a transiently failing operation becomes `failed`.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub base_backoff_ms: u64,
    /// Upper bound on the retry delay.
    pub max_backoff_ms: u64,
    /// Timeout applied to each network attempt.
    pub request_timeout_ms: u64,
    /// Fallback wakeup interval when the queue looks idle.
    pub poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            max_attempts: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            request_timeout_ms: 10_000,
            poll_interval_ms: 5_000,
        }
    }
}

impl SyncConfig {
    /// Load configuration from `TETHER_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            max_in_flight: read_var("TETHER_MAX_IN_FLIGHT", defaults.max_in_flight)?,
            max_attempts: read_var("TETHER_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_backoff_ms: read_var("TETHER_BASE_BACKOFF_MS", defaults.base_backoff_ms)?,
            max_backoff_ms: read_var("TETHER_MAX_BACKOFF_MS", defaults.max_backoff_ms)?,
            request_timeout_ms: read_var("TETHER_REQUEST_TIMEOUT_MS", defaults.request_timeout_ms)?,
            poll_interval_ms: read_var("TETHER_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the replayer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }

    /// Exponential retry delay for an operation that has already failed
    /// `attempts` times, without jitter.
    pub fn backoff_delay_ms(&self, attempts: u32) -> u64 {
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        self.base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms)
    }
}

fn read_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },

    #[error("TETHER_MAX_IN_FLIGHT must be at least 1")]
    ZeroConcurrency,

    #[error("TETHER_MAX_ATTEMPTS must be at least 1")]
    ZeroAttempts,
}
