//! Coordinator configuration.
//!
//! Every tunable is a `nutype` newtype, so a [`ReservationConfig`] that exists
//! is a valid one. Values can come from code, from serde, or from the
//! `STOCKHOLD_*` environment variables via [`ReservationConfig::from_env`].

use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Environment variable for [`MaxRetryAttempts`].
pub const MAX_RETRY_ATTEMPTS_VAR: &str = "STOCKHOLD_MAX_RETRY_ATTEMPTS";
/// Environment variable for [`RetryBaseDelayMs`].
pub const RETRY_BASE_DELAY_MS_VAR: &str = "STOCKHOLD_RETRY_BASE_DELAY_MS";
/// Environment variable for [`RetryMaxDelayMs`].
pub const RETRY_MAX_DELAY_MS_VAR: &str = "STOCKHOLD_RETRY_MAX_DELAY_MS";
/// Environment variable for [`LockTimeoutMs`].
pub const LOCK_TIMEOUT_MS_VAR: &str = "STOCKHOLD_LOCK_TIMEOUT_MS";

/// Total number of attempts an operation gets when commits keep conflicting.
///
/// Validated to be between 1 and 10; `1` disables retries.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct MaxRetryAttempts(u32);

/// Delay before the first retry, in milliseconds.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RetryBaseDelayMs(u64);

impl RetryBaseDelayMs {
    /// Convert to Duration for use with tokio::time::sleep.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Upper bound of the exponential backoff, in milliseconds.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RetryMaxDelayMs(u64);

impl RetryMaxDelayMs {
    /// Convert to Duration for use with tokio::time::sleep.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// How long one product lock may be waited for, in milliseconds.
///
/// Validated to be between 10ms and 10 minutes.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct LockTimeoutMs(u64);

impl LockTimeoutMs {
    /// Convert to Duration for use with tokio::time::timeout.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Backoff applied when a commit reports a concurrency conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: MaxRetryAttempts,
    /// Delay before the first retry; doubled for each further retry.
    pub base_delay: RetryBaseDelayMs,
    /// Cap on the doubled delay.
    pub max_delay: RetryMaxDelayMs,
}

impl RetryConfig {
    /// Builds a retry configuration, rejecting a cap below the base delay.
    pub fn new(
        max_attempts: MaxRetryAttempts,
        base_delay: RetryBaseDelayMs,
        max_delay: RetryMaxDelayMs,
    ) -> Result<Self, ConfigError> {
        let base_ms: u64 = base_delay.into();
        let max_ms: u64 = max_delay.into();
        if max_ms < base_ms {
            return Err(ConfigError::InconsistentDelays { base_ms, max_ms });
        }
        Ok(Self {
            max_attempts,
            base_delay,
            max_delay,
        })
    }

    /// A configuration that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: one_attempt(),
            ..Self::default()
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

/// Everything a [`crate::ReservationCoordinator`] can be tuned with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReservationConfig {
    /// Retry policy for conflicting commits.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Longest wait for any single product lock.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: LockTimeoutMs,
}

impl ReservationConfig {
    /// Replaces the retry settings.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the lock timeout.
    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: LockTimeoutMs) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Reads the `STOCKHOLD_*` environment variables; unset ones keep their default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`ReservationConfig::from_env`], reading values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_attempts = match read_u64(&lookup, MAX_RETRY_ATTEMPTS_VAR)? {
            Some(raw) => {
                let raw = u32::try_from(raw).map_err(|_| out_of_range(MAX_RETRY_ATTEMPTS_VAR, raw))?;
                MaxRetryAttempts::try_new(raw).map_err(|error| ConfigError::OutOfRange {
                    parameter: MAX_RETRY_ATTEMPTS_VAR,
                    detail: error.to_string(),
                })?
            }
            None => defaults.retry.max_attempts,
        };
        let base_delay = match read_u64(&lookup, RETRY_BASE_DELAY_MS_VAR)? {
            Some(raw) => RetryBaseDelayMs::try_new(raw).map_err(|error| ConfigError::OutOfRange {
                parameter: RETRY_BASE_DELAY_MS_VAR,
                detail: error.to_string(),
            })?,
            None => defaults.retry.base_delay,
        };
        let max_delay = match read_u64(&lookup, RETRY_MAX_DELAY_MS_VAR)? {
            Some(raw) => RetryMaxDelayMs::try_new(raw).map_err(|error| ConfigError::OutOfRange {
                parameter: RETRY_MAX_DELAY_MS_VAR,
                detail: error.to_string(),
            })?,
            None => defaults.retry.max_delay,
        };
        let lock_timeout = match read_u64(&lookup, LOCK_TIMEOUT_MS_VAR)? {
            Some(raw) => LockTimeoutMs::try_new(raw).map_err(|error| ConfigError::OutOfRange {
                parameter: LOCK_TIMEOUT_MS_VAR,
                detail: error.to_string(),
            })?,
            None => defaults.lock_timeout,
        };

        Ok(Self {
            retry: RetryConfig::new(max_attempts, base_delay, max_delay)?,
            lock_timeout,
        })
    }
}

fn read_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    variable: &'static str,
) -> Result<Option<u64>, ConfigError> {
    lookup(variable)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::NotANumber { variable, value })
        })
        .transpose()
}

fn out_of_range(parameter: &'static str, raw: u64) -> ConfigError {
    ConfigError::OutOfRange {
        parameter,
        detail: format!("{raw} does not fit in 32 bits"),
    }
}

// The literals below satisfy their validators; see `default_values_are_valid`.
fn default_max_attempts() -> MaxRetryAttempts {
    MaxRetryAttempts::try_new(3).expect("3 is within 1..=10")
}

fn one_attempt() -> MaxRetryAttempts {
    MaxRetryAttempts::try_new(1).expect("1 is within 1..=10")
}

fn default_base_delay() -> RetryBaseDelayMs {
    RetryBaseDelayMs::try_new(20).expect("20 is within 1..=10_000")
}

fn default_max_delay() -> RetryMaxDelayMs {
    RetryMaxDelayMs::try_new(1_000).expect("1_000 is within 10..=300_000")
}

fn default_lock_timeout() -> LockTimeoutMs {
    LockTimeoutMs::try_new(5_000).expect("5_000 is within 10..=600_000")
}

impl Default for LockTimeoutMs {
    fn default() -> Self {
        default_lock_timeout()
    }
}
