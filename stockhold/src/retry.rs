//! Retry of coordinator attempts on concurrency conflicts.
//!
//! An attempt acquires its locks, reads, decides and commits, and drops its
//! locks before returning. Only a commit rejected with
//! [`StoreError::ConcurrencyConflict`] is retried, after an exponential
//! backoff with jitter, so a retry always starts from freshly loaded state.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::config::RetryConfig;
use crate::errors::{ReservationError, ReservationResult, StoreError};

impl RetryConfig {
    /// Backoff ceiling before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn backoff_ceiling(&self, retry: u32) -> Duration {
        let base: u64 = self.base_delay.into();
        let cap: u64 = self.max_delay.into();
        let exponent = retry.saturating_sub(1).min(32);
        let delay = base.saturating_mul(1u64 << exponent).min(cap.max(base));
        Duration::from_millis(delay)
    }

    /// Delay to sleep before retry number `retry`.
    ///
    /// Picks uniformly between half the ceiling and the full ceiling so that
    /// contending writers spread out.
    pub fn backoff(&self, retry: u32) -> Duration {
        let ceiling = u64::try_from(self.backoff_ceiling(retry).as_millis()).unwrap_or(u64::MAX);
        let floor = ceiling / 2;
        Duration::from_millis(rand::rng().random_range(floor..=ceiling))
    }
}

/// Runs `attempt` until it succeeds, fails with something other than a
/// concurrency conflict, or runs out of attempts.
///
/// `attempt` receives the 1-based attempt number.
pub(crate) async fn retry_on_conflict<T, F, Fut>(
    config: &RetryConfig,
    operation: &'static str,
    mut attempt: F,
) -> ReservationResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ReservationResult<T>>,
{
    let max_attempts: u32 = config.max_attempts.into();
    let mut number = 1;
    loop {
        match attempt(number).await {
            Err(ReservationError::Store(StoreError::ConcurrencyConflict)) => {
                if number >= max_attempts {
                    error!(
                        operation,
                        attempts = number,
                        "[coordinator.retry] concurrency conflict persisted, giving up"
                    );
                    return Err(ReservationError::ConcurrencyConflict { attempts: number });
                }
                let delay = config.backoff(number);
                warn!(
                    operation,
                    attempt = number,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "[coordinator.retry] concurrency conflict, retrying"
                );
                tokio::time::sleep(delay).await;
                number += 1;
            }
            other => return other,
        }
    }
}
