//! Bounded retry with backoff.
//!
//! Shared by the HTTP fetch layer (exponential backoff with jitter on transient
//! failures) and the ETL load step (fixed delay, every failure retried).
//!
//! # Backoff Strategy
//!
//! ```text
//! exponential: delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..jitter)
//! fixed:       delay = base_delay
//! ```

use crate::error::EtlError;
use rand::{Rng, rng};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// Upper bound of the random jitter added to exponential delays.
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff: Backoff::Exponential,
            jitter: Duration::from_millis(250),
        }
    }

    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            max_delay: delay,
            backoff: Backoff::Fixed,
            jitter: Duration::ZERO,
        }
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(16) as u32;
                let delay = self.base_delay.saturating_mul(1 << shift).min(self.max_delay);
                let jitter_ms = self.jitter.as_millis() as u64;
                if jitter_ms == 0 {
                    delay
                } else {
                    delay + Duration::from_millis(rng().random_range(0..=jitter_ms))
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_millis(500), Duration::from_secs(10))
    }
}

/// Run `op` until it succeeds, `should_retry` rejects the error, or the policy's
/// attempt budget is spent. The last error is returned unchanged.
pub async fn retry<T, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    should_retry: P,
    mut op: F,
) -> Result<T, EtlError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, EtlError>>,
    P: Fn(&EtlError) -> bool,
{
    let total_t0 = Instant::now();
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }
                if attempt >= policy.max_attempts {
                    error!(
                        label,
                        attempt,
                        max = policy.max_attempts,
                        elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                        error = %e,
                        "retries exhausted"
                    );
                    return Err(e);
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    label,
                    attempt,
                    max = policy.max_attempts,
                    ?delay,
                    error = %e,
                    "attempt failed; backing off"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast(attempts: usize) -> RetryPolicy {
        RetryPolicy::fixed(attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let mut policy =
            RetryPolicy::exponential(5, Duration::from_secs(1), Duration::from_secs(4));
        policy.jitter = Duration::ZERO;
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(4));
    }

    #[test]
    fn test_fixed_delay_never_grows() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Cell::new(0usize);
        let result = retry(&fast(5), "test", |_| true, |_| {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 {
                    Err(EtlError::Store("busy".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = Cell::new(0usize);
        let result: Result<(), _> = retry(&fast(3), "test", |_| true, |_| {
            calls.set(calls.get() + 1);
            async { Err(EtlError::Store("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = Cell::new(0usize);
        let result: Result<(), _> = retry(&fast(5), "test", EtlError::is_retryable, |_| {
            calls.set(calls.get() + 1);
            async { Err(EtlError::scrape("doc", "missing field")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
