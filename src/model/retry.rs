//! Bounded retry policy applied uniformly at capability-call boundaries.
//!
//! LLM requests, search requests and browser operations all go through
//! [`RetryPolicy::run`], so retry counts and backoff live in configuration
//! instead of being scattered through call sites.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Default number of retry attempts for failed requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between retry attempts in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 2;

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Errors that know whether a repeat attempt can succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub retry_delay: Duration,
    /// Multiplier applied to the delay after every retry (1 = constant delay).
    pub backoff_factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            backoff_factor: 2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay before the first retry.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    pub fn with_backoff_factor(mut self, factor: u32) -> Self {
        self.backoff_factor = factor.max(1);
        self
    }

    /// Delay to sleep after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_factor
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.retry_delay
            .checked_mul(factor)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is exhausted. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let max_attempts = self.max_retries + 1;
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && e.is_retryable() => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts,
                        error = %e,
                        "capability call failed, retrying in {:?}",
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(bool);

    impl Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(retryable={})", self.0)
        }
    }

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(max_retries)
            .with_retry_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, Flaky> = fast_policy(3)
            .run("test", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(Flaky(true))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Flaky> = fast_policy(2)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(true))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Flaky> = fast_policy(5)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(false))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default().with_retry_delay(Duration::from_secs(10));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for(10), MAX_BACKOFF);
    }
}
