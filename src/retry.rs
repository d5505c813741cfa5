//! Rate-limit aware retrier wrapped around every network call.

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, SocialGraphError};
use crate::fetch::FetchError;

/// Bounds and delays for retrying a single call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// First backoff after a transient failure; doubled per attempt.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Wait after a rate-limit response that carries no retry-after hint.
    pub rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            rate_limit_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Same bounds, no waiting. Used by tests and stub backends.
    pub fn without_delays(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            rate_limit_delay: Duration::ZERO,
        }
    }

    /// Delay before the next attempt, given the failure and how many
    /// attempts were already made.
    pub fn delay_for(&self, error: &FetchError, attempt: u32) -> Duration {
        match error {
            FetchError::RateLimited { retry_after } => retry_after.unwrap_or(self.rate_limit_delay),
            _ => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.base_backoff
                    .checked_mul(factor)
                    .unwrap_or(self.max_backoff)
                    .min(self.max_backoff)
            }
        }
    }
}

/// Executes fetcher calls under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct Retrier {
    policy: RetryPolicy,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails fatally, or the attempt
    /// bound is reached.
    ///
    /// `what` names the call in log lines.
    pub async fn execute<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, FetchError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        log::debug!("{} succeeded on attempt {}", what, attempt);
                    }
                    return Ok(value);
                }
                Err(FetchError::Fatal(message)) => {
                    return Err(SocialGraphError::NonRetryable(format!("{}: {}", what, message)));
                }
                Err(error) => error,
            };

            if attempt >= max_attempts {
                return Err(SocialGraphError::RetriesExhausted {
                    attempts: attempt,
                    last_error: format!("{}: {}", what, error),
                });
            }

            let delay = self.policy.delay_for(&error, attempt);
            log::warn!(
                "{}: retry {}/{} in {:?} after error: {}",
                what,
                attempt,
                max_attempts - 1,
                delay,
                error
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn rate_limited() -> FetchError {
        FetchError::RateLimited { retry_after: None }
    }

    #[tokio::test]
    async fn test_success_returns_immediately() {
        let retrier = Retrier::new(RetryPolicy::without_delays(3));
        let calls = Cell::new(0);
        let result = retrier
            .execute("ok", || {
                calls.set(calls.get() + 1);
                async { Ok::<_, FetchError>(7) }
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_rate_limits_below_bound() {
        let retrier = Retrier::new(RetryPolicy::without_delays(4));
        let calls = Cell::new(0);
        let result = retrier
            .execute("flaky", || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n <= 3 {
                        Err(rate_limited())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 4);
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test]
    async fn test_always_rate_limited_exhausts() {
        let retrier = Retrier::new(RetryPolicy::without_delays(3));
        let calls = Cell::new(0);
        let err = retrier
            .execute("busy", || {
                calls.set(calls.get() + 1);
                async { Err::<(), _>(rate_limited()) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.get(), 3);
        match err {
            SocialGraphError::RetriesExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("busy"));
                assert!(last_error.contains("rate limited"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let retrier = Retrier::new(RetryPolicy::without_delays(5));
        let calls = Cell::new(0);
        let result = retrier
            .execute("reset", || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n == 1 {
                        Err(FetchError::Transient("connection reset".to_string()))
                    } else {
                        Ok("page")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, "page");
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let retrier = Retrier::new(RetryPolicy::without_delays(5));
        let calls = Cell::new(0);
        let err = retrier
            .execute("auth", || {
                calls.set(calls.get() + 1);
                async { Err::<(), _>(FetchError::Fatal("invalid token".to_string())) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert!(matches!(err, SocialGraphError::NonRetryable(ref m) if m.contains("invalid token")));
    }

    #[test]
    fn test_delay_prefers_retry_after_hint() {
        let policy = RetryPolicy::default();
        let hinted = FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(12)),
        };
        assert_eq!(policy.delay_for(&hinted, 1), Duration::from_secs(12));
        assert_eq!(policy.delay_for(&rate_limited(), 1), Duration::from_secs(300));
    }

    #[test]
    fn test_transient_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            rate_limit_delay: Duration::from_secs(300),
        };
        let err = FetchError::Transient("timeout".to_string());
        assert_eq!(policy.delay_for(&err, 1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(&err, 2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(&err, 3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(&err, 4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(&err, 40), Duration::from_secs(5));
    }
}
