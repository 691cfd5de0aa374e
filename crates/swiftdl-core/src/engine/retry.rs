//! Retry/backoff controller
//!
//! Runs an attempt closure up to `max_retries + 1` times, sleeping
//! `min(initial * 2^n, max)` between failures.

use crate::error::DownloadError;
use std::future::Future;
use std::time::Duration;
use swiftdl_types::EngineConfig;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Retry 4xx responses instead of failing fast
    pub retry_client_errors: bool,
}

/// What the retry loop ended with
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, DownloadError>,
    /// Index of the last attempt made
    pub retries_used: u32,
    pub failed_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            initial_delay: config.initial_retry_delay(),
            max_delay: config.max_retry_delay(),
            retry_client_errors: config.retry_client_errors,
        }
    }

    /// Sleep before retry number `retry` (0 = first retry)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(retry);
        self.initial_delay.saturating_mul(multiplier).min(self.max_delay)
    }

    /// Upper bound of all sleeps a task with `max_retries` can incur
    pub fn total_backoff(&self, max_retries: u32) -> Duration {
        (0..max_retries).fold(Duration::ZERO, |acc, n| acc.saturating_add(self.delay_for(n)))
    }

    pub fn should_retry(&self, error: &DownloadError) -> bool {
        error.is_retryable() || (self.retry_client_errors && error.is_client_error())
    }

    /// Drive `attempt` until it succeeds, fails permanently, or runs out of tries.
    ///
    /// `on_retry` is told the upcoming attempt index, the delay and the error
    /// that caused it, before the controller sleeps.
    pub async fn run<T, F, Fut, R>(&self, max_retries: u32, mut on_retry: R, mut attempt: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DownloadError>>,
        R: FnMut(u32, Duration, &DownloadError),
    {
        let mut index = 0;
        let mut failed_attempts = 0;

        loop {
            match attempt(index).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        retries_used: index,
                        failed_attempts,
                    };
                }
                Err(e) => {
                    failed_attempts += 1;

                    if index >= max_retries || !self.should_retry(&e) {
                        return RetryOutcome {
                            result: Err(e),
                            retries_used: index,
                            failed_attempts,
                        };
                    }

                    let delay = self.delay_for(index);
                    warn!(
                        "Attempt {}/{} failed: {}. Retrying in {:?}",
                        index + 1,
                        max_retries + 1,
                        e,
                        delay
                    );
                    on_retry(index + 1, delay, &e);
                    tokio::time::sleep(delay).await;
                    index += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            retry_client_errors: false,
        }
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let p = policy();
        let delays: Vec<u64> = (0..5).map(|n| p.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert_eq!(p.total_backoff(3), Duration::from_secs(7));
        assert_eq!(p.total_backoff(0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = policy()
            .run(3, |_, _, _| {}, |_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(DownloadError::Http { status: 500 })
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), "done");
        assert_eq!(outcome.retries_used, 2);
        assert_eq!(outcome.failed_attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut notified = Vec::new();
        let outcome: RetryOutcome<()> = policy()
            .run(
                2,
                |attempt, delay, _| notified.push((attempt, delay)),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(DownloadError::Timeout(Duration::from_secs(1))) }
                },
            )
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.retries_used, 2);
        assert_eq!(outcome.failed_attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            notified,
            vec![(1, Duration::from_secs(1)), (2, Duration::from_secs(2))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_fails_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let outcome: RetryOutcome<()> = policy()
            .run(3, |_, _, _| {}, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DownloadError::Http { status: 404 }) }
            })
            .await;

        assert_eq!(outcome.retries_used, 0);
        assert_eq!(outcome.failed_attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_retried_when_enabled() {
        let calls = Arc::new(AtomicU32::new(0));
        let p = RetryPolicy {
            retry_client_errors: true,
            ..policy()
        };
        let outcome: RetryOutcome<()> = p
            .run(2, |_, _, _| {}, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DownloadError::Http { status: 404 }) }
            })
            .await;

        assert_eq!(outcome.retries_used, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
