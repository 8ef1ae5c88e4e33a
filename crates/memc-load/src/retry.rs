//! Fixed-delay retry for store writes

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Classifies errors that are worth another attempt
pub trait Transient {
    fn is_transient(&self) -> bool {
        true
    }
}

/// Why [`RetryPolicy::run`] gave up
#[derive(Error, Debug)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },

    #[error("cancelled while waiting to retry")]
    Cancelled,
}

/// Number of attempts and the delay between them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Run `op` until it succeeds, returns a permanent error, or runs out of
    /// attempts
    ///
    /// `op` receives the 1-based attempt number. The delay is only taken
    /// between attempts, never after the last one, and is cut short when
    /// `cancel` fires.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Transient + 'static,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_attempts || !e.is_transient() => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                },
                Err(e) => {
                    debug!(
                        "Attempt {}/{} failed: {}. Retrying in {}ms...",
                        attempt,
                        max_attempts,
                        e,
                        self.backoff.as_millis()
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(self.backoff) => {},
                    }

                    attempt += 1;
                },
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_ATTEMPTS,
            Duration::from_millis(crate::config::DEFAULT_RETRY_BACKOFF_MS),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Error, Debug)]
    enum TestError {
        #[error("flaky")]
        Flaky,
        #[error("permanent")]
        Permanent,
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Flaky)
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_succeeds_without_delay() {
        let start = Instant::now();
        let value = policy()
            .run(&CancellationToken::new(), |_| async { Ok::<_, TestError>(7) })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_last_attempt() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let value = policy()
            .run(&CancellationToken::new(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(TestError::Flaky)
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sleep_after_final_attempt() {
        let start = Instant::now();
        let result = policy()
            .run(&CancellationToken::new(), |_| async {
                Err::<(), _>(TestError::Flaky)
            })
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 3, .. })
        ));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result = policy()
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Permanent) }
            })
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = policy()
            .run(&cancel, |_| async { Err::<(), _>(TestError::Flaky) })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_tries_once() {
        let calls = AtomicU32::new(0);
        let _ = RetryPolicy::new(0, Duration::ZERO)
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TestError::Flaky) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
