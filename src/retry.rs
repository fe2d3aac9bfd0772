//! Retry loop for one collaborator call.
//!
//! Transient failures (connect errors, timeouts, 429 and 5xx answers) are
//! retried with capped exponential backoff; everything else stops at once.
//! The backoff wait runs under the run's cancellation token, so an interrupt
//! never sits out a long delay before the batch is dropped.

use std::{fmt::Display, future::Future, time::Duration};

use log::warn;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

/// Whether a failed attempt should be tried again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retry,
    Stop,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Single attempt, no waiting. Used by tests and `--max-retries 1`.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Runs `op` until it succeeds, `classify` says stop, attempts run out, or
    /// `cancel` fires. The last attempt's error is returned when giving up;
    /// cancellation surfaces as [`PipelineError::Cancelled`].
    pub async fn run<F, Fut, T, E, Classifier>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        classify: Classifier,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + From<PipelineError>,
        Classifier: Fn(&E) -> RetryDisposition,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled.into());
            }
            let err = match op().await {
                Ok(result) => return Ok(result),
                Err(err) => err,
            };
            if classify(&err) == RetryDisposition::Stop || attempt >= self.max_attempts {
                return Err(err);
            }
            let delay = self.backoff_delay(attempt - 1);
            warn!(
                "Attempt {attempt}/{} failed ({err}); retrying in {delay:?}",
                self.max_attempts
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled.into()),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Wait before retry number `retry` (zero-based), doubling up to `max_delay`.
    pub fn backoff_delay(&self, retry: usize) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << retry.min(16))
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn transient(_: &PipelineError) -> RetryDisposition {
        RetryDisposition::Retry
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(350));
        assert_eq!(RetryPolicy::no_retry().backoff_delay(3), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(10));
        let result = policy
            .run(
                &CancellationToken::new(),
                || {
                    calls.set(calls.get() + 1);
                    let n = calls.get();
                    async move {
                        if n < 3 {
                            Err(PipelineError::Transport("busy".into()))
                        } else {
                            Ok(n)
                        }
                    }
                },
                transient,
            )
            .await;
        assert_eq!(result.ok(), Some(3));
    }

    #[tokio::test]
    async fn stop_disposition_returns_immediately() {
        let calls = Cell::new(0);
        let result: Result<(), PipelineError> = RetryPolicy::default()
            .run(
                &CancellationToken::new(),
                || {
                    calls.set(calls.get() + 1);
                    async { Err(PipelineError::Transport("bad request".into())) }
                },
                |_| RetryDisposition::Stop,
            )
            .await;
        assert!(matches!(result, Err(PipelineError::Transport(_))));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_backoff_short() {
        let cancel = CancellationToken::new();
        let calls = Cell::new(0);
        let policy = RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60));
        let result: Result<(), PipelineError> = policy
            .run(
                &cancel,
                || {
                    calls.set(calls.get() + 1);
                    cancel.cancel();
                    async { Err(PipelineError::Transport("reset".into())) }
                },
                transient,
            )
            .await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(calls.get(), 1);
    }
}
