//! Retry executor: run an async operation, retrying per a `RetryPolicy`.
//!
//! Knows nothing about workflows. The operation's error type classifies
//! itself through [`RetryableError`]; the executor only decides whether to
//! wait and try again, give up, or stop because the token was cancelled.

use std::future::Future;
use std::time::Duration;

use cadence_types::llm::ProviderError;
use cadence_types::retry::RetryPolicy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Errors that know whether another attempt may succeed.
pub trait RetryableError: std::fmt::Display {
    fn is_retryable(&self) -> bool;

    /// Suggested minimum wait in milliseconds before the next attempt.
    fn retry_delay_hint(&self) -> Option<u64> {
        None
    }
}

impl RetryableError for ProviderError {
    fn is_retryable(&self) -> bool {
        ProviderError::is_retryable(self)
    }

    fn retry_delay_hint(&self) -> Option<u64> {
        self.retry_after_ms()
    }
}

/// Terminal outcome of a retried operation. Every variant carries the number
/// of attempts that were started.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    #[error("non-retryable failure on attempt {attempts}: {error}")]
    NonRetryable { attempts: u32, error: E },

    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::NonRetryable { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }

    /// The last operation error, if the operation ever failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last_error, .. } => Some(last_error),
            RetryError::NonRetryable { error, .. } => Some(error),
            RetryError::Cancelled { .. } => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Passed to the retry observer just before the executor sleeps.
#[derive(Debug)]
pub struct RetryNotice<'a, E> {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub delay: Duration,
    pub error: &'a E,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Applies one [`RetryPolicy`] to an operation.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails terminally, exhausts the
    /// policy's attempts, or `cancel` fires.
    ///
    /// The operation receives the 1-based attempt number.
    pub async fn execute<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError,
    {
        self.execute_observed(cancel, operation, |_| {}).await
    }

    /// Like [`execute`](Self::execute), calling `on_retry` before every
    /// backoff sleep.
    pub async fn execute_observed<F, Fut, T, E, O>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
        mut on_retry: O,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError,
        O: FnMut(RetryNotice<'_, E>),
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                outcome = operation(attempt) => outcome,
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(RetryError::NonRetryable {
                    attempts: attempt,
                    error,
                });
            }
            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %error, "retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = self.next_delay(attempt, &error);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retryable failure, backing off"
            );
            on_retry(RetryNotice {
                attempt,
                delay,
                error: &error,
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Policy delay after `attempt`, raised to the error's hint if larger.
    fn next_delay<E: RetryableError>(&self, attempt: u32, error: &E) -> Duration {
        let computed = self.policy.delay_after(attempt, rand::random::<f64>());
        match error.retry_delay_hint() {
            Some(hint) => computed.max(Duration::from_millis(hint)),
            None => computed,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
