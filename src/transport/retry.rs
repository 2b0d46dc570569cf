//! Retry with exponential backoff and cancellation-aware waits.

use crate::config::BackendConfig;
use crate::error::{ApiError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default total attempts (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default base delay for backoff.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

/// Retry policy: up to `max_attempts` tries, waiting `base * 2^(n-1)`
/// after failed attempt `n`.
///
/// ```
/// use vocalis::transport::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, never less than 1.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn from_backend(config: &BackendConfig) -> Self {
        Self::new(
            config.retry_attempts,
            Duration::from_millis(config.retry_delay_ms),
        )
    }

    /// Wait applied after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(31);
        self.base_delay.saturating_mul(1u32 << shift)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt limit is reached. `op` receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns the last error, or [`ApiError::Cancelled`] if `cancel` fires.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_while(cancel, operation, ApiError::is_retryable, op)
            .await
    }

    /// Like [`RetryPolicy::run`], with a caller-supplied retry predicate.
    ///
    /// # Errors
    ///
    /// Returns the last error, or [`ApiError::Cancelled`] if `cancel` fires.
    pub async fn run_while<T, F, Fut, R>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        should_retry: R,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        R: Fn(&ApiError) -> bool,
    {
        let mut attempt = 1;
        loop {
            let err = match until_cancelled(cancel, op(attempt)).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= self.max_attempts || !should_retry(&err) {
                return Err(err);
            }
            let delay = self.delay_for_attempt(attempt);
            warn!(
                operation,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            );
            sleep_or_cancel(delay, cancel).await?;
            attempt += 1;
        }
    }
}

/// Await `fut` unless `cancel` fires first.
///
/// # Errors
///
/// Returns the future's error or [`ApiError::Cancelled`].
pub async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ApiError::Cancelled("request cancelled".to_owned())),
        result = fut => result,
    }
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// # Errors
///
/// Returns [`ApiError::Cancelled`] when cancelled during the wait.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ApiError::Cancelled("retry wait cancelled".to_owned())),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}
