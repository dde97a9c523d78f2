//! Bounded retry with exponential backoff for store calls.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StoreError;

/// How transient store failures are retried.
///
/// Durations are kept as integer milliseconds so the policy reads
/// naturally in a TOML config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay_ms: u64,
    /// Backoff cap.
    pub max_delay_ms: u64,
    /// Multiplier applied per further attempt.
    pub backoff_factor: f64,
    /// Upper bound on a single remote call.
    pub call_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
            backoff_factor: 2.0,
            call_timeout_ms: 60_000,
        }
    }
}

/// Why a retried call gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: StoreError },

    #[error("permanent failure on attempt {attempt}: {source}")]
    Permanent { attempt: u32, source: StoreError },

    #[error("cancelled")]
    Cancelled,
}

impl RetryError {
    /// The last store error, if the call failed rather than being cancelled.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Exhausted { source, .. } | Self::Permanent { source, .. } => Some(source),
            Self::Cancelled => None,
        }
    }
}

impl RetryPolicy {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay after the given failed attempt (1-based), with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay_ms as f64 / 1000.0 * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay().as_secs_f64());
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / u32::MAX as f64)
            * 2.0
            - 1.0;
        Duration::from_secs_f64((capped + jitter * offset).max(0.0))
    }

    /// Runs `call` until it succeeds, fails permanently, runs out of
    /// attempts, or `cancel` fires. Cancellation abandons an in-flight call.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: &str,
        call: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.run_inner(cancel, op, call, true).await
    }

    /// Like [`run`](Self::run) but never abandons a call once sent.
    ///
    /// Used for ref updates: an abandoned update may still land remotely,
    /// so cancellation is only honoured before the first attempt.
    pub async fn run_to_completion<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: &str,
        call: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.run_inner(cancel, op, call, false).await
    }

    async fn run_inner<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: &str,
        mut call: F,
        interruptible: bool,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let max_attempts = self.max_attempts.max(1);
        let timeout = self.call_timeout();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = if interruptible {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    r = tokio::time::timeout(timeout, call()) => r,
                }
            } else {
                tokio::time::timeout(timeout, call()).await
            };

            let err = match outcome {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(op, attempt, "store call succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => StoreError::Timeout(timeout),
            };

            if !err.is_transient() {
                return Err(RetryError::Permanent {
                    attempt,
                    source: err,
                });
            }
            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = match &err {
                StoreError::RateLimited {
                    retry_after: Some(after),
                } => (*after).min(self.max_delay()),
                _ => self.delay_for_attempt(attempt),
            };
            warn!(
                op,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient store failure, retrying"
            );

            if interruptible {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                tokio::time::sleep(delay).await;
            }
        }
    }
}
