//! Retry controller for remote calls
//!
//! Wraps a fallible async call with exponential backoff, jitter, a per-attempt
//! timeout and a bounded attempt count. Retryable failures are slept on and
//! repeated; fatal failures return immediately. Exhausting the attempts turns
//! the last retryable failure into a [`FatalError`] carrying every attempt.
//!
//! The controller holds no mutable state and is shared freely across chunks.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{AttemptRecord, ExtractError, FatalError, FatalKind};

/// Successful result together with the failed attempts that preceded it
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: Vec<AttemptRecord>,
}

impl<T> Retried<T> {
    /// Number of retries that were needed
    pub fn retries(&self) -> usize {
        self.attempts.len()
    }
}

/// Longest server-requested wait honoured before a retry
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `base * multiplier^retry`, capped, before jitter
    pub fn base_backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let raw = self.policy.base_delay_ms as f64 * self.policy.multiplier.powi(exponent);
        let capped = raw.min(self.policy.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay before retry number `retry` (0-based).
    ///
    /// `sample` is a uniform draw from `0.0..1.0` scaled by the jitter fraction.
    /// The result never drops below `previous` and never exceeds the cap, so a
    /// run of consecutive failures waits a non-decreasing, bounded amount.
    pub fn next_delay(&self, retry: u32, previous: Duration, sample: f64) -> Duration {
        let base = self.base_backoff(retry);
        let jitter = base.as_millis() as f64 * self.policy.jitter * sample.clamp(0.0, 1.0);
        let jittered = Duration::from_millis(base.as_millis() as u64 + jitter as u64);
        jittered.min(self.policy.max_delay()).max(previous)
    }

    /// Run `call` until it succeeds, fails fatally, or runs out of attempts.
    ///
    /// `call` receives the 1-based attempt number. Each attempt is bounded by
    /// the policy's attempt timeout; an elapsed timeout counts as retryable.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<Retried<T>, FatalError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ExtractError>>,
    {
        let max_attempts = self.policy.max_attempts();
        let timeout = self.policy.attempt_timeout();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut previous = Duration::ZERO;

        for attempt in 1..=max_attempts {
            debug!(operation, attempt, max_attempts, "Attempt starting");

            let outcome = match tokio::time::timeout(timeout, call(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(ExtractError::timeout(format!(
                    "attempt exceeded {}ms",
                    timeout.as_millis()
                ))),
            };

            match outcome {
                Ok(value) => return Ok(Retried { value, attempts }),
                Err(ExtractError::Fatal(mut fatal)) => {
                    warn!(operation, attempt, error = %fatal, "Fatal failure, not retrying");
                    attempts.push(AttemptRecord {
                        attempt,
                        error: fatal.to_string(),
                        retryable: false,
                        delay_ms: None,
                        used_retry_after: false,
                    });
                    fatal.attempts = attempts;
                    return Err(fatal);
                },
                Err(ExtractError::Retryable(err)) => {
                    if attempt == max_attempts {
                        attempts.push(AttemptRecord {
                            attempt,
                            error: err.to_string(),
                            retryable: true,
                            delay_ms: None,
                            used_retry_after: false,
                        });
                        break;
                    }

                    let computed = self.next_delay(attempt - 1, previous, rand::random::<f64>());
                    previous = computed;
                    let (delay, used_retry_after) = match err.retry_after {
                        Some(hint) if hint > MAX_RETRY_AFTER => {
                            warn!(
                                operation,
                                retry_after_s = hint.as_secs(),
                                max_s = MAX_RETRY_AFTER.as_secs(),
                                "Retry-After hint exceeds the limit, clamping"
                            );
                            (MAX_RETRY_AFTER, true)
                        },
                        Some(hint) => (hint, true),
                        None => (computed, false),
                    };

                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        used_retry_after,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    attempts.push(AttemptRecord {
                        attempt,
                        error: err.to_string(),
                        retryable: true,
                        delay_ms: Some(delay.as_millis() as u64),
                        used_retry_after,
                    });
                    tokio::time::sleep(delay).await;
                },
            }
        }

        let last = attempts.last().map(|a| a.error.clone()).unwrap_or_default();
        Err(FatalError {
            kind: FatalKind::RetriesExhausted,
            message: format!("{} failed after {} attempts: {}", operation, attempts.len(), last),
            attempts,
        })
    }
}
