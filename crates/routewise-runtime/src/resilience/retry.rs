//! Retry with exponential backoff.
//!
//! A retry loop wraps one logical call to one (provider, model) target.
//! Only the final outcome is reported to the circuit breaker, by the caller.

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use crate::providers::{ErrorCategory, ProviderError};

/// Retry policy for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "crate::config::duration_str")]
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after each retry
    pub backoff_factor: f32,

    /// Upper bound for any single delay
    #[serde(with = "crate::config::duration_str")]
    pub max_delay: Duration,

    /// HTTP statuses worth retrying
    pub retryable_status_codes: BTreeSet<u16>,

    /// Failure categories worth retrying when there is no status
    pub retryable_errors: BTreeSet<ErrorCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
            retryable_status_codes: [408, 429, 500, 502, 503, 504].into_iter().collect(),
            retryable_errors: [
                ErrorCategory::Timeout,
                ErrorCategory::Connection,
                ErrorCategory::RateLimited,
                ErrorCategory::ServerError,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(format!(
                "backoff_factor must be at least 1.0, got {}",
                self.backoff_factor
            ));
        }
        Ok(())
    }

    /// Delay slept before retry number `retry` (1-based):
    /// `min(initial_delay * backoff_factor^(retry - 1), max_delay)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let scaled = self.initial_delay.as_secs_f64() * f64::from(self.backoff_factor).powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Whether a failure should be retried against the same target.
    ///
    /// Authentication and malformed-request failures never are. Failures
    /// carrying an HTTP status are judged by status, the rest by category.
    pub fn is_retryable(&self, error: &ProviderError) -> bool {
        let category = error.category();
        if matches!(
            category,
            ErrorCategory::Authentication | ErrorCategory::InvalidRequest
        ) {
            return false;
        }

        match error.status() {
            Some(status) => self.retryable_status_codes.contains(&status),
            None => self.retryable_errors.contains(&category),
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.backoff_factor)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }
}

/// Result of a retried call.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Final outcome: the first success, or the last failure
    pub result: Result<T, ProviderError>,

    /// Attempts made, including the first
    pub attempts: u32,

    /// Delays slept between attempts, in order
    pub delays: Vec<Duration>,
}

impl<T> RetryOutcome<T> {
    pub fn into_result(self) -> Result<T, ProviderError> {
        self.result
    }
}

/// Run `operation` under `policy`.
///
/// Retryable failures are retried after a backoff delay until the attempt
/// budget is spent; any other failure is returned at once. Delays use
/// `tokio::time::sleep`, so only the calling task is suspended.
pub async fn execute<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempts = 0u32;
    let mut delays = Vec::new();

    let result = (|| {
        attempts += 1;
        operation()
    })
    .retry(policy.backoff())
    .sleep(tokio::time::sleep)
    .when(|err: &ProviderError| policy.is_retryable(err))
    .notify(|err: &ProviderError, delay: Duration| {
        tracing::warn!(
            attempt = delays.len() + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient failure"
        );
        delays.push(delay);
    })
    .await;

    if let Err(err) = &result {
        tracing::debug!(attempts, error = %err, "Giving up on target");
    }

    RetryOutcome {
        result,
        attempts,
        delays,
    }
}
