//! Retry with exponential backoff and transient-error classification.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use backon::{ExponentialBuilder, Retryable};
use tokio_util::sync::CancellationToken;

use crate::error::{self, Cancelled, MaxRetriesExceeded};
use crate::gcp::http::ApiError;

/// Message fragments that mark an otherwise unrecognised error as transient.
const TRANSIENT_INDICATORS: &[&str] = &[
    "timeout",
    "timed out",
    "deadline",
    "temporary",
    "connection reset",
    "connection refused",
    "broken pipe",
];

/// How many times to run an operation and how long to wait in between.
///
/// - Max attempts: 3 (the first call counts)
/// - Backoff: `initial_backoff`, doubling after each failure (1s, 2s)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delays between attempts: `initial_backoff`, doubling, no jitter.
    ///
    /// - Min delay: `initial_backoff`
    /// - Factor: 2
    /// - Retries: `max_attempts - 1`
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_factor(2.0)
            .with_max_times(self.attempts() as usize - 1)
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget is
/// spent.
///
/// - Non-retryable errors are returned unchanged after the attempt that
///   produced them.
/// - Cancelling `cancel` while an attempt or a backoff sleep is pending
///   returns [`Cancelled`] and `op` is not called again.
/// - Exhausting the budget returns the last error with
///   [`MaxRetriesExceeded`] attached as context.
pub async fn retry_with_backoff<T, F, Fut>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let retried = op
        .retry(policy.backoff())
        .when(is_retryable)
        .notify(|err: &anyhow::Error, delay: Duration| {
            tracing::warn!("Attempt failed, retrying in {:?}: {:#}", delay, err);
        });

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Cancelled.into()),
        result = retried => result,
    };

    match result {
        Err(err) if is_retryable(&err) => Err(err).context(MaxRetriesExceeded {
            attempts: policy.attempts(),
        }),
        other => other,
    }
}

/// Determines if an error should trigger a retry.
///
/// Retryable:
/// - HTTP 429, 502, 503, 504
/// - `RESOURCE_EXHAUSTED`, `UNAVAILABLE`, `DEADLINE_EXCEEDED`
/// - transport timeouts and connection failures
/// - messages mentioning timeouts, deadlines, resets, refused connections
///   or broken pipes
///
/// Never retried:
/// - caller cancellation
/// - HTTP 400, 401, 403, 404
/// - `PERMISSION_DENIED`, `UNAUTHENTICATED`, `NOT_FOUND`, `INVALID_ARGUMENT`
/// - anything unrecognised
pub fn is_retryable(err: &anyhow::Error) -> bool {
    if error::is_cancelled(err) {
        return false;
    }

    for cause in err.chain() {
        if let Some(api) = cause.downcast_ref::<ApiError>() {
            if let Some(verdict) = classify_api_error(api) {
                return verdict;
            }
        }
        if let Some(transport) = cause.downcast_ref::<reqwest::Error>() {
            if transport.is_timeout() || transport.is_connect() {
                return true;
            }
        }
    }

    let message = format!("{err:#}").to_lowercase();
    TRANSIENT_INDICATORS
        .iter()
        .any(|indicator| message.contains(indicator))
}

fn classify_api_error(err: &ApiError) -> Option<bool> {
    match err.code.as_deref() {
        Some("UNAVAILABLE" | "RESOURCE_EXHAUSTED" | "DEADLINE_EXCEEDED") => return Some(true),
        Some("PERMISSION_DENIED" | "UNAUTHENTICATED" | "NOT_FOUND" | "INVALID_ARGUMENT") => {
            return Some(false)
        }
        _ => {}
    }

    match err.status {
        429 | 502 | 503 | 504 => Some(true),
        400 | 401 | 403 | 404 => Some(false),
        _ => None,
    }
}
