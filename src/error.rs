//! Error types shared across the collection pipeline
//!
//! Most of the crate works with `anyhow::Result` and layers context as errors
//! travel upward. The types here are the ones callers need to tell apart:
//! caller cancellation, an exhausted retry budget and a partially failed
//! multi-project scan.

use thiserror::Error;

/// The caller's cancellation token fired while an operation was waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Attached as context to the last underlying error once every retry
/// attempt has failed.
///
/// ```ignore
/// if err.downcast_ref::<MaxRetriesExceeded>().is_some() { /* budget spent */ }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("max retries ({attempts}) exceeded")]
pub struct MaxRetriesExceeded {
    pub attempts: u32,
}

/// Summary returned by the project pool when at least one project failed.
/// The per-project details stay available on the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed to collect {failed} of {total} projects")]
pub struct PartialFailure {
    pub failed: usize,
    pub total: usize,
}

/// Returns true when the error chain contains a caller cancellation.
pub fn is_cancelled(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause.downcast_ref::<Cancelled>().is_some()
            || cause
                .downcast_ref::<crate::storage::StoreError>()
                .is_some_and(|e| e.is_cancelled())
    })
}
