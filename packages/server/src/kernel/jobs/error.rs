//! Handler error classification.
//!
//! Handlers return `anyhow::Result<()>`. A handler that knows its failure
//! is permanent wraps it in [`JobError::Permanent`]; everything else is
//! classified by [`classify_error`] before the dispatcher decides between
//! retry and terminal failure.

use thiserror::Error;

use super::job::ErrorKind;

/// Sentinel error type handlers can return to steer retry behavior.
#[derive(Debug, Error)]
pub enum JobError {
    /// Do not retry, regardless of remaining attempts.
    #[error("{0}")]
    Permanent(String),

    /// Retry with backoff while attempts remain.
    #[error("{0}")]
    Transient(String),

    /// The run observed its cancel signal and unwound. Not a failure.
    #[error("job canceled")]
    Canceled,
}

impl JobError {
    pub fn permanent(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(JobError::Permanent(msg.into()))
    }

    pub fn transient(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(JobError::Transient(msg.into()))
    }

    pub fn canceled() -> anyhow::Error {
        anyhow::Error::new(JobError::Canceled)
    }
}

/// Classify a handler error to determine retry behavior.
///
/// A [`JobError`] sentinel anywhere in the chain wins. Otherwise fall back
/// to text heuristics: validation-shaped failures will not get better on a
/// second attempt, everything else (network, timeouts, contention) might.
pub fn classify_error(error: &anyhow::Error) -> ErrorKind {
    for cause in error.chain() {
        if let Some(job_err) = cause.downcast_ref::<JobError>() {
            return match job_err {
                JobError::Permanent(_) => ErrorKind::NonRetryable,
                JobError::Transient(_) => ErrorKind::Retryable,
                JobError::Canceled => ErrorKind::Canceled,
            };
        }
    }

    let error_str = error.to_string().to_lowercase();

    // Non-retryable: validation errors, not found, permission denied
    if error_str.contains("not found")
        || error_str.contains("invalid")
        || error_str.contains("permission denied")
        || error_str.contains("unauthorized")
        || error_str.contains("forbidden")
    {
        return ErrorKind::NonRetryable;
    }

    // Non-retryable: deserialization errors
    if error_str.contains("deserialize") || error_str.contains("parse") {
        return ErrorKind::NonRetryable;
    }

    // Everything else is retryable (network errors, timeouts, etc.)
    ErrorKind::Retryable
}
