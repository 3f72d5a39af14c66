use crate::{event::EventId, store::StoreError};
use garner_integration::Unrecoverable;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Represents all possible errors that can occur in the Garner core.
///
/// Variants are classified by effect rather than by origin:
/// - `Validation` - rejected before any state mutation; reported, never retried.
/// - `Conflict` - optimistic-concurrency mismatch or start-of-day-after-intraday; retried once,
///   then escalated to `Permanent`.
/// - `Transient` - store/publish I/O, timeouts, lock-acquire failures; retried with
///   exponential backoff until the [`RetryPolicy`] is exhausted.
/// - `Permanent` - exhausted retries or corrupt payloads; dead-lettered, offset committed.
/// - `Quarantined` - a limit-counter rollback failed; the key is excluded from all further
///   updates and reads until an operator clears it.
/// - `Timeout` - processing deadline exceeded; no state mutation persists.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient: {0}")]
    Transient(#[from] TransientError),

    #[error("permanent: {0}")]
    Permanent(String),

    #[error("key quarantined: {0}")]
    Quarantined(String),

    #[error("deadline of {budget_ms}ms exceeded in {operation}")]
    Timeout { operation: String, budget_ms: u64 },
}

impl CoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CoreError::Validation(_) => ErrorClass::Validation,
            CoreError::Conflict(_) => ErrorClass::Conflict,
            CoreError::Transient(_) => ErrorClass::Transient,
            CoreError::Permanent(_) => ErrorClass::Permanent,
            CoreError::Quarantined(_) => ErrorClass::Quarantine,
            CoreError::Timeout { .. } => ErrorClass::Timeout,
        }
    }

    /// True if the dispatcher should re-attempt the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::Conflict
        )
    }

    /// Escalate an error whose retries are exhausted into a `Permanent` error.
    pub fn into_permanent(self) -> Self {
        match self {
            retryable @ (CoreError::Transient(_) | CoreError::Conflict(_)) => {
                CoreError::Permanent(retryable.to_string())
            }
            other => other,
        }
    }

    pub fn timeout(operation: impl Into<String>, budget: Duration) -> Self {
        CoreError::Timeout {
            operation: operation.into(),
            budget_ms: budget.as_millis() as u64,
        }
    }
}

/// Effect classification of a [`CoreError`], used by the dispatcher to choose between
/// reject, retry, dead-letter and quarantine.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum ErrorClass {
    Validation,
    Conflict,
    Transient,
    Permanent,
    Quarantine,
    Timeout,
}

/// An event or order rejected before any state mutation.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum ValidationError {
    #[error("event field missing: {0}")]
    MissingField(String),

    #[error("duplicate event: {0}")]
    DuplicateEvent(EventId),

    #[error("business date {date} outside ±{window} business days of {today}")]
    BusinessDateOutOfWindow {
        date: chrono::NaiveDate,
        today: chrono::NaiveDate,
        window: u32,
    },

    #[error("unknown security: {0}")]
    UnknownSecurity(String),

    #[error("unknown counterparty: {0}")]
    UnknownCounterparty(String),

    #[error("unknown aggregation unit: {0}")]
    UnknownAggregationUnit(String),

    #[error("{0}")]
    Invalid(String),
}

/// A temporary failure expected to succeed on retry.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum TransientError {
    #[error("store: {0}")]
    Store(String),

    #[error("publish: {0}")]
    Publish(String),

    #[error("lock acquire: {0}")]
    Lock(String),
}

impl From<StoreError> for CoreError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::VersionConflict { expected, actual } => CoreError::Conflict(format!(
                "version mismatch: expected {expected:?}, actual {actual:?}"
            )),
            StoreError::Io(io) => CoreError::Transient(TransientError::Store(io)),
            StoreError::Unavailable(unavailable) => {
                CoreError::Transient(TransientError::Store(unavailable))
            }
        }
    }
}

impl Unrecoverable for CoreError {
    fn is_unrecoverable(&self) -> bool {
        matches!(self, CoreError::Permanent(_) | CoreError::Quarantined(_))
    }
}

/// Exponential backoff schedule for `Transient` failures.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the provided attempt (1-indexed).
    ///
    /// Doubles per attempt from `base`, saturating at `cap`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent));
        delay.min(self.cap)
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
