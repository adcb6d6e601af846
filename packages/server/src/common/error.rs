use crate::kernel::jobs::JobStatus;

/// Core error taxonomy.
///
/// The disposition of each variant is fixed: infrastructure errors are
/// absorbed and retried, business errors surface into the ledger, and
/// duplicate submissions are treated as success by the ingest path.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed input from a caller or a worker message. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Lookup for an absent job.
    #[error("job not found")]
    NotFound,

    /// Tenant mismatch on read. Also a security event.
    #[error("forbidden")]
    Forbidden,

    /// Duplicate job_key or client idempotency key.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A status change not present in the job state machine.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: JobStatus, to: JobStatus },

    /// Database or broker infrastructure failure; retryable.
    #[error("transient infrastructure error: {0}")]
    Transient(String),

    /// Business-logic failure inside a worker handler; counted against
    /// the job's attempt budget.
    #[error("handler failure: {0}")]
    Handler(String),
}

impl CoreError {
    /// Whether the worker runtime should consume an attempt and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_) | CoreError::Handler(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::NotFound,
            other => CoreError::Transient(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_handler_errors_are_retryable() {
        assert!(CoreError::Transient("db timeout".into()).is_retryable());
        assert!(CoreError::Handler("boom".into()).is_retryable());
    }

    #[test]
    fn validation_and_access_errors_are_not_retryable() {
        assert!(!CoreError::Validation("empty text".into()).is_retryable());
        assert!(!CoreError::Forbidden.is_retryable());
        assert!(!CoreError::NotFound.is_retryable());
    }
}
