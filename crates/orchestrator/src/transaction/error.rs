//! Transaction error types.

use itertools::Itertools;
use thiserror::Error;

use super::synchronization::SynchronizationFailure;
use crate::persistence::PersistenceError;

/// Errors raised while running or committing a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// One or more synchronizations failed; the transaction rolled back.
    ///
    /// `causes` holds every failure in registration order.
    #[error("commit failed: {message} [{}]", .causes.iter().join("; "))]
    CommitFailed {
        message: String,
        causes: Vec<SynchronizationFailure>,
    },

    /// The unit of work itself failed.
    #[error("handler failed: {reason}")]
    Handler { reason: String },

    /// Applying or reading state failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// A transient failure persisted through every retry.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<TransactionError>,
    },
}

impl TransactionError {
    /// Aggregate commit failure over an ordered list of causes.
    pub fn commit_failed(message: impl Into<String>, causes: Vec<SynchronizationFailure>) -> Self {
        Self::CommitFailed {
            message: message.into(),
            causes,
        }
    }

    /// Commit failure with a single cause.
    pub fn commit_failed_single(message: impl Into<String>, cause: SynchronizationFailure) -> Self {
        Self::commit_failed(message, vec![cause])
    }

    /// Create a handler error.
    pub fn handler(reason: impl Into<String>) -> Self {
        Self::Handler {
            reason: reason.into(),
        }
    }

    /// Whether re-running the unit of work may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Persistence(err) => err.is_retryable(),
            Self::CommitFailed { .. } | Self::Handler { .. } | Self::RetriesExhausted { .. } => {
                false
            }
        }
    }

    /// Listener failures carried by a commit failure, if any.
    #[must_use]
    pub fn causes(&self) -> &[SynchronizationFailure] {
        match self {
            Self::CommitFailed { causes, .. } => causes,
            Self::RetriesExhausted { last, .. } => last.causes(),
            Self::Handler { .. } | Self::Persistence(_) => &[],
        }
    }
}

/// Result type for transactional work.
pub type TransactionResult<T> = Result<T, TransactionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::SynchronizationError;

    fn failure(index: usize, name: &str, cause: &str) -> SynchronizationFailure {
        SynchronizationFailure {
            index,
            name: name.to_string(),
            cause: SynchronizationError::new(cause),
        }
    }

    #[test]
    fn test_commit_failed_lists_every_cause() {
        let err = TransactionError::commit_failed(
            "synchronization failed",
            vec![failure(0, "a", "A"), failure(2, "c", "C")],
        );
        assert_eq!(
            err.to_string(),
            "commit failed: synchronization failed [#0 a: A; #2 c: C]"
        );
        assert_eq!(err.causes().len(), 2);
    }

    #[test]
    fn test_commit_failed_single() {
        let err = TransactionError::commit_failed_single("audit", failure(0, "batch-log", "disk full"));
        assert_eq!(err.causes().len(), 1);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_conflict_is_transient() {
        let err = TransactionError::from(PersistenceError::conflict("scheduled_job", "job-1", "lost"));
        assert!(err.is_transient());

        let err = TransactionError::from(PersistenceError::not_found("scheduled_job", "job-1"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_handler_error_is_permanent() {
        assert!(!TransactionError::handler("boom").is_transient());
    }
}
