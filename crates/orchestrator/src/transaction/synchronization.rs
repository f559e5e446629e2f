//! Commit-time listeners.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use super::context::TransactionStatus;
use crate::store::StagedWrite;

/// Failure raised by a synchronization's `before_completion`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SynchronizationError {
    message: String,
}

impl SynchronizationError {
    /// Create a synchronization error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// One listener's failure, tagged with its registration position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynchronizationFailure {
    /// Position in the registry.
    pub index: usize,
    /// Listener name.
    pub name: String,
    /// What went wrong.
    pub cause: SynchronizationError,
}

impl fmt::Display for SynchronizationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}: {}", self.index, self.name, self.cause)
    }
}

/// A listener bound to one transaction's completion.
#[async_trait]
pub trait Synchronization: Send + Sync {
    /// Name used in failure reports and logs.
    fn name(&self) -> &str;

    /// Runs before the write-set is applied. Writes pushed onto `writes`
    /// are applied atomically with the transaction's own. A failure rolls
    /// the transaction back.
    async fn before_completion(
        &self,
        _writes: &mut Vec<StagedWrite>,
    ) -> Result<(), SynchronizationError> {
        Ok(())
    }

    /// Runs once the outcome is known.
    async fn after_completion(&self, _status: TransactionStatus) {}
}

/// Aggregate result of running every `before_completion`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Every listener succeeded.
    Success,
    /// At least one listener failed; all failures in registration order.
    Failed(Vec<SynchronizationFailure>),
}

impl CommitOutcome {
    /// Check if every listener succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Ordered listeners owned by a single transaction.
#[derive(Default)]
pub struct SynchronizationRegistry {
    entries: Vec<Arc<dyn Synchronization>>,
}

impl SynchronizationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener.
    pub fn register(&mut self, synchronization: Arc<dyn Synchronization>) {
        self.entries.push(synchronization);
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every `before_completion` in order without short-circuiting.
    pub async fn before_completion(&self, writes: &mut Vec<StagedWrite>) -> CommitOutcome {
        let mut failures = Vec::new();
        for (index, sync) in self.entries.iter().enumerate() {
            if let Err(cause) = sync.before_completion(writes).await {
                warn!(
                    synchronization = sync.name(),
                    index,
                    error = %cause,
                    "Synchronization failed before completion"
                );
                failures.push(SynchronizationFailure {
                    index,
                    name: sync.name().to_string(),
                    cause,
                });
            }
        }

        if failures.is_empty() {
            CommitOutcome::Success
        } else {
            CommitOutcome::Failed(failures)
        }
    }

    /// Run every `after_completion`, then drop all listeners.
    pub async fn after_completion(&mut self, status: TransactionStatus) {
        let entries = std::mem::take(&mut self.entries);
        debug!(listeners = entries.len(), status = %status, "Completing synchronizations");
        for sync in entries {
            sync.after_completion(status).await;
        }
    }
}

impl fmt::Debug for SynchronizationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|sync| sync.name()))
            .finish()
    }
}
