//! Per-attempt transaction context.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::{TransactionError, TransactionResult};
use super::synchronization::{CommitOutcome, Synchronization, SynchronizationRegistry};
use crate::store::{StagedWrite, WriteSetStore};

/// Unique identifier for a transaction attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    /// Create a new unique transaction ID.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("tx-{}", Uuid::new_v4()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Work in progress.
    Active,
    /// Write-set applied.
    Committed,
    /// Nothing applied.
    RolledBack,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Staged writes plus the listeners that must agree before they apply.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    status: TransactionStatus,
    writes: Vec<StagedWrite>,
    registry: SynchronizationRegistry,
}

impl Transaction {
    /// Begin a new transaction.
    #[must_use]
    pub fn begin() -> Self {
        Self {
            id: TransactionId::new(),
            status: TransactionStatus::Active,
            writes: Vec::new(),
            registry: SynchronizationRegistry::new(),
        }
    }

    /// Get the transaction ID.
    #[must_use]
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    /// Get the status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Writes staged so far.
    #[must_use]
    pub fn writes(&self) -> &[StagedWrite] {
        &self.writes
    }

    /// Stage a write for commit.
    pub fn stage(&mut self, write: StagedWrite) {
        self.writes.push(write);
    }

    /// Register a commit-time listener.
    pub fn register_synchronization(&mut self, synchronization: Arc<dyn Synchronization>) {
        self.registry.register(synchronization);
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn synchronization_count(&self) -> usize {
        self.registry.len()
    }

    /// Run the listeners, then apply the write-set, including writes the
    /// listeners staged, atomically.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::CommitFailed` with every listener failure
    /// when any `before_completion` fails, or `TransactionError::Persistence`
    /// when the write-set cannot be applied. Either way nothing is applied.
    pub async fn commit<S>(mut self, store: &S) -> TransactionResult<()>
    where
        S: WriteSetStore + ?Sized,
    {
        let mut writes = std::mem::take(&mut self.writes);
        let outcome = self.registry.before_completion(&mut writes).await;
        if let CommitOutcome::Failed(causes) = outcome {
            warn!(
                transaction_id = %self.id,
                failures = causes.len(),
                "Rolling back after synchronization failures"
            );
            self.complete(TransactionStatus::RolledBack).await;
            return Err(TransactionError::commit_failed(
                "synchronization failed before completion",
                causes,
            ));
        }

        let count = writes.len();
        match store.apply(writes).await {
            Ok(()) => {
                debug!(transaction_id = %self.id, writes = count, "Transaction committed");
                self.complete(TransactionStatus::Committed).await;
                Ok(())
            }
            Err(err) => {
                warn!(transaction_id = %self.id, error = %err, "Write-set rejected");
                self.complete(TransactionStatus::RolledBack).await;
                Err(err.into())
            }
        }
    }

    /// Discard staged writes and notify listeners.
    pub async fn rollback(mut self) {
        self.writes.clear();
        debug!(transaction_id = %self.id, "Transaction rolled back");
        self.complete(TransactionStatus::RolledBack).await;
    }

    async fn complete(&mut self, status: TransactionStatus) {
        self.status = status;
        self.registry.after_completion(status).await;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::events::EventInstance;
    use crate::store::{EventStore, InMemoryStore};
    use crate::transaction::SynchronizationError;

    struct Flaky {
        name: &'static str,
        fail: bool,
        completed: Mutex<Option<TransactionStatus>>,
    }

    impl Flaky {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                completed: Mutex::new(None),
            })
        }

        fn completed(&self) -> Option<TransactionStatus> {
            self.completed.lock().ok().and_then(|c| *c)
        }
    }

    #[async_trait]
    impl Synchronization for Flaky {
        fn name(&self) -> &str {
            self.name
        }

        async fn before_completion(
            &self,
            _writes: &mut Vec<StagedWrite>,
        ) -> Result<(), SynchronizationError> {
            if self.fail {
                Err(SynchronizationError::new(self.name.to_uppercase()))
            } else {
                Ok(())
            }
        }

        async fn after_completion(&self, status: TransactionStatus) {
            if let Ok(mut completed) = self.completed.lock() {
                *completed = Some(status);
            }
        }
    }

    #[tokio::test]
    async fn test_commit_applies_writes() {
        let store = InMemoryStore::new();
        let event = EventInstance::intermediate_catch("def-1", "proc-1", "wait", Utc::now());
        let listener = Flaky::new("ok", false);

        let mut tx = Transaction::begin();
        tx.stage(StagedWrite::PutEvent(event.clone()));
        tx.register_synchronization(listener.clone());
        tx.commit(&store).await.unwrap();

        assert!(store.get_event(event.id()).await.unwrap().is_some());
        assert_eq!(listener.completed(), Some(TransactionStatus::Committed));
    }

    #[tokio::test]
    async fn test_listener_failures_roll_back_everything() {
        let store = InMemoryStore::new();
        let event = EventInstance::intermediate_catch("def-1", "proc-1", "wait", Utc::now());
        let a = Flaky::new("a", true);
        let b = Flaky::new("b", true);
        let c = Flaky::new("c", true);

        let mut tx = Transaction::begin();
        tx.stage(StagedWrite::PutEvent(event.clone()));
        for listener in [&a, &b, &c] {
            tx.register_synchronization(Arc::clone(listener) as Arc<dyn Synchronization>);
        }
        let err = tx.commit(&store).await.unwrap_err();

        let causes: Vec<String> = err.causes().iter().map(|f| f.cause.to_string()).collect();
        assert_eq!(causes, vec!["A", "B", "C"]);
        assert!(store.get_event(event.id()).await.unwrap().is_none());
        for listener in [&a, &b, &c] {
            assert_eq!(listener.completed(), Some(TransactionStatus::RolledBack));
        }
    }

    #[tokio::test]
    async fn test_store_rejection_rolls_back() {
        let store = InMemoryStore::new();
        store.inject_conflicts(1);
        let listener = Flaky::new("ok", false);

        let mut tx = Transaction::begin();
        tx.register_synchronization(listener.clone());
        let err = tx.commit(&store).await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(listener.completed(), Some(TransactionStatus::RolledBack));
    }

    #[tokio::test]
    async fn test_explicit_rollback_notifies_listeners() {
        let listener = Flaky::new("ok", false);
        let mut tx = Transaction::begin();
        tx.register_synchronization(listener.clone());
        assert_eq!(tx.synchronization_count(), 1);

        tx.rollback().await;
        assert_eq!(listener.completed(), Some(TransactionStatus::RolledBack));
    }
}
