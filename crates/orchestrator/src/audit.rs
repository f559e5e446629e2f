//! Audit log batching.
//!
//! Handlers append [`AuditRecord`]s to a [`BatchLogSynchronization`]
//! during the transaction. Before completion the whole batch is staged as
//! one [`StagedWrite::AppendAudit`], so it lands in the store with the rest
//! of the write-set or not at all. The [`AuditSink`] is asked to reserve
//! the batch before the write-set is applied; a refusal is a listener
//! failure and rolls the transaction back. The sink only sees the records
//! once the transaction committed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::store::StagedWrite;
use crate::transaction::{Synchronization, SynchronizationError, TransactionStatus};

/// One audit log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the audited action happened.
    pub recorded_at: DateTime<Utc>,
    /// What the entry is about (job, event or process id).
    pub subject: String,
    /// Human-readable description.
    pub message: String,
}

impl AuditRecord {
    /// Create an audit record.
    pub fn new(
        recorded_at: DateTime<Utc>,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            recorded_at,
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// Audit sink failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("audit write failed: {reason}")]
pub struct AuditError {
    reason: String,
}

impl AuditError {
    /// Create an audit error.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Destination for committed audit batches.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Accept or refuse a batch before its transaction is applied.
    async fn reserve(&self, _records: &[AuditRecord]) -> Result<(), AuditError> {
        Ok(())
    }

    /// Receive a batch whose transaction committed.
    async fn publish(&self, records: Vec<AuditRecord>);
}

/// Sink that emits each record as a tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn publish(&self, records: Vec<AuditRecord>) {
        for record in records {
            info!(
                target: "audit",
                subject = %record.subject,
                recorded_at = %record.recorded_at,
                "{}",
                record.message
            );
        }
    }
}

/// Sink keeping published records in memory; can be told to refuse.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    failing: AtomicBool,
}

impl InMemoryAuditSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following reservation fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Records published so far.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn reserve(&self, _records: &[AuditRecord]) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::new("sink unavailable"));
        }
        Ok(())
    }

    async fn publish(&self, records: Vec<AuditRecord>) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(records);
    }
}

/// Collects audit records for one transaction and stages them at commit.
pub struct BatchLogSynchronization {
    sink: Arc<dyn AuditSink>,
    pending: Mutex<Vec<AuditRecord>>,
    staged: Mutex<Vec<AuditRecord>>,
}

impl BatchLogSynchronization {
    /// Create a batch bound to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            pending: Mutex::new(Vec::new()),
            staged: Mutex::new(Vec::new()),
        }
    }

    /// Queue a record for the commit-time batch.
    pub fn add_log(&self, record: AuditRecord) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Number of queued records.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn take(slot: &Mutex<Vec<AuditRecord>>) -> Vec<AuditRecord> {
        std::mem::take(&mut *slot.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl Synchronization for BatchLogSynchronization {
    fn name(&self) -> &str {
        "batch-log"
    }

    async fn before_completion(
        &self,
        writes: &mut Vec<StagedWrite>,
    ) -> Result<(), SynchronizationError> {
        let batch = Self::take(&self.pending);
        if batch.is_empty() {
            return Ok(());
        }
        self.sink
            .reserve(&batch)
            .await
            .map_err(|err| SynchronizationError::new(err.to_string()))?;
        writes.push(StagedWrite::AppendAudit(batch.clone()));
        *self.staged.lock().unwrap_or_else(PoisonError::into_inner) = batch;
        Ok(())
    }

    async fn after_completion(&self, status: TransactionStatus) {
        Self::take(&self.pending);
        let staged = Self::take(&self.staged);
        if status == TransactionStatus::Committed && !staged.is_empty() {
            self.sink.publish(staged).await;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unreachable)]

    use super::*;

    fn record(message: &str) -> AuditRecord {
        AuditRecord::new(Utc::now(), "job-1", message)
    }

    fn messages(records: &[AuditRecord]) -> Vec<&str> {
        records.iter().map(|r| r.message.as_str()).collect()
    }

    #[tokio::test]
    async fn test_batch_staged_as_one_write() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let batch = BatchLogSynchronization::new(sink.clone());
        batch.add_log(record("claimed"));
        batch.add_log(record("fired"));

        let mut writes = Vec::new();
        assert!(batch.before_completion(&mut writes).await.is_ok());

        assert_eq!(writes.len(), 1);
        let Some(StagedWrite::AppendAudit(staged)) = writes.first() else {
            unreachable!("expected an audit write, got {writes:?}");
        };
        assert_eq!(messages(staged), vec!["claimed", "fired"]);
        assert_eq!(batch.pending_len(), 0);
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_sink_sees_batch_only_after_commit() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let batch = BatchLogSynchronization::new(sink.clone());
        batch.add_log(record("fired"));

        let mut writes = Vec::new();
        assert!(batch.before_completion(&mut writes).await.is_ok());
        batch.after_completion(TransactionStatus::Committed).await;

        assert_eq!(messages(&sink.records()), vec!["fired"]);
    }

    #[tokio::test]
    async fn test_staged_batch_dropped_on_rollback() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let batch = BatchLogSynchronization::new(sink.clone());
        batch.add_log(record("fired"));

        let mut writes = Vec::new();
        assert!(batch.before_completion(&mut writes).await.is_ok());
        batch.after_completion(TransactionStatus::RolledBack).await;

        assert!(sink.records().is_empty());
        // A later commit on the same listener has nothing left to publish.
        batch.after_completion(TransactionStatus::Committed).await;
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_refused_reservation_is_listener_failure() {
        let sink = Arc::new(InMemoryAuditSink::new());
        sink.set_failing(true);
        let batch = BatchLogSynchronization::new(sink.clone());
        batch.add_log(record("fired"));

        let mut writes = Vec::new();
        let err = batch.before_completion(&mut writes).await;
        assert_eq!(
            err.err().map(|e| e.to_string()),
            Some("audit write failed: sink unavailable".to_string())
        );
        assert!(writes.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_discards_pending() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let batch = BatchLogSynchronization::new(sink.clone());
        batch.add_log(record("fired"));

        batch.after_completion(TransactionStatus::RolledBack).await;
        assert_eq!(batch.pending_len(), 0);
        assert!(sink.records().is_empty());
    }
}
