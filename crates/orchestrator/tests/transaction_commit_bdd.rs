//! BDD tests: commit-time synchronizations and the write-set.
//!
//! **Scenario:** GIVEN listeners A, B and C WHEN B and C fail before
//! completion THEN the commit reports both, nothing is applied and every
//! listener learns the transaction rolled back.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use orchestrator::audit::{AuditRecord, BatchLogSynchronization, InMemoryAuditSink};
use orchestrator::events::EventInstance;
use orchestrator::store::{AuditLogStore, EventStore, InMemoryStore, StagedWrite};
use orchestrator::transaction::{
    Synchronization, SynchronizationError, Transaction, TransactionError, TransactionResult,
    TransactionRunner, TransactionStatus, TransactionalWork,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Records every callback it receives into a shared journal.
struct Listener {
    name: String,
    fail_with: Option<String>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl Listener {
    fn new(name: &str, fail_with: Option<&str>, journal: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail_with: fail_with.map(String::from),
            journal: Arc::clone(journal),
        })
    }

    fn note(&self, entry: String) {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

#[async_trait]
impl Synchronization for Listener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn before_completion(
        &self,
        _writes: &mut Vec<StagedWrite>,
    ) -> Result<(), SynchronizationError> {
        self.note(format!("{}:before", self.name));
        match &self.fail_with {
            Some(message) => Err(SynchronizationError::new(message.clone())),
            None => Ok(()),
        }
    }

    async fn after_completion(&self, status: TransactionStatus) {
        self.note(format!("{}:after:{status}", self.name));
    }
}

fn journal_of(journal: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    journal
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

#[tokio::test]
async fn given_three_listeners_when_two_fail_then_commit_reports_both_and_rolls_back(
) -> TestResult {
    // Given: listeners A (ok), B (fails), C (fails) and one staged write
    let store = InMemoryStore::new();
    let journal = Arc::new(Mutex::new(Vec::new()));
    let event = EventInstance::intermediate_catch("def-1", "proc-1", "wait", Utc::now());

    let mut tx = Transaction::begin();
    tx.stage(StagedWrite::PutEvent(event));
    tx.register_synchronization(Listener::new("A", None, &journal));
    tx.register_synchronization(Listener::new("B", Some("B refused"), &journal));
    tx.register_synchronization(Listener::new("C", Some("C refused"), &journal));

    // When: the transaction commits
    let err = tx
        .commit(&store)
        .await
        .err()
        .ok_or("commit should fail")?;

    // Then: both failures are reported, in registration order
    let causes = err.causes();
    assert_eq!(causes.len(), 2);
    assert_eq!((causes[0].index, causes[0].name.as_str()), (1, "B"));
    assert_eq!((causes[1].index, causes[1].name.as_str()), (2, "C"));
    let message = err.to_string();
    assert!(message.contains("B refused") && message.contains("C refused"), "{message}");

    // And: nothing was applied
    assert!(store.find_waiting("proc-1", "wait").await?.is_none());

    // And: every listener ran both phases, in order
    assert_eq!(
        journal_of(&journal),
        vec![
            "A:before",
            "B:before",
            "C:before",
            "A:after:rolled_back",
            "B:after:rolled_back",
            "C:after:rolled_back",
        ]
    );
    Ok(())
}

#[tokio::test]
async fn given_listeners_succeed_when_commit_then_writes_applied_and_committed_seen(
) -> TestResult {
    // Given: one passing listener and a staged event
    let store = InMemoryStore::new();
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut tx = Transaction::begin();
    tx.stage(StagedWrite::PutEvent(EventInstance::intermediate_catch(
        "def-1",
        "proc-1",
        "wait",
        Utc::now(),
    )));
    tx.register_synchronization(Listener::new("A", None, &journal));

    // When: the transaction commits
    tx.commit(&store).await?;

    // Then: the write is visible and the listener saw the commit
    assert!(store.find_waiting("proc-1", "wait").await?.is_some());
    assert_eq!(journal_of(&journal), vec!["A:before", "A:after:committed"]);
    Ok(())
}

#[tokio::test]
async fn given_failing_audit_sink_when_commit_then_batch_discarded_and_nothing_applied(
) -> TestResult {
    // Given: a batch-log listener over a sink that rejects writes
    let store = InMemoryStore::new();
    let sink = Arc::new(InMemoryAuditSink::new());
    sink.set_failing(true);
    let batch = Arc::new(BatchLogSynchronization::new(sink.clone()));
    batch.add_log(AuditRecord::new(Utc::now(), "job-1", "fired"));

    let mut tx = Transaction::begin();
    tx.stage(StagedWrite::PutEvent(EventInstance::intermediate_catch(
        "def-1",
        "proc-1",
        "wait",
        Utc::now(),
    )));
    tx.register_synchronization(batch.clone());

    // When: the transaction commits
    let result = tx.commit(&store).await;

    // Then: the commit fails, the pending batch is dropped and nothing is written
    assert!(matches!(result, Err(TransactionError::CommitFailed { .. })));
    assert_eq!(batch.pending_len(), 0);
    assert!(sink.records().is_empty());
    assert!(store.find_waiting("proc-1", "wait").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn given_audit_batch_when_write_set_rejected_then_no_audit_row_and_sink_untouched(
) -> TestResult {
    // Given: a batch-log listener and a store that rejects the next write-set
    let store = InMemoryStore::new();
    store.inject_conflicts(1);
    let sink = Arc::new(InMemoryAuditSink::new());
    let batch = Arc::new(BatchLogSynchronization::new(sink.clone()));
    batch.add_log(AuditRecord::new(Utc::now(), "job-1", "fired"));

    let mut tx = Transaction::begin();
    tx.register_synchronization(batch.clone());

    // When: the transaction commits
    let result = tx.commit(&store).await;

    // Then: the conflict surfaces and the audit batch went nowhere
    assert!(matches!(result, Err(TransactionError::Persistence(_))), "{result:?}");
    assert!(store.audit_log("job-1").await?.is_empty());
    assert!(sink.records().is_empty());
    Ok(())
}

#[tokio::test]
async fn given_audit_batch_when_commit_then_rows_stored_and_published() -> TestResult {
    // Given: a batch-log listener with two records
    let store = InMemoryStore::new();
    let sink = Arc::new(InMemoryAuditSink::new());
    let batch = Arc::new(BatchLogSynchronization::new(sink.clone()));
    batch.add_log(AuditRecord::new(Utc::now(), "job-1", "claimed"));
    batch.add_log(AuditRecord::new(Utc::now(), "job-1", "fired"));

    let mut tx = Transaction::begin();
    tx.register_synchronization(batch);

    // When: the transaction commits
    tx.commit(&store).await?;

    // Then: the rows are in the store and the sink saw them once
    let stored: Vec<String> = store
        .audit_log("job-1")
        .await?
        .into_iter()
        .map(|r| r.message)
        .collect();
    assert_eq!(stored, vec!["claimed", "fired"]);
    assert_eq!(sink.records().len(), 2);
    Ok(())
}

/// Stages one event per attempt.
struct StageEvent;

#[async_trait]
impl TransactionalWork for StageEvent {
    type Output = ();

    async fn run(&self, tx: &mut Transaction) -> TransactionResult<()> {
        tx.stage(StagedWrite::PutEvent(EventInstance::intermediate_catch(
            "def-1",
            "proc-1",
            "wait",
            Utc::now(),
        )));
        Ok(())
    }
}

#[tokio::test]
async fn given_transient_conflicts_when_runner_executes_then_retries_until_commit() -> TestResult
{
    // Given: a store that rejects the next two write-sets
    let store = Arc::new(InMemoryStore::new());
    store.inject_conflicts(2);
    let runner = TransactionRunner::new(store.clone(), 3, Duration::from_millis(1));

    // When: the work runs
    runner.execute(&StageEvent).await?;

    // Then: the third attempt commits
    assert!(store.find_waiting("proc-1", "wait").await?.is_some());
    Ok(())
}

#[tokio::test]
async fn given_persistent_conflicts_when_runner_executes_then_retries_exhausted() -> TestResult {
    // Given: a store that keeps rejecting write-sets
    let store = Arc::new(InMemoryStore::new());
    store.inject_conflicts(100);
    let runner = TransactionRunner::new(store.clone(), 2, Duration::from_millis(1));

    // When: the work runs
    let err = runner
        .execute(&StageEvent)
        .await
        .err()
        .ok_or("runner should give up")?;

    // Then: it gives up after the initial attempt plus two retries
    assert!(
        matches!(err, TransactionError::RetriesExhausted { attempts: 3, .. }),
        "{err:?}"
    );
    assert!(store.find_waiting("proc-1", "wait").await?.is_none());
    Ok(())
}
