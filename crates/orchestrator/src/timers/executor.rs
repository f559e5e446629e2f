//! Firing one claimed job.
//!
//! Each fire runs as a [`TransactionalWork`]: the event transition, the
//! process-graph call, the audit batch and the job's own completion are
//! staged in one transaction and commit together. When the transaction
//! fails for good the job goes back to `Pending`: one-shot jobs become
//! claimable again after the failure retry delay, cycle jobs wait for
//! their next natural occurrence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::job::{JobId, ScheduledJob};
use super::trigger::resolve_rearm;
use crate::audit::{AuditRecord, AuditSink, BatchLogSynchronization};
use crate::clock::Clock;
use crate::events::EventKind;
use crate::process::ProcessGraph;
use crate::store::{EngineStore, StagedWrite};
use crate::transaction::{
    Transaction, TransactionError, TransactionResult, TransactionRunner, TransactionalWork,
};

/// Result of executing one claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// The fire committed.
    Fired {
        job_id: JobId,
        /// Re-armed instant for recurring start events.
        next_fire_at: Option<DateTime<Utc>>,
    },
    /// The owning event no longer exists; the job was dropped unfired.
    Dropped { job_id: JobId },
    /// The fire rolled back and the job was released.
    Failed {
        job_id: JobId,
        error: TransactionError,
    },
}

impl ExecutionResult {
    /// Check if the fire committed.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        matches!(self, Self::Fired { .. })
    }

    /// Check if the fire failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// The job this result is about.
    #[must_use]
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Fired { job_id, .. } | Self::Dropped { job_id } | Self::Failed { job_id, .. } => {
                job_id
            }
        }
    }
}

/// Configuration for the job executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Transient failures retried before giving up.
    pub max_transient_retries: u32,
    /// Base delay between transient retries; grows linearly per attempt.
    pub retry_backoff: Duration,
    /// Delay before a failed one-shot job may be claimed again.
    pub failure_retry_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: 3,
            retry_backoff: Duration::from_millis(50),
            failure_retry_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FireOutcome {
    Fired(Option<DateTime<Utc>>),
    Orphaned,
}

/// The transactional body of one fire.
struct FireJob<'a> {
    executor: &'a JobExecutor,
    job: &'a ScheduledJob,
}

impl FireJob<'_> {
    fn rearm_at(&self, now: DateTime<Utc>) -> TransactionResult<Option<DateTime<Utc>>> {
        let previous = self.job.next_fire_at().unwrap_or(now);
        resolve_rearm(self.job.trigger(), previous, now).map_err(handler_error)
    }
}

#[async_trait]
impl<'a> TransactionalWork for FireJob<'a> {
    type Output = FireOutcome;

    async fn run(&self, tx: &mut Transaction) -> TransactionResult<FireOutcome> {
        let executor = self.executor;
        let job = self.job;
        let now = executor.clock.now();

        let Some(mut event) = executor.store.get_event(&job.owner().event_id).await? else {
            tx.stage(StagedWrite::mark_fired(
                job.id().clone(),
                &executor.node_id,
                None,
                now,
            ));
            return Ok(FireOutcome::Orphaned);
        };

        event.trigger().map_err(handler_error)?;

        let audit = executor
            .audit
            .as_ref()
            .map(|sink| Arc::new(BatchLogSynchronization::new(Arc::clone(sink))));
        let log = |message: String| {
            if let Some(batch) = &audit {
                batch.add_log(AuditRecord::new(now, job.id().as_str(), message));
            }
        };

        let next_fire_at = match event.kind() {
            EventKind::IntermediateCatch => {
                let process_instance_id = event
                    .process_instance_id()
                    .ok_or_else(|| {
                        TransactionError::handler(format!(
                            "catch event {} has no process instance",
                            event.id()
                        ))
                    })?
                    .to_string();
                executor
                    .graph
                    .activate_flow_node(tx, &process_instance_id, event.flow_node_name())
                    .await
                    .map_err(handler_error)?;
                event.consume().map_err(handler_error)?;
                tx.stage(StagedWrite::RemoveEvent(event.id().clone()));
                log(format!(
                    "timer fired; activated '{}' in {}",
                    event.flow_node_name(),
                    process_instance_id
                ));
                None
            }
            EventKind::StartEvent => {
                let process_instance_id = executor
                    .graph
                    .create_process_instance(tx, event.definition_id(), event.flow_node_name())
                    .await
                    .map_err(handler_error)?;
                event.rearm().map_err(handler_error)?;
                log(format!(
                    "timer fired; started {} from '{}'",
                    process_instance_id,
                    event.flow_node_name()
                ));

                let next = if job.trigger().is_recurring() {
                    self.rearm_at(now)?
                } else {
                    None
                };
                if next.is_none() {
                    tx.stage(StagedWrite::RemoveEvent(event.id().clone()));
                }
                next
            }
        };

        tx.stage(StagedWrite::mark_fired(
            job.id().clone(),
            &executor.node_id,
            next_fire_at,
            now,
        ));
        if let Some(batch) = audit {
            tx.register_synchronization(batch);
        }

        Ok(FireOutcome::Fired(next_fire_at))
    }
}

fn handler_error(err: impl std::fmt::Display) -> TransactionError {
    TransactionError::handler(err.to_string())
}

/// Executes claimed jobs transactionally.
pub struct JobExecutor {
    store: Arc<dyn EngineStore>,
    graph: Arc<dyn ProcessGraph>,
    audit: Option<Arc<dyn AuditSink>>,
    clock: Arc<dyn Clock>,
    runner: TransactionRunner<dyn EngineStore>,
    node_id: String,
    failure_retry_delay: chrono::Duration,
}

impl JobExecutor {
    /// Create an executor for jobs claimed by `node_id`.
    #[must_use]
    pub fn new(
        store: Arc<dyn EngineStore>,
        graph: Arc<dyn ProcessGraph>,
        clock: Arc<dyn Clock>,
        node_id: impl Into<String>,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            runner: TransactionRunner::new(
                Arc::clone(&store),
                config.max_transient_retries,
                config.retry_backoff,
            ),
            store,
            graph,
            audit: None,
            clock,
            node_id: node_id.into(),
            failure_retry_delay: chrono::Duration::from_std(config.failure_retry_delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(5)),
        }
    }

    /// Batch audit records of every fire into `sink`.
    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Node whose claims this executor completes.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Fire a job claimed by this node.
    ///
    /// Never returns an error: failures are logged, the job is released
    /// and the failure is reported in the result.
    pub async fn execute(&self, job: &ScheduledJob) -> ExecutionResult {
        let work = FireJob {
            executor: self,
            job,
        };

        match self.runner.execute(&work).await {
            Ok(FireOutcome::Fired(next_fire_at)) => {
                info!(
                    job_id = %job.id(),
                    event_id = %job.owner().event_id,
                    misfire_count = job.misfire_count(),
                    next_fire_at = ?next_fire_at,
                    "Timer fired"
                );
                ExecutionResult::Fired {
                    job_id: job.id().clone(),
                    next_fire_at,
                }
            }
            Ok(FireOutcome::Orphaned) => {
                warn!(
                    job_id = %job.id(),
                    event_id = %job.owner().event_id,
                    "Event record gone, dropped job without firing"
                );
                ExecutionResult::Dropped {
                    job_id: job.id().clone(),
                }
            }
            Err(err) => {
                error!(job_id = %job.id(), error = %err, "Timer fire failed");
                self.release_after_failure(job).await;
                ExecutionResult::Failed {
                    job_id: job.id().clone(),
                    error: err,
                }
            }
        }
    }

    async fn release_after_failure(&self, job: &ScheduledJob) {
        let now = self.clock.now();
        let scheduled = job.next_fire_at().unwrap_or(now);

        let (next_fire_at, retry_at) = if job.trigger().is_recurring() {
            match resolve_rearm(job.trigger(), scheduled, now) {
                Ok(Some(next)) => (next, None),
                Ok(None) | Err(_) => {
                    warn!(job_id = %job.id(), "No next occurrence, retrying as one-shot");
                    (scheduled, now.checked_add_signed(self.failure_retry_delay))
                }
            }
        } else {
            (scheduled, now.checked_add_signed(self.failure_retry_delay))
        };

        let release = StagedWrite::release(
            job.id().clone(),
            &self.node_id,
            next_fire_at,
            retry_at,
            now,
        );
        match self.store.apply(vec![release]).await {
            Ok(()) => debug!(
                job_id = %job.id(),
                next_fire_at = %next_fire_at,
                retry_at = ?retry_at,
                "Released failed job"
            ),
            Err(err) => error!(
                job_id = %job.id(),
                error = %err,
                "Failed to release job; left for claim recovery"
            ),
        }
    }
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("node_id", &self.node_id)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}
