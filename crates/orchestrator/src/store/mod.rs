//! Durable storage for scheduled jobs and waiting events.
//!
//! Four capabilities make up a store:
//!
//! - [`JobStore`]: reads plus the conditional updates on job rows
//!   (claim, cancel, recovery, pruning)
//! - [`EventStore`]: read-only lookups of waiting event records
//! - [`WriteSetStore`]: applies a transaction's staged writes atomically
//! - [`AuditLogStore`]: reads back audit records committed with a fire
//!
//! [`EngineStore`] bundles all four and is what the timer service,
//! dispatcher and executor hold.
//!
//! Claiming is the only serialization point between concurrent claimers:
//! a job moves Pending -> Claimed in the same step that selects it, so two
//! claimers can never both receive the same row.

mod memory;
mod surreal;

pub use memory::InMemoryStore;
pub use surreal::SurrealStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::audit::AuditRecord;
use crate::events::{EventInstance, EventInstanceId};
use crate::persistence::PersistenceResult;
use crate::timers::{JobId, ScheduledJob};

/// Parameters of one claim sweep.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Node that will own the claimed rows.
    pub node_id: String,
    /// Claim instant; rows due at or before it are eligible.
    pub now: DateTime<Utc>,
    /// Upper bound on rows claimed in one sweep.
    pub limit: usize,
    /// Rows older than `now - misfire_grace` count as misfires.
    pub misfire_grace: Duration,
}

/// A row won by a claim sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    /// The job as it is after the claim.
    pub job: ScheduledJob,
    /// Whether this claim incremented the misfire counter.
    pub misfired: bool,
}

/// What cancelling a job did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The pending row was canceled and its waiting event removed.
    Canceled,
    /// The row is claimed by a node; the in-flight fire completes but the
    /// job is not re-armed afterwards.
    Deferred,
    /// No live row with that id.
    NotFound,
}

/// How a claimed job goes back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rearm {
    /// Next scheduled instant.
    pub next_fire_at: DateTime<Utc>,
    /// Earliest instant the row may be claimed again, if later than
    /// `next_fire_at`.
    pub retry_at: Option<DateTime<Utc>>,
}

/// A write staged inside a transaction and applied at commit.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedWrite {
    /// Insert or overwrite a waiting event record.
    PutEvent(EventInstance),
    /// Remove an event record; removing an absent record is not an error.
    RemoveEvent(EventInstanceId),
    /// Insert a new pending job.
    ///
    /// Fails with `AlreadyExists` if the id exists or another job row
    /// already references the same event.
    InsertJob(ScheduledJob),
    /// Leave the `Claimed` state.
    ///
    /// Fails with a conflict unless the row is claimed by `node_id`. With
    /// `rearm` the row returns to `Pending`, without it the row is deleted.
    /// A row whose cancellation was deferred is deleted together with its
    /// event record regardless of `rearm`.
    FinishJob {
        id: JobId,
        node_id: String,
        rearm: Option<Rearm>,
        at: DateTime<Utc>,
    },
    /// Append a batch of audit records.
    AppendAudit(Vec<AuditRecord>),
}

impl StagedWrite {
    /// Record a successful fire: delete one-shot rows, re-arm cycles.
    #[must_use]
    pub fn mark_fired(
        id: JobId,
        node_id: impl Into<String>,
        next_fire_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Self {
        Self::FinishJob {
            id,
            node_id: node_id.into(),
            rearm: next_fire_at.map(|next_fire_at| Rearm {
                next_fire_at,
                retry_at: None,
            }),
            at,
        }
    }

    /// Return a job whose fire failed to `Pending`.
    #[must_use]
    pub fn release(
        id: JobId,
        node_id: impl Into<String>,
        next_fire_at: DateTime<Utc>,
        retry_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Self {
        Self::FinishJob {
            id,
            node_id: node_id.into(),
            rearm: Some(Rearm {
                next_fire_at,
                retry_at,
            }),
            at,
        }
    }
}

/// Job row operations.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Load a job by id.
    async fn get_job(&self, id: &JobId) -> PersistenceResult<Option<ScheduledJob>>;

    /// Atomically claim up to `limit` due pending jobs, earliest first.
    ///
    /// Losing a race for a row is not an error: the row is simply absent
    /// from the result.
    async fn claim_due(&self, request: &ClaimRequest) -> PersistenceResult<Vec<ClaimedJob>>;

    /// Cancel a job. Safe to race against an in-flight claim.
    async fn cancel_job(&self, id: &JobId, now: DateTime<Utc>)
    -> PersistenceResult<CancelOutcome>;

    /// Earliest instant at which a pending job becomes claimable.
    async fn next_due_at(&self) -> PersistenceResult<Option<DateTime<Utc>>>;

    /// Live jobs owned by a process instance.
    async fn jobs_for_process(&self, process_instance_id: &str)
    -> PersistenceResult<Vec<ScheduledJob>>;

    /// Live start-event jobs of a process definition.
    async fn start_jobs_for_definition(
        &self,
        definition_id: &str,
    ) -> PersistenceResult<Vec<ScheduledJob>>;

    /// Return rows left `Claimed` by `node_id` (e.g. before a crash) to
    /// `Pending`. Rows with a deferred cancellation are canceled instead.
    async fn recover_claimed(&self, node_id: &str, now: DateTime<Utc>)
    -> PersistenceResult<usize>;

    /// Delete `Canceled` rows last touched before `older_than`.
    async fn prune_canceled(&self, older_than: DateTime<Utc>) -> PersistenceResult<usize>;

    /// Number of `Pending` rows.
    async fn pending_count(&self) -> PersistenceResult<usize>;
}

/// Waiting event lookups.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Load an event record by id.
    async fn get_event(&self, id: &EventInstanceId) -> PersistenceResult<Option<EventInstance>>;

    /// The waiting event of a process instance's flow node.
    async fn find_waiting(
        &self,
        process_instance_id: &str,
        flow_node_name: &str,
    ) -> PersistenceResult<Option<EventInstance>>;

    /// Start event records of a process definition.
    async fn start_events(&self, definition_id: &str) -> PersistenceResult<Vec<EventInstance>>;
}

/// Atomic application of a transaction's write-set.
#[async_trait]
pub trait WriteSetStore: Send + Sync {
    /// Apply every write or none of them.
    ///
    /// Writes are applied in order; the first failing write aborts the
    /// whole set.
    async fn apply(&self, writes: Vec<StagedWrite>) -> PersistenceResult<()>;
}

/// Committed audit records.
#[async_trait]
pub trait AuditLogStore: Send + Sync {
    /// Records about `subject`, in append order.
    async fn audit_log(&self, subject: &str) -> PersistenceResult<Vec<AuditRecord>>;
}

/// Everything the timer subsystem needs from storage.
pub trait EngineStore: JobStore + EventStore + WriteSetStore + AuditLogStore {}

impl<T: JobStore + EventStore + WriteSetStore + AuditLogStore> EngineStore for T {}

/// Instant a pending job becomes claimable.
pub(crate) fn due_at(job: &ScheduledJob) -> Option<DateTime<Utc>> {
    job.next_fire_at()
        .map(|next| job.retry_at().map_or(next, |retry| next.max(retry)))
}
