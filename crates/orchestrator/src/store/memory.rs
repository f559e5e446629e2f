//! In-process store.
//!
//! A single mutex guards all tables, so every operation is atomic with
//! respect to every other. Write-sets are applied to a copy of the state
//! that replaces the original only when every write succeeded.

use std::collections::HashMap;
#[cfg(any(test, feature = "testing"))]
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    AuditLogStore, CancelOutcome, ClaimRequest, ClaimedJob, EventStore, JobStore, Rearm,
    StagedWrite, WriteSetStore, due_at,
};
use crate::audit::AuditRecord;
use crate::events::{EventInstance, EventInstanceId, EventKind};
use crate::persistence::{PersistenceError, PersistenceResult};
use crate::timers::{JobId, JobStatus, ScheduledJob};

#[derive(Debug, Clone, Default)]
struct Tables {
    jobs: HashMap<JobId, ScheduledJob>,
    events: HashMap<EventInstanceId, EventInstance>,
    audit: Vec<AuditRecord>,
}

impl Tables {
    fn apply_write(&mut self, write: StagedWrite) -> PersistenceResult<()> {
        match write {
            StagedWrite::PutEvent(event) => {
                self.events.insert(event.id().clone(), event);
            }
            StagedWrite::RemoveEvent(id) => {
                self.events.remove(&id);
            }
            StagedWrite::InsertJob(job) => {
                if self.jobs.contains_key(job.id()) {
                    return Err(PersistenceError::already_exists(
                        "scheduled_job",
                        job.id().as_str(),
                    ));
                }
                let event_id = &job.owner().event_id;
                if self.jobs.values().any(|other| &other.owner().event_id == event_id) {
                    return Err(PersistenceError::already_exists(
                        "scheduled_job",
                        format!("job for event {event_id}"),
                    ));
                }
                self.jobs.insert(job.id().clone(), job);
            }
            StagedWrite::AppendAudit(records) => self.audit.extend(records),
            StagedWrite::FinishJob {
                id,
                node_id,
                rearm,
                at,
            } => self.finish_job(&id, &node_id, rearm, at)?,
        }
        Ok(())
    }

    fn finish_job(
        &mut self,
        id: &JobId,
        node_id: &str,
        rearm: Option<Rearm>,
        at: DateTime<Utc>,
    ) -> PersistenceResult<()> {
        let job = self
            .jobs
            .get_mut(id)
            .filter(|job| job.status().is_claimed() && job.claimed_by() == Some(node_id))
            .ok_or_else(|| {
                PersistenceError::conflict("scheduled_job", id.as_str(), "not claimed by this node")
            })?;

        match rearm {
            Some(rearm) if !job.cancel_requested() => {
                job.rearm(rearm.next_fire_at, rearm.retry_at, at);
            }
            _ => {
                let event_id = job.owner().event_id.clone();
                let canceled = job.cancel_requested();
                self.jobs.remove(id);
                if canceled {
                    self.events.remove(&event_id);
                }
            }
        }
        Ok(())
    }
}

/// Store keeping every table in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    #[cfg(any(test, feature = "testing"))]
    injected_conflicts: AtomicU32,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` write-set applications fail with a conflict.
    #[cfg(any(test, feature = "testing"))]
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// All job rows, including canceled ones.
    pub async fn all_jobs(&self) -> Vec<ScheduledJob> {
        self.tables.lock().await.jobs.values().cloned().collect()
    }

    #[cfg(any(test, feature = "testing"))]
    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn get_job(&self, id: &JobId) -> PersistenceResult<Option<ScheduledJob>> {
        Ok(self.tables.lock().await.jobs.get(id).cloned())
    }

    async fn claim_due(&self, request: &ClaimRequest) -> PersistenceResult<Vec<ClaimedJob>> {
        let mut tables = self.tables.lock().await;

        let mut due: Vec<(DateTime<Utc>, JobId)> = tables
            .jobs
            .values()
            .filter(|job| job.is_due(request.now))
            .filter_map(|job| due_at(job).map(|at| (at, job.id().clone())))
            .collect();
        due.sort();

        let mut claimed = Vec::with_capacity(due.len().min(request.limit));
        for (_, id) in due.into_iter().take(request.limit) {
            if let Some(job) = tables.jobs.get_mut(&id) {
                let misfired = job.claim(&request.node_id, request.now, request.misfire_grace);
                claimed.push(ClaimedJob {
                    job: job.clone(),
                    misfired,
                });
            }
        }

        debug!(
            node_id = %request.node_id,
            claimed = claimed.len(),
            "Claim sweep finished"
        );
        Ok(claimed)
    }

    async fn cancel_job(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> PersistenceResult<CancelOutcome> {
        let mut tables = self.tables.lock().await;

        let Some(job) = tables.jobs.get_mut(id) else {
            return Ok(CancelOutcome::NotFound);
        };

        match job.status() {
            JobStatus::Pending => {
                let event_id = job.owner().event_id.clone();
                job.mark_canceled(now);
                tables.events.remove(&event_id);
                Ok(CancelOutcome::Canceled)
            }
            JobStatus::Claimed => {
                job.request_cancel(now);
                Ok(CancelOutcome::Deferred)
            }
            JobStatus::Fired | JobStatus::Canceled => Ok(CancelOutcome::NotFound),
        }
    }

    async fn next_due_at(&self) -> PersistenceResult<Option<DateTime<Utc>>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .jobs
            .values()
            .filter(|job| job.status().is_pending())
            .filter_map(due_at)
            .min())
    }

    async fn jobs_for_process(
        &self,
        process_instance_id: &str,
    ) -> PersistenceResult<Vec<ScheduledJob>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .jobs
            .values()
            .filter(|job| !job.status().is_terminal())
            .filter(|job| job.owner().process_instance_id.as_deref() == Some(process_instance_id))
            .cloned()
            .collect())
    }

    async fn start_jobs_for_definition(
        &self,
        definition_id: &str,
    ) -> PersistenceResult<Vec<ScheduledJob>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .jobs
            .values()
            .filter(|job| !job.status().is_terminal())
            .filter(|job| {
                job.owner().definition_id == definition_id
                    && job.owner().process_instance_id.is_none()
            })
            .cloned()
            .collect())
    }

    async fn recover_claimed(
        &self,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> PersistenceResult<usize> {
        let mut tables = self.tables.lock().await;
        let Tables { jobs, events, .. } = &mut *tables;

        let mut recovered = 0;
        for job in jobs
            .values_mut()
            .filter(|job| job.status().is_claimed() && job.claimed_by() == Some(node_id))
        {
            if job.cancel_requested() {
                events.remove(&job.owner().event_id);
                job.mark_canceled(now);
            } else if let Some(next) = job.next_fire_at() {
                job.rearm(next, None, now);
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn prune_canceled(&self, older_than: DateTime<Utc>) -> PersistenceResult<usize> {
        let mut tables = self.tables.lock().await;
        let before = tables.jobs.len();
        tables.jobs.retain(|_, job| {
            !(job.status() == JobStatus::Canceled && job.updated_at() < older_than)
        });
        Ok(before.saturating_sub(tables.jobs.len()))
    }

    async fn pending_count(&self) -> PersistenceResult<usize> {
        let tables = self.tables.lock().await;
        Ok(tables
            .jobs
            .values()
            .filter(|job| job.status().is_pending())
            .count())
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn get_event(&self, id: &EventInstanceId) -> PersistenceResult<Option<EventInstance>> {
        Ok(self.tables.lock().await.events.get(id).cloned())
    }

    async fn find_waiting(
        &self,
        process_instance_id: &str,
        flow_node_name: &str,
    ) -> PersistenceResult<Option<EventInstance>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .events
            .values()
            .find(|event| {
                event.is_waiting()
                    && event.process_instance_id() == Some(process_instance_id)
                    && event.flow_node_name() == flow_node_name
            })
            .cloned())
    }

    async fn start_events(&self, definition_id: &str) -> PersistenceResult<Vec<EventInstance>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .events
            .values()
            .filter(|event| {
                event.kind() == EventKind::StartEvent && event.definition_id() == definition_id
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuditLogStore for InMemoryStore {
    async fn audit_log(&self, subject: &str) -> PersistenceResult<Vec<AuditRecord>> {
        Ok(self
            .tables
            .lock()
            .await
            .audit
            .iter()
            .filter(|record| record.subject == subject)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WriteSetStore for InMemoryStore {
    async fn apply(&self, writes: Vec<StagedWrite>) -> PersistenceResult<()> {
        #[cfg(any(test, feature = "testing"))]
        if self.take_injected_conflict() {
            return Err(PersistenceError::conflict(
                "write_set",
                "injected",
                "simulated concurrent writer",
            ));
        }

        let mut tables = self.tables.lock().await;
        let mut staged = tables.clone();
        for write in writes {
            staged.apply_write(write)?;
        }
        *tables = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::timers::{OwnerContext, TriggerSpec};

    fn waiting_job(now: DateTime<Utc>, fire_in: Duration) -> (EventInstance, ScheduledJob) {
        let event = EventInstance::intermediate_catch("def-1", "proc-1", "wait", now);
        let job = ScheduledJob::new(
            OwnerContext::for_event(&event),
            TriggerSpec::Duration { offset_ms: 0 },
            now + fire_in,
            now,
        );
        (event, job)
    }

    async fn seeded(now: DateTime<Utc>, fire_in: Duration) -> (InMemoryStore, ScheduledJob) {
        let store = InMemoryStore::new();
        let (event, job) = waiting_job(now, fire_in);
        store
            .apply(vec![
                StagedWrite::PutEvent(event),
                StagedWrite::InsertJob(job.clone()),
            ])
            .await
            .unwrap();
        (store, job)
    }

    fn request(node: &str, now: DateTime<Utc>) -> ClaimRequest {
        ClaimRequest {
            node_id: node.to_string(),
            now,
            limit: 10,
            misfire_grace: Duration::seconds(60),
        }
    }

    #[tokio::test]
    async fn test_claim_skips_jobs_not_yet_due() {
        let now = Utc::now();
        let (store, _) = seeded(now, Duration::seconds(5)).await;

        let claimed = store.claim_due(&request("node-a", now)).await.unwrap();
        assert!(claimed.is_empty());
        assert_eq!(
            store.next_due_at().await.unwrap(),
            Some(now + Duration::seconds(5))
        );
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let now = Utc::now();
        let (store, job) = seeded(now, Duration::zero()).await;

        let first = store.claim_due(&request("node-a", now)).await.unwrap();
        let second = store.claim_due(&request("node-b", now)).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].job.id(), job.id());
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claimers_single_winner() {
        let now = Utc::now();
        let (store, _) = seeded(now, Duration::zero()).await;
        let store = Arc::new(store);

        let handles: Vec<_> = (0..16)
            .map(|n| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .claim_due(&request(&format!("node-{n}"), now))
                        .await
                        .map(|claimed| claimed.len())
                })
            })
            .collect();

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap().unwrap();
        }
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_claim_respects_limit_and_order() {
        let now = Utc::now();
        let store = InMemoryStore::new();
        let mut ids = Vec::new();
        for offset in [3, 1, 2] {
            let (event, job) = waiting_job(now, Duration::seconds(-offset));
            ids.push((offset, job.id().clone()));
            store
                .apply(vec![StagedWrite::PutEvent(event), StagedWrite::InsertJob(job)])
                .await
                .unwrap();
        }

        let mut req = request("node-a", now);
        req.limit = 2;
        let claimed = store.claim_due(&req).await.unwrap();

        assert_eq!(claimed.len(), 2);
        let oldest = ids.iter().find(|(o, _)| *o == 3).map(|(_, id)| id).unwrap();
        assert_eq!(claimed[0].job.id(), oldest);
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_fired_deletes_one_shot() {
        let now = Utc::now();
        let (store, job) = seeded(now, Duration::zero()).await;
        store.claim_due(&request("node-a", now)).await.unwrap();

        store
            .apply(vec![StagedWrite::mark_fired(
                job.id().clone(),
                "node-a",
                None,
                now,
            )])
            .await
            .unwrap();

        assert!(store.get_job(job.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finish_by_other_node_conflicts() {
        let now = Utc::now();
        let (store, job) = seeded(now, Duration::zero()).await;
        store.claim_due(&request("node-a", now)).await.unwrap();

        let err = store
            .apply(vec![StagedWrite::mark_fired(
                job.id().clone(),
                "node-b",
                None,
                now,
            )])
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        let kept = store.get_job(job.id()).await.unwrap().unwrap();
        assert_eq!(kept.claimed_by(), Some("node-a"));
    }

    #[tokio::test]
    async fn test_failed_write_set_leaves_no_partial_state() {
        let now = Utc::now();
        let (store, job) = seeded(now, Duration::zero()).await;
        let event_id = job.owner().event_id.clone();

        let err = store
            .apply(vec![
                StagedWrite::RemoveEvent(event_id.clone()),
                StagedWrite::InsertJob(job.clone()),
            ])
            .await;

        assert!(matches!(err, Err(PersistenceError::AlreadyExists { .. })));
        assert!(store.get_event(&event_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancel_pending_removes_event() {
        let now = Utc::now();
        let (store, job) = seeded(now, Duration::zero()).await;

        let outcome = store.cancel_job(job.id(), now).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Canceled);
        assert!(
            store
                .find_waiting("proc-1", "wait")
                .await
                .unwrap()
                .is_none()
        );
        assert!(store.claim_due(&request("node-a", now)).await.unwrap().is_empty());
        assert_eq!(
            store.cancel_job(job.id(), now).await.unwrap(),
            CancelOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_cancel_while_claimed_blocks_rearm() {
        let now = Utc::now();
        let (store, job) = seeded(now, Duration::zero()).await;
        store.claim_due(&request("node-a", now)).await.unwrap();

        let outcome = store.cancel_job(job.id(), now).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Deferred);

        store
            .apply(vec![StagedWrite::mark_fired(
                job.id().clone(),
                "node-a",
                Some(now + Duration::seconds(4)),
                now,
            )])
            .await
            .unwrap();

        assert!(store.get_job(job.id()).await.unwrap().is_none());
        assert!(
            store
                .get_event(&job.owner().event_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_release_with_retry_at_delays_reclaim() {
        let now = Utc::now();
        let (store, job) = seeded(now, Duration::zero()).await;
        store.claim_due(&request("node-a", now)).await.unwrap();

        let retry_at = now + Duration::seconds(30);
        store
            .apply(vec![StagedWrite::release(
                job.id().clone(),
                "node-a",
                now,
                Some(retry_at),
                now,
            )])
            .await
            .unwrap();

        assert!(store.claim_due(&request("node-a", now)).await.unwrap().is_empty());
        assert_eq!(store.next_due_at().await.unwrap(), Some(retry_at));
        assert_eq!(
            store.claim_due(&request("node-a", retry_at)).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_recover_claimed_returns_rows_to_pending() {
        let now = Utc::now();
        let (store, job) = seeded(now, Duration::zero()).await;
        store.claim_due(&request("node-a", now)).await.unwrap();

        assert_eq!(store.recover_claimed("node-b", now).await.unwrap(), 0);
        assert_eq!(store.recover_claimed("node-a", now).await.unwrap(), 1);

        let recovered = store.get_job(job.id()).await.unwrap().unwrap();
        assert_eq!(recovered.status(), JobStatus::Pending);
        assert!(recovered.claimed_by().is_none());
    }

    #[tokio::test]
    async fn test_prune_canceled() {
        let now = Utc::now();
        let (store, job) = seeded(now, Duration::zero()).await;
        store.cancel_job(job.id(), now).await.unwrap();

        assert_eq!(store.prune_canceled(now).await.unwrap(), 0);
        assert_eq!(
            store
                .prune_canceled(now + Duration::seconds(1))
                .await
                .unwrap(),
            1
        );
        assert!(store.all_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_second_job_for_same_event_rejected() {
        let now = Utc::now();
        let (store, job) = seeded(now, Duration::zero()).await;
        let duplicate = ScheduledJob::new(
            job.owner().clone(),
            TriggerSpec::Duration { offset_ms: 0 },
            now,
            now,
        );

        let err = store
            .apply(vec![StagedWrite::InsertJob(duplicate.clone())])
            .await
            .unwrap_err();

        assert!(matches!(err, PersistenceError::AlreadyExists { .. }));
        assert!(store.get_job(duplicate.id()).await.unwrap().is_none());
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_audit_batch_applies_with_write_set() {
        let now = Utc::now();
        let (store, job) = seeded(now, Duration::zero()).await;
        let subject = job.id().as_str();

        store
            .apply(vec![StagedWrite::AppendAudit(vec![
                AuditRecord::new(now, subject, "claimed"),
                AuditRecord::new(now, subject, "fired"),
            ])])
            .await
            .unwrap();
        let rejected = store
            .apply(vec![
                StagedWrite::AppendAudit(vec![AuditRecord::new(now, subject, "again")]),
                StagedWrite::InsertJob(job.clone()),
            ])
            .await;

        assert!(rejected.is_err());
        let messages: Vec<String> = store
            .audit_log(subject)
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.message)
            .collect();
        assert_eq!(messages, vec!["claimed", "fired"]);
    }

    #[tokio::test]
    async fn test_injected_conflicts_are_consumed() {
        let store = InMemoryStore::new();
        store.inject_conflicts(1);

        assert!(store.apply(Vec::new()).await.is_err());
        assert!(store.apply(Vec::new()).await.is_ok());
    }
}
