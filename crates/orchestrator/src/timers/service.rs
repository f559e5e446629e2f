//! The timer API used by the rest of the engine.
//!
//! Triggers are validated and resolved before anything is written: a
//! malformed cycle, a negative duration or a date expression that does
//! not evaluate fails the call and persists nothing. An event record and
//! its job are always created in one write-set, so a waiting event never
//! exists without its job.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::dispatcher::DispatcherWaker;
use super::job::{JobId, OwnerContext, ScheduledJob};
use super::trigger::{TriggerError, TriggerSpec, resolve_next};
use crate::clock::Clock;
use crate::events::{EventInstance, EventInstanceId};
use crate::persistence::PersistenceError;
use crate::process::ExpressionEvaluator;
use crate::store::{CancelOutcome, EngineStore, StagedWrite};

/// Errors returned by the timer service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerServiceError {
    /// The trigger definition is invalid.
    #[error(transparent)]
    Trigger(#[from] TriggerError),

    /// The store failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The owning event record does not exist.
    #[error("event {event_id} not found")]
    EventNotFound { event_id: EventInstanceId },

    /// The event already has a live job.
    #[error("event {event_id} already has a scheduled job")]
    AlreadyScheduled { event_id: EventInstanceId },
}

/// Result type for timer service calls.
pub type TimerServiceResult<T> = Result<T, TimerServiceError>;

/// Where a date trigger's instant comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateSource {
    /// A literal instant.
    Fixed(DateTime<Utc>),
    /// An expression evaluated once, when the timer is scheduled.
    Expression(String),
}

/// A timer as declared on a flow node, before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimerDefinition {
    /// Fire once after `offset_ms`.
    Duration { offset_ms: i64 },
    /// Fire once at an instant.
    Date { source: DateSource },
    /// Fire on every match of a cycle expression.
    Cycle { expression: String },
}

/// An event record together with the job that fires it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTimer {
    pub event: EventInstance,
    pub job_id: JobId,
    pub next_fire_at: DateTime<Utc>,
}

/// Schedules, cancels and looks up timers.
pub struct TimerService {
    store: Arc<dyn EngineStore>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    clock: Arc<dyn Clock>,
    waker: DispatcherWaker,
}

impl TimerService {
    /// Create a timer service.
    #[must_use]
    pub fn new(
        store: Arc<dyn EngineStore>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        clock: Arc<dyn Clock>,
        waker: DispatcherWaker,
    ) -> Self {
        Self {
            store,
            evaluator,
            clock,
            waker,
        }
    }

    /// Turn a declared timer into a trigger, evaluating date expressions.
    ///
    /// # Errors
    ///
    /// Returns a `TriggerError` for malformed definitions.
    pub fn resolve_trigger(&self, definition: &TimerDefinition) -> TimerServiceResult<TriggerSpec> {
        let trigger = match definition {
            TimerDefinition::Duration { offset_ms } => TriggerSpec::duration_ms(*offset_ms)?,
            TimerDefinition::Date {
                source: DateSource::Fixed(at),
            } => TriggerSpec::date(*at),
            TimerDefinition::Date {
                source: DateSource::Expression(expression),
            } => {
                let at = self
                    .evaluator
                    .evaluate_instant(expression, self.clock.now())
                    .map_err(|err| TriggerError::date_evaluation_failed(expression, err.to_string()))?;
                TriggerSpec::date(at)
            }
            TimerDefinition::Cycle { expression } => TriggerSpec::cycle(expression)?,
        };
        Ok(trigger)
    }

    /// Schedule a job for an existing event record.
    ///
    /// The store holds at most one job per event, so of two concurrent
    /// calls for the same event exactly one succeeds.
    ///
    /// # Errors
    ///
    /// Fails if the event does not exist, already has a live job, the
    /// trigger has no occurrence, or the store fails.
    pub async fn schedule_timer(
        &self,
        owner: OwnerContext,
        trigger: TriggerSpec,
    ) -> TimerServiceResult<JobId> {
        let event = self
            .store
            .get_event(&owner.event_id)
            .await?
            .ok_or_else(|| TimerServiceError::EventNotFound {
                event_id: owner.event_id.clone(),
            })?;

        let job = self.build_job(owner, trigger)?;
        let job_id = job.id().clone();
        match self.store.apply(vec![StagedWrite::InsertJob(job)]).await {
            Ok(()) => {}
            Err(PersistenceError::AlreadyExists { .. }) => {
                return Err(TimerServiceError::AlreadyScheduled {
                    event_id: event.id().clone(),
                });
            }
            Err(err) => return Err(err.into()),
        }
        self.waker.wake();

        debug!(job_id = %job_id, "Timer scheduled");
        Ok(job_id)
    }

    /// Create a waiting catch event and its job.
    ///
    /// # Errors
    ///
    /// Fails on invalid definitions or store errors; nothing is persisted
    /// in either case.
    pub async fn create_catch_event(
        &self,
        definition_id: &str,
        process_instance_id: &str,
        flow_node_name: &str,
        timer: &TimerDefinition,
    ) -> TimerServiceResult<ScheduledTimer> {
        let trigger = self.resolve_trigger(timer)?;
        let event = EventInstance::intermediate_catch(
            definition_id,
            process_instance_id,
            flow_node_name,
            self.clock.now(),
        );
        self.arm(event, trigger).await
    }

    /// Enable a timer start event of a process definition.
    ///
    /// # Errors
    ///
    /// Fails on invalid definitions or store errors.
    pub async fn enable_start_event(
        &self,
        definition_id: &str,
        start_node: &str,
        timer: &TimerDefinition,
    ) -> TimerServiceResult<ScheduledTimer> {
        let trigger = self.resolve_trigger(timer)?;
        let event = EventInstance::start_event(definition_id, start_node, self.clock.now());
        let scheduled = self.arm(event, trigger).await?;

        info!(
            definition_id,
            start_node,
            next_fire_at = %scheduled.next_fire_at,
            "Timer start event enabled"
        );
        Ok(scheduled)
    }

    /// Cancel every start-event timer of a definition and remove the
    /// start event records. Returns the number of jobs canceled.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn disable_start_events(&self, definition_id: &str) -> TimerServiceResult<usize> {
        let mut canceled = 0;
        for job in self.store.start_jobs_for_definition(definition_id).await? {
            if self.cancel_timer(job.id()).await? != CancelOutcome::NotFound {
                canceled += 1;
            }
        }

        let leftovers: Vec<StagedWrite> = self
            .store
            .start_events(definition_id)
            .await?
            .into_iter()
            .map(|event| StagedWrite::RemoveEvent(event.id().clone()))
            .collect();
        if !leftovers.is_empty() {
            self.store.apply(leftovers).await?;
        }

        info!(definition_id, canceled, "Timer start events disabled");
        Ok(canceled)
    }

    /// Cancel a job.
    ///
    /// A pending job is canceled together with its waiting event. A job
    /// being fired right now completes that fire but is not re-armed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn cancel_timer(&self, job_id: &JobId) -> TimerServiceResult<CancelOutcome> {
        let outcome = self.store.cancel_job(job_id, self.clock.now()).await?;
        debug!(job_id = %job_id, outcome = ?outcome, "Timer cancel requested");
        Ok(outcome)
    }

    /// Cancel every job of a terminated process instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn cancel_timers_for_process(
        &self,
        process_instance_id: &str,
    ) -> TimerServiceResult<usize> {
        let mut canceled = 0;
        for job in self.store.jobs_for_process(process_instance_id).await? {
            if self.cancel_timer(job.id()).await? != CancelOutcome::NotFound {
                canceled += 1;
            }
        }
        Ok(canceled)
    }

    /// Delete canceled job rows last touched more than `retention` ago.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn prune_canceled(&self, retention: Duration) -> TimerServiceResult<usize> {
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(retention)
            .ok_or_else(|| TriggerError::out_of_range(format!("retention {retention}")))?;
        let pruned = self.store.prune_canceled(cutoff).await?;
        if pruned > 0 {
            info!(pruned, cutoff = %cutoff, "Pruned canceled jobs");
        }
        Ok(pruned)
    }

    /// The waiting event of a flow node; `None` once it fired or if it
    /// never existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn query_waiting_event(
        &self,
        process_instance_id: &str,
        flow_node_name: &str,
    ) -> TimerServiceResult<Option<EventInstance>> {
        Ok(self
            .store
            .find_waiting(process_instance_id, flow_node_name)
            .await?)
    }

    async fn arm(
        &self,
        event: EventInstance,
        trigger: TriggerSpec,
    ) -> TimerServiceResult<ScheduledTimer> {
        let job = self.build_job(OwnerContext::for_event(&event), trigger)?;
        let job_id = job.id().clone();
        let next_fire_at = job.next_fire_at().ok_or(TriggerError::NoOccurrence)?;

        self.store
            .apply(vec![
                StagedWrite::PutEvent(event.clone()),
                StagedWrite::InsertJob(job),
            ])
            .await?;
        self.waker.wake();

        debug!(
            job_id = %job_id,
            event_id = %event.id(),
            next_fire_at = %next_fire_at,
            "Timer armed"
        );
        Ok(ScheduledTimer {
            event,
            job_id,
            next_fire_at,
        })
    }

    fn build_job(
        &self,
        owner: OwnerContext,
        trigger: TriggerSpec,
    ) -> TimerServiceResult<ScheduledJob> {
        let now = self.clock.now();
        let next_fire_at = resolve_next(&trigger, now, None)?.ok_or(TriggerError::NoOccurrence)?;
        Ok(ScheduledJob::new(owner, trigger, next_fire_at, now))
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService").finish_non_exhaustive()
    }
}
