//! Scheduled job records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::trigger::TriggerSpec;
use crate::events::{EventInstance, EventInstanceId};

/// Unique identifier for a scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Create a new unique job ID.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("job-{}", Uuid::new_v4()))
    }

    /// Create a job ID from an existing string.
    #[must_use]
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its fire time.
    Pending,
    /// Claimed by a node and executing.
    Claimed,
    /// Fired; one-shot rows are deleted right after.
    Fired,
    /// Canceled; can never be claimed.
    Canceled,
}

impl JobStatus {
    /// Check if the job is pending.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Check if the job is claimed.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed)
    }

    /// Check if the job is terminal (won't change).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fired | Self::Canceled)
    }

    /// Stable lowercase name used in persisted rows.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Fired => "fired",
            Self::Canceled => "canceled",
        }
    }

    /// Parse a persisted status name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "fired" => Some(Self::Fired),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// What a job belongs to: the waiting event and its process scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerContext {
    /// The event instance the job fires.
    pub event_id: EventInstanceId,
    /// Process definition of the event.
    pub definition_id: String,
    /// Process instance for catch events; `None` for start events.
    pub process_instance_id: Option<String>,
}

impl OwnerContext {
    /// Owner context referencing an event instance.
    #[must_use]
    pub fn for_event(event: &EventInstance) -> Self {
        Self {
            event_id: event.id().clone(),
            definition_id: event.definition_id().to_string(),
            process_instance_id: event.process_instance_id().map(String::from),
        }
    }
}

/// A persisted pending trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub(crate) id: JobId,
    pub(crate) owner: OwnerContext,
    pub(crate) trigger: TriggerSpec,
    pub(crate) next_fire_at: Option<DateTime<Utc>>,
    pub(crate) status: JobStatus,
    pub(crate) misfire_count: u32,
    /// Node holding the claim while `Claimed`.
    pub(crate) claimed_by: Option<String>,
    /// Earliest instant a failed one-shot may be claimed again.
    pub(crate) retry_at: Option<DateTime<Utc>>,
    /// Set when cancellation raced an in-flight claim; blocks re-arming.
    pub(crate) cancel_requested: bool,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Create a new pending job.
    #[must_use]
    pub fn new(
        owner: OwnerContext,
        trigger: TriggerSpec,
        next_fire_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            owner,
            trigger,
            next_fire_at: Some(next_fire_at),
            status: JobStatus::Pending,
            misfire_count: 0,
            claimed_by: None,
            retry_at: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Get the job ID.
    #[must_use]
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Get the owner context.
    #[must_use]
    pub fn owner(&self) -> &OwnerContext {
        &self.owner
    }

    /// Get the trigger.
    #[must_use]
    pub fn trigger(&self) -> &TriggerSpec {
        &self.trigger
    }

    /// Get the next fire instant.
    #[must_use]
    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.next_fire_at
    }

    /// Get the status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Get the number of misfires observed.
    #[must_use]
    pub fn misfire_count(&self) -> u32 {
        self.misfire_count
    }

    /// Get the claiming node, if claimed.
    #[must_use]
    pub fn claimed_by(&self) -> Option<&str> {
        self.claimed_by.as_deref()
    }

    /// Get the retry instant of a failed one-shot.
    #[must_use]
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        self.retry_at
    }

    /// Whether cancellation was requested while claimed.
    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Get the creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Get the updated timestamp.
    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Check if the job can be claimed at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_pending()
            && self.next_fire_at.is_some_and(|at| at <= now)
            && self.retry_at.is_none_or(|at| at <= now)
    }

    /// Check if the fire time is older than the grace window.
    #[must_use]
    pub fn is_misfire(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.next_fire_at
            .zip(now.checked_sub_signed(grace))
            .is_some_and(|(at, cutoff)| at < cutoff)
    }

    /// Pending -> Claimed, counting a misfire when the fire time is older
    /// than the grace window. Returns whether the claim was a misfire.
    pub(crate) fn claim(&mut self, node_id: &str, now: DateTime<Utc>, grace: Duration) -> bool {
        let misfired = self.is_misfire(now, grace);
        if misfired {
            self.misfire_count = self.misfire_count.saturating_add(1);
        }
        self.status = JobStatus::Claimed;
        self.claimed_by = Some(node_id.to_string());
        self.retry_at = None;
        self.updated_at = now;
        misfired
    }

    /// Claimed -> Pending at `next_fire_at`, dropping the claim.
    pub(crate) fn rearm(
        &mut self,
        next_fire_at: DateTime<Utc>,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        self.status = JobStatus::Pending;
        self.next_fire_at = Some(next_fire_at);
        self.claimed_by = None;
        self.retry_at = retry_at;
        self.updated_at = now;
    }

    /// Flag a claimed job so it is not re-armed when its fire finishes.
    pub(crate) fn request_cancel(&mut self, now: DateTime<Utc>) {
        self.cancel_requested = true;
        self.updated_at = now;
    }

    /// Mark the job canceled.
    pub(crate) fn mark_canceled(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Canceled;
        self.next_fire_at = None;
        self.claimed_by = None;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    fn owner() -> OwnerContext {
        OwnerContext {
            event_id: EventInstanceId::from_string("event-1"),
            definition_id: "def-1".to_string(),
            process_instance_id: Some("proc-1".to_string()),
        }
    }

    #[test]
    fn test_job_id_display() {
        let id = JobId::from_string("job-123");
        assert_eq!(format!("{}", id), "job-123");
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Claimed.is_terminal());
        assert!(JobStatus::Fired.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_job_status_names_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Claimed,
            JobStatus::Fired,
            JobStatus::Canceled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("cancelled"), None);
    }

    #[test]
    fn test_job_is_due() {
        let now = Utc::now();
        let job = ScheduledJob::new(
            owner(),
            TriggerSpec::Duration { offset_ms: 0 },
            now - Duration::seconds(1),
            now,
        );
        assert!(job.is_due(now));

        let later = ScheduledJob::new(
            owner(),
            TriggerSpec::Duration { offset_ms: 0 },
            now + Duration::seconds(10),
            now,
        );
        assert!(!later.is_due(now));
    }

    #[test]
    fn test_job_not_due_before_retry_at() {
        let now = Utc::now();
        let mut job = ScheduledJob::new(
            owner(),
            TriggerSpec::Duration { offset_ms: 0 },
            now - Duration::seconds(1),
            now,
        );
        job.retry_at = Some(now + Duration::seconds(5));
        assert!(!job.is_due(now));
        assert!(job.is_due(now + Duration::seconds(5)));
    }

    #[test]
    fn test_claim_counts_misfire_outside_grace() {
        let now = Utc::now();
        let mut job = ScheduledJob::new(
            owner(),
            TriggerSpec::Duration { offset_ms: 0 },
            now - Duration::minutes(10),
            now,
        );

        let misfired = job.claim("node-a", now, Duration::seconds(60));
        assert!(misfired);
        assert_eq!(job.misfire_count(), 1);
        assert_eq!(job.status(), JobStatus::Claimed);
        assert_eq!(job.claimed_by(), Some("node-a"));
    }

    #[test]
    fn test_claim_within_grace_is_not_misfire() {
        let now = Utc::now();
        let mut job = ScheduledJob::new(
            owner(),
            TriggerSpec::Duration { offset_ms: 0 },
            now - Duration::seconds(1),
            now,
        );

        assert!(!job.claim("node-a", now, Duration::seconds(60)));
        assert_eq!(job.misfire_count(), 0);
    }
}
