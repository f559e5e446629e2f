//! SurrealDB-backed store.
//!
//! Instants are persisted as epoch milliseconds and triggers as JSON text,
//! so range queries compare plain integers. Every pending row carries a
//! `due_at_ms` column (`max(next_fire_at, retry_at)`) that claim sweeps
//! filter and order on. `event_id` is unique across job rows, so two
//! concurrent write-sets can never both arm the same event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::{debug, warn};

use super::{
    AuditLogStore, CancelOutcome, ClaimRequest, ClaimedJob, EventStore, JobStore, Rearm,
    StagedWrite, WriteSetStore, due_at,
};
use crate::audit::AuditRecord;
use crate::events::{EventInstance, EventInstanceId, EventKind};
use crate::persistence::{
    OrchestratorStore, PersistenceError, PersistenceResult, StoreConfig, from_surrealdb_error,
};
use crate::timers::{JobId, JobStatus, OwnerContext, ScheduledJob};

const JOB_TABLE: &str = "scheduled_job";
const EVENT_TABLE: &str = "event_instance";
const AUDIT_TABLE: &str = "audit_log";

/// Attempts at cancelling a row that keeps changing state underneath us.
const CANCEL_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    job_id: String,
    event_id: String,
    definition_id: String,
    process_instance_id: Option<String>,
    trigger: String,
    next_fire_at_ms: Option<i64>,
    due_at_ms: Option<i64>,
    status: JobStatus,
    misfire_count: i64,
    claimed_by: Option<String>,
    retry_at_ms: Option<i64>,
    cancel_requested: bool,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl JobRecord {
    fn from_job(job: &ScheduledJob) -> PersistenceResult<Self> {
        let trigger = serde_json::to_string(job.trigger())
            .map_err(|e| PersistenceError::serialization_error(e.to_string()))?;

        Ok(Self {
            job_id: job.id().as_str().to_string(),
            event_id: job.owner().event_id.as_str().to_string(),
            definition_id: job.owner().definition_id.clone(),
            process_instance_id: job.owner().process_instance_id.clone(),
            trigger,
            next_fire_at_ms: job.next_fire_at().map(|at| at.timestamp_millis()),
            due_at_ms: due_at(job).map(|at| at.timestamp_millis()),
            status: job.status(),
            misfire_count: i64::from(job.misfire_count()),
            claimed_by: job.claimed_by().map(String::from),
            retry_at_ms: job.retry_at().map(|at| at.timestamp_millis()),
            cancel_requested: job.cancel_requested(),
            created_at_ms: job.created_at().timestamp_millis(),
            updated_at_ms: job.updated_at().timestamp_millis(),
        })
    }

    fn into_job(self) -> PersistenceResult<ScheduledJob> {
        let trigger = serde_json::from_str(&self.trigger)
            .map_err(|e| PersistenceError::serialization_error(e.to_string()))?;

        Ok(ScheduledJob {
            id: JobId::from_string(self.job_id),
            owner: OwnerContext {
                event_id: EventInstanceId::from_string(self.event_id),
                definition_id: self.definition_id,
                process_instance_id: self.process_instance_id,
            },
            trigger,
            next_fire_at: self.next_fire_at_ms.map(from_millis).transpose()?,
            status: self.status,
            misfire_count: u32::try_from(self.misfire_count).unwrap_or(u32::MAX),
            claimed_by: self.claimed_by,
            retry_at: self.retry_at_ms.map(from_millis).transpose()?,
            cancel_requested: self.cancel_requested,
            created_at: from_millis(self.created_at_ms)?,
            updated_at: from_millis(self.updated_at_ms)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventRecord {
    event_id: String,
    definition_id: String,
    process_instance_id: Option<String>,
    flow_node_name: String,
    kind: EventKind,
    created_at_ms: i64,
}

impl EventRecord {
    fn from_event(event: &EventInstance) -> Self {
        Self {
            event_id: event.id().as_str().to_string(),
            definition_id: event.definition_id().to_string(),
            process_instance_id: event.process_instance_id().map(String::from),
            flow_node_name: event.flow_node_name().to_string(),
            kind: event.kind(),
            created_at_ms: event.created_at().timestamp_millis(),
        }
    }

    fn into_event(self) -> PersistenceResult<EventInstance> {
        Ok(EventInstance::restore(
            EventInstanceId::from_string(self.event_id),
            self.definition_id,
            self.process_instance_id,
            self.flow_node_name,
            self.kind,
            from_millis(self.created_at_ms)?,
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditRow {
    subject: String,
    message: String,
    recorded_at_ms: i64,
    seq: i64,
}

impl AuditRow {
    fn from_record(record: &AuditRecord, seq: usize) -> Self {
        Self {
            subject: record.subject.clone(),
            message: record.message.clone(),
            recorded_at_ms: record.recorded_at.timestamp_millis(),
            seq: i64::try_from(seq).unwrap_or(i64::MAX),
        }
    }

    fn into_record(self) -> PersistenceResult<AuditRecord> {
        Ok(AuditRecord::new(
            from_millis(self.recorded_at_ms)?,
            self.subject,
            self.message,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: i64,
}

#[derive(Debug, Deserialize)]
struct DueRow {
    due_at_ms: Option<i64>,
}

fn from_millis(ms: i64) -> PersistenceResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        PersistenceError::serialization_error(format!("timestamp out of range: {ms}"))
    })
}

fn to_value<T: Serialize>(value: &T) -> PersistenceResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| PersistenceError::serialization_error(e.to_string()))
}

/// Surface the most telling statement error of a response.
///
/// Inside a failed transaction every statement reports an error; the one
/// naming the cause is preferred over the generic "not executed" ones.
fn check_response(mut response: surrealdb::Response) -> PersistenceResult<surrealdb::Response> {
    let mut errors: Vec<(usize, String)> = response
        .take_errors()
        .into_iter()
        .map(|(index, err)| (index, err.to_string()))
        .collect();
    if errors.is_empty() {
        return Ok(response);
    }
    errors.sort_by_key(|(index, _)| *index);

    let cause = errors
        .iter()
        .find(|(_, msg)| msg.to_lowercase().contains("conflict"))
        .or_else(|| {
            errors
                .iter()
                .find(|(_, msg)| !msg.to_lowercase().contains("failed transaction"))
        })
        .or_else(|| errors.first())
        .map(|(_, msg)| msg.clone())
        .unwrap_or_default();

    Err(from_surrealdb_error(cause))
}

/// Store over a SurrealDB connection.
#[derive(Debug, Clone)]
pub struct SurrealStore {
    store: OrchestratorStore,
}

impl SurrealStore {
    /// Wrap an existing connection. The schema must already be applied.
    #[must_use]
    pub fn new(store: OrchestratorStore) -> Self {
        Self { store }
    }

    /// Connect and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema setup fails.
    pub async fn connect(config: StoreConfig) -> PersistenceResult<Self> {
        let store = OrchestratorStore::connect(config).await?;
        store.initialize_schema().await?;
        Ok(Self::new(store))
    }

    /// The underlying connection.
    #[must_use]
    pub fn connection(&self) -> &OrchestratorStore {
        &self.store
    }

    async fn select_jobs(
        &self,
        query: &'static str,
        key: &'static str,
        value: String,
    ) -> PersistenceResult<Vec<ScheduledJob>> {
        let response = self
            .store
            .db()
            .query(query)
            .bind((key, value))
            .await
            .map_err(from_surrealdb_error)?;
        let records: Vec<JobRecord> = check_response(response)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        records.into_iter().map(JobRecord::into_job).collect()
    }

    async fn select_events(
        &self,
        query: &'static str,
        bindings: serde_json::Value,
    ) -> PersistenceResult<Vec<EventInstance>> {
        let response = self
            .store
            .db()
            .query(query)
            .bind(bindings)
            .await
            .map_err(from_surrealdb_error)?;
        let records: Vec<EventRecord> = check_response(response)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        records.into_iter().map(EventRecord::into_event).collect()
    }

    async fn try_claim(
        &self,
        record: JobRecord,
        request: &ClaimRequest,
    ) -> PersistenceResult<Option<ClaimedJob>> {
        let seen = record.updated_at_ms;
        let misfired = record
            .clone()
            .into_job()?
            .is_misfire(request.now, request.misfire_grace);

        let response = self
            .store
            .db()
            .query(
                "UPDATE type::thing('scheduled_job', $id) SET \
                     status = 'claimed', claimed_by = $node, retry_at_ms = NONE, \
                     due_at_ms = next_fire_at_ms, misfire_count += $inc, updated_at_ms = $now \
                 WHERE status = 'pending' AND updated_at_ms = $seen AND due_at_ms <= $now \
                 RETURN AFTER",
            )
            .bind(("id", record.job_id))
            .bind(("node", request.node_id.clone()))
            .bind(("inc", i64::from(misfired)))
            .bind(("now", request.now.timestamp_millis()))
            .bind(("seen", seen))
            .await
            .map_err(from_surrealdb_error)?;
        let updated: Vec<JobRecord> = check_response(response)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        updated
            .into_iter()
            .next()
            .map(|record| {
                record.into_job().map(|job| ClaimedJob { job, misfired })
            })
            .transpose()
    }

    async fn run_script(
        &self,
        script: String,
        bindings: serde_json::Map<String, serde_json::Value>,
    ) -> PersistenceResult<()> {
        let response = self
            .store
            .db()
            .query(script)
            .bind(serde_json::Value::Object(bindings))
            .await
            .map_err(from_surrealdb_error)?;
        check_response(response).map(|_| ())
    }
}

#[async_trait]
impl JobStore for SurrealStore {
    async fn get_job(&self, id: &JobId) -> PersistenceResult<Option<ScheduledJob>> {
        let record: Option<JobRecord> = self
            .store
            .db()
            .select((JOB_TABLE, id.as_str()))
            .await
            .map_err(from_surrealdb_error)?;

        record.map(JobRecord::into_job).transpose()
    }

    async fn claim_due(&self, request: &ClaimRequest) -> PersistenceResult<Vec<ClaimedJob>> {
        let response = self
            .store
            .db()
            .query(
                "SELECT * FROM scheduled_job \
                 WHERE status = 'pending' AND due_at_ms <= $now \
                 ORDER BY due_at_ms ASC LIMIT $limit",
            )
            .bind(("now", request.now.timestamp_millis()))
            .bind(("limit", i64::try_from(request.limit).unwrap_or(i64::MAX)))
            .await
            .map_err(from_surrealdb_error)?;
        let candidates: Vec<JobRecord> = check_response(response)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for record in candidates {
            let job_id = record.job_id.clone();
            match self.try_claim(record, request).await? {
                Some(job) => claimed.push(job),
                None => debug!(job_id = %job_id, node_id = %request.node_id, "Lost claim race"),
            }
        }
        Ok(claimed)
    }

    async fn cancel_job(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> PersistenceResult<CancelOutcome> {
        for _ in 0..CANCEL_ATTEMPTS {
            let Some(job) = self.get_job(id).await? else {
                return Ok(CancelOutcome::NotFound);
            };

            match job.status() {
                JobStatus::Pending => {
                    let mut bindings = serde_json::Map::new();
                    bindings.insert("id".into(), id.as_str().into());
                    bindings.insert("event".into(), job.owner().event_id.as_str().into());
                    bindings.insert("now".into(), now.timestamp_millis().into());

                    let script = "BEGIN TRANSACTION;\n\
                        LET $updated = (UPDATE type::thing('scheduled_job', $id) SET \
                            status = 'canceled', next_fire_at_ms = NONE, due_at_ms = NONE, \
                            claimed_by = NONE, updated_at_ms = $now \
                            WHERE status = 'pending' RETURN AFTER);\n\
                        IF array::len($updated) == 0 { THROW 'conflict: job left pending state'; };\n\
                        DELETE type::thing('event_instance', $event);\n\
                        COMMIT TRANSACTION;";

                    match self.run_script(script.to_string(), bindings).await {
                        Ok(()) => return Ok(CancelOutcome::Canceled),
                        Err(err) if err.is_retryable() => {
                            debug!(job_id = %id, error = %err, "Cancel raced a claim, retrying");
                        }
                        Err(err) => return Err(err),
                    }
                }
                JobStatus::Claimed => {
                    let response = self
                        .store
                        .db()
                        .query(
                            "UPDATE type::thing('scheduled_job', $id) SET \
                                 cancel_requested = true, updated_at_ms = $now \
                             WHERE status = 'claimed' RETURN AFTER",
                        )
                        .bind(("id", id.as_str().to_string()))
                        .bind(("now", now.timestamp_millis()))
                        .await
                        .map_err(from_surrealdb_error)?;
                    let updated: Vec<JobRecord> = check_response(response)?
                        .take(0)
                        .map_err(from_surrealdb_error)?;
                    if !updated.is_empty() {
                        return Ok(CancelOutcome::Deferred);
                    }
                }
                JobStatus::Fired | JobStatus::Canceled => return Ok(CancelOutcome::NotFound),
            }
        }

        warn!(job_id = %id, attempts = CANCEL_ATTEMPTS, "Cancel kept racing state changes");
        Err(PersistenceError::conflict(
            JOB_TABLE,
            id.as_str(),
            "state kept changing during cancel",
        ))
    }

    async fn next_due_at(&self) -> PersistenceResult<Option<DateTime<Utc>>> {
        let response = self
            .store
            .db()
            .query(
                "SELECT due_at_ms FROM scheduled_job WHERE status = 'pending' \
                 ORDER BY due_at_ms ASC LIMIT 1",
            )
            .await
            .map_err(from_surrealdb_error)?;
        let rows: Vec<DueRow> = check_response(response)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        rows.into_iter()
            .find_map(|row| row.due_at_ms)
            .map(from_millis)
            .transpose()
    }

    async fn jobs_for_process(
        &self,
        process_instance_id: &str,
    ) -> PersistenceResult<Vec<ScheduledJob>> {
        self.select_jobs(
            "SELECT * FROM scheduled_job \
             WHERE process_instance_id = $pid AND status IN ['pending', 'claimed']",
            "pid",
            process_instance_id.to_string(),
        )
        .await
    }

    async fn start_jobs_for_definition(
        &self,
        definition_id: &str,
    ) -> PersistenceResult<Vec<ScheduledJob>> {
        let jobs = self
            .select_jobs(
                "SELECT * FROM scheduled_job \
                 WHERE definition_id = $def AND status IN ['pending', 'claimed']",
                "def",
                definition_id.to_string(),
            )
            .await?;

        Ok(jobs
            .into_iter()
            .filter(|job| job.owner().process_instance_id.is_none())
            .collect())
    }

    async fn recover_claimed(
        &self,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> PersistenceResult<usize> {
        let held = self
            .select_jobs(
                "SELECT * FROM scheduled_job WHERE status = 'claimed' AND claimed_by = $node",
                "node",
                node_id.to_string(),
            )
            .await?;
        if held.is_empty() {
            return Ok(0);
        }

        let mut bindings = serde_json::Map::new();
        bindings.insert("node".into(), node_id.into());
        bindings.insert("now".into(), now.timestamp_millis().into());

        let script = "BEGIN TRANSACTION;\n\
            LET $doomed = (SELECT event_id FROM scheduled_job \
                WHERE status = 'claimed' AND claimed_by = $node AND cancel_requested = true);\n\
            FOR $row IN $doomed { DELETE type::thing('event_instance', $row.event_id); };\n\
            UPDATE scheduled_job SET status = 'canceled', next_fire_at_ms = NONE, \
                due_at_ms = NONE, claimed_by = NONE, updated_at_ms = $now \
                WHERE status = 'claimed' AND claimed_by = $node AND cancel_requested = true;\n\
            UPDATE scheduled_job SET status = 'pending', claimed_by = NONE, retry_at_ms = NONE, \
                due_at_ms = next_fire_at_ms, updated_at_ms = $now \
                WHERE status = 'claimed' AND claimed_by = $node;\n\
            COMMIT TRANSACTION;";

        self.run_script(script.to_string(), bindings).await?;
        Ok(held.len())
    }

    async fn prune_canceled(&self, older_than: DateTime<Utc>) -> PersistenceResult<usize> {
        let response = self
            .store
            .db()
            .query(
                "DELETE scheduled_job WHERE status = 'canceled' AND updated_at_ms < $cutoff \
                 RETURN BEFORE",
            )
            .bind(("cutoff", older_than.timestamp_millis()))
            .await
            .map_err(from_surrealdb_error)?;
        let removed: Vec<JobRecord> = check_response(response)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(removed.len())
    }

    async fn pending_count(&self) -> PersistenceResult<usize> {
        let response = self
            .store
            .db()
            .query("SELECT count() AS count FROM scheduled_job WHERE status = 'pending' GROUP ALL")
            .await
            .map_err(from_surrealdb_error)?;
        let row: Option<CountRow> = check_response(response)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        Ok(row.map_or(0, |row| usize::try_from(row.count).unwrap_or(0)))
    }
}

#[async_trait]
impl EventStore for SurrealStore {
    async fn get_event(&self, id: &EventInstanceId) -> PersistenceResult<Option<EventInstance>> {
        let record: Option<EventRecord> = self
            .store
            .db()
            .select((EVENT_TABLE, id.as_str()))
            .await
            .map_err(from_surrealdb_error)?;

        record.map(EventRecord::into_event).transpose()
    }

    async fn find_waiting(
        &self,
        process_instance_id: &str,
        flow_node_name: &str,
    ) -> PersistenceResult<Option<EventInstance>> {
        let events = self
            .select_events(
                "SELECT * FROM event_instance \
                 WHERE process_instance_id = $pid AND flow_node_name = $node LIMIT 1",
                serde_json::json!({ "pid": process_instance_id, "node": flow_node_name }),
            )
            .await?;

        Ok(events.into_iter().next())
    }

    async fn start_events(&self, definition_id: &str) -> PersistenceResult<Vec<EventInstance>> {
        self.select_events(
            "SELECT * FROM event_instance WHERE definition_id = $def AND kind = 'start_event'",
            serde_json::json!({ "def": definition_id }),
        )
        .await
    }
}

#[async_trait]
impl AuditLogStore for SurrealStore {
    async fn audit_log(&self, subject: &str) -> PersistenceResult<Vec<AuditRecord>> {
        let response = self
            .store
            .db()
            .query("SELECT * FROM audit_log WHERE subject = $subject ORDER BY recorded_at_ms, seq")
            .bind(("subject", subject.to_string()))
            .await
            .map_err(from_surrealdb_error)?;
        let rows: Vec<AuditRow> = check_response(response)?
            .take(0)
            .map_err(from_surrealdb_error)?;

        rows.into_iter().map(AuditRow::into_record).collect()
    }
}

#[async_trait]
impl WriteSetStore for SurrealStore {
    async fn apply(&self, writes: Vec<StagedWrite>) -> PersistenceResult<()> {
        if writes.is_empty() {
            return Ok(());
        }

        let mut script = String::from("BEGIN TRANSACTION;\n");
        let mut bindings = serde_json::Map::new();

        for (i, write) in writes.iter().enumerate() {
            let p = format!("p{i}");
            match write {
                StagedWrite::PutEvent(event) => {
                    bindings.insert(format!("{p}_id"), event.id().as_str().into());
                    bindings.insert(
                        format!("{p}_body"),
                        to_value(&EventRecord::from_event(event))?,
                    );
                    let _ = writeln!(
                        script,
                        "UPSERT type::thing('event_instance', ${p}_id) CONTENT ${p}_body;"
                    );
                }
                StagedWrite::RemoveEvent(id) => {
                    bindings.insert(format!("{p}_id"), id.as_str().into());
                    let _ = writeln!(script, "DELETE type::thing('event_instance', ${p}_id);");
                }
                StagedWrite::InsertJob(job) => {
                    bindings.insert(format!("{p}_id"), job.id().as_str().into());
                    bindings.insert(
                        format!("{p}_event"),
                        job.owner().event_id.as_str().into(),
                    );
                    bindings.insert(format!("{p}_body"), to_value(&JobRecord::from_job(job)?)?);
                    let _ = writeln!(
                        script,
                        "IF array::len((SELECT id FROM scheduled_job WHERE event_id = ${p}_event)) > 0 {{ \
                             THROW 'already exists: scheduled_job for event ' + ${p}_event; }};\n\
                         CREATE type::thing('scheduled_job', ${p}_id) CONTENT ${p}_body;"
                    );
                }
                StagedWrite::AppendAudit(records) => {
                    let rows: Vec<AuditRow> = records
                        .iter()
                        .enumerate()
                        .map(|(seq, record)| AuditRow::from_record(record, seq))
                        .collect();
                    bindings.insert(format!("{p}_rows"), to_value(&rows)?);
                    let _ = writeln!(script, "INSERT INTO {AUDIT_TABLE} ${p}_rows;");
                }
                StagedWrite::FinishJob {
                    id,
                    node_id,
                    rearm,
                    at,
                } => {
                    bindings.insert(format!("{p}_id"), id.as_str().into());
                    bindings.insert(format!("{p}_node"), node_id.as_str().into());
                    bindings.insert(format!("{p}_at"), at.timestamp_millis().into());
                    bindings.insert(format!("{p}_rearm"), rearm.is_some().into());
                    if let Some(Rearm {
                        next_fire_at,
                        retry_at,
                    }) = rearm
                    {
                        let due = retry_at.map_or(*next_fire_at, |retry| retry.max(*next_fire_at));
                        bindings.insert(format!("{p}_next"), next_fire_at.timestamp_millis().into());
                        bindings.insert(format!("{p}_due"), due.timestamp_millis().into());
                        bindings.insert(
                            format!("{p}_retry"),
                            retry_at.map(|at| at.timestamp_millis()).into(),
                        );
                    } else {
                        for key in ["next", "due", "retry"] {
                            bindings.insert(format!("{p}_{key}"), serde_json::Value::Null);
                        }
                    }

                    let _ = writeln!(
                        script,
                        "LET ${p}_row = (SELECT * FROM type::thing('scheduled_job', ${p}_id))[0];\n\
                         IF ${p}_row.status != 'claimed' OR ${p}_row.claimed_by != ${p}_node {{ \
                             THROW 'conflict: scheduled_job ' + ${p}_id + ' is not claimed by ' + ${p}_node; }};\n\
                         IF ${p}_row.cancel_requested OR !${p}_rearm {{ \
                             DELETE type::thing('scheduled_job', ${p}_id); \
                             IF ${p}_row.cancel_requested {{ \
                                 DELETE type::thing('event_instance', ${p}_row.event_id); }}; \
                         }} ELSE {{ \
                             UPDATE type::thing('scheduled_job', ${p}_id) SET \
                                 status = 'pending', next_fire_at_ms = ${p}_next, \
                                 due_at_ms = ${p}_due, retry_at_ms = ${p}_retry, \
                                 claimed_by = NONE, updated_at_ms = ${p}_at; \
                         }};"
                    );
                }
            }
        }
        script.push_str("COMMIT TRANSACTION;");

        debug!(writes = writes.len(), "Applying write-set");
        self.run_script(script, bindings).await
    }
}
