//! The dispatch loop.
//!
//! [`JobDispatcher::run`] parks until the earliest pending job is due,
//! until a [`DispatcherWaker`] reports a new job, or until shutdown.
//! Each wake claims at most as many due jobs as there are free workers
//! and hands every claimed job to the [`JobExecutor`] on its own task.
//! A failing job is logged by the executor and never stops the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore, broadcast};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::executor::{ExecutionResult, JobExecutor};
use crate::clock::Clock;
use crate::cluster::ClusterCoordinator;
use crate::persistence::PersistenceError;
use crate::shutdown::ShutdownSignal;
use crate::store::{ClaimedJob, EngineStore};

/// Errors that stop the dispatcher.
#[derive(Debug, Error)]
pub enum DispatcherError {
    /// The store failed while claiming or recovering.
    #[error("store error: {0}")]
    Store(#[from] PersistenceError),
}

/// Configuration for the job dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum jobs claimed per wake.
    pub batch_size: usize,
    /// Maximum jobs executing at once.
    pub max_concurrent: usize,
    /// Jobs claimed later than this after their fire time are misfires.
    pub misfire_grace: chrono::Duration,
    /// Longest the loop parks without a known due time. Also bounds how
    /// late a job inserted by another node is noticed.
    pub idle_poll: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_concurrent: 8,
            misfire_grace: chrono::Duration::seconds(60),
            idle_poll: Duration::from_secs(5),
        }
    }
}

/// Wakes a parked dispatcher early.
#[derive(Debug, Clone, Default)]
pub struct DispatcherWaker {
    notify: Arc<Notify>,
}

impl DispatcherWaker {
    /// Create a waker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that a job may now be due earlier than the dispatcher thinks.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    async fn woken(&self) {
        self.notify.notified().await;
    }
}

/// Counters for one or more dispatch rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Jobs claimed.
    pub claimed: usize,
    /// Of those, claimed past the misfire grace window.
    pub misfired: usize,
    /// Fires that committed.
    pub fired: usize,
    /// Jobs dropped because their event was gone.
    pub dropped: usize,
    /// Fires that rolled back.
    pub failed: usize,
}

impl DispatchReport {
    fn record(&mut self, result: &ExecutionResult) {
        match result {
            ExecutionResult::Fired { .. } => self.fired += 1,
            ExecutionResult::Dropped { .. } => self.dropped += 1,
            ExecutionResult::Failed { .. } => self.failed += 1,
        }
    }
}

/// Claims due jobs and runs them on a bounded worker pool.
pub struct JobDispatcher {
    config: DispatcherConfig,
    coordinator: Arc<ClusterCoordinator>,
    store: Arc<dyn EngineStore>,
    executor: Arc<JobExecutor>,
    clock: Arc<dyn Clock>,
    waker: DispatcherWaker,
    workers: Arc<Semaphore>,
}

impl JobDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        config: DispatcherConfig,
        coordinator: Arc<ClusterCoordinator>,
        store: Arc<dyn EngineStore>,
        executor: Arc<JobExecutor>,
        clock: Arc<dyn Clock>,
        waker: DispatcherWaker,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            coordinator,
            store,
            executor,
            clock,
            waker,
            workers,
        }
    }

    /// Handle for waking this dispatcher.
    #[must_use]
    pub fn waker(&self) -> DispatcherWaker {
        self.waker.clone()
    }

    /// Claim every currently due job (one batch) and wait for all of them.
    ///
    /// # Errors
    ///
    /// Returns an error if claiming fails; job failures are only counted.
    pub async fn run_once(&self) -> Result<DispatchReport, DispatcherError> {
        let mut report = DispatchReport::default();
        let mut in_flight = JoinSet::new();

        self.claim_and_spawn(self.config.batch_size, &mut report, &mut in_flight)
            .await?;
        while let Some(joined) = in_flight.join_next().await {
            Self::reap(joined, &mut report);
        }

        Ok(report)
    }

    /// Run until a shutdown signal arrives, then drain in-flight jobs.
    ///
    /// # Errors
    ///
    /// Returns an error if startup recovery fails. Errors during the loop
    /// are logged and retried on the next wake.
    pub async fn run(
        &self,
        mut shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> Result<DispatchReport, DispatcherError> {
        self.coordinator
            .release_orphaned_claims(self.clock.now())
            .await?;
        info!(node_id = %self.coordinator.node_id(), "Dispatcher started");

        let mut report = DispatchReport::default();
        let mut in_flight = JoinSet::new();

        loop {
            let capacity = self.workers.available_permits().min(self.config.batch_size);
            let mut claimed = 0;
            if capacity > 0 {
                match self
                    .claim_and_spawn(capacity, &mut report, &mut in_flight)
                    .await
                {
                    Ok(count) => claimed = count,
                    Err(err) => error!(error = %err, "Claim sweep failed"),
                }
            }

            while let Some(joined) = in_flight.try_join_next() {
                Self::reap(joined, &mut report);
            }

            // A full batch means more jobs may already be due.
            if claimed > 0 && claimed == capacity {
                continue;
            }

            // With every worker busy only a finishing job frees capacity.
            let park = if self.workers.available_permits() == 0 {
                None
            } else {
                Some(self.park_duration().await)
            };
            debug!(park = ?park, in_flight = in_flight.len(), "Dispatcher parking");

            tokio::select! {
                () = Self::sleep_for(park) => {}
                () = self.waker.woken() => debug!("Dispatcher woken early"),
                Some(joined) = in_flight.join_next() => Self::reap(joined, &mut report),
                signal = shutdown.recv() => {
                    match signal {
                        Ok(signal) => info!(signal = %signal, "Dispatcher stopping"),
                        Err(err) => warn!(error = %err, "Shutdown channel closed, stopping"),
                    }
                    break;
                }
            }
        }

        let draining = in_flight.len();
        if draining > 0 {
            info!(in_flight = draining, "Waiting for in-flight jobs");
        }
        while let Some(joined) = in_flight.join_next().await {
            Self::reap(joined, &mut report);
        }

        info!(
            claimed = report.claimed,
            fired = report.fired,
            failed = report.failed,
            misfired = report.misfired,
            "Dispatcher stopped"
        );
        Ok(report)
    }

    async fn claim_and_spawn(
        &self,
        limit: usize,
        report: &mut DispatchReport,
        in_flight: &mut JoinSet<ExecutionResult>,
    ) -> Result<usize, DispatcherError> {
        let now = self.clock.now();
        let claimed = self
            .coordinator
            .claim_due(now, limit, self.config.misfire_grace)
            .await?;
        let count = claimed.len();

        for ClaimedJob { job, misfired } in claimed {
            report.claimed += 1;
            if misfired {
                report.misfired += 1;
                warn!(
                    job_id = %job.id(),
                    next_fire_at = ?job.next_fire_at(),
                    misfire_count = job.misfire_count(),
                    "Misfire: firing late job now"
                );
            }

            let permit = Arc::clone(&self.workers).acquire_owned().await.ok();
            let executor = Arc::clone(&self.executor);
            in_flight.spawn(async move {
                let _permit = permit;
                executor.execute(&job).await
            });
        }

        Ok(count)
    }

    fn reap(
        joined: Result<ExecutionResult, tokio::task::JoinError>,
        report: &mut DispatchReport,
    ) {
        match joined {
            Ok(result) => report.record(&result),
            Err(err) => {
                report.failed += 1;
                error!(error = %err, "Job task aborted");
            }
        }
    }

    async fn sleep_for(park: Option<Duration>) {
        match park {
            Some(park) => tokio::time::sleep(park).await,
            None => std::future::pending().await,
        }
    }

    async fn park_duration(&self) -> Duration {
        let next_due = match self.store.next_due_at().await {
            Ok(next_due) => next_due,
            Err(err) => {
                warn!(error = %err, "Could not read next due time");
                None
            }
        };
        Self::park_until(next_due, self.clock.now(), self.config.idle_poll)
    }

    fn park_until(next_due: Option<DateTime<Utc>>, now: DateTime<Utc>, idle: Duration) -> Duration {
        next_due.map_or(idle, |due| {
            (due - now).to_std().unwrap_or(Duration::ZERO).min(idle)
        })
    }
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("config", &self.config)
            .field("node_id", self.coordinator.node_id())
            .finish_non_exhaustive()
    }
}
