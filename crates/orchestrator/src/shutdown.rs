//! Graceful shutdown handling for a timer node.
//!
//! Handles SIGTERM/SIGINT and coordinates the drain of running components:
//! dispatchers stop claiming, finish their in-flight fires and report back
//! within the drain window. Claims left behind by a node that dies anyway
//! are released by the next node start.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

/// Maximum time allowed for graceful shutdown (30 seconds)
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum time to wait for components to drain (25 seconds, leaving 5s buffer)
const DRAIN_TIMEOUT: Duration = Duration::from_secs(25);

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownSignal {
    /// SIGTERM signal received
    Sigterm,
    /// SIGINT signal received (Ctrl+C)
    Sigint,
    /// Programmatic shutdown requested
    Programmatic,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sigterm => write!(f, "SIGTERM"),
            Self::Sigint => write!(f, "SIGINT"),
            Self::Programmatic => write!(f, "PROGRAMMATIC"),
        }
    }
}

/// Shutdown coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownPhase {
    /// Normal operation, no shutdown initiated
    Running,
    /// Shutdown signal broadcast to components
    Initiating,
    /// Waiting for in-flight fires to finish
    Draining,
    /// Shutdown complete
    Complete,
}

/// Report a component sends once it has drained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainReport {
    /// Component that drained
    pub component: String,
    /// Whether the component stopped cleanly
    pub success: bool,
    /// Jobs the component finished while draining
    pub drained_jobs: usize,
    /// Optional error message
    pub error: Option<String>,
}

impl DrainReport {
    /// A component that stopped cleanly.
    pub fn success(component: impl Into<String>, drained_jobs: usize) -> Self {
        Self {
            component: component.into(),
            success: true,
            drained_jobs,
            error: None,
        }
    }

    /// A component that failed while stopping.
    pub fn failure(component: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            success: false,
            drained_jobs: 0,
            error: Some(error.into()),
        }
    }
}

/// Shutdown coordinator for graceful node shutdown
pub struct ShutdownCoordinator {
    phase: Arc<RwLock<ShutdownPhase>>,
    shutdown_initiated: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    drain_tx: mpsc::Sender<DrainReport>,
    drain_rx: Arc<RwLock<Option<mpsc::Receiver<DrainReport>>>>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        let (drain_tx, drain_rx) = mpsc::channel(32);

        Self {
            phase: Arc::new(RwLock::new(ShutdownPhase::Running)),
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            drain_tx,
            drain_rx: Arc::new(RwLock::new(Some(drain_rx))),
        }
    }

    /// Get the current shutdown phase
    pub async fn phase(&self) -> ShutdownPhase {
        *self.phase.read().await
    }

    /// Check if shutdown has been initiated
    #[must_use]
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Subscribe to shutdown notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Get a sender for drain reports
    #[must_use]
    pub fn drain_sender(&self) -> mpsc::Sender<DrainReport> {
        self.drain_tx.clone()
    }

    /// Initiate graceful shutdown
    ///
    /// # Errors
    ///
    /// Currently infallible; a duplicate signal is ignored.
    pub async fn initiate_shutdown(&self, signal: ShutdownSignal) -> Result<()> {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Shutdown already in progress, ignoring duplicate signal");
            return Ok(());
        }

        info!(signal = %signal, "Initiating graceful shutdown");
        *self.phase.write().await = ShutdownPhase::Initiating;

        let subscriber_count = self.shutdown_tx.receiver_count();
        info!(
            subscribers = subscriber_count,
            "Broadcasting shutdown signal to subscribers"
        );

        if let Err(e) = self.shutdown_tx.send(signal) {
            debug!("No active subscribers for shutdown signal: {}", e);
        }

        Ok(())
    }

    /// Wait for `expected` components to report that they drained.
    ///
    /// # Errors
    ///
    /// Returns an error if the drain reports were already collected.
    pub async fn shutdown(&self, expected: usize) -> Result<ShutdownStats> {
        let start = std::time::Instant::now();
        let mut stats = ShutdownStats::default();

        info!(expected, "Starting graceful shutdown sequence");

        *self.phase.write().await = ShutdownPhase::Draining;
        let reports = self.collect_drain_reports(expected).await?;
        stats.components_drained = reports.iter().filter(|r| r.success).count();
        stats.components_failed = reports.iter().filter(|r| !r.success).count();
        stats.jobs_drained = reports.iter().map(|r| r.drained_jobs).sum();
        stats.components_missing = expected.saturating_sub(reports.len());
        for report in reports.iter().filter(|r| !r.success) {
            warn!(
                component = %report.component,
                error = report.error.as_deref().unwrap_or("unknown"),
                "Component failed to drain"
            );
        }

        *self.phase.write().await = ShutdownPhase::Complete;

        stats.total_duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            duration_ms = stats.total_duration_ms,
            drained = stats.components_drained,
            missing = stats.components_missing,
            "Graceful shutdown complete"
        );

        Ok(stats)
    }

    async fn collect_drain_reports(&self, expected: usize) -> Result<Vec<DrainReport>> {
        let Some(mut rx) = self.drain_rx.write().await.take() else {
            return Err(Error::shutdown_failed("drain reports already collected"));
        };

        let mut reports = Vec::with_capacity(expected);
        let collected = timeout(DRAIN_TIMEOUT, async {
            while reports.len() < expected {
                match rx.recv().await {
                    Some(report) => {
                        debug!(
                            component = %report.component,
                            success = report.success,
                            drained_jobs = report.drained_jobs,
                            "Received drain report"
                        );
                        reports.push(report);
                    }
                    None => break,
                }
            }
        })
        .await;

        if collected.is_err() {
            warn!(
                timeout_secs = DRAIN_TIMEOUT.as_secs(),
                received = reports.len(),
                expected,
                "Drain timeout exceeded"
            );
        }
        Ok(reports)
    }

    /// Block until shutdown is initiated, then drain `expected` components
    /// under the overall deadline.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShutdownFailed` if the deadline passes.
    pub async fn wait_for_signal_and_drain(&self, expected: usize) -> Result<ShutdownStats> {
        let mut signals = self.subscribe();
        if !self.is_shutdown_initiated() {
            match signals.recv().await {
                Ok(signal) => debug!(signal = %signal, "Shutdown signal observed"),
                Err(e) => warn!(error = %e, "Shutdown channel error, draining anyway"),
            }
        }
        self.wait_with_timeout(expected).await
    }

    /// Run [`Self::shutdown`] under the overall shutdown deadline.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShutdownFailed` if the deadline passes.
    pub async fn wait_with_timeout(&self, expected: usize) -> Result<ShutdownStats> {
        match timeout(SHUTDOWN_TIMEOUT, self.shutdown(expected)).await {
            Ok(stats) => stats,
            Err(_) => {
                error!(
                    timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                    "Shutdown timeout exceeded, forcing exit"
                );
                Err(Error::shutdown_failed(format!(
                    "timeout exceeded: {} seconds",
                    SHUTDOWN_TIMEOUT.as_secs()
                )))
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the shutdown process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShutdownStats {
    /// Components that drained cleanly
    pub components_drained: usize,
    /// Components that reported a failure
    pub components_failed: usize,
    /// Components that never reported before the deadline
    pub components_missing: usize,
    /// Jobs finished during the drain
    pub jobs_drained: usize,
    /// Total shutdown duration in milliseconds
    pub total_duration_ms: u64,
}

/// Install OS signal handlers (SIGTERM, SIGINT)
///
/// # Errors
///
/// Currently infallible; handler installation failures are logged by the
/// spawned task.
pub async fn install_signal_handlers(
    coordinator: Arc<ShutdownCoordinator>,
) -> Result<tokio::task::JoinHandle<()>> {
    info!("Installing OS signal handlers");

    let handle = tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };

            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGINT handler");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    if let Err(e) = coordinator.initiate_shutdown(ShutdownSignal::Sigterm).await {
                        error!(error = %e, "Failed to initiate shutdown on SIGTERM");
                    }
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    if let Err(e) = coordinator.initiate_shutdown(ShutdownSignal::Sigint).await {
                        error!(error = %e, "Failed to initiate shutdown on SIGINT");
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }

            info!("Received Ctrl+C");
            if let Err(e) = coordinator.initiate_shutdown(ShutdownSignal::Sigint).await {
                error!(error = %e, "Failed to initiate shutdown on Ctrl+C");
            }
        }
    });

    Ok(handle)
}
