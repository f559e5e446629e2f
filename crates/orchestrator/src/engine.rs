//! Wiring of a timer node.
//!
//! [`TimerEngine`] owns one store handle shared by the timer service, the
//! cluster coordinator, the executor and the dispatcher, so that a job
//! inserted by the service wakes this node's dispatcher directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::audit::AuditSink;
use crate::clock::{Clock, SystemClock};
use crate::cluster::{
    ClusterCoordinator, ClusterMember, ClusterTransport, LocalMember, MemberId, ResourceCache,
    StaticMembership,
};
use crate::config::EngineConfig;
use crate::process::{ConstantExpressionEvaluator, ExpressionEvaluator, ProcessGraph};
use crate::shutdown::{DrainReport, ShutdownCoordinator};
use crate::store::EngineStore;
use crate::timers::{
    DispatchReport, DispatcherConfig, DispatcherError, DispatcherWaker, ExecutorConfig,
    JobDispatcher, JobExecutor, TimerService,
};

const DEFAULT_MEMBER_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder for [`TimerEngine`].
pub struct TimerEngineBuilder {
    store: Arc<dyn EngineStore>,
    graph: Arc<dyn ProcessGraph>,
    node_id: MemberId,
    clock: Arc<dyn Clock>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    audit: Option<Arc<dyn AuditSink>>,
    transport: Option<Arc<dyn ClusterTransport>>,
    dispatcher: DispatcherConfig,
    executor: ExecutorConfig,
    member_timeout: Duration,
}

impl TimerEngineBuilder {
    /// Identity of this node.
    #[must_use]
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = MemberId::new(node_id);
        self
    }

    /// Time source; the system clock by default.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Evaluator for date expressions.
    #[must_use]
    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Batch an audit record of every fire into `sink`.
    #[must_use]
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Cluster membership; a single local member by default.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn ClusterTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Dispatcher settings.
    #[must_use]
    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher = config;
        self
    }

    /// Executor settings.
    #[must_use]
    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    /// Per-member bound for cluster broadcasts.
    #[must_use]
    pub fn member_timeout(mut self, timeout: Duration) -> Self {
        self.member_timeout = timeout;
        self
    }

    /// Take node id and component settings from a loaded config.
    #[must_use]
    pub fn with_config(self, config: &EngineConfig) -> Self {
        self.node_id(config.cluster.node_id.clone())
            .dispatcher_config(config.dispatcher_config())
            .executor_config(config.executor_config())
            .member_timeout(config.member_timeout())
    }

    /// Wire the components.
    #[must_use]
    pub fn build(self) -> TimerEngine {
        let transport = self.transport.unwrap_or_else(|| {
            let local: Arc<dyn ClusterMember> = Arc::new(LocalMember::new(
                self.node_id.clone(),
                Arc::new(ResourceCache::new()),
            ));
            Arc::new(StaticMembership::single(local))
        });
        let coordinator = Arc::new(ClusterCoordinator::new(
            self.node_id.clone(),
            Arc::clone(&self.store),
            transport,
            self.member_timeout,
        ));

        let mut executor = JobExecutor::new(
            Arc::clone(&self.store),
            self.graph,
            Arc::clone(&self.clock),
            self.node_id.as_str(),
            &self.executor,
        );
        if let Some(sink) = self.audit {
            executor = executor.with_audit_sink(sink);
        }

        let waker = DispatcherWaker::new();
        let dispatcher = Arc::new(JobDispatcher::new(
            self.dispatcher,
            Arc::clone(&coordinator),
            Arc::clone(&self.store),
            Arc::new(executor),
            Arc::clone(&self.clock),
            waker.clone(),
        ));
        let service = Arc::new(TimerService::new(
            Arc::clone(&self.store),
            self.evaluator,
            self.clock,
            waker,
        ));

        TimerEngine {
            node_id: self.node_id,
            store: self.store,
            coordinator,
            dispatcher,
            service,
        }
    }
}

/// A fully wired timer node.
pub struct TimerEngine {
    node_id: MemberId,
    store: Arc<dyn EngineStore>,
    coordinator: Arc<ClusterCoordinator>,
    dispatcher: Arc<JobDispatcher>,
    service: Arc<TimerService>,
}

impl TimerEngine {
    /// Start building an engine over `store` that fires into `graph`.
    #[must_use]
    pub fn builder(store: Arc<dyn EngineStore>, graph: Arc<dyn ProcessGraph>) -> TimerEngineBuilder {
        TimerEngineBuilder {
            store,
            graph,
            node_id: MemberId::new("node-1"),
            clock: Arc::new(SystemClock),
            evaluator: Arc::new(ConstantExpressionEvaluator),
            audit: None,
            transport: None,
            dispatcher: DispatcherConfig::default(),
            executor: ExecutorConfig::default(),
            member_timeout: DEFAULT_MEMBER_TIMEOUT,
        }
    }

    /// This node's identity.
    #[must_use]
    pub fn node_id(&self) -> &MemberId {
        &self.node_id
    }

    /// The timer API.
    #[must_use]
    pub fn service(&self) -> &Arc<TimerService> {
        &self.service
    }

    /// The cluster coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<ClusterCoordinator> {
        &self.coordinator
    }

    /// The dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<JobDispatcher> {
        &self.dispatcher
    }

    /// The shared store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    /// Fire every job that is due now and wait for the fires to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if claiming fails.
    pub async fn run_once(&self) -> Result<DispatchReport, DispatcherError> {
        self.dispatcher.run_once().await
    }

    /// Run the dispatcher on its own task until `shutdown` broadcasts,
    /// then send a drain report.
    #[must_use]
    pub fn spawn(&self, shutdown: &ShutdownCoordinator) -> JoinHandle<()> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let signals = shutdown.subscribe();
        let drained = shutdown.drain_sender();
        let component = format!("dispatcher-{}", self.node_id);

        info!(node_id = %self.node_id, "Starting timer dispatcher");
        tokio::spawn(async move {
            let report = match dispatcher.run(signals).await {
                Ok(report) => DrainReport::success(
                    component,
                    report.fired + report.dropped + report.failed,
                ),
                Err(err) => {
                    error!(error = %err, "Dispatcher stopped with an error");
                    DrainReport::failure(component, err.to_string())
                }
            };
            if drained.send(report).await.is_err() {
                error!("Shutdown coordinator dropped before drain report");
            }
        })
    }
}

impl std::fmt::Debug for TimerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEngine")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}
