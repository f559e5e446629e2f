//! Durable timers.
//!
//! A timer is a persisted [`ScheduledJob`] owned by a waiting event. The
//! [`TimerService`] creates and cancels jobs, the [`JobDispatcher`] claims
//! due jobs across the cluster and the [`JobExecutor`] fires each claimed
//! job inside one transaction.

mod dispatcher;
mod executor;
mod job;
mod service;
mod trigger;

pub use dispatcher::{
    DispatchReport, DispatcherConfig, DispatcherError, DispatcherWaker, JobDispatcher,
};
pub use executor::{ExecutionResult, ExecutorConfig, JobExecutor};
pub use job::{JobId, JobStatus, OwnerContext, ScheduledJob};
pub use service::{
    DateSource, ScheduledTimer, TimerDefinition, TimerService, TimerServiceError,
    TimerServiceResult,
};
pub use trigger::{
    CycleExpression, TriggerError, TriggerKind, TriggerResult, TriggerSpec, resolve_next,
    resolve_rearm,
};
