//! # Orchestrator
//!
//! Timer events, clustered job dispatch and transactional commit for the
//! Tickwork process engine.
//!
//! A flow node that waits on a timer is recorded as an
//! [`events::EventInstance`] plus one persisted [`timers::ScheduledJob`].
//! Any node of the cluster may claim a due job; the claim is atomic in the
//! shared [`store`], and the fire runs inside a [`transaction::Transaction`]
//! whose synchronizations and write-set commit or roll back together.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

pub use tickwork_core::{Error, Result};

pub mod audit;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod events;
pub mod persistence;
pub mod process;
pub mod shutdown;
pub mod store;
pub mod timers;
pub mod transaction;

pub use config::EngineConfig;
pub use engine::{TimerEngine, TimerEngineBuilder};
