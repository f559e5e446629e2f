//! Transaction boundary for firing a job.
//!
//! A [`Transaction`] collects the writes a fire-handler stages and the
//! [`Synchronization`]s it registers. At commit every synchronization's
//! `before_completion` runs in registration order and may stage writes of
//! its own; all of them run even when some fail, and every failure ends up
//! in one [`TransactionError::CommitFailed`]. Only then is the write-set
//! applied, atomically. `after_completion` is invoked with the final status and the
//! registry is cleared whether the transaction committed or rolled back.
//!
//! [`TransactionRunner`] re-runs a unit of work when it failed for a
//! transient reason, up to a bounded number of attempts.

mod context;
mod error;
mod runner;
mod synchronization;

pub use context::{Transaction, TransactionId, TransactionStatus};
pub use error::{TransactionError, TransactionResult};
pub use runner::{TransactionRunner, TransactionalWork};
pub use synchronization::{
    CommitOutcome, Synchronization, SynchronizationError, SynchronizationFailure,
    SynchronizationRegistry,
};
