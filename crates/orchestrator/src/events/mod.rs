//! Waiting-event records.
//!
//! An [`EventInstance`] is the workflow-visible record of a flow node that
//! waits on a timer. Outside a transaction it is either `Waiting` or absent:
//! the `Triggered` and `Consumed` states only exist inside the transaction
//! that fires the timer.

mod instance;

pub use instance::{
    EventInstance, EventInstanceId, EventKind, EventState, EventStateError, EventStateResult,
};
