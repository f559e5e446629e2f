//! Event instance state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for an event instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventInstanceId(String);

impl EventInstanceId {
    /// Create a new unique event ID.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("event-{}", Uuid::new_v4()))
    }

    /// Create an event ID from an existing string.
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

impl Default for EventInstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventInstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an event instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    /// Waiting for its timer.
    Waiting,
    /// Timer fired; downstream activation in progress.
    Triggered,
    /// Downstream activation recorded; the record is removed.
    Consumed,
}

impl std::fmt::Display for EventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Triggered => write!(f, "triggered"),
            Self::Consumed => write!(f, "consumed"),
        }
    }
}

/// What kind of flow node the event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Timer catch event inside a running process instance.
    IntermediateCatch,
    /// Timer start event of a process definition.
    StartEvent,
}

/// Invalid state transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventStateError {
    /// The transition is not allowed from the current state.
    #[error("event {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: EventInstanceId,
        from: EventState,
        to: EventState,
    },

    /// Start events are never consumed.
    #[error("start event {id} cannot be consumed")]
    StartEventNotConsumable { id: EventInstanceId },
}

/// Result type for event state transitions.
pub type EventStateResult<T> = Result<T, EventStateError>;

/// A flow node waiting on a timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInstance {
    id: EventInstanceId,
    definition_id: String,
    /// `None` for start events, which precede any process instance.
    process_instance_id: Option<String>,
    flow_node_name: String,
    state: EventState,
    kind: EventKind,
    created_at: DateTime<Utc>,
}

impl EventInstance {
    /// A waiting intermediate catch event owned by a process instance.
    #[must_use]
    pub fn intermediate_catch(
        definition_id: impl Into<String>,
        process_instance_id: impl Into<String>,
        flow_node_name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventInstanceId::new(),
            definition_id: definition_id.into(),
            process_instance_id: Some(process_instance_id.into()),
            flow_node_name: flow_node_name.into(),
            state: EventState::Waiting,
            kind: EventKind::IntermediateCatch,
            created_at,
        }
    }

    /// A waiting start event of a process definition.
    #[must_use]
    pub fn start_event(
        definition_id: impl Into<String>,
        flow_node_name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventInstanceId::new(),
            definition_id: definition_id.into(),
            process_instance_id: None,
            flow_node_name: flow_node_name.into(),
            state: EventState::Waiting,
            kind: EventKind::StartEvent,
            created_at,
        }
    }

    /// Get the event ID.
    #[must_use]
    pub fn id(&self) -> &EventInstanceId {
        &self.id
    }

    /// Get the owning process definition.
    #[must_use]
    pub fn definition_id(&self) -> &str {
        &self.definition_id
    }

    /// Get the owning process instance, if any.
    #[must_use]
    pub fn process_instance_id(&self) -> Option<&str> {
        self.process_instance_id.as_deref()
    }

    /// Get the flow node name.
    #[must_use]
    pub fn flow_node_name(&self) -> &str {
        &self.flow_node_name
    }

    /// Get the state.
    #[must_use]
    pub fn state(&self) -> EventState {
        self.state
    }

    /// Get the kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Get the creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the event is waiting for its timer.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.state == EventState::Waiting
    }

    /// Waiting -> Triggered.
    ///
    /// # Errors
    ///
    /// Returns `EventStateError::InvalidTransition` unless the event is waiting.
    pub fn trigger(&mut self) -> EventStateResult<()> {
        self.transition(EventState::Waiting, EventState::Triggered)
    }

    /// Triggered -> Consumed.
    ///
    /// # Errors
    ///
    /// Returns an error for start events or if the event was not triggered.
    pub fn consume(&mut self) -> EventStateResult<()> {
        if self.kind == EventKind::StartEvent {
            return Err(EventStateError::StartEventNotConsumable {
                id: self.id.clone(),
            });
        }
        self.transition(EventState::Triggered, EventState::Consumed)
    }

    /// Triggered -> Waiting, for start events that stay armed.
    ///
    /// # Errors
    ///
    /// Returns `EventStateError::InvalidTransition` unless the event was triggered.
    pub fn rearm(&mut self) -> EventStateResult<()> {
        self.transition(EventState::Triggered, EventState::Waiting)
    }

    fn transition(&mut self, from: EventState, to: EventState) -> EventStateResult<()> {
        if self.state != from {
            return Err(EventStateError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Restore an event from persisted state.
    #[must_use]
    pub fn restore(
        id: EventInstanceId,
        definition_id: String,
        process_instance_id: Option<String>,
        flow_node_name: String,
        kind: EventKind,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            definition_id,
            process_instance_id,
            flow_node_name,
            state: EventState::Waiting,
            kind,
            created_at,
        }
    }
}
