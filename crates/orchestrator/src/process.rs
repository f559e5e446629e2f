//! Contracts with the process engine.
//!
//! The timer core never walks a process graph itself. It asks a
//! [`ProcessGraph`] to activate the flow node after a catch event or to
//! start a new instance after a start event, passing the open
//! [`Transaction`] so the graph's effects commit or roll back with the
//! timer's own. Date triggers are resolved by an [`ExpressionEvaluator`]
//! when the timer is scheduled.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::transaction::{Synchronization, Transaction, TransactionStatus};

/// Failures reported by process engine collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// The flow node could not be activated.
    #[error("cannot activate '{flow_node_name}' in {process_instance_id}: {reason}")]
    ActivationFailed {
        process_instance_id: String,
        flow_node_name: String,
        reason: String,
    },

    /// A new process instance could not be created.
    #[error("cannot start definition {definition_id}: {reason}")]
    StartFailed {
        definition_id: String,
        reason: String,
    },

    /// An expression did not evaluate to an instant.
    #[error("expression '{expression}' failed: {reason}")]
    ExpressionFailed { expression: String, reason: String },
}

impl ProcessError {
    /// Create an activation failure.
    pub fn activation_failed(
        process_instance_id: impl Into<String>,
        flow_node_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ActivationFailed {
            process_instance_id: process_instance_id.into(),
            flow_node_name: flow_node_name.into(),
            reason: reason.into(),
        }
    }

    /// Create an expression failure.
    pub fn expression_failed(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExpressionFailed {
            expression: expression.into(),
            reason: reason.into(),
        }
    }
}

/// Flow-node graph operations invoked when a timer fires.
#[async_trait]
pub trait ProcessGraph: Send + Sync {
    /// Activate the flow node following a fired catch event.
    async fn activate_flow_node(
        &self,
        tx: &mut Transaction,
        process_instance_id: &str,
        flow_node_name: &str,
    ) -> Result<(), ProcessError>;

    /// Start a new process instance at `start_node`; returns its id.
    async fn create_process_instance(
        &self,
        tx: &mut Transaction,
        definition_id: &str,
        start_node: &str,
    ) -> Result<String, ProcessError>;
}

/// Resolves a date expression to an instant at scheduling time.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate `expression` relative to `now`.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError::ExpressionFailed` if the expression does not
    /// produce an instant.
    fn evaluate_instant(
        &self,
        expression: &str,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ProcessError>;
}

/// Evaluates constant expressions: RFC 3339 instants or epoch milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantExpressionEvaluator;

impl ExpressionEvaluator for ConstantExpressionEvaluator {
    fn evaluate_instant(
        &self,
        expression: &str,
        _now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ProcessError> {
        let trimmed = expression.trim();
        if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
            return Ok(at.with_timezone(&Utc));
        }
        trimmed
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| {
                ProcessError::expression_failed(expression, "not an RFC 3339 instant or epoch ms")
            })
    }
}

/// A flow node activated by a committed fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub process_instance_id: String,
    pub flow_node_name: String,
}

/// A process instance started by a committed start event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedInstance {
    pub process_instance_id: String,
    pub definition_id: String,
    pub start_node: String,
}

#[derive(Debug, Default)]
struct GraphState {
    activations: Vec<Activation>,
    started: Vec<StartedInstance>,
    failing_nodes: HashSet<String>,
}

#[derive(Debug, Clone)]
enum GraphEffect {
    Activate(Activation),
    Start(StartedInstance),
}

/// Applies a graph effect once its transaction commits.
struct DeferredGraphEffect {
    state: Arc<Mutex<GraphState>>,
    effect: GraphEffect,
}

#[async_trait]
impl Synchronization for DeferredGraphEffect {
    fn name(&self) -> &str {
        "process-graph"
    }

    async fn after_completion(&self, status: TransactionStatus) {
        if status != TransactionStatus::Committed {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match self.effect.clone() {
            GraphEffect::Activate(activation) => state.activations.push(activation),
            GraphEffect::Start(started) => state.started.push(started),
        }
    }
}

/// Process graph that only records what it was asked to do.
///
/// Effects become visible when the surrounding transaction commits.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProcessGraph {
    state: Arc<Mutex<GraphState>>,
}

impl InMemoryProcessGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make activation of `flow_node_name` fail until cleared.
    pub fn fail_activation_of(&self, flow_node_name: impl Into<String>) {
        self.lock().failing_nodes.insert(flow_node_name.into());
    }

    /// Let activation of `flow_node_name` succeed again.
    pub fn clear_failure(&self, flow_node_name: &str) {
        self.lock().failing_nodes.remove(flow_node_name);
    }

    /// Committed flow-node activations, in commit order.
    #[must_use]
    pub fn activations(&self) -> Vec<Activation> {
        self.lock().activations.clone()
    }

    /// Committed process starts, in commit order.
    #[must_use]
    pub fn started_instances(&self) -> Vec<StartedInstance> {
        self.lock().started.clone()
    }

    /// Whether `flow_node_name` was activated in `process_instance_id`.
    #[must_use]
    pub fn was_activated(&self, process_instance_id: &str, flow_node_name: &str) -> bool {
        self.lock().activations.iter().any(|a| {
            a.process_instance_id == process_instance_id && a.flow_node_name == flow_node_name
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GraphState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn defer(&self, tx: &mut Transaction, effect: GraphEffect) {
        tx.register_synchronization(Arc::new(DeferredGraphEffect {
            state: Arc::clone(&self.state),
            effect,
        }));
    }
}

#[async_trait]
impl ProcessGraph for InMemoryProcessGraph {
    async fn activate_flow_node(
        &self,
        tx: &mut Transaction,
        process_instance_id: &str,
        flow_node_name: &str,
    ) -> Result<(), ProcessError> {
        if self.lock().failing_nodes.contains(flow_node_name) {
            return Err(ProcessError::activation_failed(
                process_instance_id,
                flow_node_name,
                "activation rejected",
            ));
        }
        self.defer(
            tx,
            GraphEffect::Activate(Activation {
                process_instance_id: process_instance_id.to_string(),
                flow_node_name: flow_node_name.to_string(),
            }),
        );
        Ok(())
    }

    async fn create_process_instance(
        &self,
        tx: &mut Transaction,
        definition_id: &str,
        start_node: &str,
    ) -> Result<String, ProcessError> {
        let process_instance_id = format!("proc-{}", Uuid::new_v4());
        self.defer(
            tx,
            GraphEffect::Start(StartedInstance {
                process_instance_id: process_instance_id.clone(),
                definition_id: definition_id.to_string(),
                start_node: start_node.to_string(),
            }),
        );
        Ok(process_instance_id)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn test_constant_evaluator_rfc3339() {
        let at = ConstantExpressionEvaluator
            .evaluate_instant("2024-03-14T10:00:00Z", Utc::now())
            .unwrap();
        assert_eq!(at.timestamp(), 1_710_410_400);
    }

    #[test]
    fn test_constant_evaluator_epoch_millis() {
        let at = ConstantExpressionEvaluator
            .evaluate_instant("1710410400000", Utc::now())
            .unwrap();
        assert_eq!(at.timestamp(), 1_710_410_400);
    }

    #[test]
    fn test_constant_evaluator_rejects_garbage() {
        let err = ConstantExpressionEvaluator.evaluate_instant("next tuesday", Utc::now());
        assert!(matches!(err, Err(ProcessError::ExpressionFailed { .. })));
    }

    #[tokio::test]
    async fn test_activation_visible_only_after_commit() {
        let graph = InMemoryProcessGraph::new();
        let store = InMemoryStore::new();

        let mut tx = Transaction::begin();
        graph.activate_flow_node(&mut tx, "proc-1", "next").await.unwrap();
        assert!(!graph.was_activated("proc-1", "next"));

        tx.commit(&store).await.unwrap();
        assert!(graph.was_activated("proc-1", "next"));
    }

    #[tokio::test]
    async fn test_rolled_back_activation_discarded() {
        let graph = InMemoryProcessGraph::new();

        let mut tx = Transaction::begin();
        graph.activate_flow_node(&mut tx, "proc-1", "next").await.unwrap();
        tx.rollback().await;

        assert!(graph.activations().is_empty());
    }

    #[tokio::test]
    async fn test_failing_node() {
        let graph = InMemoryProcessGraph::new();
        graph.fail_activation_of("next");

        let mut tx = Transaction::begin();
        let err = graph.activate_flow_node(&mut tx, "proc-1", "next").await;
        assert!(err.is_err());
        assert_eq!(tx.synchronization_count(), 0);
    }
}
