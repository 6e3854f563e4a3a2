//! Workflow progress/event streaming, mirroring
//! `durable_shannon::worker::{WorkflowEvent, WorkflowHandle::subscribe}`:
//! a `tokio::sync::broadcast` channel per running workflow, fed by the
//! orchestrator loop as each task transitions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::state::{Status, TaskError};

/// A single observable transition in a workflow's lifecycle. Consumers
/// (CLIs, UIs, the desktop app) subscribe via `WorkflowHandle::subscribe`
/// and render these as they arrive; late subscribers only see events from
/// the point they subscribed (broadcast semantics, not a durable log).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow_exec_id: String,
        workflow_id: String,
    },
    TaskStarted {
        workflow_exec_id: String,
        task_exec_id: String,
        task_id: String,
    },
    TaskCompleted {
        workflow_exec_id: String,
        task_exec_id: String,
        task_id: String,
        status: Status,
        output: Option<Value>,
    },
    TaskFailed {
        workflow_exec_id: String,
        task_exec_id: String,
        task_id: String,
        error: TaskError,
    },
    WorkflowPaused {
        workflow_exec_id: String,
    },
    WorkflowResumed {
        workflow_exec_id: String,
    },
    WorkflowCompleted {
        workflow_exec_id: String,
        status: Status,
        output: Option<Value>,
    },
}

impl WorkflowEvent {
    #[must_use]
    pub fn workflow_exec_id(&self) -> &str {
        match self {
            Self::WorkflowStarted { workflow_exec_id, .. }
            | Self::TaskStarted { workflow_exec_id, .. }
            | Self::TaskCompleted { workflow_exec_id, .. }
            | Self::TaskFailed { workflow_exec_id, .. }
            | Self::WorkflowPaused { workflow_exec_id }
            | Self::WorkflowResumed { workflow_exec_id }
            | Self::WorkflowCompleted { workflow_exec_id, .. } => workflow_exec_id,
        }
    }
}

/// Default channel capacity: enough to absorb a burst of sibling task
/// completions under a wide `parallel`/`collection` parent without
/// blocking the publisher; slow subscribers drop the oldest events
/// (`RecvError::Lagged`) rather than stalling the orchestrator.
const DEFAULT_CAPACITY: usize = 256;

/// Publishes `WorkflowEvent`s for one workflow instance and hands out
/// subscriptions. Cloning is cheap (`broadcast::Sender` is an `Arc`
/// internally); the orchestrator keeps one per in-flight workflow.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventPublisher {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe for events from this point forward.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Errs only when there are zero subscribers, which
    /// is a normal, ignorable condition (nobody is watching right now).
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.tx.send(event);
    }
}
