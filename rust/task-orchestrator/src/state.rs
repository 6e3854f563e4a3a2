//! Data model entities: task/workflow state, status, and progress.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of lifecycle statuses for a task or workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Waiting,
    Paused,
    Success,
    Failed,
    Canceled,
    TimedOut,
}

impl Status {
    /// Terminal statuses never transition further.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Canceled | Self::TimedOut
        )
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Paused => "paused",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

/// Execution-type discriminant carried on a `TaskState`, collapsed from the
/// richer `TaskConfig` type tag (wait/signal/aggregate/memory all execute as
/// `basic` from the state tree's point of view).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Basic,
    Router,
    Parallel,
    Collection,
    Composite,
}

/// What kind of execution target a task state represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Task,
    Agent,
    Tool,
}

/// Token usage counters, mergeable across attempts/children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageSummary {
    /// Commutative, associative merge of two usage summaries.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens + other.prompt_tokens,
            completion_tokens: self.completion_tokens + other.completion_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
        }
    }
}

/// A task's execution state, persisted by the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub task_exec_id: String,
    pub task_id: String,
    pub workflow_exec_id: String,
    pub workflow_id: String,
    pub component: Component,
    pub execution_type: ExecutionType,
    pub status: Status,
    pub parent_state_id: Option<String>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub usage: Vec<UsageSummary>,
}

impl TaskState {
    #[must_use]
    pub fn new(
        task_exec_id: impl Into<String>,
        task_id: impl Into<String>,
        workflow_exec_id: impl Into<String>,
        workflow_id: impl Into<String>,
        component: Component,
        execution_type: ExecutionType,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_exec_id: task_exec_id.into(),
            task_id: task_id.into(),
            workflow_exec_id: workflow_exec_id.into(),
            workflow_id: workflow_id.into(),
            component,
            execution_type,
            status: Status::Pending,
            parent_state_id: None,
            input: None,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
            usage: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent_state_id: impl Into<String>) -> Self {
        self.parent_state_id = Some(parent_state_id.into());
        self
    }

    pub fn transition(&mut self, status: Status) {
        debug_assert!(
            !self.status.is_terminal(),
            "transition attempted out of terminal status {:?}",
            self.status
        );
        self.status = status;
        self.updated_at = Utc::now();
    }

    #[must_use]
    pub fn merged_usage(&self) -> UsageSummary {
        self.usage
            .iter()
            .copied()
            .fold(UsageSummary::default(), UsageSummary::merge)
    }
}

/// A structured, user-safe task error. Stack traces and internal IDs are
/// logged, never placed in `message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: HashMap<String, Value>,
}

impl TaskError {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: HashMap::new(),
        }
    }
}

/// Per-status counts derived for a parent's children, plus summary rates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub total_children: usize,
    pub pending: usize,
    pub running: usize,
    pub success: usize,
    pub failed: usize,
    pub canceled: usize,
    pub timed_out: usize,
}

impl ProgressInfo {
    #[must_use]
    pub fn from_children(children: &[TaskState]) -> Self {
        let mut info = Self {
            total_children: children.len(),
            ..Self::default()
        };
        for child in children {
            match child.status {
                Status::Pending => info.pending += 1,
                Status::Running | Status::Waiting | Status::Paused => info.running += 1,
                Status::Success => info.success += 1,
                Status::Failed => info.failed += 1,
                Status::Canceled => info.canceled += 1,
                Status::TimedOut => info.timed_out += 1,
            }
        }
        info
    }

    #[must_use]
    pub fn terminal_count(&self) -> usize {
        self.success + self.failed + self.canceled + self.timed_out
    }

    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.terminal_count() == self.total_children
    }

    #[must_use]
    pub fn completion_rate(&self) -> f64 {
        if self.total_children == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss, reason = "progress ratios are display-only")]
        {
            self.terminal_count() as f64 / self.total_children as f64
        }
    }

    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.total_children == 0 {
            return 0.0;
        }
        let failures = self.failed + self.canceled + self.timed_out;
        #[allow(clippy::cast_precision_loss, reason = "progress ratios are display-only")]
        {
            failures as f64 / self.total_children as f64
        }
    }
}

/// A child's normalized outcome, handed to a parent's response handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskResponse {
    pub task_id: String,
    pub output: Option<Value>,
    pub error: Option<TaskError>,
    pub status: Status,
    pub state: TaskState,
}

/// Workflow-level execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_exec_id: String,
    pub workflow_id: String,
    pub status: Status,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<TaskError>,
    /// Successful, terminal child states visible to downstream templates,
    /// keyed by task id. Monotonic: entries are added, never removed.
    pub tasks: HashMap<String, TaskStateView>,
}

impl WorkflowState {
    #[must_use]
    pub fn new(
        workflow_exec_id: impl Into<String>,
        workflow_id: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            workflow_exec_id: workflow_exec_id.into(),
            workflow_id: workflow_id.into(),
            status: Status::Pending,
            input,
            output: None,
            error: None,
            tasks: HashMap::new(),
        }
    }

    /// Record a child's successful, normalized output. Only called for
    /// children whose status is `success`.
    pub fn record_success(&mut self, task_id: impl Into<String>, view: TaskStateView) {
        self.tasks.insert(task_id.into(), view);
    }
}

/// The rendered view of a child task exposed to template contexts: output,
/// status, and (for routers) the chosen route.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStateView {
    pub output: Option<Value>,
    pub status: Option<Status>,
    pub route_taken: Option<String>,
}
