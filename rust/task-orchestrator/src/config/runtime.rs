//! Orchestrator-wide tunables not owned by any single `WorkflowConfig` or
//! `TaskConfig`.

use serde::{Deserialize, Serialize};

/// Runtime-level configuration for the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Applied when a task omits its own `timeout`.
    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,

    /// Applied when a task omits its own `retries`.
    #[serde(default = "default_task_retries")]
    pub default_task_retries: u32,

    /// How long a delivered signal is buffered for a waiter that has not
    /// yet registered, per `(workflow_exec_id, signal_name)` pair.
    #[serde(default = "default_signal_retention_secs")]
    pub signal_retention_secs: u64,

    /// Poll interval used by the in-memory state store's
    /// `GetStateForUpdate` while waiting on contention (production stores
    /// use native row/document locks instead of polling).
    #[serde(default = "default_parent_lock_poll_ms")]
    pub parent_lock_poll_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_task_timeout_secs: default_task_timeout_secs(),
            default_task_retries: default_task_retries(),
            signal_retention_secs: default_signal_retention_secs(),
            parent_lock_poll_ms: default_parent_lock_poll_ms(),
        }
    }
}

fn default_task_timeout_secs() -> u64 {
    60
}

fn default_task_retries() -> u32 {
    3
}

fn default_signal_retention_secs() -> u64 {
    300
}

fn default_parent_lock_poll_ms() -> u64 {
    5
}
