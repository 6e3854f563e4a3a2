//! Typed task configuration: the tagged union of task types plus clone,
//! map conversion, and merge semantics (route inheritance, env merging).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchestratorError, Result};

/// Strategy governing how a parent's status is derived from its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    WaitAll,
    FailFast,
    BestEffort,
    Race,
}

impl Default for Strategy {
    fn default() -> Self {
        Self::WaitAll
    }
}

/// Dispatch mode for collection tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMode {
    Parallel,
    Sequential,
}

impl Default for CollectionMode {
    fn default() -> Self {
        Self::Parallel
    }
}

/// A memory operation for the `memory` task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOperation {
    Read,
    Write,
    Append,
}

/// Either an `on_success`/`on_error` transition target, or none.
pub type Transition = Option<String>;

/// Shared attributes present on every task type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommonFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Transition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Transition,
    #[serde(default)]
    pub r#final: bool,
}

/// Invocation target for a `basic` task: exactly one of agent or tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasicTarget {
    Agent {
        agent: String,
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settings: Option<Value>,
    },
    Tool {
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
}

/// The tagged union of task configurations, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskConfig {
    Basic {
        id: String,
        #[serde(flatten)]
        target: BasicTarget,
        #[serde(flatten)]
        common: CommonFields,
    },
    Router {
        id: String,
        condition: String,
        routes: HashMap<String, String>,
        #[serde(flatten)]
        common: CommonFields,
    },
    Parallel {
        id: String,
        tasks: Vec<TaskConfig>,
        #[serde(default)]
        strategy: Strategy,
        #[serde(default)]
        max_workers: u32,
        #[serde(flatten)]
        common: CommonFields,
    },
    Collection {
        id: String,
        items: String,
        task: Box<TaskConfig>,
        #[serde(default = "default_item_var")]
        item_var: String,
        #[serde(default = "default_index_var")]
        index_var: String,
        #[serde(default)]
        batch: u32,
        #[serde(default)]
        mode: CollectionMode,
        #[serde(default)]
        strategy: Strategy,
        #[serde(flatten)]
        common: CommonFields,
    },
    Composite {
        id: String,
        tasks: Vec<TaskConfig>,
        #[serde(flatten)]
        common: CommonFields,
    },
    Wait {
        id: String,
        signal_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
        #[serde(flatten)]
        common: CommonFields,
    },
    Signal {
        id: String,
        target_workflow: String,
        signal_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(flatten)]
        common: CommonFields,
    },
    Aggregate {
        id: String,
        #[serde(flatten)]
        common: CommonFields,
    },
    Memory {
        id: String,
        memory_ref: String,
        operation: MemoryOperation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(flatten)]
        common: CommonFields,
    },
}

fn default_item_var() -> String {
    "item".to_string()
}

fn default_index_var() -> String {
    "index".to_string()
}

impl TaskConfig {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Basic { id, .. }
            | Self::Router { id, .. }
            | Self::Parallel { id, .. }
            | Self::Collection { id, .. }
            | Self::Composite { id, .. }
            | Self::Wait { id, .. }
            | Self::Signal { id, .. }
            | Self::Aggregate { id, .. }
            | Self::Memory { id, .. } => id,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Basic { .. } => "basic",
            Self::Router { .. } => "router",
            Self::Parallel { .. } => "parallel",
            Self::Collection { .. } => "collection",
            Self::Composite { .. } => "composite",
            Self::Wait { .. } => "wait",
            Self::Signal { .. } => "signal",
            Self::Aggregate { .. } => "aggregate",
            Self::Memory { .. } => "memory",
        }
    }

    #[must_use]
    pub fn common(&self) -> &CommonFields {
        match self {
            Self::Basic { common, .. }
            | Self::Router { common, .. }
            | Self::Parallel { common, .. }
            | Self::Collection { common, .. }
            | Self::Composite { common, .. }
            | Self::Wait { common, .. }
            | Self::Signal { common, .. }
            | Self::Aggregate { common, .. }
            | Self::Memory { common, .. } => common,
        }
    }

    #[must_use]
    pub fn common_mut(&mut self) -> &mut CommonFields {
        match self {
            Self::Basic { common, .. }
            | Self::Router { common, .. }
            | Self::Parallel { common, .. }
            | Self::Collection { common, .. }
            | Self::Composite { common, .. }
            | Self::Wait { common, .. }
            | Self::Signal { common, .. }
            | Self::Aggregate { common, .. }
            | Self::Memory { common, .. } => common,
        }
    }

    /// Deep copy with no shared mutable state. `serde_json::Value` and
    /// `Vec`/`HashMap` are value types in Rust, so `Clone::clone` already
    /// satisfies this; named for parity with the contract.
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        self.clone()
    }

    /// Stable, field-tagged map representation.
    pub fn as_map(&self) -> Result<serde_json::Map<String, Value>> {
        let value = serde_json::to_value(self)?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(OrchestratorError::ConfigShape {
                task_id: self.id().to_string(),
                reason: format!("expected object, got {other}"),
            }),
        }
    }

    /// Inverse of `as_map`; fails with `ConfigShape` on discriminant
    /// conflicts with type-specific fields.
    pub fn from_map(map: serde_json::Map<String, Value>) -> Result<Self> {
        let id = map
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("<unknown>")
            .to_string();
        serde_json::from_value(Value::Object(map)).map_err(|e| OrchestratorError::ConfigShape {
            task_id: id,
            reason: e.to_string(),
        })
    }

    /// Merge an environment map into this task's `env`, child (self)
    /// overriding parent key-by-key. Neither input is mutated.
    #[must_use]
    pub fn merge_env_from(&self, parent_env: Option<&HashMap<String, String>>) -> HashMap<String, String> {
        merge_env(parent_env, self.common().env.as_ref())
    }

    /// Copy non-conflicting fields (env, retries, timeout, and — for basic
    /// targets — agent/tool overrides) from `source` into `self` where
    /// `self` has no explicit value. Used by the router response handler to
    /// pass context to the route it selected.
    pub fn inherit_from(&mut self, source: &TaskConfig) {
        let source_common = source.common().clone();
        let target_common = self.common_mut();

        if target_common.env.is_none() {
            target_common.env.clone_from(&source_common.env);
        } else if let Some(source_env) = &source_common.env {
            let merged = merge_env(Some(source_env), target_common.env.as_ref());
            target_common.env = Some(merged);
        }
        if target_common.retries.is_none() {
            target_common.retries = source_common.retries;
        }
        if target_common.timeout.is_none() {
            target_common.timeout = source_common.timeout;
        }
    }
}

/// Child-overrides-parent key-by-key env merge. Nil-safe; neither input is
/// mutated.
#[must_use]
pub fn merge_env(
    parent: Option<&HashMap<String, String>>,
    child: Option<&HashMap<String, String>>,
) -> HashMap<String, String> {
    let mut merged = parent.cloned().unwrap_or_default();
    if let Some(child) = child {
        for (k, v) in child {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}
