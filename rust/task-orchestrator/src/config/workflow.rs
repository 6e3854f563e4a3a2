//! Workflow-level configuration: an ordered task sequence plus shared
//! environment and optional output templates.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::task::TaskConfig;
use crate::error::{OrchestratorError, Result};

/// A declared workflow: `id` and an ordered sequence of `TaskConfig`.
/// Triggers are out of scope for the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub id: String,
    pub tasks: Vec<TaskConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<HashMap<String, Value>>,
}

impl WorkflowConfig {
    pub fn from_map(map: serde_json::Map<String, Value>) -> Result<Self> {
        if !map.contains_key("id") || !map.contains_key("tasks") {
            return Err(OrchestratorError::ConfigShape {
                task_id: "<workflow>".to_string(),
                reason: "workflow config requires 'id' and 'tasks'".to_string(),
            });
        }
        serde_json::from_value(Value::Object(map)).map_err(|e| OrchestratorError::ConfigShape {
            task_id: "<workflow>".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn as_map(&self) -> Result<serde_json::Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(OrchestratorError::ConfigShape {
                task_id: self.id.clone(),
                reason: format!("expected object, got {other}"),
            }),
        }
    }

    /// Look up a task by id anywhere in the top-level sequence. Embedded
    /// tasks of parallel/collection/composite parents are not indexed here;
    /// the orchestrator resolves those via the parent's own child list.
    #[must_use]
    pub fn find_task(&self, task_id: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|t| t.id() == task_id)
    }

    #[must_use]
    pub fn first_task(&self) -> Option<&TaskConfig> {
        self.tasks.first()
    }
}

#[cfg(test)]
mod tests {
    use super::super::task::{BasicTarget, CommonFields, TaskConfig};
    use super::*;

    fn sample() -> WorkflowConfig {
        WorkflowConfig {
            id: "wf1".into(),
            tasks: vec![TaskConfig::Basic {
                id: "t1".into(),
                target: BasicTarget::Tool {
                    tool: "calc".into(),
                    params: None,
                },
                common: CommonFields::default(),
            }],
            input_schema: None,
            env: HashMap::new(),
            outputs: None,
        }
    }

    #[test]
    fn finds_task_by_id() {
        let wf = sample();
        assert!(wf.find_task("t1").is_some());
        assert!(wf.find_task("missing").is_none());
    }

    #[test]
    fn round_trips_through_map() {
        let wf = sample();
        let map = wf.as_map().unwrap();
        let back = WorkflowConfig::from_map(map).unwrap();
        assert_eq!(back.id, "wf1");
    }

    #[test]
    fn rejects_missing_required_fields() {
        let map = serde_json::Map::new();
        let err = WorkflowConfig::from_map(map).unwrap_err();
        assert_eq!(err.code(), "config_shape");
    }
}
