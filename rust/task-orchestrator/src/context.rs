//! Context builder (C3): assembles the variables map passed to the
//! template engine, keyed by `workflow`, `tasks`, `task`, and, for
//! iteration scopes, `item`/`index` (plus user-defined aliases).

use serde_json::{Map, Value};

use crate::config::task::TaskConfig;
use crate::config::workflow::WorkflowConfig;
use crate::error::{OrchestratorError, Result};
use crate::state::{TaskState, WorkflowState};

/// The variable bag handed to `TemplateEngine::parse_any` and friends.
/// Wraps a plain JSON object so it composes with any template backend.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    vars: Map<String, Value>,
}

impl TemplateContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn as_value(&self) -> Value {
        Value::Object(self.vars.clone())
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.vars.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Layer additional key/value pairs over the existing context, used to
    /// bind `item`/`index` aliases for collection children. Later keys win.
    pub fn with_overlay(&self, overlay: &Map<String, Value>) -> Self {
        let mut merged = self.vars.clone();
        for (k, v) in overlay {
            merged.insert(k.clone(), v.clone());
        }
        Self { vars: merged }
    }
}

/// Builds and validates the template context for a given task within a
/// workflow instance.
#[derive(Debug, Default)]
pub struct ContextBuilder;

impl ContextBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Assemble `{workflow, tasks, task}` for `task_config` within
    /// `workflow_state`/`workflow_config`.
    pub fn build_context(
        &self,
        workflow_state: &WorkflowState,
        workflow_config: &WorkflowConfig,
        task_config: &TaskConfig,
    ) -> Result<TemplateContext> {
        let mut ctx = TemplateContext::new();

        ctx.set(
            "workflow",
            serde_json::json!({
                "id": workflow_state.workflow_id,
                "exec_id": workflow_state.workflow_exec_id,
                "input": workflow_state.input,
                "status": workflow_state.status.to_string(),
                "env": workflow_config.env,
            }),
        );

        let mut tasks_map = Map::with_capacity(workflow_state.tasks.len());
        for (task_id, view) in &workflow_state.tasks {
            tasks_map.insert(
                task_id.clone(),
                serde_json::json!({
                    "output": view.output,
                    "status": view.status.map(|s| s.to_string()),
                    "route_taken": view.route_taken,
                }),
            );
        }
        ctx.set("tasks", Value::Object(tasks_map));

        ctx.set(
            "task",
            serde_json::json!({
                "id": task_config.id(),
                "type": task_config.type_name(),
            }),
        );

        self.validate_context(&ctx)?;
        Ok(ctx)
    }

    /// Add `task.status` (and related fields) once a task state exists,
    /// e.g. when re-rendering a condition against a just-arrived signal.
    pub fn enrich_context(&self, ctx: &mut TemplateContext, task_state: &TaskState) {
        let mut task = ctx.get("task").cloned().unwrap_or_else(|| serde_json::json!({}));
        task["status"] = Value::String(task_state.status.to_string());
        if let Some(output) = &task_state.output {
            task["output"] = output.clone();
        }
        if let Some(error) = &task_state.error {
            task["error"] = serde_json::json!({ "code": error.code, "message": error.message });
        }
        ctx.set("task", task);
    }

    /// Reject an empty/nil context; a context must at least carry
    /// `workflow` and `task`.
    pub fn validate_context(&self, ctx: &TemplateContext) -> Result<()> {
        if ctx.get("workflow").is_none() || ctx.get("task").is_none() {
            return Err(OrchestratorError::Template(
                "context missing required 'workflow'/'task' keys".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::task::{BasicTarget, CommonFields};
    use serde_json::json;
    use std::collections::HashMap;

    fn sample_workflow() -> (WorkflowConfig, WorkflowState) {
        let cfg = WorkflowConfig {
            id: "wf1".into(),
            tasks: vec![],
            input_schema: None,
            env: HashMap::new(),
            outputs: None,
        };
        let state = WorkflowState::new("exec1", "wf1", json!({"x": 1}));
        (cfg, state)
    }

    fn sample_task() -> TaskConfig {
        TaskConfig::Basic {
            id: "t1".into(),
            target: BasicTarget::Tool {
                tool: "calc".into(),
                params: None,
            },
            common: CommonFields::default(),
        }
    }

    #[test]
    fn builds_workflow_tasks_task_keys() {
        let (wf_cfg, wf_state) = sample_workflow();
        let task_cfg = sample_task();
        let builder = ContextBuilder::new();
        let ctx = builder.build_context(&wf_state, &wf_cfg, &task_cfg).unwrap();
        assert_eq!(ctx.get("workflow").unwrap()["id"], json!("wf1"));
        assert_eq!(ctx.get("task").unwrap()["id"], json!("t1"));
        assert!(ctx.get("tasks").unwrap().as_object().unwrap().is_empty());
    }

    #[test]
    fn pending_children_are_absent_from_tasks() {
        let (wf_cfg, mut wf_state) = sample_workflow();
        // Only success children get recorded; a pending sibling never
        // appears because the orchestrator only calls `record_success`.
        wf_state.record_success(
            "a",
            crate::state::TaskStateView {
                output: Some(json!({"n": 1})),
                status: Some(crate::state::Status::Success),
                route_taken: None,
            },
        );
        let task_cfg = sample_task();
        let ctx = ContextBuilder::new().build_context(&wf_state, &wf_cfg, &task_cfg).unwrap();
        let tasks = ctx.get("tasks").unwrap().as_object().unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(tasks.contains_key("a"));
    }

    #[test]
    fn validate_context_rejects_missing_keys() {
        let builder = ContextBuilder::new();
        let empty = TemplateContext::new();
        assert!(builder.validate_context(&empty).is_err());
    }

    #[test]
    fn with_overlay_layers_item_index() {
        let ctx = TemplateContext::new();
        let mut overlay = Map::new();
        overlay.insert("item".to_string(), json!("a"));
        overlay.insert("index".to_string(), json!(0));
        let layered = ctx.with_overlay(&overlay);
        assert_eq!(layered.get("item").unwrap(), &json!("a"));
    }
}
