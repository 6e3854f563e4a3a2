//! Response handlers (C5): convert a completed child's `TaskState` into a
//! `SubtaskResponse`, resolve the router's next-task override, and (for
//! parent types, invoked from the parent-status protocol in `parent_status`)
//! compute the aggregated output plus deferred-`outputs` rendering.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::config::task::{Strategy, TaskConfig};
use crate::config::workflow::WorkflowConfig;
use crate::error::{OrchestratorError, Result};
use crate::state::{Status, SubtaskResponse, TaskError, TaskState};
use crate::template::TemplateEngine;

/// Result of handling a task's completion: the normalized response plus,
/// for routers, the cloned+inherited target task to dispatch next instead
/// of following `on_success`.
pub struct HandledResponse {
    pub response: SubtaskResponse,
    pub next_task_override: Option<TaskConfig>,
}

/// Basic / memory / signal / wait all pass `{output, error, status}`
/// through unchanged; wait's output is already the received signal payload
/// or a `{"timeout": true}` marker set by the coordinator.
#[must_use]
pub fn handle_passthrough(task_config: &TaskConfig, state: &TaskState) -> HandledResponse {
    HandledResponse {
        response: SubtaskResponse {
            task_id: task_config.id().to_string(),
            output: state.output.clone(),
            error: state.error.clone(),
            status: state.status,
            state: state.clone(),
        },
        next_task_override: None,
    }
}

/// Router: output must be non-nil and carry a string `route_taken`; the
/// named target is cloned from the workflow config and route-inherited
/// (§4.5: target wins conflicts, router fills gaps).
pub fn handle_router(
    task_config: &TaskConfig,
    state: &TaskState,
    workflow_config: &WorkflowConfig,
) -> Result<HandledResponse> {
    let task_id = task_config.id().to_string();
    let output = state.output.as_ref().ok_or_else(|| OrchestratorError::ConfigShape {
        task_id: task_id.clone(),
        reason: "router produced no output".to_string(),
    })?;
    let route = output
        .get("route_taken")
        .and_then(Value::as_str)
        .ok_or_else(|| OrchestratorError::RouteUnknown {
            task_id: task_id.clone(),
            route: "<missing>".to_string(),
        })?;

    let target = workflow_config
        .find_task(route)
        .ok_or_else(|| OrchestratorError::RouteUnknown {
            task_id: task_id.clone(),
            route: route.to_string(),
        })?;

    let mut target_clone = target.deep_clone();
    target_clone.inherit_from(task_config);

    Ok(HandledResponse {
        response: SubtaskResponse {
            task_id,
            output: state.output.clone(),
            error: state.error.clone(),
            status: state.status,
            state: state.clone(),
        },
        next_task_override: Some(target_clone),
    })
}

/// Evaluate an `aggregate` task's `outputs` templates against the current
/// (non-deferred) workflow context. No children involved.
pub fn evaluate_aggregate(
    engine: &dyn TemplateEngine,
    outputs: &HashMap<String, Value>,
    vars: &Value,
) -> Result<Value> {
    let map: Map<String, Value> = outputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    engine.parse_any(&Value::Object(map), vars)
}

/// Aggregated output + (if the parent is non-success) propagated error for
/// a terminal parallel/collection/composite parent. Called from the
/// parent-status updater (C7) once the strategy has decided `final_status`.
pub struct ParentAggregation {
    pub output: Value,
    pub error: Option<TaskError>,
}

pub fn aggregate_children(
    engine: &dyn TemplateEngine,
    strategy: Strategy,
    final_status: Status,
    outputs_template: Option<&HashMap<String, Value>>,
    children: &[TaskState],
) -> Result<ParentAggregation> {
    let output = match outputs_template {
        Some(template) if !template.is_empty() => {
            let ctx = children_context(children);
            let map: Map<String, Value> = template.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            engine.parse_any(&Value::Object(map), &ctx)?
        }
        _ => default_aggregate_output(strategy, children),
    };

    let error = if final_status.is_terminal() && !final_status.is_success() {
        Some(propagate_error(strategy, children))
    } else {
        None
    };

    Ok(ParentAggregation { output, error })
}

/// Local `{ tasks: { task_id: { output, status, error } } }` scope used
/// while rendering a parent's deferred `outputs` — distinct from the
/// workflow-level `tasks` bag, which only ever holds top-level siblings.
fn children_context(children: &[TaskState]) -> Value {
    let mut tasks_map = Map::with_capacity(children.len());
    for child in children {
        tasks_map.insert(
            child.task_id.clone(),
            serde_json::json!({
                "output": child.output,
                "status": child.status.to_string(),
                "error": child.error.as_ref().map(|e| serde_json::json!({
                    "code": e.code,
                    "message": e.message,
                })),
            }),
        );
    }
    serde_json::json!({ "tasks": Value::Object(tasks_map) })
}

fn default_aggregate_output(strategy: Strategy, children: &[TaskState]) -> Value {
    let mut children_map = Map::with_capacity(children.len());
    let mut success = 0usize;
    let mut failed = 0usize;
    let mut canceled = 0usize;
    let mut timed_out = 0usize;
    for child in children {
        children_map.insert(child.task_id.clone(), child.output.clone().unwrap_or(Value::Null));
        match child.status {
            Status::Success => success += 1,
            Status::Failed => failed += 1,
            Status::Canceled => canceled += 1,
            Status::TimedOut => timed_out += 1,
            _ => {}
        }
    }
    serde_json::json!({
        "children": Value::Object(children_map),
        "strategy": strategy_name(strategy),
        "summary": {
            "total": children.len(),
            "success": success,
            "failed": failed,
            "canceled": canceled,
            "timed_out": timed_out,
        },
    })
}

/// First failing child's error wins under `fail_fast` and `race`
/// (determinism per spec §7); other strategies get a summary error.
fn propagate_error(strategy: Strategy, children: &[TaskState]) -> TaskError {
    let non_success = children
        .iter()
        .filter(|c| c.status.is_terminal() && !c.status.is_success());

    if matches!(strategy, Strategy::FailFast | Strategy::Race) {
        if let Some(first) = non_success.min_by_key(|c| c.updated_at) {
            if let Some(err) = &first.error {
                return err.clone();
            }
            return TaskError::new("child_failed", format!("child '{}' did not succeed", first.task_id));
        }
    }

    let failed_ids: Vec<&str> = non_success.map(|c| c.task_id.as_str()).collect();
    TaskError::new(
        "children_failed",
        format!("{} of the parent's children did not succeed: {}", failed_ids.len(), failed_ids.join(", ")),
    )
}

fn strategy_name(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::WaitAll => "wait_all",
        Strategy::FailFast => "fail_fast",
        Strategy::BestEffort => "best_effort",
        Strategy::Race => "race",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::task::{BasicTarget, CommonFields};
    use crate::state::{Component, ExecutionType};
    use serde_json::json;

    fn child(id: &str, status: Status, output: Option<Value>) -> TaskState {
        let mut s = TaskState::new(id, id, "wexec", "wf", Component::Task, ExecutionType::Basic);
        s.status = status;
        s.output = output;
        s
    }

    #[test]
    fn deferred_outputs_render_against_children_context() {
        let engine = crate::template::HandlebarsEngine::new();
        let children = vec![
            child("a", Status::Success, Some(json!({"n": 1}))),
            child("b", Status::Success, Some(json!({"n": 2}))),
            child("c", Status::Success, Some(json!({"n": 3}))),
        ];
        let mut outputs = HashMap::new();
        outputs.insert(
            "sum".to_string(),
            json!("{{ add tasks.a.output.n tasks.b.output.n tasks.c.output.n }}"),
        );
        let agg = aggregate_children(&engine, Strategy::WaitAll, Status::Success, Some(&outputs), &children).unwrap();
        assert_eq!(agg.output["sum"], json!("6"));
        assert!(agg.error.is_none());
    }

    #[test]
    fn fail_fast_preserves_first_failing_child_error() {
        let engine = crate::template::HandlebarsEngine::new();
        let mut b = child("b", Status::Failed, None);
        b.error = Some(TaskError::new("runtime", "boom"));
        let children = vec![child("a", Status::Canceled, None), b, child("c", Status::Canceled, None)];
        let agg = aggregate_children(&engine, Strategy::FailFast, Status::Failed, None, &children).unwrap();
        let err = agg.error.unwrap();
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn router_validates_route_taken_and_inherits() {
        let router_common = {
            let mut c = CommonFields::default();
            c.timeout = Some(10);
            c
        };
        let router_cfg = TaskConfig::Router {
            id: "r1".into(),
            condition: "{{ 1 }}".into(),
            routes: HashMap::new(),
            common: router_common,
        };
        let approve_cfg = TaskConfig::Basic {
            id: "approve".into(),
            target: BasicTarget::Tool { tool: "noop".into(), params: None },
            common: CommonFields::default(),
        };
        let wf_cfg = WorkflowConfig {
            id: "wf1".into(),
            tasks: vec![approve_cfg],
            input_schema: None,
            env: HashMap::new(),
            outputs: None,
        };
        let mut state = TaskState::new("e1", "r1", "wexec", "wf1", Component::Task, ExecutionType::Router);
        state.status = Status::Success;
        state.output = Some(json!({"route_taken": "approve"}));

        let handled = handle_router(&router_cfg, &state, &wf_cfg).unwrap();
        let next = handled.next_task_override.unwrap();
        assert_eq!(next.common().timeout, Some(10));
        assert_eq!(next.id(), "approve");
    }

    #[test]
    fn router_rejects_unknown_route() {
        let router_cfg = TaskConfig::Router {
            id: "r1".into(),
            condition: "{{ 1 }}".into(),
            routes: HashMap::new(),
            common: CommonFields::default(),
        };
        let wf_cfg = WorkflowConfig {
            id: "wf1".into(),
            tasks: vec![],
            input_schema: None,
            env: HashMap::new(),
            outputs: None,
        };
        let mut state = TaskState::new("e1", "r1", "wexec", "wf1", Component::Task, ExecutionType::Router);
        state.output = Some(json!({"route_taken": "nonexistent"}));
        let err = handle_router(&router_cfg, &state, &wf_cfg).unwrap_err();
        assert_eq!(err.code(), "route_unknown");
    }
}
