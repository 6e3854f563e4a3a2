//! Type-specific normalizers (C4): template expansion, environment
//! merging, and runtime-only-reference preservation, applied per task
//! type before dispatch.
//!
//! Mirrors the registry style spec §9 calls for ("type → normalizer"):
//! one function per type, selected by matching on the `TaskConfig`
//! discriminant, the same pattern `config::task::TaskConfig`'s `id()`/
//! `common()` accessors already use.

use std::collections::HashMap;

use serde_json::Value;

use crate::config::task::{BasicTarget, CommonFields, TaskConfig};
use crate::config::workflow::WorkflowConfig;
use crate::context::TemplateContext;
use crate::error::{OrchestratorError, Result};
use crate::state::WorkflowState;
use crate::template::{references_tasks, TemplateEngine};

/// Ambient data a normalizer needs beyond the template context itself.
pub struct NormalizationContext<'a> {
    pub variables: &'a TemplateContext,
    pub workflow_config: &'a WorkflowConfig,
    pub workflow_state: &'a WorkflowState,
    pub parent_env: Option<&'a HashMap<String, String>>,
}

/// Normalize `task_config` in place. Shared base behavior (spec §4.4):
/// convert to map, template everything except `outputs` (deferred),
/// convert back, re-attach any runtime-only `with` references that are
/// not yet resolvable, then merge the parent's env in (child wins).
pub fn normalize(
    engine: &dyn TemplateEngine,
    task_config: &mut TaskConfig,
    nctx: &NormalizationContext<'_>,
) -> Result<()> {
    let runtime_only_with = extract_unresolved_with(task_config, nctx);

    let map = task_config.as_map()?;
    let vars = nctx.variables.as_value();
    let rendered = engine.parse_map_with_filter(&map, &vars, &|key| key == "outputs")?;
    let Value::Object(rendered_map) = rendered else {
        return Err(OrchestratorError::ConfigShape {
            task_id: task_config.id().to_string(),
            reason: "normalized task did not render to an object".to_string(),
        });
    };
    *task_config = TaskConfig::from_map(rendered_map)?;

    if let Some(with) = runtime_only_with {
        task_config.common_mut().with = Some(with);
    }

    let merged_env = task_config.merge_env_from(nctx.parent_env);
    task_config.common_mut().env = Some(merged_env);

    type_specific(engine, task_config, nctx)?;
    Ok(())
}

/// If `with` contains a template referencing `.tasks.*` for a sibling that
/// has not yet completed (absent from `workflow_state.tasks`), return it
/// unrendered so it can be re-attached after the generic template pass
/// clobbers it with an unresolved/garbage render.
pub(crate) fn extract_unresolved_with(task_config: &TaskConfig, nctx: &NormalizationContext<'_>) -> Option<Value> {
    let with = task_config.common().with.as_ref()?;
    if !references_tasks(with) {
        return None;
    }
    let tasks_known = nctx
        .variables
        .get("tasks")
        .and_then(Value::as_object)
        .is_some_and(|m| !m.is_empty());
    if tasks_known {
        None
    } else {
        Some(with.clone())
    }
}

fn type_specific(
    engine: &dyn TemplateEngine,
    task_config: &mut TaskConfig,
    nctx: &NormalizationContext<'_>,
) -> Result<()> {
    let vars = nctx.variables.as_value();
    match task_config {
        TaskConfig::Basic { target, common, .. } => normalize_basic(engine, target, common, &vars),
        TaskConfig::Router { condition, .. } => normalize_router(engine, condition, &vars),
        TaskConfig::Wait { condition, common, id, .. } => {
            normalize_wait(engine, condition, common.timeout, common, id, &vars)
        }
        TaskConfig::Signal { payload, .. } => normalize_signal(engine, payload, &vars),
        TaskConfig::Aggregate { id, common } => normalize_aggregate(id, common),
        TaskConfig::Memory { key, value, .. } => normalize_memory(engine, key, value, &vars),
        // Parallel/composite/collection children are normalized individually
        // by the orchestrator as each is spawned (spec §4.8), not eagerly
        // here — a child's own template context (and, for collection, its
        // `item`/`index` overlay) is only available at spawn time.
        TaskConfig::Parallel { .. } | TaskConfig::Composite { .. } | TaskConfig::Collection { .. } => Ok(()),
    }
}

fn normalize_basic(
    engine: &dyn TemplateEngine,
    target: &mut BasicTarget,
    _common: &mut CommonFields,
    vars: &Value,
) -> Result<()> {
    match target {
        BasicTarget::Agent { settings, .. } => {
            if let Some(s) = settings {
                *s = engine.parse_any(s, vars)?;
            }
        }
        BasicTarget::Tool { params, .. } => {
            if let Some(p) = params {
                *p = engine.parse_any(p, vars)?;
            }
        }
    }
    Ok(())
}

fn normalize_router(engine: &dyn TemplateEngine, condition: &mut String, vars: &Value) -> Result<()> {
    if engine.has_template(condition) {
        // condition is rendered lazily at dispatch time against the live
        // signal/workflow context; here we only validate it parses.
        let _ = engine.parse_any(&Value::String(condition.clone()), vars)?;
    }
    Ok(())
}

fn normalize_wait(
    engine: &dyn TemplateEngine,
    condition: &mut Option<String>,
    timeout: Option<u64>,
    _common: &mut CommonFields,
    id: &str,
    vars: &Value,
) -> Result<()> {
    if condition.is_none() && timeout.is_none() {
        return Err(OrchestratorError::ConfigShape {
            task_id: id.to_string(),
            reason: "wait task requires either 'condition' or 'timeout'".to_string(),
        });
    }
    if let Some(c) = condition {
        if engine.has_template(c) {
            let _ = engine.parse_any(&Value::String(c.clone()), vars)?;
        }
    }
    Ok(())
}

fn normalize_signal(engine: &dyn TemplateEngine, payload: &mut Option<Value>, vars: &Value) -> Result<()> {
    if let Some(p) = payload {
        *p = engine.parse_any(p, vars)?;
    }
    Ok(())
}

fn normalize_aggregate(id: &str, common: &mut CommonFields) -> Result<()> {
    match &common.outputs {
        Some(outputs) if !outputs.is_empty() => Ok(()),
        _ => Err(OrchestratorError::ConfigShape {
            task_id: id.to_string(),
            reason: "aggregate task requires a non-empty 'outputs' map".to_string(),
        }),
    }
}

fn normalize_memory(
    engine: &dyn TemplateEngine,
    key: &mut Option<String>,
    value: &mut Option<Value>,
    vars: &Value,
) -> Result<()> {
    if let Some(k) = key {
        if engine.has_template(k) {
            if let Value::String(rendered) = engine.parse_any(&Value::String(k.clone()), vars)? {
                *k = rendered;
            }
        }
    }
    if let Some(v) = value {
        *v = engine.parse_any(v, vars)?;
    }
    Ok(())
}
