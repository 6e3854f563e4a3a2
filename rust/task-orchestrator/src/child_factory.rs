//! Child factory (C8): creates child task states for parallel/collection/
//! composite parents, including collection's item-sequence expansion
//! (strings, arrays, JSON numbers, and `X..Y` range expressions).

use num_bigint::BigInt;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::task::TaskConfig;
use crate::context::TemplateContext;
use crate::error::{OrchestratorError, Result};
use crate::normalize::{extract_unresolved_with, NormalizationContext};
use crate::state::{Component, ExecutionType, TaskState};
use crate::template::TemplateEngine;

/// A freshly-minted child: its (already normalized, for collection:
/// per-item-expanded) config plus the `TaskState` to persist before
/// dispatch.
pub struct SpawnedChild {
    pub config: TaskConfig,
    pub state: TaskState,
}

#[must_use]
pub fn execution_type_for(cfg: &TaskConfig) -> ExecutionType {
    match cfg {
        TaskConfig::Router { .. } => ExecutionType::Router,
        TaskConfig::Parallel { .. } => ExecutionType::Parallel,
        TaskConfig::Collection { .. } => ExecutionType::Collection,
        TaskConfig::Composite { .. } => ExecutionType::Composite,
        TaskConfig::Basic { .. }
        | TaskConfig::Wait { .. }
        | TaskConfig::Signal { .. }
        | TaskConfig::Aggregate { .. }
        | TaskConfig::Memory { .. } => ExecutionType::Basic,
    }
}

#[must_use]
pub fn component_for(cfg: &TaskConfig) -> Component {
    match cfg {
        TaskConfig::Basic {
            target: crate::config::task::BasicTarget::Agent { .. },
            ..
        } => Component::Agent,
        TaskConfig::Basic {
            target: crate::config::task::BasicTarget::Tool { .. },
            ..
        } => Component::Tool,
        _ => Component::Task,
    }
}

fn fresh_state(cfg: &TaskConfig, parent: &TaskState) -> TaskState {
    TaskState::new(
        Uuid::new_v4().to_string(),
        cfg.id(),
        parent.workflow_exec_id.clone(),
        parent.workflow_id.clone(),
        component_for(cfg),
        execution_type_for(cfg),
    )
    .with_parent(parent.task_exec_id.clone())
}

/// Parallel/composite: clone each embedded task config verbatim and
/// assign it a fresh state. Both share this factory per spec §4.8.
#[must_use]
pub fn spawn_static_children(tasks: &[TaskConfig], parent: &TaskState) -> Vec<SpawnedChild> {
    tasks
        .iter()
        .map(|cfg| {
            let cfg = cfg.deep_clone();
            let state = fresh_state(&cfg, parent);
            SpawnedChild { config: cfg, state }
        })
        .collect()
}

/// Collection: evaluate `items` against the parent-scope context, expand
/// to a concrete sequence, then for each item evaluate `task` against a
/// context layering `item`/`index` (or the configured aliases) to produce
/// one concrete child config per item.
pub fn spawn_collection_children(
    engine: &dyn TemplateEngine,
    collection_cfg: &TaskConfig,
    parent: &TaskState,
    base_ctx: &TemplateContext,
    nctx: &NormalizationContext<'_>,
) -> Result<Vec<SpawnedChild>> {
    let TaskConfig::Collection {
        items,
        task,
        item_var,
        index_var,
        ..
    } = collection_cfg
    else {
        return Err(OrchestratorError::ConfigShape {
            task_id: collection_cfg.id().to_string(),
            reason: "spawn_collection_children called on a non-collection task".to_string(),
        });
    };

    let rendered_items = engine.parse_with_json_handling(&Value::String(items.clone()), &base_ctx.as_value())?;
    let sequence = expand_items(&rendered_items).map_err(|reason| OrchestratorError::ChildValidation {
        task_id: collection_cfg.id().to_string(),
        reason,
    })?;

    let mut children = Vec::with_capacity(sequence.len());
    for (index, item) in sequence.into_iter().enumerate() {
        let mut overlay = Map::new();
        overlay.insert(item_var.clone(), item);
        #[allow(clippy::cast_possible_wrap, reason = "index fits usize well under i64 in practice")]
        overlay.insert(index_var.clone(), Value::Number((index as i64).into()));
        let item_ctx = base_ctx.with_overlay(&overlay);

        let task_map = task.as_map()?;
        let unresolved_with = extract_unresolved_with(task, nctx);
        let rendered = engine.parse_map_with_filter(&task_map, &item_ctx.as_value(), &|k| k == "outputs")?;
        let Value::Object(rendered_map) = rendered else {
            return Err(OrchestratorError::ChildValidation {
                task_id: collection_cfg.id().to_string(),
                reason: "per-item task template did not render to an object".to_string(),
            });
        };
        let mut child_cfg = TaskConfig::from_map(rendered_map)?;
        if let Some(with) = unresolved_with {
            child_cfg.common_mut().with = Some(with);
        }
        // Each item gets a distinct id so siblings don't collide in the
        // parent's child list; the base template's id (if any) becomes a
        // prefix.
        child_cfg = retag_id(child_cfg, index);

        let state = fresh_state(&child_cfg, parent);
        children.push(SpawnedChild { config: child_cfg, state });
    }
    Ok(children)
}

fn retag_id(cfg: TaskConfig, index: usize) -> TaskConfig {
    let suffix = format!("#{index}");
    match cfg {
        TaskConfig::Basic { id, target, common } => TaskConfig::Basic { id: id + &suffix, target, common },
        TaskConfig::Router { id, condition, routes, common } => {
            TaskConfig::Router { id: id + &suffix, condition, routes, common }
        }
        TaskConfig::Parallel { id, tasks, strategy, max_workers, common } => {
            TaskConfig::Parallel { id: id + &suffix, tasks, strategy, max_workers, common }
        }
        TaskConfig::Collection { id, items, task, item_var, index_var, batch, mode, strategy, common } => {
            TaskConfig::Collection {
                id: id + &suffix,
                items,
                task,
                item_var,
                index_var,
                batch,
                mode,
                strategy,
                common,
            }
        }
        TaskConfig::Composite { id, tasks, common } => TaskConfig::Composite { id: id + &suffix, tasks, common },
        TaskConfig::Wait { id, signal_name, condition, common } => {
            TaskConfig::Wait { id: id + &suffix, signal_name, condition, common }
        }
        TaskConfig::Signal { id, target_workflow, signal_name, payload, common } => TaskConfig::Signal {
            id: id + &suffix,
            target_workflow,
            signal_name,
            payload,
            common,
        },
        TaskConfig::Aggregate { id, common } => TaskConfig::Aggregate { id: id + &suffix, common },
        TaskConfig::Memory { id, memory_ref, operation, key, value, common } => TaskConfig::Memory {
            id: id + &suffix,
            memory_ref,
            operation,
            key,
            value,
            common,
        },
    }
}

/// Unicode "script" bucket used only to reject cross-script ranges like
/// `"a..α"`; coarse on purpose (spec only requires rejecting mixed-script
/// ranges, not full Unicode script segmentation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Latin,
    Greek,
    Other,
}

fn script_of(c: char) -> Script {
    if c.is_ascii_alphabetic() {
        Script::Latin
    } else if ('\u{0370}'..='\u{03FF}').contains(&c) {
        Script::Greek
    } else {
        Script::Other
    }
}

/// Expand a rendered `items` value into a concrete ordered sequence,
/// supporting strings (single-item, or `X..Y` numeric/char ranges), JSON
/// arrays (elements preserved as-is), and JSON numbers (treated as a
/// single-element sequence).
pub fn expand_items(value: &Value) -> std::result::Result<Vec<Value>, String> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::String(s) => expand_string_items(s),
        Value::Number(_) => Ok(vec![value.clone()]),
        other => Err(format!("collection 'items' must render to a string, array, or number; got {other}")),
    }
}

fn expand_string_items(s: &str) -> std::result::Result<Vec<Value>, String> {
    if let Some((lhs, rhs)) = split_range(s) {
        return expand_range(lhs, rhs);
    }
    Ok(vec![Value::String(s.to_string())])
}

fn split_range(s: &str) -> Option<(&str, &str)> {
    s.split_once("..").filter(|(l, r)| !l.is_empty() && !r.is_empty())
}

fn expand_range(lhs: &str, rhs: &str) -> std::result::Result<Vec<Value>, String> {
    if let (Ok(start), Ok(end)) = (lhs.parse::<BigInt>(), rhs.parse::<BigInt>()) {
        return Ok(numeric_range(&start, &end).into_iter().map(bigint_to_value).collect());
    }

    let lhs_chars: Vec<char> = lhs.chars().collect();
    let rhs_chars: Vec<char> = rhs.chars().collect();
    if lhs_chars.len() == 1 && rhs_chars.len() == 1 {
        let (a, b) = (lhs_chars[0], rhs_chars[0]);
        if script_of(a) != script_of(b) {
            return Err(format!("mixed-script character range '{lhs}..{rhs}' is rejected"));
        }
        return Ok(char_range(a, b).into_iter().map(|c| Value::String(c.to_string())).collect());
    }

    Err(format!("'{lhs}..{rhs}' is neither a numeric nor a single-character range"))
}

fn numeric_range(start: &BigInt, end: &BigInt) -> Vec<BigInt> {
    let one = BigInt::from(1);
    let mut out = Vec::new();
    if start <= end {
        let mut cur = start.clone();
        while &cur <= end {
            out.push(cur.clone());
            cur += &one;
        }
    } else {
        let mut cur = start.clone();
        while &cur >= end {
            out.push(cur.clone());
            cur -= &one;
        }
    }
    out
}

fn char_range(a: char, b: char) -> Vec<char> {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut out: Vec<char> = (lo..=hi).collect();
    if a > b {
        out.reverse();
    }
    out
}

/// Converts to a JSON number when the value fits in `i64`, else falls back
/// to its decimal string form to avoid precision loss.
fn bigint_to_value(n: BigInt) -> Value {
    let text = n.to_string();
    match text.parse::<i64>() {
        Ok(i) => Value::from(i),
        Err(_) => Value::String(text),
    }
}
