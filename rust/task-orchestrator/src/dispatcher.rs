//! Task dispatcher (C9): executes a single normalized, non-parent task
//! (basic/router/wait/signal/aggregate/memory) against its external
//! collaborators and folds the outcome into a `DispatchResult`. Parent
//! types (parallel/collection/composite) never reach this module — the
//! orchestrator spawns their children directly via `child_factory`.

use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::runtime::RuntimeConfig;
use crate::config::task::{BasicTarget, MemoryOperation, TaskConfig};
use crate::coordinator::{SignalCoordinator, WaitOutcome};
use crate::error::{OrchestratorError, Result};
use crate::response::evaluate_aggregate;
use crate::runtimes::{AgentRuntime, MemoryManager, RuntimeResult, ToolRuntime};
use crate::state::{Status, TaskError, UsageSummary};
use crate::substrate::Substrate;
use crate::template::TemplateEngine;

/// External collaborators + config a dispatch call needs. Borrowed, not
/// owned: the orchestrator constructs one of these per tick.
pub struct Dispatcher<'a> {
    pub engine: &'a dyn TemplateEngine,
    pub agent_runtime: &'a dyn AgentRuntime,
    pub tool_runtime: &'a dyn ToolRuntime,
    pub memory_manager: &'a dyn MemoryManager,
    pub coordinator: &'a SignalCoordinator,
    pub runtime_config: &'a RuntimeConfig,
    pub substrate: &'a dyn Substrate,
}

/// Outcome of executing a leaf task once. Always terminal-or-waiting from
/// the dispatcher's point of view; retry scheduling is the orchestrator's
/// call, driven by `error`'s `OrchestratorError::retryable()`.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub status: Status,
    pub output: Option<Value>,
    pub error: Option<TaskError>,
    pub usage: Option<UsageSummary>,
}

impl DispatchResult {
    fn success(output: Value, usage: Option<UsageSummary>) -> Self {
        Self {
            status: Status::Success,
            output: Some(output),
            error: None,
            usage,
        }
    }

    fn failure(status: Status, error: TaskError) -> Self {
        Self {
            status,
            output: None,
            error: Some(error),
            usage: None,
        }
    }
}

/// Dispatch a non-parent task. `vars` is the already-built template context
/// value (see `context::ContextBuilder`); `workflow_exec_id` scopes
/// wait/signal coordination; `cancel` lets the orchestrator cut a suspended
/// wait short (eager sibling cancellation, spec §4.7/§9).
pub async fn dispatch(
    dispatcher: &Dispatcher<'_>,
    task_config: &TaskConfig,
    vars: &Value,
    workflow_exec_id: &str,
    cancel: &CancellationToken,
) -> Result<DispatchResult> {
    match task_config {
        TaskConfig::Basic { target, common, .. } => {
            let input = common.with.clone().unwrap_or(Value::Null);
            let env = common.env.clone().unwrap_or_default();
            let outcome = match target {
                BasicTarget::Agent { agent, action, settings } => {
                    dispatcher.agent_runtime.invoke(agent, action, settings.as_ref(), &input, &env).await
                }
                BasicTarget::Tool { tool, params } => {
                    dispatcher.tool_runtime.invoke(tool, params.as_ref(), &input, &env).await
                }
            };
            Ok(from_runtime_result(task_config.id(), outcome))
        }
        TaskConfig::Router { condition, routes, .. } => dispatch_router(dispatcher, task_config.id(), condition, routes, vars),
        TaskConfig::Wait { signal_name, condition, common, .. } => {
            dispatch_wait(dispatcher, task_config.id(), signal_name, condition.as_deref(), common.timeout, workflow_exec_id, cancel)
                .await
        }
        TaskConfig::Signal {
            target_workflow,
            signal_name,
            payload,
            ..
        } => dispatch_signal(dispatcher, target_workflow, signal_name, payload.clone(), workflow_exec_id),
        TaskConfig::Aggregate { common, .. } => dispatch_aggregate(dispatcher, task_config.id(), common.outputs.as_ref(), vars),
        TaskConfig::Memory {
            memory_ref,
            operation,
            key,
            value,
            ..
        } => dispatch_memory(dispatcher, memory_ref, *operation, key.as_deref(), value.as_ref()).await,
        TaskConfig::Parallel { .. } | TaskConfig::Collection { .. } | TaskConfig::Composite { .. } => {
            Err(OrchestratorError::ConfigShape {
                task_id: task_config.id().to_string(),
                reason: "parent task types are spawned, not dispatched".to_string(),
            })
        }
    }
}

fn from_runtime_result(task_id: &str, outcome: RuntimeResult) -> DispatchResult {
    match outcome {
        Ok(runtime_outcome) => DispatchResult::success(runtime_outcome.output, runtime_outcome.usage),
        Err(runtime_error) => {
            let mut error = TaskError::new(
                if runtime_error.retryable { "transient" } else { "runtime" },
                runtime_error.reason,
            );
            error.details.insert("task_id".to_string(), Value::String(task_id.to_string()));
            DispatchResult::failure(Status::Failed, error)
        }
    }
}

fn dispatch_router(
    dispatcher: &Dispatcher<'_>,
    task_id: &str,
    condition: &str,
    routes: &std::collections::HashMap<String, String>,
    vars: &Value,
) -> Result<DispatchResult> {
    let label = if dispatcher.engine.has_template(condition) {
        match dispatcher.engine.parse_any(&Value::String(condition.to_string()), vars)? {
            Value::String(s) => s,
            other => other.to_string(),
        }
    } else {
        condition.to_string()
    };

    let Some(target_task_id) = routes.get(label.trim()) else {
        return Err(OrchestratorError::RouteUnknown {
            task_id: task_id.to_string(),
            route: label,
        });
    };

    Ok(DispatchResult::success(
        serde_json::json!({ "route_taken": target_task_id }),
        None,
    ))
}

async fn dispatch_wait(
    dispatcher: &Dispatcher<'_>,
    task_id: &str,
    signal_name: &str,
    condition: Option<&str>,
    timeout_secs: Option<u64>,
    workflow_exec_id: &str,
    cancel: &CancellationToken,
) -> Result<DispatchResult> {
    let timeout = timeout_secs.map(Duration::from_secs);
    let outcome = dispatcher
        .coordinator
        .wait(dispatcher.engine, dispatcher.substrate, workflow_exec_id, signal_name, condition, timeout, cancel)
        .await?;
    Ok(match outcome {
        WaitOutcome::Signaled(payload) => DispatchResult::success(payload, None),
        WaitOutcome::TimedOut => DispatchResult::failure(
            Status::TimedOut,
            TaskError::new("timeout", format!("wait task '{task_id}' timed out waiting for '{signal_name}'")),
        ),
        WaitOutcome::Canceled => DispatchResult::failure(Status::Canceled, TaskError::new("canceled", "wait task canceled")),
    })
}

fn dispatch_signal(
    dispatcher: &Dispatcher<'_>,
    target_workflow: &str,
    signal_name: &str,
    payload: Option<Value>,
    own_workflow_exec_id: &str,
) -> Result<DispatchResult> {
    let target = if target_workflow == "self" { own_workflow_exec_id } else { target_workflow };
    dispatcher
        .coordinator
        .signal(dispatcher.engine, target, signal_name, payload.clone().unwrap_or(Value::Null))?;
    Ok(DispatchResult::success(
        serde_json::json!({ "delivered_to": target, "signal_name": signal_name, "payload": payload }),
        None,
    ))
}

fn dispatch_aggregate(
    dispatcher: &Dispatcher<'_>,
    task_id: &str,
    outputs: Option<&std::collections::HashMap<String, Value>>,
    vars: &Value,
) -> Result<DispatchResult> {
    let Some(outputs) = outputs else {
        return Err(OrchestratorError::ConfigShape {
            task_id: task_id.to_string(),
            reason: "aggregate task requires 'outputs'".to_string(),
        });
    };
    let output = evaluate_aggregate(dispatcher.engine, outputs, vars)?;
    Ok(DispatchResult::success(output, None))
}

async fn dispatch_memory(
    dispatcher: &Dispatcher<'_>,
    memory_ref: &str,
    operation: MemoryOperation,
    key: Option<&str>,
    value: Option<&Value>,
) -> Result<DispatchResult> {
    let outcome = match operation {
        MemoryOperation::Read => dispatcher.memory_manager.read(memory_ref, key).await,
        MemoryOperation::Write => {
            let Some(value) = value else {
                return Err(OrchestratorError::ConfigShape {
                    task_id: memory_ref.to_string(),
                    reason: "memory 'write' requires a 'value'".to_string(),
                });
            };
            dispatcher.memory_manager.write(memory_ref, key, value).await
        }
        MemoryOperation::Append => {
            let Some(value) = value else {
                return Err(OrchestratorError::ConfigShape {
                    task_id: memory_ref.to_string(),
                    reason: "memory 'append' requires a 'value'".to_string(),
                });
            };
            dispatcher.memory_manager.append(memory_ref, key, value).await
        }
    };
    Ok(from_runtime_result(memory_ref, outcome))
}

/// Translate a dispatch failure into retry-or-terminal per spec §4.9/§7:
/// transient runtime errors are retried up to the task's configured
/// `retries` (falling back to `RuntimeConfig::default_task_retries`);
/// everything else (route_unknown, config_shape, deterministic runtime
/// failures) is terminal on the first attempt.
#[must_use]
pub fn should_retry(error: &TaskError, attempt: u32, configured_retries: Option<u32>, runtime_config: &RuntimeConfig) -> bool {
    if error.code != "transient" {
        return false;
    }
    let max = configured_retries.unwrap_or(runtime_config.default_task_retries);
    if attempt >= max {
        warn!(attempt, max, "exhausted retries for transient failure");
        false
    } else {
        true
    }
}
