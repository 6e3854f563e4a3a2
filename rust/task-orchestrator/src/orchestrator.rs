//! Workflow orchestrator (C11): the cooperative loop described in spec
//! §4.11 — normalize, dispatch (or spawn children), wait for terminal,
//! handle the response, record it, pick the next transition, repeat —
//! plus the supplemented control surface: a `WorkflowHandle` for
//! progress polling and pause/resume, mirroring
//! `shannon_api::workflow::engine::WorkflowEngineImpl::{pause,resume}`
//! and `durable_shannon::worker::WorkflowHandle::subscribe`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::child_factory::{component_for, execution_type_for, spawn_collection_children, spawn_static_children, SpawnedChild};
use crate::config::task::{CollectionMode, Strategy, TaskConfig};
use crate::config::workflow::WorkflowConfig;
use crate::context::{ContextBuilder, TemplateContext};
use crate::dispatcher::{dispatch, should_retry, DispatchResult, Dispatcher};
use crate::error::Result;
use crate::events::{EventPublisher, WorkflowEvent};
use crate::normalize::{normalize, NormalizationContext};
use crate::parent_status::{siblings_to_cancel, update_parent, UpdateOutcome};
use crate::response::{handle_passthrough, handle_router};
use crate::state::{Component, ExecutionType, Status, TaskError, TaskState, TaskStateView, WorkflowState};
use crate::store::StateStore;

/// Shared pause/cancel control for one workflow instance. Cheap to clone
/// (`Arc`); a caller holding a `WorkflowHandle` can flip these from an
/// entirely separate task while the orchestrator loop is running.
#[derive(Debug, Default)]
pub struct WorkflowControl {
    paused: AtomicBool,
    resume_notify: Notify,
    cancel: CancellationToken,
}

impl WorkflowControl {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume_notify.notify_waiters();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Blocks the caller while paused, waking on `resume()` or `cancel()`.
    async fn wait_if_paused(&self) {
        while self.is_paused() && !self.is_canceled() {
            tokio::select! {
                () = self.resume_notify.notified() => {}
                () = self.cancel.cancelled() => {}
            }
        }
    }
}

/// Caller-facing view of an in-flight (or completed) workflow: progress
/// polling, an event subscription, and pause/resume/cancel. Mirrors the
/// `TaskHandle`/`WorkflowHandle` surface of the teacher's workflow engine.
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    pub workflow_exec_id: String,
    state: Arc<Mutex<WorkflowState>>,
    control: Arc<WorkflowControl>,
    events: EventPublisher,
}

impl WorkflowHandle {
    #[must_use]
    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    #[must_use]
    pub fn snapshot(&self) -> WorkflowState {
        self.state.lock().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }
}

/// Collaborators the orchestrator drives each tick. Borrowed for the
/// duration of one `run` call.
pub struct Orchestrator<'a> {
    pub store: &'a (dyn StateStore + 'a),
    pub dispatcher: Dispatcher<'a>,
}

impl Orchestrator<'_> {
    /// Build a fresh handle for a new workflow instance: a dedicated event
    /// channel and pause/cancel control, not yet started.
    #[must_use]
    pub fn new_handle(workflow_id: &str, input: serde_json::Value) -> WorkflowHandle {
        let workflow_exec_id = Uuid::new_v4().to_string();
        WorkflowHandle {
            state: Arc::new(Mutex::new(WorkflowState::new(&workflow_exec_id, workflow_id, input))),
            control: WorkflowControl::new(),
            events: EventPublisher::default(),
            workflow_exec_id,
        }
    }

    /// Runs `workflow_config` to completion against `handle`, returning the
    /// final `WorkflowState`. The caller typically calls `new_handle` first,
    /// hands a clone to whoever needs to pause/cancel/subscribe, then awaits
    /// this.
    #[instrument(skip(self, workflow_config, handle), fields(workflow_exec_id = %handle.workflow_exec_id))]
    pub async fn run(&self, workflow_config: &WorkflowConfig, handle: &WorkflowHandle) -> Result<WorkflowState> {
        handle.events.publish(WorkflowEvent::WorkflowStarted {
            workflow_exec_id: handle.workflow_exec_id.clone(),
            workflow_id: workflow_config.id.clone(),
        });
        {
            let mut state = handle.state.lock();
            state.status = Status::Running;
        }

        let mut current = workflow_config.first_task().cloned();
        let mut final_status = Status::Success;
        let mut final_output = None;
        let mut final_error = None;

        while let Some(task_config) = current.take() {
            handle.control.wait_if_paused().await;
            if handle.control.is_canceled() {
                final_status = Status::Canceled;
                break;
            }

            let task_state = self
                .execute(
                    workflow_config,
                    &handle.state,
                    &task_config,
                    None,
                    handle.control.cancellation_token(),
                    &handle.events,
                )
                .await?;

            let is_router = matches!(task_config, TaskConfig::Router { .. });
            let handled = if is_router {
                handle_router(&task_config, &task_state, workflow_config)?
            } else {
                handle_passthrough(&task_config, &task_state)
            };

            if task_state.status.is_success() {
                let route_taken = handled
                    .response
                    .output
                    .as_ref()
                    .and_then(|o| o.get("route_taken"))
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string);
                handle.state.lock().record_success(
                    task_config.id(),
                    TaskStateView {
                        output: task_state.output.clone(),
                        status: Some(task_state.status),
                        route_taken,
                    },
                );
            }

            if task_config.common().r#final {
                final_status = task_state.status;
                final_output = task_state.output.clone();
                final_error = task_state.error.clone();
                break;
            }

            current = if let Some(next) = handled.next_task_override {
                Some(next)
            } else {
                let transition = if task_state.status.is_success() {
                    task_config.common().on_success.as_deref()
                } else {
                    task_config.common().on_error.as_deref()
                };
                transition.and_then(|id| workflow_config.find_task(id)).cloned()
            };

            if !task_state.status.is_success() && current.is_none() {
                final_status = task_state.status;
                final_output = task_state.output.clone();
                final_error = task_state.error.clone();
            }
        }

        let mut state = handle.state.lock();
        state.status = final_status;
        state.output = final_output;
        state.error = final_error;
        let snapshot = state.clone();
        drop(state);

        handle.events.publish(WorkflowEvent::WorkflowCompleted {
            workflow_exec_id: handle.workflow_exec_id.clone(),
            status: snapshot.status,
            output: snapshot.output.clone(),
        });
        info!(status = %snapshot.status, "workflow run finished");
        Ok(snapshot)
    }

    /// Execute one task to completion: normalize, then either dispatch (leaf
    /// types) or spawn and drive children to the parent's terminal status
    /// (parallel/collection/composite). Recurses for nested parents.
    fn execute<'s>(
        &'s self,
        workflow_config: &'s WorkflowConfig,
        workflow_state: &'s Mutex<WorkflowState>,
        task_config: &'s TaskConfig,
        parent: Option<&'s TaskState>,
        cancel: &'s CancellationToken,
        events: &'s EventPublisher,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<TaskState>> + Send + 's>> {
        Box::pin(async move {
            let mut config = task_config.clone();

            let vars = {
                let state_snapshot = workflow_state.lock().clone();
                ContextBuilder::new().build_context(&state_snapshot, workflow_config, &config)?
            };
            let state_snapshot = workflow_state.lock().clone();
            let nctx = NormalizationContext {
                variables: &vars,
                workflow_config,
                workflow_state: &state_snapshot,
                parent_env: parent.and_then(|_| None), // env threaded explicitly by callers that spawn children
            };
            normalize(self.dispatcher.engine, &mut config, &nctx)?;

            let workflow_exec_id = state_snapshot.workflow_exec_id.clone();
            let workflow_id = state_snapshot.workflow_id.clone();

            let mut state = match parent {
                Some(p) => TaskState::new(
                    Uuid::new_v4().to_string(),
                    config.id(),
                    workflow_exec_id.clone(),
                    workflow_id,
                    component_for(&config),
                    execution_type_for(&config),
                )
                .with_parent(p.task_exec_id.clone()),
                None => TaskState::new(
                    Uuid::new_v4().to_string(),
                    config.id(),
                    workflow_exec_id.clone(),
                    workflow_id,
                    component_for(&config),
                    execution_type_for(&config),
                ),
            };
            state.transition(Status::Running);
            self.store.upsert_state(state.clone()).await?;
            events.publish(WorkflowEvent::TaskStarted {
                workflow_exec_id: workflow_exec_id.clone(),
                task_exec_id: state.task_exec_id.clone(),
                task_id: config.id().to_string(),
            });

            match execution_type_for(&config) {
                ExecutionType::Parallel => {
                    let (tasks, strategy, max_workers): (&[TaskConfig], Strategy, u32) = match &config {
                        TaskConfig::Parallel { tasks, strategy, max_workers, .. } => (tasks, *strategy, *max_workers),
                        _ => (&[], Strategy::WaitAll, 0),
                    };
                    let children = spawn_static_children(tasks, &state);
                    // Scoped to this parent's children: canceling it when the
                    // strategy resolves stops stragglers under this parent
                    // without reaching siblings elsewhere in the workflow.
                    let children_scope = cancel.child_token();
                    let concurrency = (max_workers != 0).then_some(max_workers as usize);
                    self.run_children(
                        workflow_config,
                        workflow_state,
                        &state,
                        children,
                        strategy,
                        &config,
                        &children_scope,
                        events,
                        concurrency,
                    )
                    .await?;
                }
                ExecutionType::Composite => {
                    // Strictly wait_all, sequenced: the next child is not
                    // dispatched until the previous one reaches a terminal
                    // status (spec §4.7/§4.8). `run_children` special-cases
                    // `concurrency == Some(1)` to enforce that ordering.
                    let tasks: &[TaskConfig] = match &config {
                        TaskConfig::Composite { tasks, .. } => tasks,
                        _ => &[],
                    };
                    let children = spawn_static_children(tasks, &state);
                    let children_scope = cancel.child_token();
                    self.run_children(
                        workflow_config,
                        workflow_state,
                        &state,
                        children,
                        Strategy::WaitAll,
                        &config,
                        &children_scope,
                        events,
                        Some(1),
                    )
                    .await?;
                }
                ExecutionType::Collection => {
                    let (strategy, mode, batch) = match &config {
                        TaskConfig::Collection { strategy, mode, batch, .. } => (*strategy, *mode, *batch),
                        _ => (Strategy::WaitAll, CollectionMode::Parallel, 0),
                    };
                    let item_ctx = TemplateContext::default();
                    let item_ctx = item_ctx.with_overlay(&vars.as_value().as_object().cloned().unwrap_or_default());
                    let children = spawn_collection_children(self.dispatcher.engine, &config, &state, &item_ctx, &nctx)?;
                    let children_scope = cancel.child_token();
                    let concurrency = match mode {
                        CollectionMode::Sequential => Some(1),
                        CollectionMode::Parallel => (batch != 0).then_some(batch as usize),
                    };
                    self.run_children(
                        workflow_config,
                        workflow_state,
                        &state,
                        children,
                        strategy,
                        &config,
                        &children_scope,
                        events,
                        concurrency,
                    )
                    .await?;
                }
                ExecutionType::Basic | ExecutionType::Router => {
                    let leaf_cancel = cancel.child_token();
                    self.run_leaf(&config, &vars, &workflow_exec_id, &leaf_cancel, &mut state).await?;
                }
            }

            let persisted = self.store.get_state(&state.task_exec_id).await?.unwrap_or(state);
            match persisted.error.as_ref() {
                Some(_) => events.publish(WorkflowEvent::TaskFailed {
                    workflow_exec_id,
                    task_exec_id: persisted.task_exec_id.clone(),
                    task_id: config.id().to_string(),
                    error: persisted.error.clone().expect("checked some above"),
                }),
                None => events.publish(WorkflowEvent::TaskCompleted {
                    workflow_exec_id,
                    task_exec_id: persisted.task_exec_id.clone(),
                    task_id: config.id().to_string(),
                    status: persisted.status,
                    output: persisted.output.clone(),
                }),
            }

            Ok(persisted)
        })
    }

    /// Dispatch a leaf task with the configured retry budget (spec §4.9/§7:
    /// only transient failures are retried, up to the task's own `retries`
    /// or the runtime default). Each attempt races the dispatch against
    /// `cancel` and, for basic/router tasks, against the task's own
    /// `timeout` (wait's timeout is already enforced inside the signal
    /// coordinator) — so a hung agent/tool call or a sibling cancellation
    /// both resolve the task's own state instead of leaving it running past
    /// its parent's terminal status (spec §4.7/§5/§9).
    async fn run_leaf(
        &self,
        config: &TaskConfig,
        vars: &TemplateContext,
        workflow_exec_id: &str,
        cancel: &CancellationToken,
        state: &mut TaskState,
    ) -> Result<()> {
        let vars_value = vars.as_value();
        let timeout = if matches!(config, TaskConfig::Basic { .. } | TaskConfig::Router { .. }) {
            config.common().timeout.map(Duration::from_secs)
        } else {
            None
        };
        let mut attempt = 0u32;
        loop {
            let dispatch_fut = dispatch(&self.dispatcher, config, &vars_value, workflow_exec_id, cancel);
            let sleep_fut = async {
                match timeout {
                    Some(duration) => self.dispatcher.substrate.sleep(duration).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => DispatchResult {
                    status: Status::Canceled,
                    output: None,
                    error: Some(TaskError::new("canceled", format!("task '{}' canceled", config.id()))),
                    usage: None,
                },
                () = sleep_fut => DispatchResult {
                    status: Status::TimedOut,
                    output: None,
                    error: Some(TaskError::new(
                        "timeout",
                        format!(
                            "task '{}' exceeded its {}s timeout",
                            config.id(),
                            timeout.expect("sleep_fut only resolves when a timeout is set").as_secs()
                        ),
                    )),
                    usage: None,
                },
                outcome = dispatch_fut => outcome?,
            };
            if let Some(error) = &result.error {
                if should_retry(error, attempt, config.common().retries, self.dispatcher.runtime_config) {
                    attempt += 1;
                    continue;
                }
            }
            state.output = result.output;
            state.error = result.error;
            state.usage.extend(result.usage);
            state.transition(result.status);
            self.store.upsert_state(state.clone()).await?;
            return Ok(());
        }
    }

    /// Persist `children`, drive them to completion bounded by
    /// `concurrency` (`None` = unbounded, as plain `parallel`/`collection`
    /// default to; `Some(n)` = `max_workers`/`batch`), cancel stragglers
    /// once the parent's strategy resolves (spec §4.7/§9), then persist the
    /// parent's own aggregated terminal state.
    #[allow(clippy::too_many_arguments, reason = "recursive executor threads the full ambient context through")]
    async fn run_children<'s>(
        &'s self,
        workflow_config: &'s WorkflowConfig,
        workflow_state: &'s Mutex<WorkflowState>,
        parent_state: &'s TaskState,
        children: Vec<SpawnedChild>,
        strategy: Strategy,
        parent_config: &'s TaskConfig,
        cancel: &'s CancellationToken,
        events: &'s EventPublisher,
        concurrency: Option<usize>,
    ) -> Result<()> {
        for child in &children {
            self.store.upsert_state(child.state.clone()).await?;
        }

        let outputs_template = parent_config.common().outputs.clone();

        if concurrency == Some(1) {
            // Composite, and collection's `mode: sequential`: the next
            // child must not be dispatched until the previous one reaches a
            // terminal status. A plain in-order await — not a one-permit
            // semaphore racing through `FuturesUnordered` — is what actually
            // guarantees that ordering; `FuturesUnordered` polls its
            // members in no particular order even when only one can hold
            // the permit at a time.
            for child in children {
                self.execute(workflow_config, workflow_state, &child.config, Some(parent_state), cancel, events)
                    .await?;
                let became_terminal = self
                    .advance_parent(parent_state, outputs_template.as_ref(), strategy, cancel)
                    .await?;
                if became_terminal || cancel.is_cancelled() {
                    break;
                }
            }
            return Ok(());
        }

        let semaphore = concurrency.map(|limit| Arc::new(Semaphore::new(limit)));
        let mut in_flight = FuturesUnordered::new();
        for child in children {
            let semaphore = semaphore.clone();
            in_flight.push(async move {
                let _permit = match semaphore {
                    Some(sem) => Some(sem.acquire_owned().await.expect("semaphore is never closed")),
                    None => None,
                };
                self.execute(workflow_config, workflow_state, &child.config, Some(parent_state), cancel, events)
                    .await
            });
        }

        while let Some(result) = in_flight.next().await {
            result?;
            self.advance_parent(parent_state, outputs_template.as_ref(), strategy, cancel).await?;
        }

        Ok(())
    }

    /// Re-runs the parent-status protocol after a child reaches a terminal
    /// status. Returns whether the parent just became terminal; on that
    /// transition, persists the aggregated output/error and cancels
    /// non-terminal siblings per the strategy's rule (spec §4.7 step 5,
    /// §9). Canceled siblings persist `Status::Canceled` themselves, via
    /// their own in-flight `run_leaf`/`run_children` observing `cancel` —
    /// not via an out-of-band write here, which would race the sibling's
    /// own still-running future for the same `task_exec_id`.
    async fn advance_parent(
        &self,
        parent_state: &TaskState,
        outputs_template: Option<&std::collections::HashMap<String, serde_json::Value>>,
        strategy: Strategy,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        match update_parent(self.store, self.dispatcher.engine, &parent_state.task_exec_id, outputs_template, strategy).await? {
            UpdateOutcome::StillRunning | UpdateOutcome::AlreadyTerminal => Ok(false),
            UpdateOutcome::BecameTerminal { aggregation } => {
                let mut parent_now = self
                    .store
                    .get_state(&parent_state.task_exec_id)
                    .await?
                    .unwrap_or_else(|| parent_state.clone());
                parent_now.output = Some(aggregation.output);
                parent_now.error = aggregation.error;
                parent_now.updated_at = chrono::Utc::now();
                self.store.upsert_state(parent_now.clone()).await?;

                let siblings = self.store.list_children(&parent_state.task_exec_id).await?;
                let to_cancel = siblings_to_cancel(strategy, parent_now.status, &siblings);
                if !to_cancel.is_empty() {
                    info!(count = to_cancel.len(), "canceling siblings after parent resolved");
                }
                cancel.cancel();
                Ok(true)
            }
        }
    }
}
