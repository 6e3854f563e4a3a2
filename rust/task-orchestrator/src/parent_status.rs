//! Parent status updater (C7): under the state store's exclusive
//! per-parent lock, recomputes parent progress and decides the parent's
//! status using its strategy. The most subtle piece of the engine — see
//! spec §4.7 for the full protocol this function implements verbatim.

use std::sync::Arc;

use tracing::info;

use crate::config::task::Strategy;
use crate::error::Result;
use crate::response::{aggregate_children, ParentAggregation};
use crate::state::{Status, TaskState};
use crate::store::StateStore;
use crate::template::TemplateEngine;

/// Outcome of running the protocol once: either the parent is still
/// in-flight (no-op, someone else will retry later) or it just became
/// terminal and `aggregation` carries its final output/error.
pub enum UpdateOutcome {
    StillRunning,
    AlreadyTerminal,
    BecameTerminal { aggregation: ParentAggregation },
}

/// Internal decision communicated out of the transaction closure. Plain
/// data, `Send`, no aggregation computed yet (that happens after commit,
/// against the now-immutable terminal children).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    StillRunning,
    AlreadyTerminal,
    BecameTerminal,
}

/// Runs the parent-status protocol for `parent_exec_id`. Idempotent under
/// at-least-once redelivery: step 3 (already-terminal check) plus the
/// store's exclusive lock make re-running this for the same parent after
/// it has resolved a no-op (spec §4.7, §8 property 2).
pub async fn update_parent(
    store: &(dyn StateStore + '_),
    engine: &dyn TemplateEngine,
    parent_exec_id: &str,
    outputs_template: Option<&std::collections::HashMap<String, serde_json::Value>>,
    strategy: Strategy,
) -> Result<UpdateOutcome> {
    let decision_slot = Arc::new(std::sync::Mutex::new(Decision::StillRunning));
    let decision_handle = Arc::clone(&decision_slot);
    let parent_id_owned = parent_exec_id.to_string();

    store
        .with_transaction(Box::new(move |tx| {
            let decision_handle = Arc::clone(&decision_handle);
            let parent_id = parent_id_owned.clone();
            Box::pin(async move {
                let Some(mut parent) = tx.get_state_for_update(&parent_id).await? else {
                    return Ok(());
                };

                if parent.status.is_terminal() {
                    *decision_handle.lock().expect("mutex poisoned") = Decision::AlreadyTerminal;
                    return Ok(());
                }

                let children = tx.list_children(&parent_id).await?;
                match decide(strategy, &children) {
                    None => {}
                    Some(final_status) => {
                        parent.transition(final_status);
                        tx.upsert_state(parent).await?;
                        *decision_handle.lock().expect("mutex poisoned") = Decision::BecameTerminal;
                    }
                }
                Ok(())
            })
        }))
        .await?;

    let decision = *decision_slot.lock().expect("mutex poisoned");
    match decision {
        Decision::StillRunning => Ok(UpdateOutcome::StillRunning),
        Decision::AlreadyTerminal => Ok(UpdateOutcome::AlreadyTerminal),
        Decision::BecameTerminal => {
            // Re-read the now-terminal children outside the lock (they are
            // immutable once terminal, per invariant 4) to compute the
            // aggregated output/deferred templates; this is the one place
            // C5's parent handler runs (spec §4.5/§4.7 step 6).
            let children = store.list_children(parent_exec_id).await?;
            let parent = store
                .get_state(parent_exec_id)
                .await?
                .expect("parent state vanished after being upserted as terminal");
            info!(
                task_exec_id = %parent_exec_id,
                status = %parent.status,
                total_children = children.len(),
                "parent task reached terminal status"
            );
            let aggregation = aggregate_children(engine, strategy, parent.status, outputs_template, &children)?;
            Ok(UpdateOutcome::BecameTerminal { aggregation })
        }
    }
}

/// Applies the strategy rule (spec §4.7 step 5) to the current snapshot of
/// children. Returns `None` while the parent should stay non-terminal, or
/// `Some(final_status)` once the strategy has a verdict.
fn decide(strategy: Strategy, children: &[TaskState]) -> Option<Status> {
    if children.is_empty() {
        return Some(Status::Success);
    }

    let total = children.len();
    let terminal: Vec<&TaskState> = children.iter().filter(|c| c.status.is_terminal()).collect();
    let success_count = terminal.iter().filter(|c| c.status.is_success()).count();
    let non_success_terminal = terminal.len() - success_count;

    match strategy {
        Strategy::WaitAll => {
            if terminal.len() < total {
                return None;
            }
            if non_success_terminal == 0 {
                Some(Status::Success)
            } else {
                Some(Status::Failed)
            }
        }
        Strategy::FailFast => {
            if non_success_terminal > 0 {
                return Some(Status::Failed);
            }
            if terminal.len() == total {
                Some(Status::Success)
            } else {
                None
            }
        }
        Strategy::BestEffort => {
            if terminal.len() < total {
                return None;
            }
            if success_count == 0 {
                Some(Status::Failed)
            } else {
                Some(Status::Success)
            }
        }
        Strategy::Race => {
            if success_count > 0 {
                return Some(Status::Success);
            }
            if terminal.len() == total {
                Some(Status::Failed)
            } else {
                None
            }
        }
    }
}

/// Task ids of siblings that should be canceled now that the parent has
/// resolved: all non-terminal children under `fail_fast` (the failure is
/// final) and `race` (a winner was found) — both per spec §4.7/§9's open
/// question, resolved here as eager cancellation (documented in
/// DESIGN.md).
#[must_use]
pub fn siblings_to_cancel(strategy: Strategy, final_status: Status, children: &[TaskState]) -> Vec<String> {
    let should_cancel = match strategy {
        Strategy::FailFast => final_status == Status::Failed,
        Strategy::Race => final_status == Status::Success,
        Strategy::WaitAll | Strategy::BestEffort => false,
    };
    if !should_cancel {
        return Vec::new();
    }
    children
        .iter()
        .filter(|c| !c.status.is_terminal())
        .map(|c| c.task_exec_id.clone())
        .collect()
}
