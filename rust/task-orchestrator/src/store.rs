//! State store contract (C6, external) and an in-memory reference
//! implementation. Modeled on `durable_shannon::backends::EventLog`: a
//! `Send + Sync` trait, a `Box<dyn Trait>` blanket impl so trait objects
//! compose, and a `parking_lot`-guarded in-memory default used by tests and
//! by any caller that has not wired a durable backend yet.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{OrchestratorError, Result};
use crate::state::{ProgressInfo, TaskState, UsageSummary};

/// Required operations a state store must provide. Semantics (not just
/// signatures) must be preserved by any implementation — see spec §4.6.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace by `task_exec_id`; updates `updated_at`.
    async fn upsert_state(&self, state: TaskState) -> Result<()>;

    /// Returns a copy; never leaks internal references.
    async fn get_state(&self, task_exec_id: &str) -> Result<Option<TaskState>>;

    /// Runs `f` against a transactional view of the store. The in-memory
    /// implementation serializes all transactions behind a single mutex,
    /// trivially satisfying "retries contention once" (there is none to
    /// retry) while still matching the external signature.
    async fn with_transaction<'a>(
        &'a self,
        f: Box<dyn FnOnce(&dyn TxStateStore) -> BoxFuture<'_, Result<()>> + Send + 'a>,
    ) -> Result<()>;

    async fn list_children(&self, parent_id: &str) -> Result<Vec<TaskState>>;

    /// `{task_id → output}` for terminal successful children only. Hot
    /// path: must not materialize full states.
    async fn list_children_outputs(
        &self,
        parent_id: &str,
    ) -> Result<HashMap<String, Option<serde_json::Value>>>;

    async fn get_child_by_task_id(
        &self,
        parent_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskState>>;

    async fn get_progress_info(&self, parent_id: &str) -> Result<ProgressInfo>;

    /// Associative merge of token-usage counters.
    async fn merge_usage(&self, task_exec_id: &str, summary: UsageSummary) -> Result<()>;
}

/// A boxed, pinned future, used where `async_trait` object-safety requires
/// an explicit return type (the `with_transaction` closure argument).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The view of the store available inside `with_transaction`: adds the
/// exclusive-lock read used by the parent-status protocol.
#[async_trait]
pub trait TxStateStore: Send + Sync {
    /// Returns the state with an exclusive lock held until the enclosing
    /// transaction commits or rolls back.
    async fn get_state_for_update(&self, task_exec_id: &str) -> Result<Option<TaskState>>;

    async fn upsert_state(&self, state: TaskState) -> Result<()>;

    async fn list_children(&self, parent_id: &str) -> Result<Vec<TaskState>>;
}

#[async_trait]
impl<T: StateStore + ?Sized> StateStore for Box<T> {
    async fn upsert_state(&self, state: TaskState) -> Result<()> {
        (**self).upsert_state(state).await
    }

    async fn get_state(&self, task_exec_id: &str) -> Result<Option<TaskState>> {
        (**self).get_state(task_exec_id).await
    }

    async fn with_transaction<'a>(
        &'a self,
        f: Box<dyn FnOnce(&dyn TxStateStore) -> BoxFuture<'_, Result<()>> + Send + 'a>,
    ) -> Result<()> {
        (**self).with_transaction(f).await
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<TaskState>> {
        (**self).list_children(parent_id).await
    }

    async fn list_children_outputs(
        &self,
        parent_id: &str,
    ) -> Result<HashMap<String, Option<serde_json::Value>>> {
        (**self).list_children_outputs(parent_id).await
    }

    async fn get_child_by_task_id(
        &self,
        parent_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskState>> {
        (**self).get_child_by_task_id(parent_id, task_id).await
    }

    async fn get_progress_info(&self, parent_id: &str) -> Result<ProgressInfo> {
        (**self).get_progress_info(parent_id).await
    }

    async fn merge_usage(&self, task_exec_id: &str, summary: UsageSummary) -> Result<()> {
        (**self).merge_usage(task_exec_id, summary).await
    }
}

/// In-memory `StateStore` for tests and single-process use. A single
/// `parking_lot::Mutex` over the whole table gives `GetStateForUpdate` its
/// exclusivity trivially — every access is already serialized — matching
/// `durable_shannon::backends::InMemoryEventLog`'s trade-off of simplicity
/// over concurrency for the reference/test backend.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: Mutex<HashMap<String, TaskState>>,
    /// Held for the duration of `with_transaction`'s closure (not just per
    /// individual read/write) so `get_state_for_update → list_children →
    /// upsert_state` runs as one atomic unit per spec §4.6, rather than each
    /// call separately acquiring and releasing `states`.
    tx_lock: tokio::sync::Mutex<()>,
}

impl InMemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn children_of(states: &HashMap<String, TaskState>, parent_id: &str) -> Vec<TaskState> {
        states
            .values()
            .filter(|s| s.parent_state_id.as_deref() == Some(parent_id))
            .cloned()
            .collect()
    }
}

struct InMemoryTx<'a> {
    store: &'a InMemoryStateStore,
}

#[async_trait]
impl TxStateStore for InMemoryTx<'_> {
    async fn get_state_for_update(&self, task_exec_id: &str) -> Result<Option<TaskState>> {
        let states = self.store.states.lock();
        Ok(states.get(task_exec_id).cloned())
    }

    async fn upsert_state(&self, mut state: TaskState) -> Result<()> {
        state.updated_at = chrono::Utc::now();
        let mut states = self.store.states.lock();
        states.insert(state.task_exec_id.clone(), state);
        Ok(())
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<TaskState>> {
        let states = self.store.states.lock();
        Ok(InMemoryStateStore::children_of(&states, parent_id))
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn upsert_state(&self, mut state: TaskState) -> Result<()> {
        state.updated_at = chrono::Utc::now();
        let mut states = self.states.lock();
        states.insert(state.task_exec_id.clone(), state);
        Ok(())
    }

    async fn get_state(&self, task_exec_id: &str) -> Result<Option<TaskState>> {
        let states = self.states.lock();
        Ok(states.get(task_exec_id).cloned())
    }

    async fn with_transaction<'a>(
        &'a self,
        f: Box<dyn FnOnce(&dyn TxStateStore) -> BoxFuture<'_, Result<()>> + Send + 'a>,
    ) -> Result<()> {
        // `tx_lock` is held across the whole closure, not just the
        // individual `states` lock/unlock per call inside it, so a
        // concurrent transaction can't interleave a read or write between
        // this transaction's own get/list/upsert sequence.
        let _guard = self.tx_lock.lock().await;
        let tx = InMemoryTx { store: self };
        f(&tx).await
    }

    async fn list_children(&self, parent_id: &str) -> Result<Vec<TaskState>> {
        let states = self.states.lock();
        Ok(Self::children_of(&states, parent_id))
    }

    async fn list_children_outputs(
        &self,
        parent_id: &str,
    ) -> Result<HashMap<String, Option<serde_json::Value>>> {
        let states = self.states.lock();
        Ok(Self::children_of(&states, parent_id)
            .into_iter()
            .filter(|c| c.status.is_success())
            .map(|c| (c.task_id, c.output))
            .collect())
    }

    async fn get_child_by_task_id(
        &self,
        parent_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskState>> {
        let states = self.states.lock();
        Ok(Self::children_of(&states, parent_id)
            .into_iter()
            .find(|c| c.task_id == task_id))
    }

    async fn get_progress_info(&self, parent_id: &str) -> Result<ProgressInfo> {
        let states = self.states.lock();
        let children = Self::children_of(&states, parent_id);
        Ok(ProgressInfo::from_children(&children))
    }

    async fn merge_usage(&self, task_exec_id: &str, summary: UsageSummary) -> Result<()> {
        let mut states = self.states.lock();
        let state = states
            .get_mut(task_exec_id)
            .ok_or_else(|| OrchestratorError::Transient(format!("unknown task_exec_id {task_exec_id}")))?;
        state.usage.push(summary);
        Ok(())
    }
}
