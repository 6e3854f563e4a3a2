//! External collaborators consumed by the dispatcher (C9): the agent and
//! tool invocation runtimes and the memory manager. Spec §1 scopes these
//! out as external components; this module only specifies the contracts
//! the core calls through, mirroring
//! `durable_shannon::activities::{Activity, ActivityContext, ActivityResult}`
//! — a small `async_trait` per concern, `Send + Sync`, returning a typed
//! result the dispatcher folds into `TaskState.output`/`error`.

use async_trait::async_trait;
use serde_json::Value;

use crate::state::UsageSummary;

/// Outcome of invoking an agent action or a tool, folded into
/// `TaskState.output`/`error` by the basic-task executor.
#[derive(Debug, Clone)]
pub struct RuntimeOutcome {
    pub output: Value,
    pub usage: Option<UsageSummary>,
}

impl RuntimeOutcome {
    #[must_use]
    pub fn new(output: Value) -> Self {
        Self { output, usage: None }
    }

    #[must_use]
    pub fn with_usage(mut self, usage: UsageSummary) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Error surfaced by an agent/tool/memory runtime. The dispatcher wraps
/// this as `OrchestratorError::Runtime`; `retryable` follows the task's
/// own `retries` policy per spec §7.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub reason: String,
    pub retryable: bool,
}

impl RuntimeError {
    #[must_use]
    pub fn new(reason: impl Into<String>, retryable: bool) -> Self {
        Self {
            reason: reason.into(),
            retryable,
        }
    }
}

pub type RuntimeResult = Result<RuntimeOutcome, RuntimeError>;

/// Invokes an LLM agent action by name. Settings/env have already been
/// templated and merged by the normalizer (C4) before this is called.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn invoke(
        &self,
        agent: &str,
        action: &str,
        settings: Option<&Value>,
        input: &Value,
        env: &std::collections::HashMap<String, String>,
    ) -> RuntimeResult;
}

/// Invokes a native tool by name.
#[async_trait]
pub trait ToolRuntime: Send + Sync {
    async fn invoke(
        &self,
        tool: &str,
        params: Option<&Value>,
        input: &Value,
        env: &std::collections::HashMap<String, String>,
    ) -> RuntimeResult;
}

/// Performs a `memory` task's requested operation against a named memory
/// reference (spec §3 `memory_ref`). `read` returns the stored value (or
/// `Value::Null` if absent); `write`/`append` return the new value.
#[async_trait]
pub trait MemoryManager: Send + Sync {
    async fn read(&self, memory_ref: &str, key: Option<&str>) -> RuntimeResult;
    async fn write(&self, memory_ref: &str, key: Option<&str>, value: &Value) -> RuntimeResult;
    async fn append(&self, memory_ref: &str, key: Option<&str>, value: &Value) -> RuntimeResult;
}

#[async_trait]
impl<T: AgentRuntime + ?Sized> AgentRuntime for Box<T> {
    async fn invoke(
        &self,
        agent: &str,
        action: &str,
        settings: Option<&Value>,
        input: &Value,
        env: &std::collections::HashMap<String, String>,
    ) -> RuntimeResult {
        (**self).invoke(agent, action, settings, input, env).await
    }
}

#[async_trait]
impl<T: ToolRuntime + ?Sized> ToolRuntime for Box<T> {
    async fn invoke(
        &self,
        tool: &str,
        params: Option<&Value>,
        input: &Value,
        env: &std::collections::HashMap<String, String>,
    ) -> RuntimeResult {
        (**self).invoke(tool, params, input, env).await
    }
}

#[async_trait]
impl<T: MemoryManager + ?Sized> MemoryManager for Box<T> {
    async fn read(&self, memory_ref: &str, key: Option<&str>) -> RuntimeResult {
        (**self).read(memory_ref, key).await
    }
    async fn write(&self, memory_ref: &str, key: Option<&str>, value: &Value) -> RuntimeResult {
        (**self).write(memory_ref, key, value).await
    }
    async fn append(&self, memory_ref: &str, key: Option<&str>, value: &Value) -> RuntimeResult {
        (**self).append(memory_ref, key, value).await
    }
}

/// Test/demo double: echoes a deterministic output, used by the seed-suite
/// integration tests (spec §8 S1–S6) where real agent/tool calls are out of
/// scope.
#[derive(Debug, Default)]
pub struct EchoRuntime;

#[async_trait]
impl AgentRuntime for EchoRuntime {
    async fn invoke(
        &self,
        _agent: &str,
        _action: &str,
        _settings: Option<&Value>,
        input: &Value,
        _env: &std::collections::HashMap<String, String>,
    ) -> RuntimeResult {
        Ok(RuntimeOutcome::new(input.clone()))
    }
}

#[async_trait]
impl ToolRuntime for EchoRuntime {
    async fn invoke(
        &self,
        _tool: &str,
        _params: Option<&Value>,
        input: &Value,
        _env: &std::collections::HashMap<String, String>,
    ) -> RuntimeResult {
        Ok(RuntimeOutcome::new(input.clone()))
    }
}

#[async_trait]
impl MemoryManager for EchoRuntime {
    async fn read(&self, _memory_ref: &str, _key: Option<&str>) -> RuntimeResult {
        Ok(RuntimeOutcome::new(Value::Null))
    }
    async fn write(&self, _memory_ref: &str, _key: Option<&str>, value: &Value) -> RuntimeResult {
        Ok(RuntimeOutcome::new(value.clone()))
    }
    async fn append(&self, _memory_ref: &str, _key: Option<&str>, value: &Value) -> RuntimeResult {
        Ok(RuntimeOutcome::new(value.clone()))
    }
}
