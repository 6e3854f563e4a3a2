use thiserror::Error;

/// Error taxonomy for the orchestration core.
///
/// Retry policy lives with the caller: `retryable()` reports whether the
/// substrate should redeliver, but this crate never retries on its own.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Config failed type/union constraints or required-field checks.
    #[error("config shape error in task '{task_id}': {reason}")]
    ConfigShape { task_id: String, reason: String },

    /// Template evaluation failed (missing key, parse error).
    #[error("template error: {0}")]
    Template(String),

    /// Router chose a label not present in its `routes` map.
    #[error("router '{task_id}' chose unknown route '{route}'")]
    RouteUnknown { task_id: String, route: String },

    /// Child config rejected during factory expansion.
    #[error("child validation failed for '{task_id}': {reason}")]
    ChildValidation { task_id: String, reason: String },

    /// Task or wait exceeded its timeout.
    #[error("task '{task_id}' timed out after {seconds}s")]
    Timeout { task_id: String, seconds: u64 },

    /// Ambient cancellation.
    #[error("task '{task_id}' canceled")]
    Canceled { task_id: String },

    /// Network/store contention; the substrate is expected to retry.
    #[error("transient error: {0}")]
    Transient(String),

    /// Agent/tool/memory runtime reported failure.
    #[error("runtime error in task '{task_id}': {reason}")]
    Runtime { task_id: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Whether the substrate should redeliver this task attempt.
    ///
    /// Only `Transient` is retried; everything else is deterministic from
    /// the core's point of view and is recorded as a terminal failure.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Stable machine-readable code for the workflow boundary's error
    /// envelope (`code`/`message`/`details`).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigShape { .. } => "config_shape",
            Self::Template(_) => "template",
            Self::RouteUnknown { .. } => "route_unknown",
            Self::ChildValidation { .. } => "child_validation",
            Self::Timeout { .. } => "timeout",
            Self::Canceled { .. } => "canceled",
            Self::Transient(_) => "transient",
            Self::Runtime { .. } => "runtime",
            Self::Other(_) => "internal",
        }
    }

    /// Convert to the sanitized, user-visible `TaskError` surfaced via
    /// `state.error`. Internal detail (e.g. anyhow chains) is logged by the
    /// caller, never placed in `message`.
    #[must_use]
    pub fn to_task_error(&self) -> crate::state::TaskError {
        crate::state::TaskError::new(self.code(), self.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Template(err.to_string())
    }
}

impl From<handlebars::RenderError> for OrchestratorError {
    fn from(err: handlebars::RenderError) -> Self {
        Self::Template(err.to_string())
    }
}

impl From<handlebars::TemplateError> for OrchestratorError {
    fn from(err: handlebars::TemplateError) -> Self {
        Self::Template(err.to_string())
    }
}
