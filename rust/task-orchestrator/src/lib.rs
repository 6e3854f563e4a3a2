//! Task orchestration core: maps declarative workflow/task configuration
//! onto a durable execution substrate supplied by the caller.
//!
//! This crate is a library, not a service: the HTTP/API layer, persistence
//! driver, template engine backend, durable workflow runtime, and agent/tool
//! runtimes are all external collaborators, consumed here as trait objects
//! the caller supplies (`StateStore`, `TemplateEngine`, `AgentRuntime`,
//! `ToolRuntime`, `MemoryManager`). Each contract ships an in-memory/echo
//! double so the orchestrator is independently testable without wiring a
//! real backend.
//!
//! Module map mirrors the component breakdown this core implements:
//! - [`config`] — C1, typed task/workflow configuration.
//! - [`template`] — C2, the template engine adapter contract.
//! - [`context`] — C3, the per-task variable bag.
//! - [`normalize`] — C4, per-type config normalization.
//! - [`response`] — C5, per-type completion handling and aggregation.
//! - [`store`] — C6, the state store contract plus an in-memory reference.
//! - [`parent_status`] — C7, the parent status update protocol.
//! - [`child_factory`] — C8, child state creation (including collection
//!   item expansion).
//! - [`dispatcher`] — C9, leaf-task dispatch.
//! - [`coordinator`] — C10, signal/wait coordination.
//! - [`orchestrator`] — C11, the workflow execution loop.
//! - [`substrate`] — the durable-runtime `Now`/`Sleep` seam the above
//!   consume instead of reading the system clock/timer directly.

pub mod child_factory;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod metrics;
pub mod normalize;
pub mod orchestrator;
pub mod parent_status;
pub mod response;
pub mod runtimes;
pub mod state;
pub mod store;
pub mod substrate;
pub mod template;

/// Common imports for a caller wiring up an orchestrator instance.
pub mod prelude {
    pub use crate::config::runtime::RuntimeConfig;
    pub use crate::config::task::{Strategy, TaskConfig};
    pub use crate::config::workflow::WorkflowConfig;
    pub use crate::coordinator::SignalCoordinator;
    pub use crate::dispatcher::Dispatcher;
    pub use crate::error::{OrchestratorError, Result};
    pub use crate::orchestrator::{Orchestrator, WorkflowControl, WorkflowHandle};
    pub use crate::runtimes::{AgentRuntime, MemoryManager, ToolRuntime};
    pub use crate::state::{Status, TaskState, WorkflowState};
    pub use crate::store::{InMemoryStateStore, StateStore};
    pub use crate::substrate::{Substrate, SystemSubstrate};
    pub use crate::template::{HandlebarsEngine, TemplateEngine};
}
