//! Config model (C1): typed workflow/task configuration, map conversion,
//! and the merge semantics route inheritance and env merging build on.

pub mod runtime;
pub mod task;
pub mod workflow;
