//! Durable-substrate seam (spec §5/§6): the two primitives a workflow
//! coordinator must source from its runtime rather than from ambient
//! process state — `Now()` and `Sleep(duration)` — so that swapping in a
//! durable backend (one that persists and replays these calls) does not
//! require touching the orchestrator's control flow. Mirrors the narrow,
//! one-trait-per-concern shape of [`crate::metrics::OrchestratorMetrics`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// The subset of a durable workflow runtime the orchestrator core actually
/// consumes. A durable backend implements this against its own replay log;
/// [`SystemSubstrate`] is the direct, non-durable default used by tests and
/// by callers that have not wired a real substrate.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Current time, as the coordinator should observe it. A durable
    /// backend replays the value recorded on first execution rather than
    /// re-reading the system clock.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend for `duration`. A durable backend schedules a durable timer
    /// instead of blocking the calling task.
    async fn sleep(&self, duration: Duration);
}

/// Direct pass-through to the system clock and `tokio::time::sleep`. Not
/// durable — replaying a workflow against this substrate re-runs real time,
/// which is fine for in-process/test use but not for a crash-safe backend.
#[derive(Debug, Default)]
pub struct SystemSubstrate;

#[async_trait]
impl Substrate for SystemSubstrate {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
