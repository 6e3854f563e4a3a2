//! Observability surface (spec §6): a small trait over the metrics the
//! core emits, plus a `prometheus`-backed default. Mirrors
//! `agent_core::metrics`'s pattern of a registry-owning struct with one
//! method per counter/gauge/histogram family, registered once at
//! construction.

use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry};

use crate::error::Result;

/// Metrics emitted by the orchestration core. Implementations are
/// expected to be cheap to call from the hot path (counter/gauge
/// increments, no I/O).
pub trait OrchestratorMetrics: Send + Sync {
    fn workflow_started(&self, workflow_id: &str);
    fn workflow_completed(&self, workflow_id: &str, status: &str, duration_secs: f64);
    fn task_started(&self, task_type: &str);
    fn task_completed(&self, task_type: &str, status: &str, duration_secs: f64);
    fn parent_progress(&self, parent_task_id: &str, completion_rate: f64);
}

/// `prometheus`-backed default, registering its families on a caller-owned
/// `Registry` so the crate composes into a larger process's `/metrics`
/// endpoint rather than owning its own.
pub struct PrometheusMetrics {
    workflows_started: IntCounterVec,
    workflows_completed: IntCounterVec,
    workflow_duration_seconds: Histogram,
    tasks_started: IntCounterVec,
    tasks_completed: IntCounterVec,
    task_duration_seconds: Histogram,
    parent_progress_ratio: IntGaugeVec,
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}

impl PrometheusMetrics {
    /// Registers all families on `registry`. Fails only if a metric name
    /// collides with one already registered (programmer error — surfaced
    /// as `OrchestratorError::Other` since it is not a runtime condition).
    pub fn new(registry: &Registry) -> Result<Self> {
        let workflows_started = IntCounterVec::new(
            Opts::new("orchestrator_workflows_started_total", "Workflows started"),
            &["workflow_id"],
        )
        .map_err(anyhow::Error::from)?;
        let workflows_completed = IntCounterVec::new(
            Opts::new("orchestrator_workflows_completed_total", "Workflows completed by final status"),
            &["workflow_id", "status"],
        )
        .map_err(anyhow::Error::from)?;
        let workflow_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "orchestrator_workflow_duration_seconds",
            "Workflow end-to-end duration",
        ))
        .map_err(anyhow::Error::from)?;
        let tasks_started = IntCounterVec::new(
            Opts::new("orchestrator_tasks_started_total", "Tasks started by type"),
            &["task_type"],
        )
        .map_err(anyhow::Error::from)?;
        let tasks_completed = IntCounterVec::new(
            Opts::new("orchestrator_tasks_completed_total", "Tasks completed by type and final status"),
            &["task_type", "status"],
        )
        .map_err(anyhow::Error::from)?;
        let task_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "orchestrator_task_duration_seconds",
            "Per-task execution duration",
        ))
        .map_err(anyhow::Error::from)?;
        let parent_progress_ratio = IntGaugeVec::new(
            Opts::new("orchestrator_parent_progress_percent", "Completion percentage of a parent's children"),
            &["parent_task_id"],
        )
        .map_err(anyhow::Error::from)?;

        for collector in [
            Box::new(workflows_started.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(workflows_completed.clone()),
            Box::new(workflow_duration_seconds.clone()),
            Box::new(tasks_started.clone()),
            Box::new(tasks_completed.clone()),
            Box::new(task_duration_seconds.clone()),
            Box::new(parent_progress_ratio.clone()),
        ] {
            registry.register(collector).map_err(anyhow::Error::from)?;
        }

        Ok(Self {
            workflows_started,
            workflows_completed,
            workflow_duration_seconds,
            tasks_started,
            tasks_completed,
            task_duration_seconds,
            parent_progress_ratio,
        })
    }
}

impl OrchestratorMetrics for PrometheusMetrics {
    fn workflow_started(&self, workflow_id: &str) {
        self.workflows_started.with_label_values(&[workflow_id]).inc();
    }

    fn workflow_completed(&self, workflow_id: &str, status: &str, duration_secs: f64) {
        self.workflows_completed.with_label_values(&[workflow_id, status]).inc();
        self.workflow_duration_seconds.observe(duration_secs);
    }

    fn task_started(&self, task_type: &str) {
        self.tasks_started.with_label_values(&[task_type]).inc();
    }

    fn task_completed(&self, task_type: &str, status: &str, duration_secs: f64) {
        self.tasks_completed.with_label_values(&[task_type, status]).inc();
        self.task_duration_seconds.observe(duration_secs);
    }

    fn parent_progress(&self, parent_task_id: &str, completion_rate: f64) {
        #[allow(clippy::cast_possible_truncation, reason = "completion_rate is in [0.0, 1.0]")]
        let percent = (completion_rate * 100.0).round() as i64;
        self.parent_progress_ratio.with_label_values(&[parent_task_id]).set(percent);
    }
}

/// No-op implementation for callers that have not wired Prometheus.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl OrchestratorMetrics for NoopMetrics {
    fn workflow_started(&self, _workflow_id: &str) {}
    fn workflow_completed(&self, _workflow_id: &str, _status: &str, _duration_secs: f64) {}
    fn task_started(&self, _task_type: &str) {}
    fn task_completed(&self, _task_type: &str, _status: &str, _duration_secs: f64) {}
    fn parent_progress(&self, _parent_task_id: &str, _completion_rate: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_families_without_name_collisions() {
        let registry = Registry::new();
        let metrics = PrometheusMetrics::new(&registry).unwrap();
        metrics.workflow_started("wf1");
        metrics.task_started("basic");
        metrics.parent_progress("p1", 0.5);
        let families = registry.gather();
        assert!(!families.is_empty());
    }

    #[test]
    fn noop_metrics_never_panics() {
        let metrics = NoopMetrics;
        metrics.workflow_started("wf1");
        metrics.workflow_completed("wf1", "success", 1.0);
        metrics.task_started("basic");
        metrics.task_completed("basic", "success", 0.1);
        metrics.parent_progress("p1", 1.0);
    }
}
