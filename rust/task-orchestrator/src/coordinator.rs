//! Signal/wait coordinator (C10): registers waits, routes inbound signals
//! to waiting instances, and enforces timeouts. In-process analog of
//! `durable_shannon`'s signal channels, built the same way
//! `durable_shannon::backends::InMemoryEventLog` builds its reference
//! backend: a `parking_lot`-guarded map plus `tokio::sync` primitives for
//! suspension.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestratorError, Result};
use crate::substrate::Substrate;
use crate::template::TemplateEngine;

/// Key a wait/signal pair is addressed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WaitKey {
    workflow_exec_id: String,
    signal_name: String,
}

struct Waiter {
    condition: Option<String>,
    reply: oneshot::Sender<Value>,
}

/// Outcome of a `wait` suspension.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    Signaled(Value),
    TimedOut,
    Canceled,
}

#[derive(Default)]
struct Bucket {
    waiters: VecDeque<Waiter>,
    /// Buffered signals for a `(workflow_exec_id, signal_name)` pair that
    /// arrived before any waiter registered; retained up to
    /// `RuntimeConfig::signal_retention_secs` per spec §4.10.
    buffered: VecDeque<(Value, std::time::Instant)>,
}

/// In-process signal/wait coordinator.
pub struct SignalCoordinator {
    buckets: Mutex<HashMap<WaitKey, Bucket>>,
    retention: Duration,
}

impl std::fmt::Debug for SignalCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalCoordinator").finish_non_exhaustive()
    }
}

impl SignalCoordinator {
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Suspend until a signal matching `signal_name` arrives and (if
    /// `condition` is set) templating it against `{ signal: payload }`
    /// evaluates truthy, or `timeout` elapses, or `cancel` fires.
    #[allow(clippy::too_many_arguments, reason = "substrate is an explicit collaborator, same as engine")]
    pub async fn wait(
        &self,
        engine: &dyn TemplateEngine,
        substrate: &dyn Substrate,
        workflow_exec_id: &str,
        signal_name: &str,
        condition: Option<&str>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome> {
        let key = WaitKey {
            workflow_exec_id: workflow_exec_id.to_string(),
            signal_name: signal_name.to_string(),
        };

        // First, check the buffer for an already-buffered matching signal
        // (retained for waiters that register late).
        if let Some(payload) = self.take_buffered_match(engine, &key, condition)? {
            return Ok(WaitOutcome::Signaled(payload));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut buckets = self.buckets.lock();
            buckets.entry(key.clone()).or_default().waiters.push_back(Waiter {
                condition: condition.map(str::to_string),
                reply: tx,
            });
        }

        let sleep = async {
            match timeout {
                Some(d) => substrate.sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.remove_waiter(&key);
                Ok(WaitOutcome::Canceled)
            }
            result = rx => {
                match result {
                    Ok(payload) => Ok(WaitOutcome::Signaled(payload)),
                    Err(_) => Ok(WaitOutcome::Canceled),
                }
            }
            () = sleep => {
                self.remove_waiter(&key);
                Ok(WaitOutcome::TimedOut)
            }
        }
    }

    /// Deliver `payload` to the FIFO-eligible waiter whose `condition` (if
    /// any) renders truthy against `{ signal: payload }`; if none is
    /// registered, buffer it for up to `retention`.
    pub fn signal(&self, engine: &dyn TemplateEngine, workflow_exec_id: &str, signal_name: &str, payload: Value) -> Result<()> {
        let key = WaitKey {
            workflow_exec_id: workflow_exec_id.to_string(),
            signal_name: signal_name.to_string(),
        };
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key).or_default();

        let ctx = serde_json::json!({ "signal": payload });
        let mut matched_index = None;
        for (idx, waiter) in bucket.waiters.iter().enumerate() {
            if condition_truthy(engine, waiter.condition.as_deref(), &ctx)? {
                matched_index = Some(idx);
                break;
            }
        }

        if let Some(idx) = matched_index {
            let waiter = bucket.waiters.remove(idx).expect("index was just located");
            let _ = waiter.reply.send(payload);
        } else {
            bucket.buffered.push_back((payload, std::time::Instant::now()));
            self.evict_expired(bucket);
        }
        Ok(())
    }

    fn take_buffered_match(
        &self,
        engine: &dyn TemplateEngine,
        key: &WaitKey,
        condition: Option<&str>,
    ) -> Result<Option<Value>> {
        let mut buckets = self.buckets.lock();
        let Some(bucket) = buckets.get_mut(key) else {
            return Ok(None);
        };
        self.evict_expired(bucket);
        let mut matched_index = None;
        for (idx, (payload, _)) in bucket.buffered.iter().enumerate() {
            let ctx = serde_json::json!({ "signal": payload });
            if condition_truthy(engine, condition, &ctx)? {
                matched_index = Some(idx);
                break;
            }
        }
        Ok(matched_index.map(|idx| bucket.buffered.remove(idx).expect("index was just located").0))
    }

    fn evict_expired(&self, bucket: &mut Bucket) {
        let retention = self.retention;
        bucket.buffered.retain(|(_, arrived)| arrived.elapsed() < retention);
    }

    fn remove_waiter(&self, key: &WaitKey) {
        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get_mut(key) {
            // Dropped senders (already consumed or canceled) are harmless;
            // nothing further to clean up beyond letting the deque shrink
            // naturally on the next access.
            bucket.waiters.retain(|w| !w.reply.is_closed());
        }
    }
}

fn condition_truthy(engine: &dyn TemplateEngine, condition: Option<&str>, ctx: &Value) -> Result<bool> {
    let Some(condition) = condition else {
        return Ok(true);
    };
    if !engine.has_template(condition) {
        return Err(OrchestratorError::Template(format!(
            "wait condition '{condition}' is not a template expression"
        )));
    }
    let rendered = engine.parse_any(&Value::String(condition.to_string()), ctx)?;
    Ok(is_truthy(&rendered))
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::SystemSubstrate;
    use crate::template::HandlebarsEngine;

    #[tokio::test]
    async fn signal_resolves_matching_waiter() {
        let engine = HandlebarsEngine::new();
        let substrate = SystemSubstrate;
        let coordinator = SignalCoordinator::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let wait_fut = coordinator.wait(&engine, &substrate, "wexec1", "go", None, Some(Duration::from_secs(1)), &cancel);
        let signal_fut = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            coordinator.signal(&engine, "wexec1", "go", serde_json::json!({"kind": "ready"})).unwrap();
        };
        let (outcome, ()) = tokio::join!(wait_fut, signal_fut);
        match outcome.unwrap() {
            WaitOutcome::Signaled(payload) => assert_eq!(payload["kind"], "ready"),
            other => panic!("expected Signaled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_times_out_without_a_signal() {
        let engine = HandlebarsEngine::new();
        let substrate = SystemSubstrate;
        let coordinator = SignalCoordinator::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let outcome = coordinator
            .wait(&engine, &substrate, "wexec1", "go", None, Some(Duration::from_millis(20)), &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::TimedOut));
    }

    #[tokio::test]
    async fn condition_filters_non_matching_signals() {
        let engine = HandlebarsEngine::new();
        let substrate = SystemSubstrate;
        let coordinator = SignalCoordinator::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let condition = "{{#if (eq signal.kind \"ready\")}}true{{else}}false{{/if}}";
        let wait_fut = coordinator.wait(
            &engine,
            &substrate,
            "wexec1",
            "go",
            Some(condition),
            Some(Duration::from_millis(200)),
            &cancel,
        );
        let signal_fut = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            coordinator.signal(&engine, "wexec1", "go", serde_json::json!({"kind": "not-ready"})).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            coordinator.signal(&engine, "wexec1", "go", serde_json::json!({"kind": "ready"})).unwrap();
        };
        let (outcome, ()) = tokio::join!(wait_fut, signal_fut);
        match outcome.unwrap() {
            WaitOutcome::Signaled(payload) => assert_eq!(payload["kind"], "ready"),
            other => panic!("expected Signaled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_resolves_wait_as_canceled() {
        let engine = HandlebarsEngine::new();
        let substrate = SystemSubstrate;
        let coordinator = SignalCoordinator::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        let wait_fut = coordinator.wait(&engine, &substrate, "wexec1", "go", None, Some(Duration::from_secs(5)), &cancel);
        let cancel_fut = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_clone.cancel();
        };
        let (outcome, ()) = tokio::join!(wait_fut, cancel_fut);
        assert!(matches!(outcome.unwrap(), WaitOutcome::Canceled));
    }

    #[tokio::test]
    async fn buffered_signal_is_delivered_to_late_waiter() {
        let engine = HandlebarsEngine::new();
        let substrate = SystemSubstrate;
        let coordinator = SignalCoordinator::new(Duration::from_secs(60));
        coordinator.signal(&engine, "wexec1", "go", serde_json::json!({"kind": "ready"})).unwrap();

        let cancel = CancellationToken::new();
        let outcome = coordinator
            .wait(&engine, &substrate, "wexec1", "go", None, Some(Duration::from_millis(200)), &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Signaled(_)));
    }
}
