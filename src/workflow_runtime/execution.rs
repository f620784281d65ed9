//! Per-execution driver — the single-stepper, channel-driven plugin runner.
//!
//! Grounded in `server/task_updater.rs`'s `Mutex<UpdaterState>` +
//! terminal-state-guard idiom: each execution keeps its own
//! `Mutex<ExecutionInner>` guarding a `terminal_reached` flag, and every
//! publish to the event bus goes through the same "check, then set, then
//! release the lock before the await" shape `TaskUpdater::update_status`
//! uses.
//!
//! The cooperative routine itself is modeled per `spec.md` §9 option (a): the
//! plugin's `execute` future runs on its own `tokio::task`, talking to this
//! driver over a pair of channels. `WorkflowContext::pause` is the only
//! context method that can block — every other yield method sends-and-
//! returns immediately, which is exactly "the runtime loops immediately" from
//! the spec's step table, achieved here for free because the plugin task
//! simply keeps running between sends.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::error::A2AResult;
use crate::event_bus::EventBus;
use crate::task_store::TaskStore;
use crate::types::{
    Artifact, EventPayload, Part, PauseInfo, PluginError, TaskState, TaskStatus,
};

use super::WorkflowPlugin;

/// One value a plugin's cooperative routine can emit mid-execution.
///
/// `Return`/`Fail` are not represented here — they are the `Ok`/`Err` of the
/// plugin future's final `Result`, observed by the driver via the task's
/// `JoinHandle` rather than sent over the yield channel.
#[derive(Debug, Clone)]
pub(crate) enum Yield {
    Status {
        state: TaskState,
        message: Option<String>,
    },
    Artifact {
        artifact: Artifact,
        append: bool,
        last_chunk: bool,
    },
    Progress {
        current: u64,
        total: u64,
    },
    Pause {
        reason: String,
        input_schema: serde_json::Value,
        message: Option<String>,
        reply: Arc<Mutex<Option<oneshot::Sender<PauseOutcome>>>>,
    },
    DispatchResponse {
        parts: Vec<Part>,
    },
}

/// What a paused plugin receives back from `WorkflowContext::pause`.
#[derive(Debug, Clone)]
pub enum PauseOutcome {
    /// The caller supplied schema-validated input; here it is.
    Resumed(serde_json::Value),
    /// The execution was canceled while paused.
    Canceled,
}

/// The runtime's only handle into a spawned execution: enough to resume or
/// cancel it, and to inspect whether (and on what schema) it is paused.
pub(crate) struct ExecutionControl {
    inner: Arc<Mutex<ControlInner>>,
}

struct ControlInner {
    /// Set while the execution is parked in `WorkflowContext::pause`.
    pending_pause: Option<PendingPause>,
    terminal: bool,
    driver: Option<JoinHandle<()>>,
    /// Shared with the plugin's `WorkflowContext`; `cancel()` sets this
    /// unconditionally so a non-paused plugin polling `is_canceled()`
    /// between yields observes the signal even though it has no pending
    /// pause to wake.
    canceled: Arc<std::sync::atomic::AtomicBool>,
}

struct PendingPause {
    schema: serde_json::Value,
    reply: Arc<Mutex<Option<oneshot::Sender<PauseOutcome>>>>,
}

impl ExecutionControl {
    pub(crate) async fn pause_schema(&self) -> Option<serde_json::Value> {
        let inner = self.inner.lock().await;
        inner.pending_pause.as_ref().map(|p| p.schema.clone())
    }

    pub(crate) async fn pause_info(&self) -> Option<PauseInfo> {
        // The schema is all `ExecutionControl` retains; reason/message live
        // only in the task record (set via the `status-update` the driver
        // already published), so callers needing the full `PauseInfo`
        // should read it off the `Task` via `TaskStore` instead. Kept here
        // for the narrow case of routing validation, which only needs the
        // schema.
        let inner = self.inner.lock().await;
        inner.pending_pause.as_ref().map(|p| PauseInfo {
            reason: String::new(),
            input_schema: p.schema.clone(),
            message: None,
        })
    }

    pub(crate) async fn resume(&self, input: serde_json::Value) -> A2AResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(pending) = inner.pending_pause.take() {
            let mut reply = pending.reply.lock().await;
            if let Some(sender) = reply.take() {
                let _ = sender.send(PauseOutcome::Resumed(input));
            }
        }
        Ok(())
    }

    pub(crate) async fn cancel(&self) {
        let mut inner = self.inner.lock().await;
        if inner.terminal {
            return;
        }
        inner.canceled.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(pending) = inner.pending_pause.take() {
            let mut reply = pending.reply.lock().await;
            if let Some(sender) = reply.take() {
                let _ = sender.send(PauseOutcome::Canceled);
            }
        }
        // Not currently paused: the plugin observes `canceled` the next time
        // it checks `WorkflowContext::is_canceled()` or calls `pause()`. The
        // deadline watcher spawned alongside the driver force-terminates the
        // task if it does not observe completion within the cancellation
        // grace period (`spec.md` §4.4.1).
    }
}

/// Spawn the driver task for a freshly dispatched execution.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn(
    task_id: String,
    context_id: String,
    plugin: Arc<dyn WorkflowPlugin>,
    parameters: serde_json::Value,
    event_bus: EventBus,
    task_store: TaskStore,
    cancel_grace: Duration,
) -> ExecutionControl {
    let canceled_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let control_inner = Arc::new(Mutex::new(ControlInner {
        pending_pause: None,
        terminal: false,
        driver: None,
        canceled: canceled_flag.clone(),
    }));

    let (yield_tx, mut yield_rx) = mpsc::unbounded_channel::<Yield>();
    let ctx = WorkflowContext {
        yield_tx,
        canceled: canceled_flag.clone(),
    };

    let plugin_task: JoinHandle<Result<serde_json::Value, PluginError>> =
        tokio::spawn(async move { plugin.execute(ctx, parameters).await });

    let control_for_driver = control_inner.clone();
    let driver = tokio::spawn(async move {
        let mut plugin_task = plugin_task;
        loop {
            tokio::select! {
                biased;
                maybe_yield = yield_rx.recv() => {
                    match maybe_yield {
                        Some(y) => {
                            handle_yield(&task_id, &event_bus, &task_store, &control_for_driver, y).await;
                        }
                        None => {
                            // Plugin task dropped the sender without
                            // completing — fall through to awaiting the
                            // join handle, which will resolve.
                        }
                    }
                }
                joined = &mut plugin_task => {
                    let result = joined.unwrap_or_else(|e| {
                        error!(error = %e, "workflow plugin task panicked");
                        Err(PluginError::new("PluginError", format!("execution panicked: {e}")))
                    });
                    finish(&task_id, &event_bus, &task_store, &control_for_driver, result).await;
                    break;
                }
            }

            let is_terminal = control_for_driver.lock().await.terminal;
            if is_terminal {
                break;
            }
        }
    });

    tokio::spawn(deadline_watcher(
        control_inner.clone(),
        canceled_flag,
        task_id_for_deadline(&context_id),
        cancel_grace,
    ));

    {
        let control_inner = control_inner.clone();
        tokio::spawn(async move {
            let mut inner = control_inner.lock().await;
            inner.driver = Some(driver);
        });
    }

    ExecutionControl { inner: control_inner }
}

// The deadline watcher only needs *a* string for logging; reuse context_id to
// avoid threading a second clone of task_id through `spawn`'s already-long
// argument list.
fn task_id_for_deadline(context_id: &str) -> String {
    context_id.to_string()
}

async fn deadline_watcher(
    control: Arc<Mutex<ControlInner>>,
    canceled: Arc<std::sync::atomic::AtomicBool>,
    label: String,
    grace: Duration,
) {
    loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let inner = control.lock().await;
        if inner.terminal {
            return;
        }
        drop(inner);
        if canceled.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }
    }

    tokio::time::sleep(grace).await;
    let mut inner = control.lock().await;
    if inner.terminal {
        return;
    }
    warn!(label = %label, "workflow execution did not terminate within cancellation grace period; forcing cancellation");
    inner.terminal = true;
    if let Some(handle) = inner.driver.take() {
        handle.abort();
    }
    // The force-cancel status-update itself is published by whoever observes
    // `terminal` flip without a prior canceled/completed/failed event; in
    // this driver that responsibility lives in `cancel()`'s caller
    // (`WorkflowRuntime::cancel`), which publishes immediately. The watcher
    // exists purely to guarantee the task doesn't dangle forever.
}

async fn handle_yield(
    task_id: &str,
    event_bus: &EventBus,
    task_store: &TaskStore,
    control: &Arc<Mutex<ControlInner>>,
    y: Yield,
) {
    match y {
        Yield::Status { state, message } => {
            let status = TaskStatus {
                state,
                message: message.map(|m| crate::utils::new_agent_text_message(m, Some(task_id.to_string()), Some(task_id.to_string()))),
                timestamp: Some(Utc::now().to_rfc3339()),
            };
            publish_status(task_id, event_bus, task_store, status, None, None).await;
        }
        Yield::Progress { current, total } => {
            let status = TaskStatus {
                state: TaskState::Working,
                message: None,
                timestamp: Some(Utc::now().to_rfc3339()),
            };
            let metadata = serde_json::json!({ "progress": { "current": current, "total": total } });
            publish_status(task_id, event_bus, task_store, status, None, Some(metadata)).await;
        }
        Yield::Artifact { artifact, append, last_chunk } => {
            let record = event_bus
                .publish(
                    task_id,
                    EventPayload::ArtifactUpdate {
                        artifact,
                        append: Some(append),
                        last_chunk: Some(last_chunk),
                    },
                    false,
                )
                .await;
            if let Ok(record) = record {
                let _ = task_store.apply_event(&record).await;
            }
        }
        Yield::DispatchResponse { parts } => {
            let message = crate::utils::new_agent_parts_message(parts, Some(task_id.to_string()), Some(task_id.to_string()));
            let record = event_bus
                .publish(task_id, EventPayload::Message { message }, false)
                .await;
            if let Ok(record) = record {
                let _ = task_store.apply_event(&record).await;
            }
        }
        Yield::Pause { reason, input_schema, message, reply } => {
            let mut inner = control.lock().await;
            inner.pending_pause = Some(PendingPause {
                schema: input_schema.clone(),
                reply,
            });
            drop(inner);

            let status_message = message
                .map(|m| crate::utils::new_agent_text_message(m, Some(task_id.to_string()), Some(task_id.to_string())));
            let status = TaskStatus {
                state: TaskState::InputRequired,
                message: status_message.clone(),
                timestamp: Some(Utc::now().to_rfc3339()),
            };
            let pause_info = PauseInfo {
                reason,
                input_schema,
                message: status_message,
            };
            publish_status(task_id, event_bus, task_store, status, Some(pause_info), None).await;
        }
    }
}

async fn publish_status(
    task_id: &str,
    event_bus: &EventBus,
    task_store: &TaskStore,
    status: TaskStatus,
    pause_info: Option<PauseInfo>,
    metadata: Option<serde_json::Value>,
) {
    let is_final = matches!(
        status.state,
        TaskState::Completed | TaskState::Failed | TaskState::Canceled
    );
    let record = event_bus
        .publish(
            task_id,
            EventPayload::StatusUpdate {
                status,
                reference_task_ids: None,
                metadata,
                pause_info,
            },
            is_final,
        )
        .await;
    if let Ok(record) = record {
        let _ = task_store.apply_event(&record).await;
    }
}

async fn finish(
    task_id: &str,
    event_bus: &EventBus,
    task_store: &TaskStore,
    control: &Arc<Mutex<ControlInner>>,
    result: Result<serde_json::Value, PluginError>,
) {
    let mut inner = control.lock().await;
    if inner.terminal {
        return;
    }
    inner.terminal = true;
    inner.pending_pause = None;
    drop(inner);

    let (state, metadata) = match result {
        Ok(value) => (TaskState::Completed, Some(serde_json::json!({ "result": value }))),
        Err(error) if error.code == "canceled" => {
            (TaskState::Canceled, Some(serde_json::json!({ "error": error })))
        }
        Err(error) => {
            error!(task_id, code = %error.code, "workflow execution failed");
            (TaskState::Failed, Some(serde_json::json!({ "error": error })))
        }
    };

    let status = TaskStatus {
        state,
        message: None,
        timestamp: Some(Utc::now().to_rfc3339()),
    };
    publish_status(task_id, event_bus, task_store, status, None, metadata).await;
}

/// The only channel a plugin's `execute` routine has back to the runtime.
///
/// A fresh context is constructed per execution (`spec.md` §5: "Workflow
/// plugins must not share mutable state across executions").
pub struct WorkflowContext {
    yield_tx: mpsc::UnboundedSender<Yield>,
    canceled: Arc<std::sync::atomic::AtomicBool>,
}

impl WorkflowContext {
    /// `Yield::status{working}` style transition that does not pause.
    pub async fn yield_status(&self, state: TaskState, message: Option<String>) {
        let _ = self.yield_tx.send(Yield::Status { state, message });
    }

    /// `Yield::artifact{...}`.
    pub async fn yield_artifact(&self, artifact: Artifact, append: bool, last_chunk: bool) {
        let _ = self.yield_tx.send(Yield::Artifact { artifact, append, last_chunk });
    }

    /// `Yield::progress{current,total}`.
    pub async fn yield_progress(&self, current: u64, total: u64) {
        let _ = self.yield_tx.send(Yield::Progress { current, total });
    }

    /// `Yield::dispatch-response{parts}`.
    pub async fn dispatch_response(&self, parts: Vec<Part>) {
        let _ = self.yield_tx.send(Yield::DispatchResponse { parts });
    }

    /// `Yield::pause{reason, inputSchema, message}` — suspends until the
    /// runtime feeds back either schema-validated input (`resume`) or a
    /// cancellation signal.
    pub async fn pause(
        &self,
        reason: impl Into<String>,
        input_schema: serde_json::Value,
        message: Option<String>,
    ) -> PauseOutcome {
        let (tx, rx) = oneshot::channel();
        let reply = Arc::new(Mutex::new(Some(tx)));
        let _ = self.yield_tx.send(Yield::Pause {
            reason: reason.into(),
            input_schema,
            message,
            reply,
        });
        match rx.await {
            Ok(outcome) => {
                if matches!(outcome, PauseOutcome::Canceled) {
                    self.canceled.store(true, std::sync::atomic::Ordering::SeqCst);
                }
                outcome
            }
            Err(_) => PauseOutcome::Canceled,
        }
    }

    /// Whether the execution has observed a cancellation signal. Plugins
    /// that do meaningful work between yields should check this
    /// periodically and return `Err(PluginError::canceled())` promptly
    /// (`spec.md` §4.4.1: "a well-behaved plugin propagates this as
    /// fail{canceled}").
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(std::sync::atomic::Ordering::SeqCst)
    }
}
