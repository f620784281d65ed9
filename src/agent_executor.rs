//! Agent executor — the routing classifier in front of `StreamProcessor` and
//! `WorkflowRuntime`.
//!
//! Grounded in the inherited SDK's `server/agent_executor.rs`
//! (`RequestContextBuilder`/`SimpleRequestContextBuilder`), which builds an
//! execution context from an inbound message before always starting a fresh
//! execution. This module generalizes that single-path shape into the
//! two-branch routing rule of `spec.md` §4.6: a message either resumes a
//! paused workflow task or starts a new AI turn — never both, never neither.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::context_manager::ContextManager;
use crate::error::{A2AError, A2AResult};
use crate::event_bus::EventBus;
use crate::stream_processor::{ModelProvider, StreamProcessor, ToolInvoker, TurnHandle};
use crate::task_store::TaskStore;
use crate::types::{EventPayload, Message, Part, Task, TaskKind, TaskState, TaskStatus};
use crate::workflow_runtime::{ResumeResult, WorkflowRuntime};

/// What routing a message actually did.
#[derive(Debug, Clone)]
pub enum RoutingOutcome {
    /// A new AI-turn task was created and its `StreamProcessor` run spawned.
    NewTurn { task_id: String, context_id: String },
    /// `taskId` resolved to a paused workflow task; its resume result.
    Resumed { task_id: String, result: ResumeResult },
}

/// Routes inbound messages to either a workflow resume or a fresh AI turn,
/// and owns the context/task bookkeeping that precedes both.
///
/// Cheaply `Clone`: every field is itself a cheaply-cloneable handle.
#[derive(Clone)]
pub struct AgentExecutor {
    context_manager: ContextManager,
    task_store: TaskStore,
    event_bus: EventBus,
    workflow_runtime: WorkflowRuntime,
    stream_processor: StreamProcessor,
    model_provider: Arc<dyn ModelProvider>,
    tool_invoker: Arc<dyn ToolInvoker>,
    /// `(taskId, messageId)` pairs that have already actually resolved via a
    /// real `WorkflowRuntime::resume` call, mapped to the `ResumeResult` that
    /// call returned, for the idempotence property (`spec.md` §8, Testable
    /// Property #4): repeating `message/send` with the same pair must not
    /// publish a second set of events, and must reflect the *original*
    /// outcome rather than a synthesized one. Only populated once a resume
    /// has genuinely happened — a request that instead errored or fell
    /// through to a new turn leaves no entry here, so retrying it runs the
    /// same routing logic again rather than fabricating a resume.
    seen: Arc<Mutex<HashMap<(String, String), ResumeResult>>>,
    /// Cancellation handles for in-flight AI-turn tasks, keyed by task id.
    /// Workflow tasks are canceled through `WorkflowRuntime` instead, which
    /// already tracks its own live executions — this registry exists only
    /// because an AI turn's `TurnHandle` has nowhere else to live once
    /// `start_new_turn` hands it off.
    turn_handles: Arc<Mutex<HashMap<String, TurnHandle>>>,
}

impl AgentExecutor {
    pub fn new(
        context_manager: ContextManager,
        task_store: TaskStore,
        event_bus: EventBus,
        workflow_runtime: WorkflowRuntime,
        stream_processor: StreamProcessor,
        model_provider: Arc<dyn ModelProvider>,
        tool_invoker: Arc<dyn ToolInvoker>,
    ) -> Self {
        Self {
            context_manager,
            task_store,
            event_bus,
            workflow_runtime,
            stream_processor,
            model_provider,
            tool_invoker,
            seen: Arc::new(Mutex::new(HashMap::new())),
            turn_handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fetch a task by id, straight from the shared `TaskStore`.
    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        self.task_store.get(task_id).await
    }

    /// Cancel a task by id, routing to whichever component owns its
    /// cancellation path: `WorkflowRuntime` for workflow tasks, the
    /// recorded `TurnHandle` for AI-turn tasks. A no-op on an already
    /// terminal task (`spec.md` §4.1 `cancel` is idempotent).
    pub async fn cancel_task(&self, task_id: &str) -> A2AResult<Task> {
        let task = self
            .task_store
            .get(task_id)
            .await
            .ok_or_else(|| A2AError::task_not_found(task_id.to_string()))?;

        if task.is_terminal() {
            return Ok(task);
        }

        match task.task_kind {
            TaskKind::Workflow => {
                self.workflow_runtime.cancel(task_id).await?;
            }
            TaskKind::AiTurn => {
                let handles = self.turn_handles.lock().await;
                if let Some(handle) = handles.get(task_id) {
                    handle.request_cancel();
                }
            }
        }

        Ok(self.task_store.get(task_id).await.unwrap_or(task))
    }

    /// Drop `TurnHandle`s for tasks that have already reached a terminal
    /// state, so the registry does not grow without bound over the node's
    /// lifetime. Safe to call periodically alongside
    /// `ContextManager::sweep_idle` (`spec.md` §4.3).
    pub async fn prune_terminal_turn_handles(&self) {
        let mut handles = self.turn_handles.lock().await;
        let mut dead = Vec::new();
        for task_id in handles.keys() {
            match self.task_store.get(task_id).await {
                Some(task) if task.is_terminal() => dead.push(task_id.clone()),
                None => dead.push(task_id.clone()),
                _ => {}
            }
        }
        for task_id in dead {
            handles.remove(&task_id);
        }
    }

    /// Route one inbound message per `spec.md` §4.6.
    ///
    /// `message.context_id` is reattached strictly — an unknown id is
    /// `InvalidRequest` (Scenario S4) rather than silently creating a new
    /// context. Leave it unset to always start a fresh context.
    pub async fn handle_message(&self, mut message: Message) -> A2AResult<RoutingOutcome> {
        let context_id = match message.context_id.clone() {
            Some(id) => {
                self.context_manager.reattach(&id).await?;
                id
            }
            None => self.context_manager.create().await.id,
        };
        message.context_id = Some(context_id.clone());

        if let Some(task_id) = message.task_id.clone() {
            let dedup_key = self.dedup_key(&task_id, &message);

            if let Some(key) = &dedup_key {
                let seen = self.seen.lock().await;
                if let Some(result) = seen.get(key).cloned() {
                    debug!(task_id, "duplicate message/send for task+messageId pair, replaying original resume result");
                    return Ok(RoutingOutcome::Resumed { task_id, result });
                }
            }

            if let Some(task) = self.task_store.get(&task_id).await {
                if task.context_id == context_id && !task.is_terminal() {
                    if task.task_kind == TaskKind::Workflow && task.status.state == TaskState::InputRequired {
                        let input = extract_resume_input(&message);
                        let result = self.workflow_runtime.resume(&task_id, input).await?;
                        if let Some(key) = dedup_key {
                            self.seen.lock().await.insert(key, result.clone());
                        }
                        return Ok(RoutingOutcome::Resumed { task_id, result });
                    }
                    return Err(A2AError::invalid_state(format!(
                        "task '{task_id}' is not awaiting input"
                    )));
                }
            }
        }

        self.start_new_turn(context_id, message).await
    }

    /// Create a fresh AI-turn task, record it against the context, publish
    /// its `task-created`/`submitted` events, and hand it to the
    /// `StreamProcessor`.
    async fn start_new_turn(&self, context_id: String, message: Message) -> A2AResult<RoutingOutcome> {
        self.context_manager.append_message(&context_id, message.clone()).await?;

        let task = self.task_store.create(TaskKind::AiTurn, &context_id, None).await;
        self.context_manager.record_task(&context_id, &task.id).await?;

        let created = self
            .event_bus
            .publish(&task.id, EventPayload::TaskCreated { task: task.clone() }, false)
            .await?;
        self.task_store.apply_event(&created).await?;

        let submitted = self
            .event_bus
            .publish(
                &task.id,
                EventPayload::StatusUpdate {
                    status: TaskStatus {
                        state: TaskState::Submitted,
                        message: None,
                        timestamp: Some(Utc::now().to_rfc3339()),
                    },
                    reference_task_ids: None,
                    metadata: None,
                    pause_info: None,
                },
                false,
            )
            .await?;
        self.task_store.apply_event(&submitted).await?;

        let handle = self.stream_processor.spawn(
            task.clone(),
            message,
            self.model_provider.clone(),
            self.tool_invoker.clone(),
        );
        self.turn_handles.lock().await.insert(task.id.clone(), handle);

        Ok(RoutingOutcome::NewTurn { task_id: task.id, context_id })
    }

    /// `(taskId, messageId)` dedup key for a message that names an existing
    /// task. New turns have no prior task id to dedup against — a repeated
    /// `message/send` with no `taskId` is, by definition, a new turn.
    fn dedup_key(&self, task_id: &str, message: &Message) -> Option<(String, String)> {
        Some((task_id.to_string(), message.message_id.clone()))
    }
}

/// Pull the resume input out of a message: the first `data` part's value if
/// present, else the concatenated text parts wrapped as `{"text": ...}`.
/// `WorkflowRuntime::resume` validates the result against the paused
/// execution's schema and rejects it there if it doesn't fit.
fn extract_resume_input(message: &Message) -> serde_json::Value {
    for part in &message.parts {
        if let Part::Data { data, .. } = part {
            return data.clone();
        }
    }
    let text = crate::utils::get_text_parts(&message.parts).join("\n");
    serde_json::json!({ "text": text })
}
