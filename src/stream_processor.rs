//! Stream processor — drives exactly one AI turn on behalf of a task.
//!
//! Grounded in the inherited SDK's `server/request_handler.rs`
//! `DefaultRequestHandler::spawn_executor`, which already shows the idiom of
//! spawning a task that drives an executor to completion and converts
//! panics/errors into a terminal `failed` status. This module generalizes
//! that shape to drive a [`ModelProvider`] delta stream instead of a single
//! `execute` call, layering the `dispatch_workflow_*` interception rule of
//! `spec.md` §4.5 on top.
//!
//! `ModelProvider` and `ToolInvoker` are the crate's seam onto the LLM
//! provider adapter and the MCP tool transport — both explicitly out of
//! scope (`spec.md` §1). [`crate::testing`] ships one deterministic,
//! scriptable implementation of each for tests; a real embedder supplies its
//! own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::context_manager::ContextManager;
use crate::error::{A2AError, A2AResult};
use crate::event_bus::EventBus;
use crate::task_store::TaskStore;
use crate::types::{EventPayload, Message, Part, Task, TaskState, TaskStatus};
use crate::utils::new_agent_text_message;
use crate::workflow_runtime::{DispatchParams, WorkflowRuntime};

/// A tool definition advertised to the model: either an external MCP tool or
/// one of `WorkflowRuntime`'s `dispatch_workflow_*` pseudo-tools.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One round's request to the model: full working history plus the current
/// tool catalog. `StreamProcessor` issues a fresh request every time it
/// needs to re-enter the model after handling an external tool result.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub context_id: String,
    pub task_id: String,
    pub history: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
}

/// One increment of a model's response.
#[derive(Debug, Clone)]
pub enum ModelDelta {
    /// A chunk of assistant text, forwarded live as a `text-delta` event.
    Text(String),
    /// The model wants to call a tool (external or a workflow pseudo-tool).
    ToolCall {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// The model has nothing further to say this round.
    Finish,
}

/// The LLM provider adapter, treated as a black box returning a stream of
/// typed deltas. Out of scope to implement for real (`spec.md` §1); this
/// crate only defines the seam.
pub trait ModelProvider: Send + Sync {
    fn stream(&self, request: ModelRequest) -> BoxStream<'static, ModelDelta>;
}

/// Error returned by an external tool invocation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// The MCP tool transport, treated as a capability to invoke a named tool
/// with JSON arguments. Out of scope to implement for real (`spec.md` §1);
/// this crate only defines the seam.
#[async_trait::async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, name: &str, args: serde_json::Value) -> Result<serde_json::Value, ToolError>;

    /// Tool descriptors to union with the workflow pseudo-tools when
    /// building a turn's catalog. Default: no external tools.
    fn available_tools(&self) -> Vec<ToolDescriptor> {
        Vec::new()
    }
}

/// Cooperative handle to a spawned turn, letting the caller request
/// cancellation (`spec.md` §4.5 "on `T.cancel`, the processor aborts the
/// provider stream").
#[derive(Clone)]
pub struct TurnHandle {
    cancel: Arc<AtomicBool>,
}

impl TurnHandle {
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Drives one AI turn: consumes a [`ModelProvider`] delta stream, forwards
/// text to the task's event bus, and intercepts `dispatch_workflow_*` tool
/// calls to spawn child tasks via [`WorkflowRuntime`].
#[derive(Clone)]
pub struct StreamProcessor {
    event_bus: EventBus,
    task_store: TaskStore,
    context_manager: ContextManager,
    workflow_runtime: WorkflowRuntime,
    max_steps: usize,
}

impl StreamProcessor {
    pub fn new(
        event_bus: EventBus,
        task_store: TaskStore,
        context_manager: ContextManager,
        workflow_runtime: WorkflowRuntime,
    ) -> Self {
        Self {
            event_bus,
            task_store,
            context_manager,
            workflow_runtime,
            max_steps: crate::config::DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Spawn the turn as its own task, returning a handle to cancel it.
    /// `task` must already be recorded in the `TaskStore` (created by
    /// [`crate::agent_executor::AgentExecutor`]) with a `task-created` event
    /// already published.
    pub fn spawn(
        &self,
        task: Task,
        message: Message,
        model: Arc<dyn ModelProvider>,
        tool_invoker: Arc<dyn ToolInvoker>,
    ) -> TurnHandle {
        let handle = TurnHandle {
            cancel: Arc::new(AtomicBool::new(false)),
        };
        let this = self.clone();
        let cancel = handle.cancel.clone();
        tokio::spawn(async move {
            this.run(task, message, model, tool_invoker, cancel).await;
        });
        handle
    }

    async fn run(
        &self,
        task: Task,
        message: Message,
        model: Arc<dyn ModelProvider>,
        tool_invoker: Arc<dyn ToolInvoker>,
        cancel: Arc<AtomicBool>,
    ) {
        let task_id = task.id.clone();
        let context_id = task.context_id.clone();

        self.publish_status(&task_id, TaskState::Working, None, None, false).await;

        let mut history = self.context_manager.history(&context_id).await.unwrap_or_default();
        history.push(message);

        let tools = self.tool_catalog(tool_invoker.as_ref());

        let mut assistant_text = String::new();
        let mut referenced_children: Vec<String> = Vec::new();
        let mut step = 0usize;

        loop {
            if cancel.load(Ordering::SeqCst) {
                self.publish_status(&task_id, TaskState::Canceled, None, None, true).await;
                return;
            }
            if step >= self.max_steps {
                self.fail(&task_id, A2AError::step_limit_exceeded(format!(
                    "exceeded {} tool-call rounds", self.max_steps
                )))
                .await;
                return;
            }
            step += 1;

            let request = ModelRequest {
                context_id: context_id.clone(),
                task_id: task_id.clone(),
                history: history.clone(),
                tools: tools.clone(),
            };
            let mut stream = model.stream(request);

            let mut external_tool_result: Option<(String, String, serde_json::Value)> = None;
            let mut finished = false;

            while let Some(delta) = stream.next().await {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                match delta {
                    ModelDelta::Text(text) => {
                        assistant_text.push_str(&text);
                        let _ = self
                            .event_bus
                            .publish(&task_id, EventPayload::TextDelta { text }, false)
                            .await;
                    }
                    ModelDelta::ToolCall { call_id, name, arguments } => {
                        if let Some(plugin_id) = self.workflow_runtime.resolve_pseudo_tool(&name) {
                            match self
                                .workflow_runtime
                                .dispatch(DispatchParams {
                                    plugin_id,
                                    context_id: context_id.clone(),
                                    parameters: arguments,
                                    parent_task_id: Some(task_id.clone()),
                                })
                                .await
                            {
                                Ok(execution) => {
                                    referenced_children.push(execution.execution_id);
                                    self.publish_status(
                                        &task_id,
                                        TaskState::Working,
                                        None,
                                        Some(referenced_children.clone()),
                                        false,
                                    )
                                    .await;
                                }
                                Err(err) => {
                                    warn!(task_id = %task_id, error = %err, "workflow dispatch failed");
                                }
                            }
                            // Per spec.md §4.5: no tool-result is fed back to
                            // the model for a dispatch interception; keep
                            // draining the stream for any trailing text.
                        } else {
                            let result = tool_invoker.invoke(&name, arguments.clone()).await;
                            let value = match result {
                                Ok(v) => v,
                                Err(e) => serde_json::json!({ "error": e.message }),
                            };
                            external_tool_result = Some((call_id, name, value));
                            break;
                        }
                    }
                    ModelDelta::Finish => {
                        finished = true;
                        break;
                    }
                }
            }

            if cancel.load(Ordering::SeqCst) {
                self.publish_status(&task_id, TaskState::Canceled, None, None, true).await;
                return;
            }

            match external_tool_result {
                Some((call_id, name, value)) => {
                    history.push(tool_round_trip_message(&context_id, &task_id, &call_id, &name, &value));
                    // Loop again: re-enter the model with the tool result in
                    // history.
                }
                None => break,
            }

            if finished {
                break;
            }
        }

        if !assistant_text.is_empty() {
            let final_message = new_agent_text_message(
                assistant_text.clone(),
                Some(context_id.clone()),
                Some(task_id.clone()),
            );
            let _ = self.context_manager.append_message(&context_id, final_message).await;
        }

        self.publish_status(
            &task_id,
            TaskState::Completed,
            None,
            if referenced_children.is_empty() { None } else { Some(referenced_children) },
            true,
        )
        .await;
    }

    fn tool_catalog(&self, tool_invoker: &dyn ToolInvoker) -> Vec<ToolDescriptor> {
        let mut tools = tool_invoker.available_tools();
        for tool_name in self.workflow_runtime.get_available_tools() {
            tools.push(ToolDescriptor {
                name: tool_name,
                description: "Dispatch a workflow execution.".to_string(),
                parameters: serde_json::json!({ "type": "object" }),
            });
        }
        tools
    }

    async fn publish_status(
        &self,
        task_id: &str,
        state: TaskState,
        message: Option<Message>,
        reference_task_ids: Option<Vec<String>>,
        is_final: bool,
    ) {
        let status = TaskStatus {
            state,
            message,
            timestamp: Some(Utc::now().to_rfc3339()),
        };
        let record = self
            .event_bus
            .publish(
                task_id,
                EventPayload::StatusUpdate {
                    status,
                    reference_task_ids,
                    metadata: None,
                    pause_info: None,
                },
                is_final,
            )
            .await;
        if let Ok(record) = record {
            let _ = self.task_store.apply_event(&record).await;
        }
    }

    async fn fail(&self, task_id: &str, error: A2AError) {
        let status = TaskStatus {
            state: TaskState::Failed,
            message: None,
            timestamp: Some(Utc::now().to_rfc3339()),
        };
        let record = self
            .event_bus
            .publish(
                task_id,
                EventPayload::StatusUpdate {
                    status,
                    reference_task_ids: None,
                    metadata: Some(serde_json::json!({ "error": error.to_string(), "code": error.code() })),
                    pause_info: None,
                },
                true,
            )
            .await;
        if let Ok(record) = record {
            let _ = self.task_store.apply_event(&record).await;
        }
    }
}

fn tool_round_trip_message(
    context_id: &str,
    task_id: &str,
    call_id: &str,
    name: &str,
    result: &serde_json::Value,
) -> Message {
    let part = Part::Data {
        data: serde_json::json!({ "toolCallId": call_id, "name": name, "result": result }),
        metadata: None,
    };
    Message {
        message_id: Uuid::new_v4().to_string(),
        role: crate::types::Role::Agent,
        kind: "message".to_string(),
        parts: vec![part],
        context_id: Some(context_id.to_string()),
        task_id: Some(task_id.to_string()),
        metadata: None,
        extensions: None,
        reference_task_ids: None,
    }
}
