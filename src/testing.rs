//! In-memory test doubles for the external collaborators `spec.md` §1
//! declares out of scope: the LLM provider adapter (`ModelProvider`) and the
//! MCP tool transport (`ToolInvoker`), plus a couple of scripted
//! `WorkflowPlugin`s used to exercise the end-to-end scenarios in `spec.md`
//! §8. None of this is a product — it exists purely so the crate's
//! S1–S6 scenarios are exercisable in integration tests without a real LLM
//! or MCP server.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::stream_processor::{ModelDelta, ModelProvider, ModelRequest, ToolDescriptor, ToolError, ToolInvoker};
use crate::types::{Artifact, PluginDescriptor, PluginError, TaskState};
use crate::workflow_runtime::{PauseOutcome, WorkflowContext, WorkflowPlugin};

/// A [`ModelProvider`] whose response to each successive `stream()` call is
/// taken from a pre-scripted queue of delta rounds. Each round is consumed
/// once; once the queue is empty, further calls finish immediately.
pub struct ScriptedModelProvider {
    rounds: Mutex<VecDeque<Vec<ModelDelta>>>,
}

impl ScriptedModelProvider {
    /// Script an explicit sequence of rounds; the Nth call to `stream()`
    /// replays the Nth `Vec<ModelDelta>`.
    pub fn new(rounds: Vec<Vec<ModelDelta>>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into_iter().collect()),
        }
    }

    /// A single round that streams `text` then finishes — the S1 "simple
    /// chat" shape.
    pub fn finishing_with_text(text: impl Into<String>) -> Self {
        Self::new(vec![vec![ModelDelta::Text(text.into()), ModelDelta::Finish]])
    }

    /// A single round that calls `tool_name` with `arguments` then finishes
    /// without further text — the S2 "workflow dispatch" shape.
    pub fn dispatching_workflow(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self::new(vec![vec![
            ModelDelta::ToolCall {
                call_id: Uuid::new_v4().to_string(),
                name: tool_name.into(),
                arguments,
            },
            ModelDelta::Finish,
        ]])
    }
}

impl ModelProvider for ScriptedModelProvider {
    fn stream(&self, _request: ModelRequest) -> BoxStream<'static, ModelDelta> {
        let mut rounds = self.rounds.lock().expect("scripted model provider mutex poisoned");
        let plan = rounds.pop_front().unwrap_or_else(|| vec![ModelDelta::Finish]);
        futures::stream::iter(plan).boxed()
    }
}

/// A [`ModelProvider`] that echoes the last user message back as its
/// response. Not a production model integration — the closest thing this
/// crate ships to one, since `ModelProvider` is an out-of-scope seam the
/// embedder is expected to implement against a real LLM. `src/bin/agent_node.rs`
/// uses this by default so the node is runnable end to end with no external
/// dependency.
#[derive(Debug, Default)]
pub struct EchoModelProvider;

impl ModelProvider for EchoModelProvider {
    fn stream(&self, request: ModelRequest) -> BoxStream<'static, ModelDelta> {
        let last_user_text = request
            .history
            .iter()
            .rev()
            .find_map(|m| {
                let text = crate::utils::get_text_parts(&m.parts).join("\n");
                if text.is_empty() { None } else { Some(text) }
            })
            .unwrap_or_default();
        let reply = if last_user_text.is_empty() {
            "...".to_string()
        } else {
            format!("you said: {last_user_text}")
        };
        futures::stream::iter(vec![ModelDelta::Text(reply), ModelDelta::Finish]).boxed()
    }
}

/// A [`ToolInvoker`] returning a fixed, pre-registered result per tool name.
#[derive(Default)]
pub struct StaticToolInvoker {
    results: HashMap<String, Value>,
    tools: Vec<ToolDescriptor>,
}

impl StaticToolInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, name: impl Into<String>, result: Value) -> Self {
        self.results.insert(name.into(), result);
        self
    }

    pub fn with_tool(mut self, descriptor: ToolDescriptor) -> Self {
        self.tools.push(descriptor);
        self
    }
}

#[async_trait]
impl ToolInvoker for StaticToolInvoker {
    async fn invoke(&self, name: &str, _args: Value) -> Result<Value, ToolError> {
        self.results
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::new(format!("no canned result registered for tool '{name}'")))
    }

    fn available_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.clone()
    }
}

/// The `greet` plugin from `spec.md` §8 S2: yields `working`, pauses for a
/// `{name: string}` input, then emits an artifact greeting that name and
/// returns.
pub struct GreetWorkflowPlugin;

#[async_trait]
impl WorkflowPlugin for GreetWorkflowPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: "greet".to_string(),
            name: "Greet".to_string(),
            description: "Pauses for a name, then greets it.".to_string(),
            version: "1.0.0".to_string(),
            input_schema: serde_json::json!({ "type": "object" }),
        }
    }

    async fn execute(&self, ctx: WorkflowContext, _parameters: Value) -> Result<Value, PluginError> {
        ctx.yield_status(TaskState::Working, None).await;

        let outcome = ctx
            .pause(
                "awaiting-name",
                serde_json::json!({ "type": "object", "required": ["name"], "properties": { "name": { "type": "string" } } }),
                Some("who?".to_string()),
            )
            .await;

        let input = match outcome {
            PauseOutcome::Resumed(value) => value,
            PauseOutcome::Canceled => return Err(PluginError::canceled()),
        };

        let name = input
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("friend")
            .to_string();

        let artifact = Artifact {
            artifact_id: "g".to_string(),
            name: Some("greeting".to_string()),
            description: None,
            parts: vec![crate::types::Part::Text {
                text: format!("hello, {name}"),
                metadata: None,
            }],
            metadata: None,
            extensions: None,
        };
        ctx.yield_artifact(artifact, false, true).await;

        Ok(serde_json::json!({ "ok": true }))
    }
}

/// Like [`GreetWorkflowPlugin`], but sleeps briefly after being resumed and
/// before emitting its post-resume events. Used to deterministically exercise
/// a caller that re-subscribes to this task's event bus right after the
/// resume call returns: with the sleep in place, a caller that (incorrectly)
/// replays from `seq=0` observes the *old* `input-required` record and stops
/// waiting well before the real post-resume events exist, while a caller
/// that resumes correctly from the task's current seq keeps waiting through
/// the sleep and observes the genuine completion.
pub struct SlowResumeWorkflowPlugin {
    pub post_resume_delay: std::time::Duration,
}

#[async_trait]
impl WorkflowPlugin for SlowResumeWorkflowPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: "slow-resume".to_string(),
            name: "SlowResume".to_string(),
            description: "Pauses for a name, sleeps, then greets it.".to_string(),
            version: "1.0.0".to_string(),
            input_schema: serde_json::json!({ "type": "object" }),
        }
    }

    async fn execute(&self, ctx: WorkflowContext, _parameters: Value) -> Result<Value, PluginError> {
        ctx.yield_status(TaskState::Working, None).await;

        let outcome = ctx
            .pause(
                "awaiting-name",
                serde_json::json!({ "type": "object", "required": ["name"], "properties": { "name": { "type": "string" } } }),
                Some("who?".to_string()),
            )
            .await;

        let input = match outcome {
            PauseOutcome::Resumed(value) => value,
            PauseOutcome::Canceled => return Err(PluginError::canceled()),
        };

        tokio::time::sleep(self.post_resume_delay).await;

        let name = input
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("friend")
            .to_string();

        let artifact = Artifact {
            artifact_id: "g".to_string(),
            name: Some("greeting".to_string()),
            description: None,
            parts: vec![crate::types::Part::Text {
                text: format!("hello, {name}"),
                metadata: None,
            }],
            metadata: None,
            extensions: None,
        };
        ctx.yield_artifact(artifact, false, true).await;

        Ok(serde_json::json!({ "ok": true }))
    }
}

/// A plugin that immediately fails, used to exercise the `PluginError`
/// termination path without needing to script a pause/resume round trip.
pub struct FailingWorkflowPlugin {
    pub id: String,
}

#[async_trait]
impl WorkflowPlugin for FailingWorkflowPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: self.id.clone(),
            name: "Failing".to_string(),
            description: "Always fails.".to_string(),
            version: "1.0.0".to_string(),
            input_schema: serde_json::json!({ "type": "object" }),
        }
    }

    async fn execute(&self, _ctx: WorkflowContext, _parameters: Value) -> Result<Value, PluginError> {
        Err(PluginError::new("PluginError", "this plugin always fails"))
    }
}
