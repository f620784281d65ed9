//! Workflow runtime — plugin registry and cooperative execution stepper.
//!
//! The registry (hot-swappable via `arc-swap`, the same primitive
//! `querymt-querymt`'s routing actor uses to publish immutable snapshots) maps
//! a stable plugin id to a `WorkflowPlugin` the agent can dispatch work onto.
//! Dispatching spawns a driver task per execution; the driver owns the
//! single-stepper guarantee by being the only reader of the execution's
//! `Yield` channel and the only writer of its resume/cancel channel.
//!
//! See [`execution`] for the driver loop itself.

mod execution;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::error::{A2AError, A2AResult};
use crate::event_bus::EventBus;
use crate::task_store::TaskStore;
use crate::types::{
    canonicalize_plugin_id, Artifact, PauseInfo, PluginDescriptor, PluginError, TaskKind,
    WorkflowExecutionRecord,
};

pub use execution::{PauseOutcome, WorkflowContext};

/// A registered workflow plugin: a static descriptor plus a cooperative
/// routine that drives one execution to completion.
///
/// `execute` receives a fresh [`WorkflowContext`] per execution — plugins
/// must not share mutable state across executions (`spec.md` §5); the
/// context is this crate's only channel back to the runtime.
#[async_trait]
pub trait WorkflowPlugin: Send + Sync {
    /// The plugin's static descriptor (id, schema, etc).
    fn descriptor(&self) -> PluginDescriptor;

    /// Run one execution. Returns `Ok(result)` on success (`Yield::Return`)
    /// or `Err(error)` on failure (`Yield::Fail`). `parameters` is the
    /// `dispatch_workflow_*` call's arguments, already validated against
    /// `descriptor().input_schema`.
    async fn execute(
        &self,
        ctx: WorkflowContext,
        parameters: serde_json::Value,
    ) -> Result<serde_json::Value, PluginError>;
}

/// Parameters for [`WorkflowRuntime::dispatch`].
pub struct DispatchParams {
    /// Plugin to dispatch.
    pub plugin_id: String,
    /// Context the new execution's task belongs to.
    pub context_id: String,
    /// Parameters to validate against the plugin's `inputSchema` and hand to
    /// `execute`.
    pub parameters: serde_json::Value,
    /// Task that dispatched this execution, if any (set when a
    /// `StreamProcessor` intercepted a `dispatch_workflow_*` tool call).
    pub parent_task_id: Option<String>,
}

/// Outcome of [`WorkflowRuntime::resume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeResult {
    /// Input validated and was fed to the paused execution.
    Accepted,
    /// Input failed schema validation; the execution remains paused.
    Rejected,
}

struct RegisteredPlugin {
    descriptor: PluginDescriptor,
    plugin: Arc<dyn WorkflowPlugin>,
}

/// Live handle to a dispatched execution, used to route `resume`/`cancel`.
struct LiveExecution {
    plugin_id: String,
    context_id: String,
    control: execution::ExecutionControl,
}

/// Registry of workflow plugins plus the live executions it has dispatched.
///
/// `register`/`unregister`/`replace` only affect *future* dispatches: each
/// execution captures its own `Arc<dyn WorkflowPlugin>` at dispatch time, so
/// swapping the registry's pointer never disturbs in-flight work
/// (`spec.md` §4.4.2, §4.8).
#[derive(Clone)]
pub struct WorkflowRuntime {
    registry: Arc<ArcSwap<HashMap<String, RegisteredPlugin>>>,
    executions: Arc<AsyncMutex<HashMap<String, LiveExecution>>>,
    event_bus: EventBus,
    task_store: TaskStore,
    cancel_grace: std::time::Duration,
}

impl WorkflowRuntime {
    /// Create an empty runtime bound to the shared `EventBus`/`TaskStore`.
    pub fn new(event_bus: EventBus, task_store: TaskStore) -> Self {
        Self {
            registry: Arc::new(ArcSwap::from_pointee(HashMap::new())),
            executions: Arc::new(AsyncMutex::new(HashMap::new())),
            event_bus,
            task_store,
            cancel_grace: std::time::Duration::from_millis(5_000),
        }
    }

    /// Override the cancellation grace period (default 5s, `spec.md` §5).
    pub fn with_cancel_grace(mut self, grace: std::time::Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Register a new plugin. Overwrites any existing registration under the
    /// same id (equivalent to `replace` for an id that happens to already
    /// exist).
    pub fn register(&self, plugin: Arc<dyn WorkflowPlugin>) -> A2AResult<()> {
        let descriptor = plugin.descriptor();
        validate_tool_name(&descriptor)?;
        self.registry.rcu(|current| {
            let mut next = (**current).clone_shallow();
            next.insert(
                descriptor.id.clone(),
                RegisteredPlugin {
                    descriptor: descriptor.clone(),
                    plugin: plugin.clone(),
                },
            );
            next
        });
        info!(plugin_id = %descriptor.id, "registered workflow plugin");
        Ok(())
    }

    /// Remove a plugin from the registry. Does not affect in-flight
    /// executions already holding their own `Arc<dyn WorkflowPlugin>`.
    pub fn unregister(&self, plugin_id: &str) {
        self.registry.rcu(|current| {
            let mut next = (**current).clone_shallow();
            next.remove(plugin_id);
            next
        });
        info!(plugin_id, "unregistered workflow plugin");
    }

    /// Replace an existing (or not-yet-existing) plugin's implementation.
    /// Equivalent to `register` — kept as a distinct name to match
    /// `spec.md` §4.4.2's vocabulary for hot reload call sites.
    pub fn replace(&self, plugin: Arc<dyn WorkflowPlugin>) -> A2AResult<()> {
        self.register(plugin)
    }

    /// Look up a plugin's descriptor.
    pub fn get_plugin(&self, plugin_id: &str) -> Option<PluginDescriptor> {
        self.registry.load().get(plugin_id).map(|p| p.descriptor.clone())
    }

    /// The `dispatch_workflow_*` pseudo-tool names currently advertised.
    pub fn get_available_tools(&self) -> Vec<String> {
        self.registry
            .load()
            .values()
            .map(|p| p.descriptor.tool_name())
            .collect()
    }

    /// Resolve a pseudo-tool name (`dispatch_workflow_<canonical(id)>`) back
    /// to a registered plugin id.
    pub fn resolve_pseudo_tool(&self, tool_name: &str) -> Option<String> {
        self.registry
            .load()
            .values()
            .find(|p| p.descriptor.tool_name() == tool_name)
            .map(|p| p.descriptor.id.clone())
    }

    /// Dispatch a new execution of `plugin_id`, allocating its task via the
    /// shared `TaskStore` and publishing `task-created` + `status-update
    /// {submitted}` before the driver is spawned (`spec.md` §4.4.2).
    pub async fn dispatch(&self, params: DispatchParams) -> A2AResult<WorkflowExecutionRecord> {
        let registered = {
            let snapshot = self.registry.load();
            snapshot
                .get(&params.plugin_id)
                .map(|p| (p.descriptor.clone(), p.plugin.clone()))
        };
        let (descriptor, plugin) = registered
            .ok_or_else(|| A2AError::plugin_not_found(format!("no plugin registered under id '{}'", params.plugin_id)))?;

        validate_against_schema(&descriptor.input_schema, &params.parameters)
            .map_err(A2AError::invalid_input)?;

        let task = self
            .task_store
            .create(TaskKind::Workflow, &params.context_id, params.parent_task_id.clone())
            .await;

        let created = self
            .event_bus
            .publish(
                &task.id,
                crate::types::EventPayload::TaskCreated { task: task.clone() },
                false,
            )
            .await?;
        self.task_store.apply_event(&created).await?;

        let submitted = self
            .event_bus
            .publish(
                &task.id,
                crate::types::EventPayload::StatusUpdate {
                    status: crate::types::TaskStatus {
                        state: crate::types::TaskState::Submitted,
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

        let control = execution::spawn(
            task.id.clone(),
            params.context_id.clone(),
            plugin,
            params.parameters,
            self.event_bus.clone(),
            self.task_store.clone(),
            self.cancel_grace,
        );

        let mut executions = self.executions.lock().await;
        executions.insert(
            task.id.clone(),
            LiveExecution {
                plugin_id: descriptor.id.clone(),
                context_id: params.context_id.clone(),
                control,
            },
        );

        Ok(WorkflowExecutionRecord {
            execution_id: task.id,
            plugin_id: descriptor.id,
            context_id: params.context_id,
            state: crate::types::TaskState::Submitted,
            started_at: Utc::now().to_rfc3339(),
            pause_info: None,
            artifacts: Vec::new(),
            last_error: None,
        })
    }

    /// Feed schema-validated input to a paused execution (`spec.md` §4.4.1).
    ///
    /// Invalid input returns `Ok(ResumeResult::Rejected)` — per the spec this
    /// is a no-op, not an error: the execution remains `input-required`.
    pub async fn resume(&self, execution_id: &str, input: serde_json::Value) -> A2AResult<ResumeResult> {
        let pause_schema = {
            let executions = self.executions.lock().await;
            let live = executions
                .get(execution_id)
                .ok_or_else(|| A2AError::plugin_not_found(format!("no live execution '{}'", execution_id)))?;
            live.control.pause_schema().await
        };

        let Some(schema) = pause_schema else {
            return Err(A2AError::invalid_state(format!(
                "execution '{}' is not awaiting input",
                execution_id
            )));
        };

        if validate_against_schema(&schema, &input).is_err() {
            warn!(execution_id, "resume input failed schema validation");
            return Ok(ResumeResult::Rejected);
        }

        let executions = self.executions.lock().await;
        let live = executions
            .get(execution_id)
            .ok_or_else(|| A2AError::plugin_not_found(format!("no live execution '{}'", execution_id)))?;
        live.control.resume(input).await?;
        Ok(ResumeResult::Accepted)
    }

    /// Cancel a live execution. No-op (not an error) if it has already
    /// terminated.
    ///
    /// Signals the execution's `WorkflowContext` immediately and also
    /// publishes an optimistic `status-update{canceled, final}` itself,
    /// rather than waiting on the plugin to observe the signal and return
    /// `fail{canceled}` — a plugin parked in non-yielding work, or one that
    /// never gets scheduled again before the cancellation grace deadline,
    /// would otherwise leave the task without a terminal event
    /// (`spec.md` §4.4.1, §8 S5). The plugin's own terminal publish, if it
    /// still arrives, is simply rejected as `TaskTerminal` by the event bus.
    pub async fn cancel(&self, execution_id: &str) -> A2AResult<()> {
        let executions = self.executions.lock().await;
        let Some(live) = executions.get(execution_id) else {
            return Ok(());
        };
        live.control.cancel().await;
        drop(executions);

        let status = crate::types::TaskStatus {
            state: crate::types::TaskState::Canceled,
            message: None,
            timestamp: Some(Utc::now().to_rfc3339()),
        };
        if let Ok(record) = self
            .event_bus
            .publish(
                execution_id,
                crate::types::EventPayload::StatusUpdate {
                    status,
                    reference_task_ids: None,
                    metadata: None,
                    pause_info: None,
                },
                true,
            )
            .await
        {
            let _ = self.task_store.apply_event(&record).await;
        }
        Ok(())
    }

    /// Fetch one artifact produced by `task_id`, if it exists.
    pub async fn get_artifact(&self, task_id: &str, artifact_id: &str) -> Option<Artifact> {
        let task = self.task_store.get(task_id).await?;
        task.artifacts?.into_iter().find(|a| a.artifact_id == artifact_id)
    }

    /// Drop bookkeeping for a terminated execution. Safe to call any time;
    /// it only discards the runtime's handle, never the task record itself.
    pub async fn forget(&self, execution_id: &str) {
        let mut executions = self.executions.lock().await;
        executions.remove(execution_id);
    }

    /// Snapshot of an execution's pause reason/message, for routing (`spec.md` §4.6).
    pub async fn pause_info(&self, execution_id: &str) -> Option<PauseInfo> {
        let executions = self.executions.lock().await;
        let live = executions.get(execution_id)?;
        live.control.pause_info().await
    }

    /// Whether `execution_id` is a live (possibly terminated-but-not-yet-
    /// forgotten) workflow execution this runtime dispatched, and if so for
    /// which context.
    pub async fn context_of(&self, execution_id: &str) -> Option<String> {
        let executions = self.executions.lock().await;
        executions.get(execution_id).map(|l| l.context_id.clone())
    }

    #[allow(dead_code)]
    fn plugin_ids(&self) -> Vec<String> {
        self.registry.load().keys().cloned().collect()
    }
}

/// Cheap clone of an `ArcSwap`-held map's contents for copy-on-write updates.
trait CloneShallow {
    fn clone_shallow(&self) -> Self;
}

impl CloneShallow for HashMap<String, RegisteredPlugin> {
    fn clone_shallow(&self) -> Self {
        self.iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    RegisteredPlugin {
                        descriptor: v.descriptor.clone(),
                        plugin: v.plugin.clone(),
                    },
                )
            })
            .collect()
    }
}

fn validate_tool_name(descriptor: &PluginDescriptor) -> A2AResult<()> {
    let canonical = canonicalize_plugin_id(&descriptor.id);
    if canonical.is_empty() || !canonical.chars().next().unwrap().is_ascii_lowercase() {
        return Err(A2AError::invalid_params(format!(
            "plugin id '{}' canonicalizes to an invalid tool name segment '{}'",
            descriptor.id, canonical
        )));
    }
    Ok(())
}

/// Minimal JSON Schema subset validator: `type` (object/string/number/
/// integer/boolean/array) and `required` for objects. This is intentionally
/// not a full draft-2020-12 validator — the core's `inputSchema`/pause
/// schemas in practice describe flat parameter objects, and pulling in a
/// general-purpose validator crate for that is more machinery than the
/// surface needs (see `DESIGN.md`).
pub(crate) fn validate_against_schema(
    schema: &serde_json::Value,
    value: &serde_json::Value,
) -> Result<(), String> {
    let Some(obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(ty) = obj.get("type").and_then(|t| t.as_str()) {
        let matches = match ty {
            "object" => value.is_object(),
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "null" => value.is_null(),
            _ => true,
        };
        if !matches {
            return Err(format!("expected type '{}', got {}", ty, value));
        }
    }

    if let Some(required) = obj.get("required").and_then(|r| r.as_array()) {
        let Some(value_obj) = value.as_object() else {
            return Err("required fields specified but value is not an object".to_string());
        };
        for field in required {
            let Some(name) = field.as_str() else { continue };
            if !value_obj.contains_key(name) {
                return Err(format!("missing required field '{}'", name));
            }
        }
    }

    if let Some(properties) = obj.get("properties").and_then(|p| p.as_object()) {
        if let Some(value_obj) = value.as_object() {
            for (key, sub_schema) in properties {
                if let Some(sub_value) = value_obj.get(key) {
                    validate_against_schema(sub_schema, sub_value)?;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_store::TaskStore;
    use crate::testing::GreetWorkflowPlugin;
    use crate::types::TaskState;

    /// `spec.md` §8 Scenario S5: cancel a paused execution; its task must
    /// observe a terminal `canceled` event, and a subsequent resume attempt
    /// must find the execution already terminal.
    #[tokio::test]
    async fn cancel_during_pause_reaches_canceled_terminal_state() {
        let event_bus = EventBus::with_default_capacity();
        let task_store = TaskStore::new();
        let runtime = WorkflowRuntime::new(event_bus.clone(), task_store.clone())
            .with_cancel_grace(std::time::Duration::from_millis(50));
        runtime.register(Arc::new(GreetWorkflowPlugin)).unwrap();

        let execution = runtime
            .dispatch(DispatchParams {
                plugin_id: "greet".to_string(),
                context_id: "ctx-1".to_string(),
                parameters: serde_json::json!({}),
                parent_task_id: None,
            })
            .await
            .unwrap();

        // Let the plugin reach its pause point.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let task = task_store.get(&execution.execution_id).await.unwrap();
        assert_eq!(task.status.state, TaskState::InputRequired);

        runtime.cancel(&execution.execution_id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let task = task_store.get(&execution.execution_id).await.unwrap();
        assert_eq!(task.status.state, TaskState::Canceled);
        assert!(task.is_terminal());

        let resumed = runtime
            .resume(&execution.execution_id, serde_json::json!({ "name": "Ada" }))
            .await;
        assert!(resumed.is_err());
    }

    #[test]
    fn schema_validation_checks_type_and_required() {
        let schema = serde_json::json!({
            "type": "object",
            "required": ["name"],
            "properties": { "name": { "type": "string" } }
        });
        assert!(validate_against_schema(&schema, &serde_json::json!({"name": "Ada"})).is_ok());
        assert!(validate_against_schema(&schema, &serde_json::json!({})).is_err());
        assert!(validate_against_schema(&schema, &serde_json::json!({"name": 5})).is_err());
    }

    #[test]
    fn empty_schema_accepts_anything() {
        assert!(validate_against_schema(&serde_json::json!({}), &serde_json::json!(42)).is_ok());
    }
}
