//! Hot-reload coordinator — atomic swap of model parameters and the
//! workflow plugin registry, and the tool catalog rebuild that follows.
//!
//! Grounded in [`crate::workflow_runtime::WorkflowRuntime`]'s own use of
//! `arc_swap::ArcSwap` for its plugin registry (`spec.md` §4.4.2): this
//! module lifts the same "swap a pointer, never block a reader" idiom one
//! layer up, to the model parameters and the advertised tool set that sit in
//! front of the runtime. Applying an update never touches in-flight tasks or
//! their event history (`spec.md` §4.8) — it only changes what *new* turns
//! and dispatches see.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::error::A2AResult;
use crate::stream_processor::{ToolDescriptor, ToolInvoker};
use crate::workflow_runtime::{WorkflowPlugin, WorkflowRuntime};

/// The part of a turn's model request that can change between turns without
/// disturbing one already in flight: the system prompt and provider-specific
/// parameters (temperature, etc). Opaque to this crate — `parameters` is
/// passed through to whatever `ModelProvider` the embedder supplies.
#[derive(Debug, Clone)]
pub struct ModelParams {
    pub system_prompt: String,
    pub parameters: serde_json::Value,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            parameters: serde_json::json!({}),
        }
    }
}

/// One hot-reload request: any subset of model params, plugin registrations,
/// and plugin removals, applied together as a single unit.
#[derive(Default)]
pub struct HotReloadUpdate {
    pub model_params: Option<ModelParams>,
    pub register_plugins: Vec<Arc<dyn WorkflowPlugin>>,
    pub unregister_plugins: Vec<String>,
}

/// Coordinates atomic reconfiguration of a running node.
///
/// Cheaply `Clone`: the swapped state lives behind `Arc<ArcSwap<_>>`, shared
/// across clones.
#[derive(Clone)]
pub struct HotReloadCoordinator {
    model_params: Arc<ArcSwap<ModelParams>>,
    advertised_tools: Arc<ArcSwap<Vec<ToolDescriptor>>>,
    workflow_runtime: WorkflowRuntime,
    tool_invoker: Arc<dyn ToolInvoker>,
}

impl HotReloadCoordinator {
    pub fn new(workflow_runtime: WorkflowRuntime, tool_invoker: Arc<dyn ToolInvoker>) -> Self {
        let coordinator = Self {
            model_params: Arc::new(ArcSwap::from_pointee(ModelParams::default())),
            advertised_tools: Arc::new(ArcSwap::from_pointee(Vec::new())),
            workflow_runtime,
            tool_invoker,
        };
        coordinator.rebuild_tool_set();
        coordinator
    }

    /// The model params a new turn should use. Read once per turn, not
    /// cached by the caller — a turn already in flight keeps whatever it
    /// already captured.
    pub fn model_params(&self) -> Arc<ModelParams> {
        self.model_params.load_full()
    }

    /// The tool catalog a new turn or dispatch should advertise: the
    /// embedder's MCP tools unioned with the runtime's `dispatch_workflow_*`
    /// pseudo-tools, as of the last applied update.
    pub fn advertised_tools(&self) -> Arc<Vec<ToolDescriptor>> {
        self.advertised_tools.load_full()
    }

    /// Apply an update in the order `spec.md` §4.8 mandates: model params
    /// first, then plugin registry changes, then the tool-set rebuild that
    /// depends on the (possibly) new registry contents.
    ///
    /// Returns the first plugin registration error encountered, if any — a
    /// partially-applied update still leaves previously-applied pieces (e.g.
    /// model params) in effect, since each piece is independently atomic.
    pub fn apply(&self, update: HotReloadUpdate) -> A2AResult<()> {
        if let Some(params) = update.model_params {
            self.model_params.store(Arc::new(params));
            info!("hot-reloaded model parameters");
        }

        for plugin_id in &update.unregister_plugins {
            self.workflow_runtime.unregister(plugin_id);
        }
        for plugin in update.register_plugins {
            self.workflow_runtime.register(plugin)?;
        }

        self.rebuild_tool_set();
        Ok(())
    }

    fn rebuild_tool_set(&self) {
        let mut tools = self.tool_invoker.available_tools();
        for tool_name in self.workflow_runtime.get_available_tools() {
            tools.push(ToolDescriptor {
                name: tool_name,
                description: "Dispatch a workflow execution.".to_string(),
                parameters: serde_json::json!({ "type": "object" }),
            });
        }
        let count = tools.len();
        self.advertised_tools.store(Arc::new(tools));
        info!(tool_count = count, "rebuilt advertised tool set");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::stream_processor::ToolInvoker as _;
    use crate::task_store::TaskStore;
    use crate::testing::{FailingWorkflowPlugin, StaticToolInvoker};

    fn runtime() -> WorkflowRuntime {
        WorkflowRuntime::new(EventBus::with_default_capacity(), TaskStore::new())
    }

    #[test]
    fn apply_swaps_model_params_without_touching_tools() {
        let coordinator = HotReloadCoordinator::new(runtime(), Arc::new(StaticToolInvoker::new()));
        let before = coordinator.advertised_tools();

        coordinator
            .apply(HotReloadUpdate {
                model_params: Some(ModelParams {
                    system_prompt: "be terse".to_string(),
                    parameters: serde_json::json!({ "temperature": 0.2 }),
                }),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(coordinator.model_params().system_prompt, "be terse");
        assert_eq!(coordinator.advertised_tools().len(), before.len());
    }

    #[test]
    fn registering_a_plugin_rebuilds_the_tool_set() {
        let coordinator = HotReloadCoordinator::new(runtime(), Arc::new(StaticToolInvoker::new()));
        assert!(coordinator.advertised_tools().is_empty());

        coordinator
            .apply(HotReloadUpdate {
                register_plugins: vec![Arc::new(FailingWorkflowPlugin { id: "doomed".to_string() })],
                ..Default::default()
            })
            .unwrap();

        let tools = coordinator.advertised_tools();
        assert_eq!(tools.len(), 1);
        assert!(tools[0].name.contains("doomed"));
    }

    #[test]
    fn unregistering_a_plugin_shrinks_the_tool_set() {
        let coordinator = HotReloadCoordinator::new(runtime(), Arc::new(StaticToolInvoker::new()));
        coordinator
            .apply(HotReloadUpdate {
                register_plugins: vec![Arc::new(FailingWorkflowPlugin { id: "doomed".to_string() })],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(coordinator.advertised_tools().len(), 1);

        coordinator
            .apply(HotReloadUpdate {
                unregister_plugins: vec!["doomed".to_string()],
                ..Default::default()
            })
            .unwrap();
        assert!(coordinator.advertised_tools().is_empty());
    }
}
