//! Process entry point for the agent node.
//!
//! Wires the eight components (`spec.md` §2) behind an axum server, reads its
//! configuration from the environment (`AGENT_*`, see `config.rs`), installs a
//! `tracing` subscriber, and serves until `SIGINT`/`SIGTERM`. `ModelProvider`
//! and `ToolInvoker` are out-of-scope external seams (`spec.md` §1); this
//! binary supplies the crate's own in-process stand-ins
//! (`testing::EchoModelProvider`, `testing::StaticToolInvoker`) so the node is
//! runnable end to end with no external dependency — an embedder wiring a real
//! LLM would construct `AgentExecutor` the same way with their own
//! `ModelProvider` in place of the echo stub.

use std::sync::Arc;

use agent_node_core::agent_executor::AgentExecutor;
use agent_node_core::builders::AgentCardBuilder;
use agent_node_core::config::Config;
use agent_node_core::context_manager::ContextManager;
use agent_node_core::event_bus::EventBus;
use agent_node_core::hot_reload::HotReloadCoordinator;
use agent_node_core::server::a2a_node_router;
use agent_node_core::stream_processor::StreamProcessor;
use agent_node_core::task_store::TaskStore;
use agent_node_core::testing::{EchoModelProvider, StaticToolInvoker};
use agent_node_core::workflow_runtime::WorkflowRuntime;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    tracing::info!(bind_addr = %config.bind_addr(), a2a_path = %config.a2a_path, "starting agent node");

    let task_store = TaskStore::new();
    let event_bus = EventBus::with_default_capacity();
    let context_manager = ContextManager::new(task_store.clone());
    let workflow_runtime = WorkflowRuntime::new(event_bus.clone(), task_store.clone())
        .with_cancel_grace(config.workflow_cancel_grace);
    let stream_processor = StreamProcessor::new(
        event_bus.clone(),
        task_store.clone(),
        context_manager.clone(),
        workflow_runtime.clone(),
    )
    .with_max_steps(config.max_steps);

    let model_provider = Arc::new(EchoModelProvider);
    let tool_invoker = Arc::new(StaticToolInvoker::new());

    let agent_executor = AgentExecutor::new(
        context_manager.clone(),
        task_store.clone(),
        event_bus.clone(),
        workflow_runtime.clone(),
        stream_processor,
        model_provider,
        tool_invoker.clone(),
    );

    // Held so an embedder could reload model params / plugins at runtime;
    // this binary does not yet expose a reload trigger of its own.
    let _hot_reload = HotReloadCoordinator::new(workflow_runtime.clone(), tool_invoker);

    let agent_card = AgentCardBuilder::new(
        "Agent Node",
        "A conversational agent reachable over A2A JSON-RPC and SSE.",
        env!("CARGO_PKG_VERSION"),
    )
    .with_jsonrpc_interface(format!("http://{}{}", config.bind_addr(), config.a2a_path))
    .with_streaming(true)
    .with_skill(
        "chat",
        "Chat",
        "Conversational turns driven by the configured model provider.",
        vec!["conversation".to_string()],
    )
    .build();

    let router = a2a_node_router(
        agent_executor.clone(),
        task_store,
        event_bus,
        workflow_runtime,
        agent_card,
        &config.a2a_path,
    );

    spawn_idle_sweeper(context_manager, agent_executor, config.context_idle_ttl);

    let listener = TcpListener::bind(config.bind_addr())
        .await
        .unwrap_or_else(|e| panic!("failed to bind {}: {e}", config.bind_addr()));

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

/// Periodically reclaim idle contexts and drop cancellation handles for
/// tasks that have already finished (`spec.md` §4.3, §4.6).
fn spawn_idle_sweeper(
    context_manager: ContextManager,
    agent_executor: AgentExecutor,
    idle_ttl: std::time::Duration,
) {
    let sweep_interval = std::cmp::min(idle_ttl, std::time::Duration::from_secs(60));
    let chrono_ttl = chrono::Duration::from_std(idle_ttl).unwrap_or(chrono::Duration::zero());

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let reclaimed = context_manager.sweep_idle(chrono::Utc::now(), chrono_ttl).await;
            if !reclaimed.is_empty() {
                tracing::debug!(count = reclaimed.len(), "reclaimed idle contexts");
            }
            agent_executor.prune_terminal_turn_handles().await;
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining");
}
