//! # agent-node-core — a runnable Agent-to-Agent (A2A) node
//!
//! This crate hosts long-lived conversational agents reachable over the
//! [A2A protocol](https://a2a-protocol.org/latest/specification/)'s JSON-RPC
//! 2.0 + Server-Sent Events transport. Its core is a task/workflow runtime:
//! a [`task_store::TaskStore`] and per-task [`event_bus::EventBus`] track
//! every AI turn and workflow execution, a [`context_manager::ContextManager`]
//! groups them into multi-turn conversations, a
//! [`workflow_runtime::WorkflowRuntime`] drives cooperative, suspendable
//! plugin executions, and a [`stream_processor::StreamProcessor`] drives one
//! AI turn against a pluggable `ModelProvider`. [`agent_executor::AgentExecutor`]
//! routes inbound messages between the two, and [`server::a2a_node_router`]
//! exposes the whole thing as an axum `Router` implementing the A2A wire
//! protocol — also shipped as the runnable `agent-node` binary
//! (`src/bin/agent_node.rs`).
//!
//! This crate also carries the inherited A2A protocol SDK it grew out of: a
//! generic, embeddable client ([`client::A2AClient`]) and an
//! executor-trait-based server framework ([`server::AgentExecutor`] trait,
//! [`server::a2a_router`]) for agents that don't need the task/workflow
//! runtime above and just want to implement `execute`/`cancel` directly.
//!
//! ## Feature flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `client` | yes     | HTTP client for calling A2A agents (reqwest + SSE) |
//! | `server` | yes     | Server traits + axum integration for building agents |
//! | `full`   | no      | Enable all features |
//!
//! ## Quick Start: Client
//!
//! ```no_run
//! use agent_node_core::client::{A2AClient, SendMessageResponse};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Connect to an A2A agent (auto-discovers endpoint)
//!     let client = A2AClient::from_url("http://localhost:7420").await?;
//!
//!     // Send a simple text message
//!     let response = client.send_text("Write a haiku about Rust").await?;
//!     match response {
//!         SendMessageResponse::Task(task) => {
//!             println!("Task: {} (status: {})", task.id, task.status.state);
//!         }
//!         SendMessageResponse::Message(msg) => {
//!             println!("Direct reply: {:?}", msg);
//!         }
//!     }
//!
//!     // Or stream responses in real-time
//!     let mut stream = client.send_text_stream("Tell me a story").await?;
//!     while let Some(event) = stream.next().await {
//!         match event? {
//!             agent_node_core::types::StreamResponse::StatusUpdate(update) => {
//!                 println!("Status: {:?}", update.status.state);
//!             }
//!             agent_node_core::types::StreamResponse::ArtifactUpdate(artifact) => {
//!                 println!("Artifact: {:?}", artifact.artifact.name);
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Quick Start: Server
//!
//! Implement [`server::AgentExecutor`] to define your agent's behavior:
//!
//! ```rust,ignore
//! use agent_node_core::server::{AgentExecutor, RequestContext, EventQueue, TaskUpdater};
//! use agent_node_core::types::Part;
//! use agent_node_core::error::A2AResult;
//! use async_trait::async_trait;
//!
//! struct EchoAgent;
//!
//! #[async_trait]
//! impl AgentExecutor for EchoAgent {
//!     async fn execute(
//!         &self,
//!         context: RequestContext,
//!         event_queue: EventQueue,
//!     ) -> A2AResult<()> {
//!         let updater = TaskUpdater::new(
//!             event_queue,
//!             context.task_id.clone(),
//!             context.context_id.clone(),
//!         );
//!
//!         // Extract text from the incoming message
//!         let text = context.message.parts.iter()
//!             .find_map(|p| match p {
//!                 Part::Text { text, .. } => Some(text.clone()),
//!                 _ => None,
//!             })
//!             .unwrap_or_else(|| "No text received".to_string());
//!
//!         // Echo it back
//!         let response = format!("Echo: {}", text);
//!         updater.complete(Some(&response)).await?;
//!
//!         Ok(())
//!     }
//!
//!     async fn cancel(
//!         &self,
//!         context: RequestContext,
//!         event_queue: EventQueue,
//!     ) -> A2AResult<()> {
//!         let updater = TaskUpdater::new(
//!             event_queue,
//!             context.task_id,
//!             context.context_id,
//!         );
//!         updater.cancel(None).await?;
//!         Ok(())
//!     }
//! }
//! ```
//!
//! Then set up the HTTP server:
//!
//! ```rust,ignore
//! use agent_node_core::server::{a2a_router, DefaultRequestHandler, InMemoryTaskStore};
//! use agent_node_core::AgentCardBuilder;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Build an agent card
//!     let agent_card = AgentCardBuilder::new("Echo Agent")
//!         .description("A simple agent that echoes back your messages")
//!         .version("1.0.0")
//!         .url("http://localhost:3000/a2a")
//!         .build()?;
//!
//!     let executor = Arc::new(EchoAgent);
//!     let store = Arc::new(InMemoryTaskStore::new());
//!     let handler = Arc::new(DefaultRequestHandler::new(executor, store));
//!
//!     // Build the router with A2A routes
//!     let app = a2a_router(handler, agent_card);
//!
//!     // Start the server
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! The server automatically provides:
//! - `POST /a2a` — JSON-RPC 2.0 endpoint for all A2A methods
//! - `GET /.well-known/agent.json` — Agent card discovery
//!
//! ## Protocol Compliance
//!
//! This crate implements **A2A protocol v0.3** as defined in the
//! [official specification](https://a2a-protocol.org/latest/specification/).
//!
//! All types match the protobuf definitions at
//! [`a2a.proto`](https://github.com/a2aproject/A2A/blob/main/specification/a2a.proto).
//!
//! Supported JSON-RPC methods:
//! - `message/send` — Send a message and get a task
//! - `message/stream` — Send a message with SSE streaming
//! - `tasks/get` — Retrieve a task by ID
//! - `tasks/list` — List tasks with filtering
//! - `tasks/cancel` — Cancel a running task
//! - `tasks/subscribe` — Subscribe to task updates (SSE)
//!
//! ## Architecture
//!
//! ### Client
//!
//! - [`client::A2AClient`] — High-level client with typed methods for all A2A operations
//! - [`client::CardResolver`] — Discovers agent cards from `/.well-known/agent.json`
//! - [`client::JsonRpcTransport`] — HTTP transport with JSON-RPC 2.0 encoding
//! - [`client::SseStream`] — Server-Sent Events stream for real-time updates
//!
//! ### Server
//!
//! - [`server::AgentExecutor`] — Trait for implementing your agent's logic
//! - [`server::RequestHandler`] — Trait for handling JSON-RPC requests
//! - [`server::DefaultRequestHandler`] — Reference implementation of `RequestHandler`
//! - [`server::TaskStore`] — Trait for task persistence
//! - [`server::InMemoryTaskStore`] — In-memory task store implementation
//! - [`server::EventQueue`] — Broadcast channel for SSE events
//! - [`server::TaskUpdater`] — Helper for publishing task status/artifact updates
//! - [`server::a2a_router`] — Creates an axum `Router` with A2A routes
//!
//! ### Core Types
//!
//! - [`types::Task`] — A2A task with status, history, and artifacts
//! - [`types::Message`] — A message with text/file/data parts
//! - [`types::Part`] — Content part (text, file, or structured data)
//! - [`types::TaskState`] — Task lifecycle state machine
//! - [`types::StreamResponse`] — SSE event types (status updates, artifact updates)
//! - [`types::AgentCard`] — Agent metadata and capabilities
//! - [`error::A2AError`] — Error types with JSON-RPC error codes
//!
//! ## Examples
//!
//! See the `examples/` directory for complete, runnable examples:
//! - `echo_agent.rs` — Minimal agent that echoes messages back
//! - `hello_client.rs` — Simple client that sends a message
//! - `streaming_client.rs` — Client with SSE streaming
//! - `multi_turn.rs` — Multi-turn conversation with context tracking

pub mod agent_executor;
pub mod builders;
pub mod config;
pub mod context_manager;
pub mod error;
pub mod event_bus;
pub mod hot_reload;
pub mod stream_processor;
pub mod task_store;
pub mod testing;
pub mod types;
pub mod utils;
pub mod workflow_runtime;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "server")]
pub mod server;

/// Prelude module that re-exports commonly used types and traits.
///
/// Import this module with `use agent_node_core::prelude::*;` to get access to the most
/// frequently used types without having to import them individually.
///
/// # Example
///
/// ```
/// use agent_node_core::prelude::*;
///
/// // Now you have access to common types like:
/// // - Message, Part, Task, TaskState, Role
/// // - AgentCard, AgentSkill, AgentCapabilities
/// // - A2AError, A2AResult
/// // - builders like AgentCardBuilder
/// ```
pub mod prelude {
    // Core types
    pub use crate::types::{
        AgentCapabilities, AgentCard, AgentInterface, AgentSkill, Artifact, FileContent,
        FileWithBytes, FileWithUri, Message, Part, Role, SendMessageConfiguration,
        SendMessageParams, StreamResponse, Task, TaskArtifactUpdateEvent, TaskState, TaskStatus,
        TaskStatusUpdateEvent,
    };

    // Error types
    pub use crate::error::{A2AError, A2AResult};

    // Builders
    pub use crate::builders::AgentCardBuilder;

    #[cfg(feature = "client")]
    pub use crate::builders::ClientBuilder;

    #[cfg(feature = "client")]
    pub use crate::client::A2AClient;

    #[cfg(feature = "server")]
    pub use crate::builders::ServerBuilder;

    #[cfg(feature = "server")]
    pub use crate::server::{
        a2a_node_router, a2a_router, EventConsumer, EventQueue, InMemoryQueueManager,
        InMemoryTaskStore, QueueManager, RequestContext, RequestContextBuilder, ServerCallContext,
        SimpleRequestContextBuilder, TaskManager, TaskUpdater,
    };

    // The node's own task/workflow runtime.
    pub use crate::agent_executor::AgentExecutor;
    pub use crate::context_manager::ContextManager;
    pub use crate::event_bus::EventBus;
    pub use crate::hot_reload::HotReloadCoordinator;
    pub use crate::stream_processor::{ModelProvider, StreamProcessor, ToolInvoker};
    pub use crate::task_store::TaskStore;
    pub use crate::workflow_runtime::{WorkflowPlugin, WorkflowRuntime};
}

// Re-export core types at crate root for convenience.
pub use builders::AgentCardBuilder;
pub use error::{A2AError, A2AResult};
pub use types::*;

#[cfg(feature = "client")]
pub use builders::ClientBuilder;

#[cfg(feature = "server")]
pub use builders::ServerBuilder;
