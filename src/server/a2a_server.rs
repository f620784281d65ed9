//! `A2AServer` (C7) — the agent node's own HTTP/JSON-RPC + SSE surface.
//!
//! Where [`super::axum_integration`] exposes the inherited SDK's generic,
//! embeddable `AgentExecutor`/`RequestHandler` seam (kept as a standalone
//! library surface behind the `server` feature), this module is the concrete
//! router `spec.md` §4.7 describes for the node itself: it is wired directly
//! to [`crate::agent_executor::AgentExecutor`], [`crate::task_store::TaskStore`],
//! [`crate::event_bus::EventBus`], and [`crate::workflow_runtime::WorkflowRuntime`]
//! rather than to a pluggable trait object, and implements the exact method
//! table and routes `spec.md` §4.7 names: `message/send` (synchronous to a
//! terminal or re-paused event), `message/stream`, `tasks/resubscribe`,
//! `tasks/get`, `tasks/cancel`, the agent-card alias paths, artifact
//! download, and `/health`.
//!
//! Grounded on [`super::axum_integration`]'s router-construction and
//! `make_sse_stream` idiom (same `axum`/`async-stream` dependencies), with
//! the JSON-RPC envelope and SSE framing generalized to stream
//! [`crate::types::EventRecord`]s off the new [`crate::event_bus::EventBus`]
//! instead of a single `broadcast::Receiver<StreamResponse>`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use serde_json::Value;
use tokio_stream::StreamExt as _;
use tracing::{debug, error, warn};

use crate::agent_executor::{AgentExecutor, RoutingOutcome};
use crate::error::{self, A2AError};
use crate::event_bus::EventBus;
use crate::task_store::TaskStore;
use crate::types::{AgentCard, EventRecord, JsonRpcError as A2AJsonRpcError, Message, Task};
use crate::workflow_runtime::{ResumeResult, WorkflowRuntime};

struct AppState {
    agent_executor: AgentExecutor,
    task_store: TaskStore,
    event_bus: EventBus,
    workflow_runtime: WorkflowRuntime,
    agent_card: AgentCard,
}

/// Build the node's A2A router.
///
/// `a2a_path` is mounted for the JSON-RPC POST endpoint and as the prefix
/// for the artifact-download route (`spec.md` §4.7:
/// `GET <a2aPath>/tasks/{taskId}/artifacts/{artifactId}`); pass
/// [`crate::config::Config::a2a_path`].
pub fn a2a_node_router(
    agent_executor: AgentExecutor,
    task_store: TaskStore,
    event_bus: EventBus,
    workflow_runtime: WorkflowRuntime,
    agent_card: AgentCard,
    a2a_path: &str,
) -> Router {
    let state = Arc::new(AppState {
        agent_executor,
        task_store,
        event_bus,
        workflow_runtime,
        agent_card,
    });

    let artifact_route = format!("{a2a_path}/tasks/{{task_id}}/artifacts/{{artifact_id}}");

    Router::new()
        .route("/.well-known/agent.json", get(handle_agent_card))
        .route("/.well-known/agent-card.json", get(handle_agent_card))
        .route(a2a_path, post(handle_jsonrpc))
        .route(&artifact_route, get(handle_artifact_download))
        .route("/health", get(handle_health))
        .with_state(state)
}

async fn handle_health() -> StatusCode {
    StatusCode::OK
}

/// Rewrite `card.url` from the actual request host, honoring
/// `x-forwarded-proto`, `x-forwarded-host`, `x-forwarded-prefix`
/// (`spec.md` §4.7).
fn rewrite_card_url(card: &AgentCard, headers: &HeaderMap, a2a_path: &str) -> AgentCard {
    let mut card = card.clone();

    let proto = header_str(headers, "x-forwarded-proto").unwrap_or("http");
    let host = header_str(headers, "x-forwarded-host")
        .or_else(|| header_str(headers, "host"))
        .unwrap_or("localhost");
    let prefix = header_str(headers, "x-forwarded-prefix").unwrap_or("");

    card.url = format!("{proto}://{host}{prefix}{a2a_path}");
    card
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn handle_agent_card(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let a2a_path = state
        .agent_card
        .supported_interfaces
        .first()
        .map(|i| i.url.clone())
        .unwrap_or_else(|| "/a2a".to_string());
    let card = rewrite_card_url(&state.agent_card, &headers, &a2a_path);
    Json(card).into_response()
}

async fn handle_artifact_download(
    State(state): State<Arc<AppState>>,
    Path((task_id, artifact_id)): Path<(String, String)>,
) -> Response {
    match state.workflow_runtime.get_artifact(&task_id, &artifact_id).await {
        Some(artifact) => Json(artifact).into_response(),
        None => {
            let err: A2AJsonRpcError =
                A2AError::task_not_found(format!("no artifact '{artifact_id}' on task '{task_id}'")).into();
            (StatusCode::NOT_FOUND, Json(err)).into_response()
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, serde::Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<A2AJsonRpcError>,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0".to_string(), id, result: Some(result), error: None }
    }

    fn error(id: Option<Value>, code: i64, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(A2AJsonRpcError { code, message, data: None }),
        }
    }

    fn from_a2a_error(id: Option<Value>, err: A2AError) -> Self {
        let rpc_err: A2AJsonRpcError = err.into();
        Self { jsonrpc: "2.0".to_string(), id, result: None, error: Some(rpc_err) }
    }
}

async fn handle_jsonrpc(State(state): State<Arc<AppState>>, Json(request): Json<JsonRpcRequest>) -> Response {
    if request.jsonrpc != "2.0" {
        return Json(JsonRpcResponse::error(
            request.id,
            error::INVALID_REQUEST,
            "Invalid JSON-RPC version — must be \"2.0\"".to_string(),
        ))
        .into_response();
    }

    debug!(method = %request.method, "A2A JSON-RPC request received");

    match request.method.as_str() {
        "message/send" => handle_message_send(state, request).await,
        "message/stream" => handle_message_stream(state, request).await,
        "tasks/get" => handle_tasks_get(state, request).await,
        "tasks/cancel" => handle_tasks_cancel(state, request).await,
        "tasks/resubscribe" => handle_tasks_resubscribe(state, request).await,
        method => {
            warn!(method = %method, "unknown A2A JSON-RPC method");
            Json(JsonRpcResponse::error(
                request.id,
                error::METHOD_NOT_FOUND,
                format!("Method not found: {}", method),
            ))
            .into_response()
        }
    }
}

fn parse_message(params: &Value) -> Result<Message, String> {
    let obj = params.as_object().ok_or("params must be an object")?;
    let message_value = obj.get("message").cloned().ok_or("missing 'message' field")?;
    serde_json::from_value(message_value).map_err(|e| format!("invalid message: {e}"))
}

fn parse_id(params: &Value) -> Result<String, String> {
    params
        .as_object()
        .and_then(|o| o.get("id"))
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| "missing 'id' field".to_string())
}

async fn handle_message_send(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let message = match parse_message(&request.params) {
        Ok(m) => m,
        Err(e) => {
            return Json(JsonRpcResponse::error(request.id, error::INVALID_PARAMS, format!("Invalid params: {e}")))
                .into_response();
        }
    };

    match drive_to_stopping_point(&state, message).await {
        Ok(task) => match serde_json::to_value(&task) {
            Ok(v) => Json(JsonRpcResponse::success(request.id, v)).into_response(),
            Err(e) => Json(JsonRpcResponse::error(request.id, error::INTERNAL_ERROR, format!("Internal error: {e}")))
                .into_response(),
        },
        Err(e) => Json(JsonRpcResponse::from_a2a_error(request.id, e)).into_response(),
    }
}

/// Shared routing + wait-for-terminal logic behind `message/send` and the
/// first frame of `message/stream`.
///
/// A message naming an existing `taskId` may turn out to *resume* a paused
/// workflow (`RoutingOutcome::Resumed`) rather than start a fresh task, and
/// that task's event stream already has a retained `input-required` record
/// from the pause that got it there — the one this very call is trying to
/// move past. Subscribing from `seq=0` in that case would immediately replay
/// that stale record, `is_paused` would match it, and the loop would return
/// before ever observing anything the resume itself produced. So the seq the
/// named task is at *before* routing is captured up front and used as the
/// resume branch's subscribe point; a brand-new task (`NewTurn`) has no such
/// history to skip and subscribes from `0` as before.
async fn drive_to_stopping_point(state: &Arc<AppState>, message: Message) -> crate::error::A2AResult<Task> {
    let pre_routing_seq = match &message.task_id {
        Some(id) => state.event_bus.current_seq(id).await,
        None => 0,
    };

    let outcome = state.agent_executor.handle_message(message).await?;

    let (task_id, from_seq) = match &outcome {
        RoutingOutcome::NewTurn { task_id, .. } => (task_id.clone(), 0),
        RoutingOutcome::Resumed { task_id, result } => {
            if *result == ResumeResult::Rejected {
                return Err(A2AError::invalid_input(format!(
                    "resume input for task '{task_id}' failed schema validation"
                )));
            }
            (task_id.clone(), pre_routing_seq)
        }
    };

    let mut stream = state.event_bus.subscribe(&task_id, from_seq).await;
    while let Some(record) = stream.next().await {
        if record.r#final || is_paused(&record) {
            break;
        }
    }

    state
        .task_store
        .get(&task_id)
        .await
        .ok_or_else(|| A2AError::task_not_found(task_id))
}

fn is_paused(record: &EventRecord) -> bool {
    matches!(
        &record.payload,
        crate::types::EventPayload::StatusUpdate { status, .. }
            if status.state == crate::types::TaskState::InputRequired
    )
}

async fn handle_message_stream(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    if !state.agent_card.capabilities.streaming.unwrap_or(false) {
        return Json(JsonRpcResponse::error(
            request.id,
            error::UNSUPPORTED_OPERATION,
            "Streaming is not supported by the agent".to_string(),
        ))
        .into_response();
    }

    let message = match parse_message(&request.params) {
        Ok(m) => m,
        Err(e) => {
            return Json(JsonRpcResponse::error(request.id, error::INVALID_PARAMS, format!("Invalid params: {e}")))
                .into_response();
        }
    };

    let outcome = match state.agent_executor.handle_message(message).await {
        Ok(o) => o,
        Err(e) => return Json(JsonRpcResponse::from_a2a_error(request.id, e)).into_response(),
    };

    let task_id = match outcome {
        RoutingOutcome::NewTurn { task_id, .. } => task_id,
        RoutingOutcome::Resumed { task_id, result } => {
            if result == ResumeResult::Rejected {
                return Json(JsonRpcResponse::from_a2a_error(
                    request.id,
                    A2AError::invalid_input(format!("resume input for task '{task_id}' failed schema validation")),
                ))
                .into_response();
            }
            task_id
        }
    };

    let event_stream = state.event_bus.subscribe(&task_id, 0).await;
    let sse_stream = make_sse_stream(request.id, event_stream);
    Sse::new(sse_stream).keep_alive(KeepAlive::default()).into_response()
}

async fn handle_tasks_get(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let id = match parse_id(&request.params) {
        Ok(id) => id,
        Err(e) => {
            return Json(JsonRpcResponse::error(request.id, error::INVALID_PARAMS, format!("Invalid params: {e}")))
                .into_response();
        }
    };

    match state.agent_executor.get_task(&id).await {
        Some(task) => match serde_json::to_value(&task) {
            Ok(v) => Json(JsonRpcResponse::success(request.id, v)).into_response(),
            Err(e) => Json(JsonRpcResponse::error(request.id, error::INTERNAL_ERROR, format!("Internal error: {e}")))
                .into_response(),
        },
        None => Json(JsonRpcResponse::from_a2a_error(request.id, A2AError::task_not_found(id))).into_response(),
    }
}

async fn handle_tasks_cancel(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let id = match parse_id(&request.params) {
        Ok(id) => id,
        Err(e) => {
            return Json(JsonRpcResponse::error(request.id, error::INVALID_PARAMS, format!("Invalid params: {e}")))
                .into_response();
        }
    };

    match state.agent_executor.cancel_task(&id).await {
        Ok(task) => match serde_json::to_value(&task) {
            Ok(v) => Json(JsonRpcResponse::success(request.id, v)).into_response(),
            Err(e) => Json(JsonRpcResponse::error(request.id, error::INTERNAL_ERROR, format!("Internal error: {e}")))
                .into_response(),
        },
        Err(e) => Json(JsonRpcResponse::from_a2a_error(request.id, e)).into_response(),
    }
}

/// `tasks/resubscribe` — subscribe to an existing task's event bus from
/// `seq=0`, replaying its retained snapshot before continuing with the live
/// tail (`spec.md` §4.7, Scenario S3).
async fn handle_tasks_resubscribe(state: Arc<AppState>, request: JsonRpcRequest) -> Response {
    let id = match parse_id(&request.params) {
        Ok(id) => id,
        Err(e) => {
            return Json(JsonRpcResponse::error(request.id, error::INVALID_PARAMS, format!("Invalid params: {e}")))
                .into_response();
        }
    };

    if state.agent_executor.get_task(&id).await.is_none() {
        return Json(JsonRpcResponse::from_a2a_error(request.id, A2AError::task_not_found(id))).into_response();
    }

    let event_stream = state.event_bus.subscribe(&id, 0).await;
    let sse_stream = make_sse_stream(request.id, event_stream);
    Sse::new(sse_stream).keep_alive(KeepAlive::default()).into_response()
}

/// Frame each [`EventRecord`] as an SSE event carrying a JSON-RPC success
/// envelope, mirroring [`super::axum_integration::make_sse_stream`]'s idiom
/// but sourced from the new per-task [`crate::event_bus::EventStream`]
/// instead of a plain broadcast receiver.
fn make_sse_stream(
    request_id: Option<Value>,
    mut records: crate::event_bus::EventStream,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(record) = records.next().await {
            let is_final = record.r#final;
            let event_type = record.payload.kind_name();

            match serde_json::to_value(&record) {
                Ok(result_value) => {
                    let rpc_response = JsonRpcResponse::success(request_id.clone(), result_value);
                    match serde_json::to_string(&rpc_response) {
                        Ok(json) => yield Ok(Event::default().event(event_type).data(json)),
                        Err(e) => error!(error = %e, "failed to serialize SSE JSON-RPC response"),
                    }
                }
                Err(e) => error!(error = %e, "failed to serialize event record"),
            }

            if is_final {
                yield Ok(Event::default().event("done").data(""));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::AgentCardBuilder;
    use crate::context_manager::ContextManager;
    use crate::stream_processor::StreamProcessor;
    use crate::testing::{ScriptedModelProvider, StaticToolInvoker};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> Router {
        let event_bus = EventBus::with_default_capacity();
        let task_store = TaskStore::new();
        let context_manager = ContextManager::new(task_store.clone());
        let workflow_runtime = WorkflowRuntime::new(event_bus.clone(), task_store.clone());
        let stream_processor = StreamProcessor::new(
            event_bus.clone(),
            task_store.clone(),
            context_manager.clone(),
            workflow_runtime.clone(),
        );
        let model = Arc::new(ScriptedModelProvider::finishing_with_text("pong"));
        let tools = Arc::new(StaticToolInvoker::default());
        let agent_executor = AgentExecutor::new(
            context_manager,
            task_store.clone(),
            event_bus.clone(),
            workflow_runtime.clone(),
            stream_processor,
            model,
            tools,
        );
        let card = AgentCardBuilder::new("Test Agent", "for tests", "0.1.0")
            .with_jsonrpc_interface("http://localhost:8080/a2a")
            .with_streaming(true)
            .build();

        a2a_node_router(agent_executor, task_store, event_bus, workflow_runtime, card, "/a2a")
    }

    #[tokio::test]
    async fn health_returns_200() {
        let app = router();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn message_send_completes_a_simple_turn() {
        let app = router();
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "message/send",
            "params": { "message": crate::utils::new_agent_text_message("ping", None::<String>, None::<String>) }
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/a2a")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["result"]["status"]["state"], "completed");
    }

    #[tokio::test]
    async fn tasks_get_unknown_id_is_task_not_found() {
        let app = router();
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tasks/get",
            "params": { "id": "does-not-exist" }
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/a2a")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"]["code"], error::TASK_NOT_FOUND);
    }

    #[tokio::test]
    async fn agent_card_url_is_rewritten_from_forwarded_headers() {
        let app = router();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/.well-known/agent.json")
                    .header("x-forwarded-proto", "https")
                    .header("x-forwarded-host", "agents.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["url"], "https://agents.example.com/a2a");
    }

    /// Same wiring as [`router`], but also hands back the `WorkflowRuntime`
    /// so a test can dispatch a workflow directly rather than going through
    /// the model-driven dispatch path.
    fn router_with_workflow_runtime() -> (Router, WorkflowRuntime) {
        let event_bus = EventBus::with_default_capacity();
        let task_store = TaskStore::new();
        let context_manager = ContextManager::new(task_store.clone());
        let workflow_runtime = WorkflowRuntime::new(event_bus.clone(), task_store.clone());
        let stream_processor = StreamProcessor::new(
            event_bus.clone(),
            task_store.clone(),
            context_manager.clone(),
            workflow_runtime.clone(),
        );
        let model = Arc::new(ScriptedModelProvider::finishing_with_text("pong"));
        let tools = Arc::new(StaticToolInvoker::default());
        let agent_executor = AgentExecutor::new(
            context_manager,
            task_store.clone(),
            event_bus.clone(),
            workflow_runtime.clone(),
            stream_processor,
            model,
            tools,
        );
        let card = AgentCardBuilder::new("Test Agent", "for tests", "0.1.0")
            .with_jsonrpc_interface("http://localhost:8080/a2a")
            .with_streaming(true)
            .build();

        let router = a2a_node_router(
            agent_executor,
            task_store,
            event_bus,
            workflow_runtime.clone(),
            card,
            "/a2a",
        );
        (router, workflow_runtime)
    }

    /// Regression test for a resume that races a caller re-subscribing to
    /// the task's event bus right after `message/send` routes it: the
    /// dispatched plugin sleeps after being resumed, so a caller that
    /// (incorrectly) replayed from `seq=0` would observe the stale
    /// `input-required` record still in the ring and return long before the
    /// plugin's post-resume completion exists, while the fix waits through
    /// the sleep and observes the real terminal state.
    #[tokio::test]
    async fn message_send_waits_out_a_slow_resume_instead_of_returning_stale_state() {
        let (app, workflow_runtime) = router_with_workflow_runtime();
        workflow_runtime
            .register(Arc::new(crate::testing::SlowResumeWorkflowPlugin {
                post_resume_delay: std::time::Duration::from_millis(200),
            }))
            .unwrap();

        let execution = workflow_runtime
            .dispatch(crate::workflow_runtime::DispatchParams {
                plugin_id: "slow-resume".to_string(),
                context_id: "ctx-1".to_string(),
                parameters: serde_json::json!({}),
                parent_task_id: None,
            })
            .await
            .unwrap();

        // Let the plugin reach its pause point before resuming it.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut message =
            crate::utils::new_agent_text_message("ada", Some("ctx-1"), Some(execution.execution_id.clone()));
        message.parts = vec![crate::types::Part::Data {
            data: serde_json::json!({ "name": "ada" }),
            metadata: None,
        }];
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "message/send",
            "params": { "message": message }
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/a2a")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["result"]["status"]["state"], "completed");
    }
}
