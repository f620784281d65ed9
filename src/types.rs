//! A2A protocol types — complete coverage of the v0.3 protobuf schema.
//!
//! Reference: <https://github.com/a2aproject/A2A/blob/main/specification/a2a.proto>
//! Python SDK reference: <https://github.com/a2aproject/a2a-python/blob/main/src/a2a/types.py>
//!
//! This module implements ALL message types from the proto spec with correct
//! JSON-RPC serialization (matching the Python SDK wire format).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// Enums
// ============================================================================

/// The lifecycle state of a task.
///
/// Serialized as SCREAMING_SNAKE_CASE ProtoJSON strings to match the
/// official A2A proto specification (`enum TaskState`).
///
/// Proto ref: `enum TaskState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    /// Task has been received but not yet started.
    Submitted,
    /// Task is actively being processed.
    Working,
    /// Task completed successfully.
    Completed,
    /// Task failed.
    Failed,
    /// Task was canceled.
    Canceled,
    /// Task requires additional input from the user.
    InputRequired,
    /// Task was rejected by the agent.
    Rejected,
    /// Task requires authentication.
    AuthRequired,
    /// Unknown state (not in proto, but present in Python SDK for forward compat).
    Unknown,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Submitted => "submitted",
            TaskState::Working => "working",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Canceled => "canceled",
            TaskState::InputRequired => "input-required",
            TaskState::Rejected => "rejected",
            TaskState::AuthRequired => "auth-required",
            TaskState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// The role of a message sender.
///
/// Serialized as SCREAMING_SNAKE_CASE ProtoJSON strings to match the
/// official A2A proto specification (`enum Role`).
///
/// Proto ref: `enum Role`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message from the user / client.
    User,
    /// Message from the agent / server.
    Agent,
    /// Unspecified role.
    Unspecified,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Agent => write!(f, "agent"),
            Role::Unspecified => write!(f, "unspecified"),
        }
    }
}

/// Location for an API key (header, query, cookie).
///
/// Python SDK ref: `In` enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    /// API key sent as a cookie.
    Cookie,
    /// API key sent in an HTTP header.
    Header,
    /// API key sent as a query parameter.
    Query,
}

// ============================================================================
// Core Task Types
// ============================================================================

/// Current status of a task.
///
/// Proto ref: `message TaskStatus`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    /// The current state.
    pub state: TaskState,

    /// Optional message associated with this status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,

    /// ISO-8601 timestamp of when this status was set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Whether a task is a plain AI turn or a dispatched workflow execution.
///
/// Orthogonal to the wire-level `kind` discriminator on [`Task`] (which is
/// always the literal `"task"` for JSON-RPC union typing); this is the
/// routing classification used internally by `AgentExecutor` and enforced by
/// the `input-required ⇒ workflow` invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// A single AI chat turn driven by `StreamProcessor`.
    AiTurn,
    /// A workflow execution driven by `WorkflowRuntime`.
    Workflow,
}

/// The schema-validated input a paused workflow is waiting for, plus the
/// reason and prompt message presented to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseInfo {
    /// Why the workflow paused (plugin-supplied, free text).
    pub reason: String,
    /// JSON Schema the resume input must validate against.
    pub input_schema: serde_json::Value,
    /// Optional message shown to the caller while paused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

/// A task — the primary unit of work in the A2A protocol.
///
/// Python SDK ref: `Task` (has `kind: Literal['task'] = 'task'`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier.
    pub id: String,

    /// Context identifier (groups related tasks/messages).
    pub context_id: String,

    /// Discriminator field — always "task".
    #[serde(default = "kind_task")]
    pub kind: String,

    /// Whether this task is an AI turn or a workflow execution.
    pub task_kind: TaskKind,

    /// The task that dispatched this one, if any. Set iff this task was
    /// spawned by a `StreamProcessor` tool-call interception; the parent
    /// always lives in the same `contextId`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,

    /// Current task status.
    pub status: TaskStatus,

    /// Details of the pending pause, set only while `status.state ==
    /// input-required`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_info: Option<PauseInfo>,

    /// RFC 3339 creation timestamp.
    pub created_at: String,

    /// RFC 3339 timestamp of the last state transition.
    pub updated_at: String,

    /// Artifacts produced by the task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<Artifact>>,

    /// Message history for this task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<Message>>,

    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Task {
    /// True once the task has reached a terminal state (`completed`,
    /// `failed`, or `canceled`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.state,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled
        )
    }
}

/// Type alias for `Task` — used in client APIs for readability.
pub type A2ATask = Task;

// ============================================================================
// Message & Parts
// ============================================================================

/// A single message in a conversation.
///
/// Python SDK ref: `Message` (has `kind: Literal['message'] = 'message'`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message identifier.
    pub message_id: String,

    /// Who sent this message.
    pub role: Role,

    /// Discriminator field — always "message".
    #[serde(default = "kind_message")]
    pub kind: String,

    /// Content parts of the message.
    pub parts: Vec<Part>,

    /// Context this message belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// Task this message is associated with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// Protocol extensions active for this message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<String>>,

    /// IDs of tasks referenced by this message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_task_ids: Option<Vec<String>>,
}

/// File content provided as base64-encoded bytes.
///
/// Python SDK ref: `FileWithBytes`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWithBytes {
    /// Base64-encoded file content.
    pub bytes: String,
    /// MIME type of the file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Optional file name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// File content provided as a URI reference.
///
/// Python SDK ref: `FileWithUri`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWithUri {
    /// URI pointing to the file content.
    pub uri: String,
    /// MIME type of the file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Optional file name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// File content — either inline bytes or a URI reference.
///
/// Python SDK ref: `FileWithBytes | FileWithUri` (union in FilePart.file)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileContent {
    /// File with inline base64-encoded bytes.
    Bytes(FileWithBytes),
    /// File referenced by URI.
    Uri(FileWithUri),
}

/// A content part within a message or artifact.
///
/// Discriminated by the `kind` field, matching the Python SDK's
/// `Part(RootModel[TextPart | FilePart | DataPart])`.
///
/// JSON wire format:
/// - Text: `{"kind": "text", "text": "hello"}`
/// - File (bytes): `{"kind": "file", "file": {"bytes": "SGVsbG8=", "mimeType": "text/plain", "name": "hello.txt"}}`
/// - File (uri): `{"kind": "file", "file": {"uri": "https://example.com/file.pdf", "mimeType": "application/pdf"}}`
/// - Data: `{"kind": "data", "data": {"key": "value"}}`
///
/// Python SDK ref: `Part`, `TextPart`, `FilePart`, `DataPart`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Part {
    /// A text content part. Discriminator: `"text"`.
    #[serde(rename = "text")]
    Text {
        /// The text content.
        text: String,
        /// Optional metadata associated with this part.
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    /// A file content part. Discriminator: `"file"`.
    #[serde(rename = "file")]
    File {
        /// The file content (bytes or URI).
        file: FileContent,
        /// Optional metadata associated with this part.
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    /// A structured data content part. Discriminator: `"data"`.
    #[serde(rename = "data")]
    Data {
        /// Arbitrary structured data.
        data: serde_json::Value,
        /// Optional metadata associated with this part.
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
}

/// Legacy type alias — `TextPart` is now an inline variant of [`Part::Text`].
///
/// For pattern matching, use `Part::Text { text, metadata }` instead.
#[deprecated(note = "Use Part::Text { text, metadata } enum variant instead")]
pub type TextPart = ();

/// Legacy type alias — replaced by [`Part::File`] with [`FileContent::Bytes`].
#[deprecated(
    note = "Use Part::File { file: FileContent::Bytes(FileWithBytes { .. }), .. } instead"
)]
pub type RawPart = ();

/// Legacy type alias — replaced by [`Part::File`] with [`FileContent::Uri`].
#[deprecated(note = "Use Part::File { file: FileContent::Uri(FileWithUri { .. }), .. } instead")]
pub type UrlPart = ();

/// Legacy type alias — `DataPart` is now an inline variant of [`Part::Data`].
///
/// For pattern matching, use `Part::Data { data, metadata }` instead.
#[deprecated(note = "Use Part::Data { data, metadata } enum variant instead")]
pub type DataPart = ();

/// An artifact produced by a task.
///
/// Proto ref: `message Artifact`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Unique artifact identifier.
    pub artifact_id: String,

    /// Human-readable name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Description of the artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Content parts of the artifact.
    pub parts: Vec<Part>,

    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// Protocol extensions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<String>>,
}

// ============================================================================
// Streaming Events
// ============================================================================

/// Notification that a task's status has changed.
///
/// Python SDK ref: `TaskStatusUpdateEvent` (has `kind: Literal['status-update'] = 'status-update'`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusUpdateEvent {
    /// ID of the task whose status changed.
    pub task_id: String,

    /// Context this task belongs to.
    pub context_id: String,

    /// Discriminator field — always "status-update".
    #[serde(default = "kind_status_update")]
    pub kind: String,

    /// The new status.
    pub status: TaskStatus,

    /// Whether this is the final status update for this task.
    ///
    /// **IMPORTANT: Proto v0.3 Discrepancy**
    ///
    /// The official A2A protobuf schema v0.3 **removed** the `final` field from
    /// `TaskStatusUpdateEvent` (it's now reserved field 4, indicating deprecation):
    /// - Proto source: https://github.com/a2aproject/A2A/blob/main/specification/a2a.proto
    ///   (see `message TaskStatusUpdateEvent`, field 4 is reserved)
    ///
    /// However, the JavaScript SDK (a2a-js) **still includes** `final: boolean` in its
    /// JSON-RPC serialization for `TaskStatusUpdateEvent`:
    /// - JS SDK source: https://github.com/a2aproject/a2a-js
    ///
    /// **Our implementation follows the JS SDK pattern** for JSON-RPC compatibility.
    /// This field is required (not optional) and is always serialized in JSON responses.
    ///
    /// Python SDK: `final: bool` (REQUIRED, not optional).
    #[serde(rename = "final")]
    pub r#final: bool,

    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Notification that an artifact has been created or updated.
///
/// Python SDK ref: `TaskArtifactUpdateEvent` (has `kind: Literal['artifact-update'] = 'artifact-update'`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskArtifactUpdateEvent {
    /// ID of the task that produced the artifact.
    pub task_id: String,

    /// Context this task belongs to.
    pub context_id: String,

    /// Discriminator field — always "artifact-update".
    #[serde(default = "kind_artifact_update")]
    pub kind: String,

    /// The artifact.
    pub artifact: Artifact,

    /// Whether to append to an existing artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub append: Option<bool>,

    /// Whether this is the last chunk of the artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_chunk: Option<bool>,

    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

fn kind_task() -> String {
    "task".to_string()
}

fn kind_message() -> String {
    "message".to_string()
}

fn kind_status_update() -> String {
    "status-update".to_string()
}

fn kind_artifact_update() -> String {
    "artifact-update".to_string()
}

fn default_preferred_transport() -> Option<String> {
    Some("JSONRPC".to_string())
}

fn default_protocol_version() -> Option<String> {
    Some("0.3.0".to_string())
}

/// A streaming response payload.
///
/// Python SDK ref: `SendStreamingMessageSuccessResponse.result` is
/// `Task | Message | TaskStatusUpdateEvent | TaskArtifactUpdateEvent`.
///
/// Each inner type has a `kind` discriminator field that identifies it:
/// - `"task"` -> Task
/// - `"message"` -> Message
/// - `"status-update"` -> TaskStatusUpdateEvent
/// - `"artifact-update"` -> TaskArtifactUpdateEvent
///
/// Serializes FLAT (no wrapper keys) — the `kind` field is the discriminator.
#[derive(Debug, Clone)]
pub enum StreamResponse {
    /// A complete task snapshot.
    Task(Task),

    /// A direct message.
    Message(Message),

    /// A task status update event.
    StatusUpdate(TaskStatusUpdateEvent),

    /// An artifact update event.
    ArtifactUpdate(TaskArtifactUpdateEvent),
}

impl Serialize for StreamResponse {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StreamResponse::Task(inner) => inner.serialize(serializer),
            StreamResponse::Message(inner) => inner.serialize(serializer),
            StreamResponse::StatusUpdate(inner) => inner.serialize(serializer),
            StreamResponse::ArtifactUpdate(inner) => inner.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for StreamResponse {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let kind = value
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| serde::de::Error::custom("missing 'kind' field"))?;

        match kind {
            "task" => {
                let task: Task =
                    serde_json::from_value(value).map_err(serde::de::Error::custom)?;
                Ok(StreamResponse::Task(task))
            }
            "message" => {
                let msg: Message =
                    serde_json::from_value(value).map_err(serde::de::Error::custom)?;
                Ok(StreamResponse::Message(msg))
            }
            "status-update" => {
                let event: TaskStatusUpdateEvent =
                    serde_json::from_value(value).map_err(serde::de::Error::custom)?;
                Ok(StreamResponse::StatusUpdate(event))
            }
            "artifact-update" => {
                let event: TaskArtifactUpdateEvent =
                    serde_json::from_value(value).map_err(serde::de::Error::custom)?;
                Ok(StreamResponse::ArtifactUpdate(event))
            }
            other => Err(serde::de::Error::custom(format!(
                "unknown kind '{}' — expected one of: task, message, status-update, artifact-update",
                other
            ))),
        }
    }
}

// ============================================================================
// Agent Card & Related Types
// ============================================================================

/// Self-describing manifest for an A2A agent.
///
/// Proto ref: `message AgentCard`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    /// Human-readable name.
    pub name: String,

    /// Description of the agent's capabilities.
    pub description: String,

    /// Agent version string.
    pub version: String,

    /// Supported transport interfaces.
    #[serde(default)]
    pub supported_interfaces: Vec<AgentInterface>,

    /// Service provider information.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<AgentProvider>,

    /// URL to the agent's documentation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,

    /// Agent capabilities.
    pub capabilities: AgentCapabilities,

    /// Named security scheme definitions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_schemes: Option<HashMap<String, SecurityScheme>>,

    /// Security requirements (references to security_schemes).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_requirements: Vec<SecurityRequirement>,

    /// Default MIME types accepted as input.
    pub default_input_modes: Vec<String>,

    /// Default MIME types produced as output.
    pub default_output_modes: Vec<String>,

    /// Skills the agent supports.
    pub skills: Vec<AgentSkill>,

    /// JWS signatures for the agent card.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Vec<AgentCardSignature>>,

    /// URL to the agent's icon.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,

    /// Additional interfaces (Python SDK field, not in proto).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_interfaces: Option<Vec<AgentInterface>>,

    /// Preferred transport protocol (e.g. "JSONRPC", "GRPC", "HTTP+JSON").
    /// Defaults to "JSONRPC" per the Python SDK.
    #[serde(
        default = "default_preferred_transport",
        skip_serializing_if = "Option::is_none"
    )]
    pub preferred_transport: Option<String>,

    /// Protocol version — defaults to "0.3.0" per the Python SDK.
    #[serde(
        default = "default_protocol_version",
        skip_serializing_if = "Option::is_none"
    )]
    pub protocol_version: Option<String>,

    /// Primary URL for the agent (required in Python/JS SDKs).
    pub url: String,

    /// Whether the agent supports authenticated extended card.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_authenticated_extended_card: Option<bool>,

    /// Security (Python SDK shorthand — list of scheme-name to scopes mappings).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<Vec<HashMap<String, Vec<String>>>>,
}

/// A transport interface supported by an agent.
///
/// Python SDK ref: `AgentInterface` — uses `transport: str`, NOT `protocolBinding`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInterface {
    /// URL of the interface endpoint.
    pub url: String,

    /// Transport protocol (e.g. "JSONRPC", "HTTP+JSON", "GRPC").
    ///
    /// Python SDK: `transport: str`
    /// JSON: `"transport"`.
    pub transport: String,

    /// Optional tenant identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,

    /// Protocol version (e.g. "0.3"). Optional since Python SDK doesn't require it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
}

/// Agent capabilities declaration.
///
/// Python SDK ref: `AgentCapabilities`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[derive(Default)]
pub struct AgentCapabilities {
    /// Whether the agent supports streaming responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,

    /// Whether the agent supports push notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_notifications: Option<bool>,

    /// Protocol extensions supported by the agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<AgentExtension>>,

    /// Whether the agent provides a history of state transitions for a task.
    ///
    /// Present in the Python SDK (generated from the JSON schema).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_transition_history: Option<bool>,
}

/// A protocol extension supported by the agent.
///
/// Proto ref: `message AgentExtension`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentExtension {
    /// URI identifying the extension.
    pub uri: String,

    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether this extension is required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,

    /// Extension-specific parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// A skill that an agent can perform.
///
/// Proto ref: `message AgentSkill`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSkill {
    /// Unique skill identifier.
    pub id: String,

    /// Human-readable skill name.
    pub name: String,

    /// Description of what the skill does.
    pub description: String,

    /// Categorization tags.
    pub tags: Vec<String>,

    /// Example prompts/inputs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub examples: Option<Vec<String>>,

    /// MIME types this skill accepts as input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_modes: Option<Vec<String>>,

    /// MIME types this skill produces as output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_modes: Option<Vec<String>>,

    /// Security requirements for this skill.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_requirements: Option<Vec<SecurityRequirement>>,

    /// Security (Python SDK shorthand).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<Vec<HashMap<String, Vec<String>>>>,
}

/// Information about the agent's provider/organization.
///
/// Proto ref: `message AgentProvider`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProvider {
    /// Organization name.
    pub organization: String,

    /// Organization URL.
    pub url: String,
}

/// JWS signature for an agent card (RFC 7515).
///
/// Proto ref: `message AgentCardSignature`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCardSignature {
    /// Base64url-encoded JWS protected header.
    pub protected: String,

    /// Base64url-encoded JWS signature.
    pub signature: String,

    /// Optional unprotected header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<serde_json::Value>,
}

// ============================================================================
// Security Schemes
// ============================================================================

/// A security scheme definition.
///
/// Python SDK ref: `SecurityScheme` is a discriminated union using `type` field.
/// Each inner type has `type: Literal['apiKey'] | 'http' | 'oauth2' | 'openIdConnect' | 'mutualTLS'`.
///
/// JSON: `{"type": "apiKey", "in": "header", "name": "X-API-Key"}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SecurityScheme {
    /// API key authentication.
    #[serde(rename = "apiKey")]
    ApiKey {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        /// Where the API key is sent (header, query, cookie).
        /// Python SDK: `in_: In` with JSON alias `"in"`.
        #[serde(rename = "in")]
        location: ApiKeyLocation,
        /// Name of the API key parameter.
        name: String,
    },
    /// HTTP authentication (Bearer, Basic, etc.).
    #[serde(rename = "http")]
    Http {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        /// Authentication scheme name (e.g. "bearer").
        scheme: String,
        /// Format of the bearer token.
        #[serde(skip_serializing_if = "Option::is_none", rename = "bearerFormat")]
        bearer_format: Option<String>,
    },
    /// OAuth 2.0 authentication.
    #[serde(rename = "oauth2")]
    OAuth2 {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        /// OAuth 2.0 flow configuration.
        flows: OAuthFlows,
        /// URL for OAuth 2.0 metadata discovery.
        #[serde(skip_serializing_if = "Option::is_none", rename = "oauth2MetadataUrl")]
        oauth2_metadata_url: Option<String>,
    },
    /// OpenID Connect authentication.
    #[serde(rename = "openIdConnect")]
    OpenIdConnect {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        /// OpenID Connect discovery URL.
        #[serde(rename = "openIdConnectUrl")]
        open_id_connect_url: String,
    },
    /// Mutual TLS authentication.
    #[serde(rename = "mutualTLS")]
    MutualTls {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

/// OAuth 2.0 flow configurations.
///
/// Python SDK ref: `OAuthFlows` — has authorization_code, client_credentials,
/// implicit, password. No device_code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[derive(Default)]
pub struct OAuthFlows {
    /// Authorization code flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_code: Option<AuthorizationCodeOAuthFlow>,

    /// Client credentials flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_credentials: Option<ClientCredentialsOAuthFlow>,

    /// Implicit flow (deprecated in OAuth 2.1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implicit: Option<ImplicitOAuthFlow>,

    /// Resource Owner Password flow (deprecated in OAuth 2.1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<PasswordOAuthFlow>,
}

/// Authorization code OAuth flow.
///
/// Python SDK ref: `AuthorizationCodeOAuthFlow` — no pkce_required field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationCodeOAuthFlow {
    /// Authorization endpoint URL.
    pub authorization_url: String,

    /// Token endpoint URL.
    pub token_url: String,

    /// Token refresh endpoint URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_url: Option<String>,

    /// Available scopes (scope name -> description).
    pub scopes: HashMap<String, String>,
}

/// Client credentials OAuth flow.
///
/// Proto ref: `message ClientCredentialsOAuthFlow`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCredentialsOAuthFlow {
    /// Token endpoint URL.
    pub token_url: String,

    /// Token refresh endpoint URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_url: Option<String>,

    /// Available scopes (scope name -> description).
    pub scopes: HashMap<String, String>,
}

/// Implicit OAuth flow (deprecated in OAuth 2.1).
///
/// Proto ref: `message ImplicitOAuthFlow`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplicitOAuthFlow {
    /// Authorization endpoint URL.
    pub authorization_url: String,

    /// Token refresh endpoint URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_url: Option<String>,

    /// Available scopes.
    pub scopes: HashMap<String, String>,
}

/// Resource Owner Password OAuth flow (deprecated in OAuth 2.1).
///
/// Proto ref: `message PasswordOAuthFlow`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordOAuthFlow {
    /// Token endpoint URL.
    pub token_url: String,

    /// Token refresh endpoint URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_url: Option<String>,

    /// Available scopes.
    pub scopes: HashMap<String, String>,
}

/// A security requirement — maps scheme names to required scopes.
///
/// Python SDK: `list[dict[str, list[str]]]` -> JSON: `[{"oauth": ["read", "write"]}]`
///
/// Each entry is a HashMap from scheme name to list of required scopes.
pub type SecurityRequirement = HashMap<String, Vec<String>>;

// ============================================================================
// Push Notifications
// ============================================================================

/// Configuration for push notification delivery.
///
/// Proto ref: `message PushNotificationConfig`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotificationConfig {
    /// Optional identifier for this config.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// URL to deliver notifications to.
    pub url: String,

    /// Optional verification token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Authentication configuration for the push endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<PushNotificationAuthenticationInfo>,
}

/// Authentication information for push notification delivery.
///
/// Python SDK ref: `PushNotificationAuthenticationInfo`
/// `schemes: list[str]` (PLURAL), `credentials: str | None`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotificationAuthenticationInfo {
    /// List of supported authentication schemes (e.g. ["Bearer", "Basic"]).
    /// Python SDK: `schemes: list[str]` (PLURAL).
    pub schemes: Vec<String>,

    /// Optional credentials required by the push notification endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

/// Push notification config bound to a specific task.
///
/// Python SDK ref: `TaskPushNotificationConfig`
/// Proto ref: `message TaskPushNotificationConfig`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPushNotificationConfig {
    /// The id of this config.
    /// Proto: `string id = 1 [REQUIRED]`
    /// NOTE: Python SDK omits this field entirely from TaskPushNotificationConfig.
    /// Made optional for cross-SDK interoperability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Task this config applies to.
    /// Proto: `string task_id = 3 [REQUIRED]`
    pub task_id: String,

    /// The push notification configuration details.
    /// Proto: `PushNotificationConfig push_notification_config = 2 [REQUIRED]`
    pub push_notification_config: PushNotificationConfig,

    /// Optional tenant.
    /// Proto: `string tenant = 4`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

// ============================================================================
// JSON-RPC Foundation
// ============================================================================

/// A JSON-RPC 2.0 request/notification ID.
///
/// Can be a string, number, or null (for notifications).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    /// String identifier.
    String(String),
    /// Numeric identifier.
    Number(i64),
    /// Null (notification — no response expected).
    Null,
}

impl fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonRpcId::String(s) => write!(f, "{}", s),
            JsonRpcId::Number(n) => write!(f, "{}", n),
            JsonRpcId::Null => write!(f, "null"),
        }
    }
}

/// A JSON-RPC 2.0 request.
///
/// Used for both requests (with `id`) and notifications (without `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcRequest {
    /// Protocol version — always "2.0".
    pub jsonrpc: String,

    /// Request identifier. Absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,

    /// Method name.
    pub method: String,

    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// A JSON-RPC 2.0 response.
///
/// Exactly one of `result` or `error` will be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcResponse {
    /// Protocol version — always "2.0".
    pub jsonrpc: String,

    /// Request identifier this response corresponds to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,

    /// Successful result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Error result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a successful JSON-RPC response.
    pub fn success(id: Option<JsonRpcId>, result: serde_json::Value) -> Self {
        JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error JSON-RPC response.
    pub fn error(id: Option<JsonRpcId>, error: JsonRpcError) -> Self {
        JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Create a JSON-RPC error response from an [`A2AError`](crate::error::A2AError).
    ///
    /// Automatically maps the error code and message using the
    /// `From<A2AError> for JsonRpcError` conversion.
    pub fn from_a2a_error(id: Option<JsonRpcId>, err: crate::error::A2AError) -> Self {
        let rpc_err: JsonRpcError = err.into();
        Self::error(id, rpc_err)
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,

    /// Human-readable error message.
    pub message: String,

    /// Optional structured error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ============================================================================
// Request / Response Parameter Types
// ============================================================================

/// Parameters for `message/send` and `message/stream`.
///
/// Proto ref: `message SendMessageRequest`
/// Python SDK ref: `MessageSendParams`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageParams {
    /// The message to send.
    pub message: Message,

    /// Optional send configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<SendMessageConfiguration>,

    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

/// Configuration for a `message/send` request.
///
/// Proto ref: `message SendMessageConfiguration`
/// Python SDK ref: `MessageSendConfiguration`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[derive(Default)]
pub struct SendMessageConfiguration {
    /// MIME types the client can accept as output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_output_modes: Option<Vec<String>>,

    /// Push notification configuration for this request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_notification_config: Option<PushNotificationConfig>,

    /// Maximum number of history messages to include in the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_length: Option<i32>,

    /// Whether the request should block until the task completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking: Option<bool>,
}

/// Parameters for `tasks/get`.
///
/// Proto ref: `message GetTaskRequest`
/// Python SDK ref: `TaskQueryParams`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTaskParams {
    /// Task ID to retrieve.
    pub id: String,

    /// Maximum number of history messages to include.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_length: Option<i32>,

    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

/// Parameters for `tasks/list`.
///
/// Proto ref: `message ListTasksRequest`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksParams {
    /// Filter by context ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// Filter by task state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskState>,

    /// Maximum number of tasks to return per page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<i32>,

    /// Token for paginating through results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,

    /// Maximum number of history messages to include per task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_length: Option<i32>,

    /// Filter by status timestamp (only tasks updated after this time).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_timestamp_after: Option<String>,

    /// Whether to include artifacts in the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_artifacts: Option<bool>,

    /// Optional tenant identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

/// Response for `tasks/list`.
///
/// Proto ref: `message ListTasksResponse`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksResponse {
    /// Tasks matching the query.
    pub tasks: Vec<Task>,

    /// Token for retrieving the next page.
    pub next_page_token: String,

    /// Number of tasks in this page.
    pub page_size: i32,

    /// Total number of matching tasks.
    pub total_size: i32,
}

/// Parameters for `tasks/cancel`.
///
/// Proto ref: `message CancelTaskRequest`
/// Python SDK ref: `TaskIdParams`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTaskParams {
    /// ID of the task to cancel.
    pub id: String,

    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

/// Parameters for `tasks/subscribe` and `tasks/resubscribe`.
///
/// Proto ref: `message SubscribeToTaskRequest`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeToTaskParams {
    /// ID of the task to subscribe to.
    pub id: String,

    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// Optional tenant identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

/// Task ID parameter type used for simple task lookups.
///
/// Python SDK ref: `TaskIdParams`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIdParams {
    /// The task ID.
    pub id: String,

    /// Arbitrary metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

// ============================================================================
// Push Notification Request/Response Types
// ============================================================================

/// Parameters for creating a push notification config for a task.
///
/// Proto ref: `message CreateTaskPushNotificationConfigRequest`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskPushNotificationConfigParams {
    /// The parent task resource id.
    /// Proto: `string task_id = 1 [REQUIRED]`
    pub task_id: String,

    /// The ID for the new config.
    /// Proto: `string config_id = 2 [REQUIRED]`
    pub config_id: String,

    /// The push notification configuration to create.
    /// Proto: `PushNotificationConfig config = 5 [REQUIRED]`
    pub config: PushNotificationConfig,

    /// Optional tenant, provided as a path parameter.
    /// Proto: `string tenant = 4`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

/// Backward-compat alias for `CreateTaskPushNotificationConfigParams`.
pub type SetTaskPushNotificationConfigParams = CreateTaskPushNotificationConfigParams;

/// Parameters for getting a push notification config for a task.
///
/// Proto ref: `message GetTaskPushNotificationConfigRequest`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTaskPushNotificationConfigParams {
    /// The unique identifier (e.g. UUID) of the task.
    /// Matches Python SDK: `id: str`
    pub id: String,

    /// The ID of the push notification configuration to retrieve.
    /// Matches Python SDK: `push_notification_config_id: str | None`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_notification_config_id: Option<String>,

    /// Optional metadata associated with the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Parameters for listing push notification configs for a task.
///
/// Proto ref: `message ListTaskPushNotificationConfigRequest`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTaskPushNotificationConfigParams {
    /// The unique identifier (e.g. UUID) of the task.
    /// Matches Python SDK: `id: str`
    pub id: String,

    /// Optional metadata associated with the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Response for listing push notification configs.
///
/// Proto ref: `message ListTaskPushNotificationConfigResponse`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTaskPushNotificationConfigResponse {
    /// The list of push notification configurations.
    /// Proto: `repeated TaskPushNotificationConfig configs = 1`
    pub configs: Vec<TaskPushNotificationConfig>,

    /// A token for retrieving the next page. Omitted if no more pages.
    /// Proto: `string next_page_token = 2`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// Parameters for deleting a push notification config for a task.
///
/// Proto ref: `message DeleteTaskPushNotificationConfigRequest`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTaskPushNotificationConfigParams {
    /// The unique identifier (e.g. UUID) of the task.
    /// Matches Python SDK: `id: str`
    pub id: String,

    /// The ID of the push notification configuration to delete.
    /// Matches Python SDK: `push_notification_config_id: str`
    pub push_notification_config_id: String,

    /// Optional metadata associated with the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Parameters for getting the extended agent card.
///
/// Proto ref: `message GetExtendedAgentCardRequest`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetExtendedAgentCardParams {
    /// Optional tenant.
    /// Proto: `string tenant = 1`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

// ============================================================================
// SendMessageResponse (oneof: Task | Message)
// ============================================================================

/// Response payload for `message/send`.
///
/// Python SDK ref: `SendMessageSuccessResponse.result` is `Task | Message`.
///
/// Each inner type has a `kind` discriminator:
/// - `"task"` -> Task
/// - `"message"` -> Message
///
/// Serializes FLAT (no wrapper keys).
#[derive(Debug, Clone)]
pub enum SendMessageResponse {
    /// A task was created/updated.
    Task(Task),

    /// A direct message response.
    Message(Message),
}

impl Serialize for SendMessageResponse {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SendMessageResponse::Task(inner) => inner.serialize(serializer),
            SendMessageResponse::Message(inner) => inner.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for SendMessageResponse {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let kind = value
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| serde::de::Error::custom("missing 'kind' field"))?;

        match kind {
            "task" => {
                let task: Task = serde_json::from_value(value).map_err(serde::de::Error::custom)?;
                Ok(SendMessageResponse::Task(task))
            }
            "message" => {
                let msg: Message =
                    serde_json::from_value(value).map_err(serde::de::Error::custom)?;
                Ok(SendMessageResponse::Message(msg))
            }
            other => Err(serde::de::Error::custom(format!(
                "unknown kind '{}' — expected one of: task, message",
                other
            ))),
        }
    }
}

// ============================================================================
// Convenience Constructors
// ============================================================================

impl Part {
    /// Create a text part.
    ///
    /// Produces JSON: `{"kind": "text", "text": "..."}`
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            metadata: None,
        }
    }

    /// Create a file part from base64-encoded bytes.
    ///
    /// Produces JSON: `{"kind": "file", "file": {"bytes": "...", "mimeType": "...", "name": "..."}}`
    pub fn file_from_bytes(
        bytes: impl Into<String>,
        name: Option<String>,
        mime_type: Option<String>,
    ) -> Self {
        Part::File {
            file: FileContent::Bytes(FileWithBytes {
                bytes: bytes.into(),
                mime_type,
                name,
            }),
            metadata: None,
        }
    }

    /// Create a file part from a URI reference.
    ///
    /// Produces JSON: `{"kind": "file", "file": {"uri": "...", "mimeType": "...", "name": "..."}}`
    pub fn file_from_uri(
        uri: impl Into<String>,
        name: Option<String>,
        mime_type: Option<String>,
    ) -> Self {
        Part::File {
            file: FileContent::Uri(FileWithUri {
                uri: uri.into(),
                mime_type,
                name,
            }),
            metadata: None,
        }
    }

    /// Create a structured data part.
    ///
    /// Produces JSON: `{"kind": "data", "data": {...}}`
    pub fn data(data: serde_json::Value) -> Self {
        Part::Data {
            data,
            metadata: None,
        }
    }
}

impl Message {
    /// Create a new user message with text content.
    pub fn user(message_id: impl Into<String>, text: impl Into<String>) -> Self {
        Message {
            message_id: message_id.into(),
            role: Role::User,
            kind: kind_message(),
            parts: vec![Part::text(text)],
            context_id: None,
            task_id: None,
            metadata: None,
            extensions: None,
            reference_task_ids: None,
        }
    }

    /// Create a new agent message with text content.
    pub fn agent(message_id: impl Into<String>, text: impl Into<String>) -> Self {
        Message {
            message_id: message_id.into(),
            role: Role::Agent,
            kind: kind_message(),
            parts: vec![Part::text(text)],
            context_id: None,
            task_id: None,
            metadata: None,
            extensions: None,
            reference_task_ids: None,
        }
    }
}

impl TaskStatus {
    /// Create a new TaskStatus with the given state and no message.
    pub fn new(state: TaskState) -> Self {
        TaskStatus {
            state,
            message: None,
            timestamp: None,
        }
    }

    /// Create a new TaskStatus with the given state and an ISO-8601 timestamp.
    pub fn with_timestamp(state: TaskState, timestamp: impl Into<String>) -> Self {
        TaskStatus {
            state,
            message: None,
            timestamp: Some(timestamp.into()),
        }
    }
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(
        id: impl Into<JsonRpcId>,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    /// Create a JSON-RPC 2.0 notification (no id, no response expected).
    pub fn notification(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }
}

impl From<String> for JsonRpcId {
    fn from(s: String) -> Self {
        JsonRpcId::String(s)
    }
}

impl From<&str> for JsonRpcId {
    fn from(s: &str) -> Self {
        JsonRpcId::String(s.to_string())
    }
}

impl From<i64> for JsonRpcId {
    fn from(n: i64) -> Self {
        JsonRpcId::Number(n)
    }
}

impl From<i32> for JsonRpcId {
    fn from(n: i32) -> Self {
        JsonRpcId::Number(n as i64)
    }
}

// ============================================================================
// Workflow runtime & event bus types
// ============================================================================

/// Static descriptor for a registered workflow plugin.
///
/// The live, callable side of a plugin (its cooperative `execute` routine)
/// is the `workflow_runtime::WorkflowPlugin` trait; this is the inert part of
/// `spec.md`'s `WorkflowPlugin { id, name, description, version, inputSchema }`
/// that the registry, hot-reload coordinator, and tool catalog all need to
/// reason about without touching the routine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    /// Stable plugin identifier, e.g. `"greet"`.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Human-readable description, surfaced to the model as tool documentation.
    pub description: String,
    /// Plugin version string.
    pub version: String,
    /// JSON Schema the dispatch `parameters` must validate against.
    pub input_schema: serde_json::Value,
}

impl PluginDescriptor {
    /// The pseudo-tool name this plugin is advertised under:
    /// `dispatch_workflow_<canonical(id)>`.
    pub fn tool_name(&self) -> String {
        format!("dispatch_workflow_{}", canonicalize_plugin_id(&self.id))
    }
}

/// Lowercases and converts `-`/camelCase boundaries to `_`, per the tool
/// naming rule in `spec.md` §6.
pub fn canonicalize_plugin_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    let mut prev_lower = false;
    for c in id.chars() {
        if c == '-' || c == '_' || c.is_whitespace() {
            out.push('_');
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower {
            out.push('_');
        }
        out.extend(c.to_lowercase());
        prev_lower = c.is_lowercase() || c.is_numeric();
    }
    out
}

/// Structured error surfaced by a failed workflow execution (`Yield::Fail`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginError {
    /// Short machine-readable error code, e.g. `"PluginError"`, `"Timeout"`,
    /// `"canceled"`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Arbitrary structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl PluginError {
    /// Build a plugin error with no structured detail.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// A `canceled` plugin error, the well-behaved response to a
    /// cancellation signal (`spec.md` §4.4.1).
    pub fn canceled() -> Self {
        Self::new("canceled", "workflow execution was canceled")
    }
}

/// A snapshot of a running or completed workflow execution, suitable for
/// external inspection (`WorkflowRuntime::get_plugin`/diagnostics). The live
/// execution — its stepper task and channels — lives in `workflow_runtime`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionRecord {
    /// Equal to the owning task's id.
    pub execution_id: String,
    /// The plugin this execution was dispatched from.
    pub plugin_id: String,
    /// Context the execution belongs to.
    pub context_id: String,
    /// Current task state.
    pub state: TaskState,
    /// RFC 3339 timestamp the execution was dispatched.
    pub started_at: String,
    /// Set while the execution is paused awaiting input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_info: Option<PauseInfo>,
    /// Artifacts emitted so far.
    pub artifacts: Vec<Artifact>,
    /// Set once the execution has failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<PluginError>,
}

/// The payload carried by one `EventRecord`, tagged by `kind` and flattened
/// into the record at the wire level (matching `StreamResponse`'s flat,
/// `kind`-tagged framing elsewhere in this module).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EventPayload {
    /// A new task was created (first event on every task's stream).
    TaskCreated {
        /// The newly created task.
        task: Task,
    },
    /// The task's status changed.
    StatusUpdate {
        /// The new status.
        status: TaskStatus,
        /// Child task ids dispatched as a result of this update, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        reference_task_ids: Option<Vec<String>>,
        /// Arbitrary metadata (e.g. `progress`).
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        /// Set when this transition moves the task into `input-required`.
        #[serde(skip_serializing_if = "Option::is_none")]
        pause_info: Option<PauseInfo>,
    },
    /// An artifact was created or updated.
    ArtifactUpdate {
        /// The artifact.
        artifact: Artifact,
        /// Whether this update appends to the existing artifact.
        #[serde(skip_serializing_if = "Option::is_none")]
        append: Option<bool>,
        /// Whether this is the last chunk for the artifact.
        #[serde(skip_serializing_if = "Option::is_none")]
        last_chunk: Option<bool>,
    },
    /// A complete message, e.g. a workflow's `dispatch-response`.
    Message {
        /// The message.
        message: Message,
    },
    /// An incremental text fragment from a live model response.
    TextDelta {
        /// The text fragment.
        text: String,
    },
}

impl EventPayload {
    /// The `kind` discriminator name, e.g. `"status-update"`.
    pub fn kind_name(&self) -> &'static str {
        match self {
            EventPayload::TaskCreated { .. } => "task-created",
            EventPayload::StatusUpdate { .. } => "status-update",
            EventPayload::ArtifactUpdate { .. } => "artifact-update",
            EventPayload::Message { .. } => "message",
            EventPayload::TextDelta { .. } => "text-delta",
        }
    }
}

/// One record on a task's event bus: `{ taskId, seq, kind, payload, final }`.
///
/// `seq` is assigned by `EventBus::publish` and is monotonically increasing
/// per `taskId`; no ordering is implied across distinct tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// The task this event belongs to.
    pub task_id: String,
    /// Monotonically increasing per-task sequence number.
    pub seq: u64,
    /// The event's content, tagged by kind.
    #[serde(flatten)]
    pub payload: EventPayload,
    /// Whether this is the last event the task will ever emit.
    #[serde(rename = "final")]
    pub r#final: bool,
}

// ============================================================================
// Tests
// ============================================================================
