//! A2A error types â€” JSON-RPC error codes + A2A-specific errors.
//!
//! Mirrors the Python SDK's error handling:
//! - Standard JSON-RPC 2.0 errors (-32700 through -32603)
//! - A2A-specific errors (-32001 through -32007)

use crate::types::JsonRpcError;

// ---------------------------------------------------------------------------
// Standard JSON-RPC 2.0 error codes
// ---------------------------------------------------------------------------

/// Invalid JSON was received by the server.
pub const PARSE_ERROR: i64 = -32700;

/// The JSON sent is not a valid Request object.
pub const INVALID_REQUEST: i64 = -32600;

/// The method does not exist / is not available.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Invalid method parameter(s).
pub const INVALID_PARAMS: i64 = -32602;

/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;

// ---------------------------------------------------------------------------
// A2A-specific error codes
// ---------------------------------------------------------------------------

/// The requested task was not found.
pub const TASK_NOT_FOUND: i64 = -32001;

/// The task cannot be canceled in its current state.
pub const TASK_NOT_CANCELABLE: i64 = -32002;

/// Push notifications are not supported by this agent.
pub const PUSH_NOTIFICATION_NOT_SUPPORTED: i64 = -32003;

/// The requested operation is not supported.
pub const UNSUPPORTED_OPERATION: i64 = -32004;

/// The content type is not supported.
pub const CONTENT_TYPE_NOT_SUPPORTED: i64 = -32005;

/// The agent returned an invalid response.
pub const INVALID_AGENT_RESPONSE: i64 = -32006;

/// Authenticated extended card is not configured.
pub const AUTHENTICATED_EXTENDED_CARD_NOT_CONFIGURED: i64 = -32007;

// ---------------------------------------------------------------------------
// Task/workflow runtime error codes
// ---------------------------------------------------------------------------

/// The task has already reached a terminal state and cannot accept a new event.
pub const TASK_TERMINAL: i64 = -32010;

/// The requested operation is not valid for the task's current state.
pub const INVALID_STATE: i64 = -32011;

/// No workflow plugin is registered under the requested id.
pub const PLUGIN_NOT_FOUND: i64 = -32012;

/// The supplied input failed schema validation.
pub const INVALID_INPUT: i64 = -32013;

/// The operation did not complete within its configured deadline.
pub const TIMEOUT: i64 = -32014;

/// A single AI turn exceeded its configured step limit.
pub const STEP_LIMIT_EXCEEDED: i64 = -32015;

// ---------------------------------------------------------------------------
// A2AError enum
// ---------------------------------------------------------------------------

/// Unified error type for all A2A and JSON-RPC errors.
///
/// Each variant carries an optional human-readable message and optional
/// structured data payload (matching the Python SDK pattern).
///
/// Also includes transport/client-side error variants that are not part of
/// the A2A spec but are needed for a complete Rust SDK.
#[derive(Debug, Clone, thiserror::Error)]
pub enum A2AError {
    // -- A2A protocol errors (map to JSON-RPC error codes) --
    //
    // Each variant carries a human-readable message and an optional structured
    // `data` payload, matching the Python SDK pattern where every error type
    // has `message: str | None` and `data: Any | None = None`.
    /// Invalid JSON payload (code -32700).
    #[error("Parse error: {message}")]
    ParseError {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data (e.g. parse error details).
        data: Option<serde_json::Value>,
    },

    /// Request payload validation error (code -32600).
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data (e.g. validation errors).
        data: Option<serde_json::Value>,
    },

    /// Method not found (code -32601).
    #[error("Method not found: {message}")]
    MethodNotFound {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Invalid parameters (code -32602).
    #[error("Invalid params: {message}")]
    InvalidParams {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data (e.g. validation errors).
        data: Option<serde_json::Value>,
    },

    /// Internal error (code -32603).
    #[error("Internal error: {message}")]
    InternalError {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Task not found (code -32001).
    #[error("Task not found: {message}")]
    TaskNotFound {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Task cannot be canceled (code -32002).
    #[error("Task not cancelable: {message}")]
    TaskNotCancelable {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Push notifications not supported (code -32003).
    #[error("Push notification not supported: {message}")]
    PushNotificationNotSupported {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Operation not supported (code -32004).
    #[error("Unsupported operation: {message}")]
    UnsupportedOperation {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Content type not supported (code -32005).
    #[error("Content type not supported: {message}")]
    ContentTypeNotSupported {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Invalid agent response (code -32006).
    #[error("Invalid agent response: {message}")]
    InvalidAgentResponse {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Authenticated extended card not configured (code -32007).
    #[error("Authenticated extended card not configured: {message}")]
    AuthenticatedExtendedCardNotConfigured {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// The task has already reached a terminal state (code -32010).
    #[error("Task already terminal: {message}")]
    TaskTerminal {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Operation not valid for the task's current state (code -32011).
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// No workflow plugin is registered under the requested id (code -32012).
    #[error("Plugin not found: {message}")]
    PluginNotFound {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Input failed schema validation (code -32013).
    #[error("Invalid input: {message}")]
    InvalidInput {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Operation exceeded its deadline (code -32014).
    ///
    /// Distinct from the client-side [`A2AError::Timeout`] transport variant:
    /// this is a protocol-level error returned to the caller, not a local
    /// client-side failure to get a response at all.
    #[error("Operation timed out: {message}")]
    OperationTimeout {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// An AI turn exceeded its configured step limit (code -32015).
    #[error("Step limit exceeded: {message}")]
    StepLimitExceeded {
        /// Human-readable error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    // -- Client/transport-side errors (not A2A error codes) --
    /// Transport-level error (connection failed, request failed, etc.).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request or stream timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// HTTP error with status code and response body.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// Invalid JSON received from remote (parse or deserialization failure).
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// A JSON-RPC error response was received from the remote agent.
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message.
        message: String,
        /// Optional structured error data.
        data: Option<serde_json::Value>,
    },

    /// Catch-all for errors that don't fit other categories.
    #[error("{0}")]
    Other(String),
}

/// Convenience result type for A2A operations.
pub type A2AResult<T> = Result<T, A2AError>;

impl A2AError {
    // -- Convenience constructors (message-only, no data) --

    /// Create a `ParseError` with a message and no data.
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::ParseError {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `InvalidRequest` with a message and no data.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `MethodNotFound` with a message and no data.
    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::MethodNotFound {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `InvalidParams` with a message and no data.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `InternalError` with a message and no data.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `TaskNotFound` with a message and no data.
    pub fn task_not_found(message: impl Into<String>) -> Self {
        Self::TaskNotFound {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `TaskNotCancelable` with a message and no data.
    pub fn task_not_cancelable(message: impl Into<String>) -> Self {
        Self::TaskNotCancelable {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `PushNotificationNotSupported` with a message and no data.
    pub fn push_notification_not_supported(message: impl Into<String>) -> Self {
        Self::PushNotificationNotSupported {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `UnsupportedOperation` with a message and no data.
    pub fn unsupported_operation(message: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `ContentTypeNotSupported` with a message and no data.
    pub fn content_type_not_supported(message: impl Into<String>) -> Self {
        Self::ContentTypeNotSupported {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `InvalidAgentResponse` with a message and no data.
    pub fn invalid_agent_response(message: impl Into<String>) -> Self {
        Self::InvalidAgentResponse {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `AuthenticatedExtendedCardNotConfigured` with a message and no data.
    pub fn authenticated_extended_card_not_configured(message: impl Into<String>) -> Self {
        Self::AuthenticatedExtendedCardNotConfigured {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `TaskTerminal` with a message and no data.
    pub fn task_terminal(message: impl Into<String>) -> Self {
        Self::TaskTerminal {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `InvalidState` with a message and no data.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `PluginNotFound` with a message and no data.
    pub fn plugin_not_found(message: impl Into<String>) -> Self {
        Self::PluginNotFound {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `InvalidInput` with a message and no data.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            data: None,
        }
    }

    /// Create an `OperationTimeout` with a message and no data.
    pub fn operation_timeout(message: impl Into<String>) -> Self {
        Self::OperationTimeout {
            message: message.into(),
            data: None,
        }
    }

    /// Create a `StepLimitExceeded` with a message and no data.
    pub fn step_limit_exceeded(message: impl Into<String>) -> Self {
        Self::StepLimitExceeded {
            message: message.into(),
            data: None,
        }
    }

    /// Returns the JSON-RPC error code for this error variant.
    ///
    /// For transport/client-side errors that don't map to A2A codes,
    /// returns -32603 (internal error).
    pub fn code(&self) -> i64 {
        match self {
            A2AError::ParseError { .. } => PARSE_ERROR,
            A2AError::InvalidRequest { .. } => INVALID_REQUEST,
            A2AError::MethodNotFound { .. } => METHOD_NOT_FOUND,
            A2AError::InvalidParams { .. } => INVALID_PARAMS,
            A2AError::InternalError { .. } => INTERNAL_ERROR,
            A2AError::TaskNotFound { .. } => TASK_NOT_FOUND,
            A2AError::TaskNotCancelable { .. } => TASK_NOT_CANCELABLE,
            A2AError::PushNotificationNotSupported { .. } => PUSH_NOTIFICATION_NOT_SUPPORTED,
            A2AError::UnsupportedOperation { .. } => UNSUPPORTED_OPERATION,
            A2AError::ContentTypeNotSupported { .. } => CONTENT_TYPE_NOT_SUPPORTED,
            A2AError::InvalidAgentResponse { .. } => INVALID_AGENT_RESPONSE,
            A2AError::AuthenticatedExtendedCardNotConfigured { .. } => {
                AUTHENTICATED_EXTENDED_CARD_NOT_CONFIGURED
            }
            A2AError::TaskTerminal { .. } => TASK_TERMINAL,
            A2AError::InvalidState { .. } => INVALID_STATE,
            A2AError::PluginNotFound { .. } => PLUGIN_NOT_FOUND,
            A2AError::InvalidInput { .. } => INVALID_INPUT,
            A2AError::OperationTimeout { .. } => TIMEOUT,
            A2AError::StepLimitExceeded { .. } => STEP_LIMIT_EXCEEDED,
            // Client/transport errors map to internal error.
            A2AError::Transport(_)
            | A2AError::Timeout(_)
            | A2AError::Http { .. }
            | A2AError::InvalidJson(_)
            | A2AError::Other(_) => INTERNAL_ERROR,
            A2AError::JsonRpc { code, .. } => *code,
        }
    }

    /// Returns the default human-readable message for this error variant
    /// (matching the Python SDK defaults).
    pub fn default_message(&self) -> &str {
        match self {
            A2AError::ParseError { .. } => "Invalid JSON payload",
            A2AError::InvalidRequest { .. } => "Request payload validation error",
            A2AError::MethodNotFound { .. } => "Method not found",
            A2AError::InvalidParams { .. } => "Invalid parameters",
            A2AError::InternalError { .. } => "Internal error",
            A2AError::TaskNotFound { .. } => "Task not found",
            A2AError::TaskNotCancelable { .. } => "Task cannot be canceled",
            A2AError::PushNotificationNotSupported { .. } => "Push Notification is not supported",
            A2AError::UnsupportedOperation { .. } => "This operation is not supported",
            A2AError::ContentTypeNotSupported { .. } => "Incompatible content types",
            A2AError::InvalidAgentResponse { .. } => "Invalid agent response",
            A2AError::AuthenticatedExtendedCardNotConfigured { .. } => {
                "Authenticated Extended Card is not configured"
            }
            A2AError::TaskTerminal { .. } => "Task has already reached a terminal state",
            A2AError::InvalidState { .. } => "Operation not valid for the task's current state",
            A2AError::PluginNotFound { .. } => "No workflow plugin registered under this id",
            A2AError::InvalidInput { .. } => "Input failed schema validation",
            A2AError::OperationTimeout { .. } => "Operation timed out",
            A2AError::StepLimitExceeded { .. } => "AI turn exceeded its step limit",
            A2AError::Transport(_) => "Transport error",
            A2AError::Timeout(_) => "Request timed out",
            A2AError::Http { .. } => "HTTP error",
            A2AError::InvalidJson(_) => "Invalid JSON",
            A2AError::JsonRpc { .. } => "JSON-RPC error",
            A2AError::Other(_) => "Error",
        }
    }
}

impl From<A2AError> for JsonRpcError {
    fn from(err: A2AError) -> Self {
        let code = err.code();
        let message = err.to_string();
        // Preserve structured data from protocol error variants and JsonRpc variant.
        let data = match &err {
            A2AError::ParseError { data, .. }
            | A2AError::InvalidRequest { data, .. }
            | A2AError::MethodNotFound { data, .. }
            | A2AError::InvalidParams { data, .. }
            | A2AError::InternalError { data, .. }
            | A2AError::TaskNotFound { data, .. }
            | A2AError::TaskNotCancelable { data, .. }
            | A2AError::PushNotificationNotSupported { data, .. }
            | A2AError::UnsupportedOperation { data, .. }
            | A2AError::ContentTypeNotSupported { data, .. }
            | A2AError::InvalidAgentResponse { data, .. }
            | A2AError::AuthenticatedExtendedCardNotConfigured { data, .. }
            | A2AError::TaskTerminal { data, .. }
            | A2AError::InvalidState { data, .. }
            | A2AError::PluginNotFound { data, .. }
            | A2AError::InvalidInput { data, .. }
            | A2AError::OperationTimeout { data, .. }
            | A2AError::StepLimitExceeded { data, .. }
            | A2AError::JsonRpc { data, .. } => data.clone(),
            _ => None,
        };
        JsonRpcError {
            code,
            message,
            data,
        }
    }
}

impl From<serde_json::Error> for A2AError {
    fn from(err: serde_json::Error) -> Self {
        A2AError::ParseError {
            message: err.to_string(),
            data: None,
        }
    }
}
