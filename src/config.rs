//! Environment-variable configuration for the agent node binary.
//!
//! Plain constructor, no config-file parsing (`spec.md` §6 — markdown/YAML
//! manifests, file watching, and card merge policies are explicitly out of
//! scope). Provider credentials are not parsed here: they are opaque to the
//! core and passed through untouched to whatever `ModelProvider` the embedder
//! supplies.

use std::env;
use std::time::Duration;

/// Default bind port (`AGENT_SERVER_PORT`).
pub const DEFAULT_SERVER_PORT: u16 = 8080;
/// Default bind host (`AGENT_SERVER_HOST`).
pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";
/// Default JSON-RPC path (`AGENT_A2A_PATH`).
pub const DEFAULT_A2A_PATH: &str = "/a2a";
/// Default `StreamProcessor` tool-call round ceiling (`AGENT_MAX_STEPS`).
pub const DEFAULT_MAX_STEPS: usize = 20;
/// Default context idle TTL in milliseconds, 30 minutes
/// (`AGENT_CONTEXT_IDLE_TTL_MS`).
pub const DEFAULT_CONTEXT_IDLE_TTL_MS: u64 = 1_800_000;
/// Default workflow cancellation grace period in milliseconds
/// (`AGENT_WORKFLOW_CANCEL_GRACE_MS`).
pub const DEFAULT_WORKFLOW_CANCEL_GRACE_MS: u64 = 5_000;

/// Typed, validated view of the process environment.
///
/// Every field has a spec-mandated default; `Config::from_env` never fails —
/// an unparsable value falls back to the default with a `tracing::warn!`,
/// since a malformed env var should not prevent the node from starting.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port the A2A server listens on.
    pub server_port: u16,
    /// Interface the A2A server binds to.
    pub server_host: String,
    /// Path the JSON-RPC endpoint is mounted at.
    pub a2a_path: String,
    /// Maximum tool-call rounds a single `StreamProcessor` turn may take.
    pub max_steps: usize,
    /// How long a context may sit idle (all tasks terminal) before
    /// `ContextManager::sweep_idle` reclaims it.
    pub context_idle_ttl: Duration,
    /// Grace period `WorkflowRuntime` waits after a cancellation signal
    /// before force-terminating an execution.
    pub workflow_cancel_grace: Duration,
}

impl Config {
    /// Read configuration from the process environment, falling back to
    /// spec-mandated defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self {
            server_port: parse_env("AGENT_SERVER_PORT", DEFAULT_SERVER_PORT),
            server_host: env::var("AGENT_SERVER_HOST")
                .unwrap_or_else(|_| DEFAULT_SERVER_HOST.to_string()),
            a2a_path: env::var("AGENT_A2A_PATH").unwrap_or_else(|_| DEFAULT_A2A_PATH.to_string()),
            max_steps: parse_env("AGENT_MAX_STEPS", DEFAULT_MAX_STEPS),
            context_idle_ttl: Duration::from_millis(parse_env(
                "AGENT_CONTEXT_IDLE_TTL_MS",
                DEFAULT_CONTEXT_IDLE_TTL_MS,
            )),
            workflow_cancel_grace: Duration::from_millis(parse_env(
                "AGENT_WORKFLOW_CANCEL_GRACE_MS",
                DEFAULT_WORKFLOW_CANCEL_GRACE_MS,
            )),
        }
    }

    /// The address the server should bind to, e.g. `0.0.0.0:8080`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_SERVER_PORT,
            server_host: DEFAULT_SERVER_HOST.to_string(),
            a2a_path: DEFAULT_A2A_PATH.to_string(),
            max_steps: DEFAULT_MAX_STEPS,
            context_idle_ttl: Duration::from_millis(DEFAULT_CONTEXT_IDLE_TTL_MS),
            workflow_cancel_grace: Duration::from_millis(DEFAULT_WORKFLOW_CANCEL_GRACE_MS),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, raw, "failed to parse environment variable, using default");
            default
        }),
        Err(_) => default,
    }
}
