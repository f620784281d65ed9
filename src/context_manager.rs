//! Context manager — conversation scopes: id, activity clock, message
//! history, and the set of task ids a context owns.
//!
//! Grounded in [`crate::task_store::TaskStore`]'s `Arc<RwLock<HashMap>>` +
//! insertion-order idiom, generalized with a `lastActivityAt` clock and a
//! periodic idle sweep (`spec.md` §4.3) instead of a pure event-sourced
//! projection — contexts are not on the event bus, so mutation happens
//! directly through this module's own methods rather than via `applyEvent`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{A2AError, A2AResult};
use crate::types::Message;

/// One conversation scope.
#[derive(Debug, Clone)]
pub struct Context {
    /// Opaque, globally unique context id.
    pub id: String,
    /// When this context was created.
    pub created_at: DateTime<Utc>,
    /// When this context last observed activity (message append, task
    /// recorded, or an explicit `touch`).
    pub last_activity_at: DateTime<Utc>,
    /// Task ids recorded against this context, in the order they were
    /// recorded.
    pub tasks: Vec<String>,
    /// Conversation history, append-only.
    pub history: Vec<Message>,
    /// Arbitrary metadata.
    pub metadata: Option<serde_json::Value>,
}

/// In-memory registry of every context this node knows about, plus the
/// mechanics for reclaiming ones that have gone idle.
///
/// Cheaply `Clone`: every field is an `Arc`, sharing the same underlying map
/// across clones (the same sharing model [`crate::task_store::TaskStore`] and
/// [`crate::event_bus::EventBus`] use).
#[derive(Debug, Clone)]
pub struct ContextManager {
    contexts: Arc<RwLock<HashMap<String, Context>>>,
    task_store: crate::task_store::TaskStore,
}

impl ContextManager {
    /// Create a new, empty context manager bound to the shared `TaskStore`
    /// it consults during `sweep_idle` to decide whether a context's tasks
    /// are all terminal.
    pub fn new(task_store: crate::task_store::TaskStore) -> Self {
        Self {
            contexts: Arc::new(RwLock::new(HashMap::new())),
            task_store,
        }
    }

    /// Allocate a new, empty context with a freshly minted id.
    pub async fn create(&self) -> Context {
        let now = Utc::now();
        let context = Context {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            last_activity_at: now,
            tasks: Vec::new(),
            history: Vec::new(),
            metadata: None,
        };
        let mut contexts = self.contexts.write().await;
        contexts.insert(context.id.clone(), context.clone());
        debug!(context_id = %context.id, "context created");
        context
    }

    /// Reattach to an existing context by id.
    ///
    /// Strict: an unknown id is `InvalidRequest` (`spec.md` §4.3, Testable
    /// Property #5) — this method never silently creates a context.
    pub async fn reattach(&self, context_id: &str) -> A2AResult<Context> {
        let contexts = self.contexts.read().await;
        contexts
            .get(context_id)
            .cloned()
            .ok_or_else(|| {
                A2AError::invalid_request(format!(
                    "unknown context '{context_id}' — omit contextId to start a new one"
                ))
            })
    }

    /// Append a message to a context's history and refresh its activity
    /// clock. History is append-only — it is never rewritten.
    pub async fn append_message(&self, context_id: &str, message: Message) -> A2AResult<()> {
        let mut contexts = self.contexts.write().await;
        let context = contexts
            .get_mut(context_id)
            .ok_or_else(|| A2AError::invalid_request(format!("unknown context '{context_id}'")))?;
        context.history.push(message);
        context.last_activity_at = Utc::now();
        Ok(())
    }

    /// Record a task id as owned by a context and refresh its activity
    /// clock.
    pub async fn record_task(&self, context_id: &str, task_id: &str) -> A2AResult<()> {
        let mut contexts = self.contexts.write().await;
        let context = contexts
            .get_mut(context_id)
            .ok_or_else(|| A2AError::invalid_request(format!("unknown context '{context_id}'")))?;
        context.tasks.push(task_id.to_string());
        context.last_activity_at = Utc::now();
        Ok(())
    }

    /// The full message history of a context, in append order.
    pub async fn history(&self, context_id: &str) -> A2AResult<Vec<Message>> {
        let contexts = self.contexts.read().await;
        contexts
            .get(context_id)
            .map(|c| c.history.clone())
            .ok_or_else(|| A2AError::invalid_request(format!("unknown context '{context_id}'")))
    }

    /// Refresh a context's activity clock without otherwise mutating it.
    pub async fn touch(&self, context_id: &str) -> A2AResult<()> {
        let mut contexts = self.contexts.write().await;
        let context = contexts
            .get_mut(context_id)
            .ok_or_else(|| A2AError::invalid_request(format!("unknown context '{context_id}'")))?;
        context.last_activity_at = Utc::now();
        Ok(())
    }

    /// Fetch a point-in-time copy of a context, without side effects.
    pub async fn get(&self, context_id: &str) -> Option<Context> {
        let contexts = self.contexts.read().await;
        contexts.get(context_id).cloned()
    }

    /// Delete every context whose `lastActivityAt` is older than `idle_ttl`
    /// (measured against `now`) and whose recorded tasks are all terminal.
    ///
    /// Idempotent: calling this repeatedly with no new activity keeps
    /// deleting nothing further once a sweep has already reclaimed the
    /// eligible contexts. Returns the ids reclaimed, for logging by the
    /// caller.
    pub async fn sweep_idle(&self, now: DateTime<Utc>, idle_ttl: chrono::Duration) -> Vec<String> {
        let candidates: Vec<Context> = {
            let contexts = self.contexts.read().await;
            contexts
                .values()
                .filter(|c| now - c.last_activity_at >= idle_ttl)
                .cloned()
                .collect()
        };

        let mut reclaimed = Vec::new();
        for context in candidates {
            let mut all_terminal = true;
            for task_id in &context.tasks {
                match self.task_store.get(task_id).await {
                    Some(task) if task.is_terminal() => {}
                    _ => {
                        all_terminal = false;
                        break;
                    }
                }
            }
            if !all_terminal {
                continue;
            }
            let mut contexts = self.contexts.write().await;
            if contexts.remove(&context.id).is_some() {
                info!(context_id = %context.id, "context reclaimed after idle TTL");
                reclaimed.push(context.id);
            }
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_store::TaskStore;
    use crate::types::TaskKind;

    #[tokio::test]
    async fn create_allocates_empty_context() {
        let manager = ContextManager::new(TaskStore::new());
        let context = manager.create().await;
        assert!(context.tasks.is_empty());
        assert!(context.history.is_empty());
    }

    #[tokio::test]
    async fn reattach_unknown_id_is_invalid_request() {
        let manager = ContextManager::new(TaskStore::new());
        let err = manager.reattach("does-not-exist").await.unwrap_err();
        assert_eq!(err.code(), crate::error::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn append_message_and_history_round_trip() {
        let manager = ContextManager::new(TaskStore::new());
        let context = manager.create().await;
        let message = crate::utils::new_agent_text_message("hi", Some(context.id.clone()), None::<String>);
        manager.append_message(&context.id, message).await.unwrap();
        let history = manager.history(&context.id).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn sweep_idle_only_reclaims_contexts_with_terminal_tasks() {
        let task_store = TaskStore::new();
        let manager = ContextManager::new(task_store.clone());

        let stale_done = manager.create().await;
        let done_task = task_store.create(TaskKind::AiTurn, &stale_done.id, None).await;
        task_store.force_cancel(&done_task.id).await.unwrap();
        manager.record_task(&stale_done.id, &done_task.id).await.unwrap();

        let stale_running = manager.create().await;
        let running_task = task_store.create(TaskKind::AiTurn, &stale_running.id, None).await;
        manager.record_task(&stale_running.id, &running_task.id).await.unwrap();

        // Force both contexts far enough into the past to be eligible.
        {
            let mut contexts = manager.contexts.write().await;
            let past = Utc::now() - chrono::Duration::hours(1);
            contexts.get_mut(&stale_done.id).unwrap().last_activity_at = past;
            contexts.get_mut(&stale_running.id).unwrap().last_activity_at = past;
        }

        let reclaimed = manager.sweep_idle(Utc::now(), chrono::Duration::minutes(30)).await;
        assert_eq!(reclaimed, vec![stale_done.id.clone()]);
        assert!(manager.get(&stale_done.id).await.is_none());
        assert!(manager.get(&stale_running.id).await.is_some());
    }
}
