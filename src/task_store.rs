//! Task store — the authoritative record of every task's current state.
//!
//! Generalizes [`crate::server::task_store`]'s `Arc<RwLock<HashMap>>` +
//! insertion-order idiom to a concrete type (rather than a trait object)
//! bound to an [`EventBus`]: every mutation here is driven by an
//! [`EventRecord`] the caller already published, so the store's job is
//! narrowly "fold this event into the task it names" plus listing/lookup.
//! Keeping `apply_event` as the only mutation path means the event bus and
//! the task store can never disagree about a task's history.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{A2AError, A2AResult};
use crate::types::{EventPayload, EventRecord, Task, TaskKind, TaskState, TaskStatus};

/// Filtering and pagination parameters for [`TaskStore::list`].
#[derive(Debug, Clone, Default)]
pub struct TaskListParams {
    /// Restrict to tasks in this context.
    pub context_id: Option<String>,
    /// Restrict to tasks in one of these states.
    pub status: Option<Vec<TaskState>>,
    /// Maximum number of tasks to return.
    pub page_size: Option<usize>,
    /// Opaque token (the last task id of the previous page) to resume from.
    pub page_token: Option<String>,
}

/// Page of tasks returned by [`TaskStore::list`].
#[derive(Debug, Clone)]
pub struct TaskListResponse {
    /// The tasks matching the query, in creation order.
    pub tasks: Vec<Task>,
    /// Token for the next page, if more results are available.
    pub next_page_token: Option<String>,
}

/// In-memory store of every task this node knows about.
///
/// Cheaply `Clone`: every field is an `Arc`, so cloning a `TaskStore` shares
/// the same underlying map with every other clone (the same sharing model
/// [`crate::event_bus::EventBus`] uses).
#[derive(Debug, Clone)]
pub struct TaskStore {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
    insertion_order: Arc<RwLock<Vec<String>>>,
}

impl TaskStore {
    /// Create a new, empty task store.
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            insertion_order: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Allocate a new task in `submitted` state and persist it.
    ///
    /// The caller is responsible for publishing the corresponding
    /// `task-created` event to the [`crate::event_bus::EventBus`] and
    /// folding it back in via [`TaskStore::apply_event`] — `create` itself
    /// does not touch the event bus, keeping this module's only dependency
    /// on ordering (not on the bus) explicit.
    pub async fn create(
        &self,
        task_kind: TaskKind,
        context_id: &str,
        parent_task_id: Option<String>,
    ) -> Task {
        let now = Utc::now().to_rfc3339();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            context_id: context_id.to_string(),
            kind: "task".to_string(),
            task_kind,
            parent_task_id,
            status: TaskStatus {
                state: TaskState::Submitted,
                message: None,
                timestamp: Some(now.clone()),
            },
            pause_info: None,
            created_at: now.clone(),
            updated_at: now,
            artifacts: None,
            history: None,
            metadata: None,
        };

        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id.clone(), task.clone());
        let mut order = self.insertion_order.write().await;
        order.push(task.id.clone());
        debug!(task_id = %task.id, ?task.task_kind, "task created");
        task
    }

    /// Fold an event bus record into the task it names, mutating the task's
    /// status, pause info, artifacts, or history as appropriate.
    ///
    /// Returns `A2AError::TaskNotFound` if `record.task_id` has no task —
    /// every event published against this store should have gone through
    /// `create` first.
    pub async fn apply_event(&self, record: &EventRecord) -> A2AResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&record.task_id)
            .ok_or_else(|| A2AError::task_not_found(record.task_id.clone()))?;

        match &record.payload {
            EventPayload::TaskCreated { .. } => {
                // The task already exists by the time this event is applied
                // (TaskStore::create runs first); nothing further to do.
            }
            EventPayload::StatusUpdate {
                status,
                pause_info,
                ..
            } => {
                task.status = status.clone();
                task.pause_info = pause_info.clone();
                task.updated_at = status
                    .timestamp
                    .clone()
                    .unwrap_or_else(|| Utc::now().to_rfc3339());
                if let Some(message) = &status.message {
                    task.history.get_or_insert_with(Vec::new).push(message.clone());
                }
            }
            EventPayload::ArtifactUpdate {
                artifact, append, ..
            } => {
                let artifacts = task.artifacts.get_or_insert_with(Vec::new);
                let append = append.unwrap_or(false);
                if append {
                    if let Some(existing) = artifacts
                        .iter_mut()
                        .find(|a| a.artifact_id == artifact.artifact_id)
                    {
                        existing.parts.extend(artifact.parts.clone());
                    } else {
                        artifacts.push(artifact.clone());
                    }
                } else if let Some(existing) = artifacts
                    .iter_mut()
                    .find(|a| a.artifact_id == artifact.artifact_id)
                {
                    *existing = artifact.clone();
                } else {
                    artifacts.push(artifact.clone());
                }
                task.updated_at = Utc::now().to_rfc3339();
            }
            EventPayload::Message { message } => {
                task.history.get_or_insert_with(Vec::new).push(message.clone());
                task.updated_at = Utc::now().to_rfc3339();
            }
            EventPayload::TextDelta { .. } => {
                // Deltas are streamed straight to subscribers and never
                // folded into the persisted task record.
            }
        }

        Ok(())
    }

    /// Fetch a task by id.
    pub async fn get(&self, task_id: &str) -> Option<Task> {
        let tasks = self.tasks.read().await;
        tasks.get(task_id).cloned()
    }

    /// Mark a task canceled directly, bypassing the event bus.
    ///
    /// A low-level escape hatch for callers that need a task's record
    /// marked terminal without a live event bus to publish through (test
    /// setup, offline bookkeeping). Product code driving a real
    /// cancellation — including `WorkflowRuntime::cancel`'s own terminal
    /// publish — should route through `EventBus::publish` +  `apply_event`
    /// instead, so subscribers actually observe the terminal event over
    /// SSE rather than just seeing the task record flip underneath them.
    pub async fn force_cancel(&self, task_id: &str) -> A2AResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| A2AError::task_not_found(task_id.to_string()))?;
        if task.is_terminal() {
            return Ok(());
        }
        task.status = TaskStatus {
            state: TaskState::Canceled,
            message: None,
            timestamp: Some(Utc::now().to_rfc3339()),
        };
        task.pause_info = None;
        task.updated_at = Utc::now().to_rfc3339();
        warn!(task_id, "task force-canceled after grace period expired");
        Ok(())
    }

    /// List tasks, optionally filtered and paginated.
    pub async fn list(&self, params: &TaskListParams) -> TaskListResponse {
        let tasks = self.tasks.read().await;
        let order = self.insertion_order.read().await;

        let start_idx = match &params.page_token {
            Some(token) => match order.iter().position(|id| id == token) {
                Some(pos) => pos + 1,
                None => {
                    warn!(page_token = %token, "invalid page token, starting from beginning");
                    0
                }
            },
            None => 0,
        };

        let page_size = params.page_size.unwrap_or(usize::MAX);
        let mut result = Vec::new();
        let mut last_id = None;

        for id in order.iter().skip(start_idx) {
            if result.len() >= page_size {
                break;
            }
            let Some(task) = tasks.get(id) else { continue };
            if let Some(ctx) = &params.context_id {
                if &task.context_id != ctx {
                    continue;
                }
            }
            if let Some(states) = &params.status {
                if !states.contains(&task.status.state) {
                    continue;
                }
            }
            last_id = Some(id.clone());
            result.push(task.clone());
        }

        let next_page_token = if result.len() == page_size {
            last_id.filter(|last| {
                order.iter().position(|id| id == last).map(|p| p + 1 < order.len()).unwrap_or(false)
            })
        } else {
            None
        };

        TaskListResponse {
            tasks: result,
            next_page_token,
        }
    }

    /// Remove a task's record entirely (used by `ContextManager`'s idle
    /// sweep, `spec.md` §4.3).
    pub async fn remove(&self, task_id: &str) {
        let mut tasks = self.tasks.write().await;
        if tasks.remove(task_id).is_some() {
            let mut order = self.insertion_order.write().await;
            order.retain(|id| id != task_id);
        }
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}
