//! In-process task store. Everything lives behind one mutex, which makes
//! the counter increment and the idempotent insert trivially atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use taskmind_core::error::StoreError;
use taskmind_core::message::UserId;
use taskmind_core::task::{Task, TaskStatus, TaskStore, UpsertOutcome};
use tokio::sync::Mutex;

#[derive(Default)]
struct State {
    counter: u64,
    /// Keyed by `source_message_id`
    tasks: HashMap<String, Task>,
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<State>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the counter at `last_issued`; the next ticket is `last_issued + 1`.
    pub fn with_counter(last_issued: u64) -> Self {
        Self {
            state: Mutex::new(State {
                counter: last_issued,
                tasks: HashMap::new(),
            }),
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn upsert_task(&self, task: Task) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.tasks.get(&task.source_message_id) {
            return Ok(UpsertOutcome {
                task: existing.clone(),
                inserted: false,
            });
        }
        if state.tasks.values().any(|t| t.ticket_id == task.ticket_id) {
            return Err(StoreError::Conflict(format!(
                "ticket {} already issued",
                task.ticket_id
            )));
        }
        state.tasks.insert(task.source_message_id.clone(), task.clone());
        Ok(UpsertOutcome {
            task,
            inserted: true,
        })
    }

    async fn get_next_sequence(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.counter += 1;
        Ok(state.counter)
    }

    async fn current_sequence(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.counter)
    }

    async fn find_by_source(&self, source_message_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.state.lock().await.tasks.get(source_message_id).cloned())
    }

    async fn get_by_ticket(&self, ticket_id: &str) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.values().find(|t| t.ticket_id == ticket_id).cloned())
    }

    async fn list_tasks(
        &self,
        owner: &UserId,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.owner == *owner && status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(Task::listing_order);
        Ok(tasks)
    }

    async fn update_status(&self, ticket_id: &str, status: TaskStatus) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .values_mut()
            .find(|t| t.ticket_id == ticket_id)
            .ok_or_else(|| StoreError::NotFound(format!("ticket {ticket_id}")))?;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn delete_owner(&self, owner: &UserId) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.tasks.len();
        state.tasks.retain(|_, t| t.owner != *owner);
        Ok(before - state.tasks.len())
    }
}
