//! In-memory `Store` backend.
//!
//! Serves the binary in standalone mode and every test. Status changes go
//! through a compare-and-set under the write lock, which is what gives the
//! coordinator its single-row atomicity.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::traits::{Store, TaskFilter};
use crate::tasks::model::{Execution, Task, TaskStatus};

/// In-memory store backed by `RwLock`ed maps.
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
    executions: RwLock<HashMap<Uuid, Execution>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches(task: &Task, filter: &TaskFilter) -> bool {
    if let Some(ref owner) = filter.owner_id {
        if &task.owner_id != owner {
            return false;
        }
    }
    if let Some(ref org) = filter.org_id {
        if &task.org_id != org {
            return false;
        }
    }
    if let Some(status) = filter.status {
        if task.status != status {
            return false;
        }
    }
    if let Some(due_before) = filter.due_before {
        match task.next_run_at {
            Some(next) if next <= due_before => {}
            _ => return false,
        }
    }
    true
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Conflict {
                reason: format!("task {} already exists", task.id),
            });
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut found: Vec<Task> = tasks.values().filter(|t| matches(t, filter)).cloned().collect();
        found.sort_by_key(|t| t.created_at);
        Ok(found)
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "task",
                id: task.id.to_string(),
            }),
        }
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.tasks.write().await.remove(&id).is_some())
    }

    async fn set_task_status(
        &self,
        id: Uuid,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "task",
            id: id.to_string(),
        })?;
        if task.status != expected {
            return Ok(false);
        }
        task.status = next;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn insert_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            return Err(StoreError::Conflict {
                reason: format!("execution {} already exists", execution.id),
            });
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        match executions.get_mut(&execution.id) {
            Some(slot) => {
                *slot = execution.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "execution",
                id: execution.id.to_string(),
            }),
        }
    }

    async fn list_executions(&self, task_id: Uuid) -> Result<Vec<Execution>, StoreError> {
        let executions = self.executions.read().await;
        let mut found: Vec<Execution> = executions
            .values()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }
}
