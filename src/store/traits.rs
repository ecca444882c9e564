//! Backend-agnostic `Store` trait — single async interface for task and
//! execution persistence.
//!
//! The store is an external collaborator: per-entity operations are atomic,
//! cross-entity transactions are not assumed. Callers snapshot related rows
//! and re-check before acting on them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::tasks::model::{Execution, Task, TaskStatus};

/// Filter for task queries.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Restrict to a single owner.
    pub owner_id: Option<String>,
    /// Restrict to a single organization.
    pub org_id: Option<String>,
    /// Restrict to a single status.
    pub status: Option<TaskStatus>,
    /// Restrict to tasks whose `next_run_at` is at or before this instant.
    pub due_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    /// Filter for due scheduled tasks, used by the ticker.
    pub fn due(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Scheduled),
            due_before: Some(now),
            ..Self::default()
        }
    }

    /// Filter for every task visible to an organization.
    pub fn for_org(org_id: impl Into<String>) -> Self {
        Self {
            org_id: Some(org_id.into()),
            ..Self::default()
        }
    }
}

/// Task and execution persistence.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task.
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// List tasks matching a filter.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Replace a task row. Fails with `NotFound` if the task is gone.
    async fn update_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Delete a task. Returns false when it did not exist.
    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Atomically move a task from `expected` status to `next`. Returns
    /// false (without writing) when the stored status no longer matches:
    /// the caller lost the race and must re-read.
    async fn set_task_status(
        &self,
        id: Uuid,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<bool, StoreError>;

    // ── Executions ──────────────────────────────────────────────────

    /// Insert a new execution record.
    async fn insert_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    /// Get an execution by ID.
    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError>;

    /// Replace an execution row.
    async fn update_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    /// List executions for a task, most recent first.
    async fn list_executions(&self, task_id: Uuid) -> Result<Vec<Execution>, StoreError>;
}
