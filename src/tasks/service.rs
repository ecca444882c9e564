//! Task CRUD with ownership and immutability guards.
//!
//! The service owns every ordinary mutation path; tasks held by the
//! coordinator (`Queued`/`Running`) reject edits here and can only be
//! touched through the coordinator's cancel/force paths.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{Error, ExecutionError, TaskError};
use crate::events::hub::{EventHub, HubEvent, Topic};
use crate::scheduler;
use crate::store::{Store, TaskFilter};
use crate::tasks::graph::DependencyGraph;
use crate::tasks::model::{Execution, ExecutionMode, Task, TaskStatus};
use crate::tasks::{Actor, Authorizer};

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub server_id: String,
    pub agent_id: String,
    pub title: String,
    pub prompt: String,
    pub execution_mode: ExecutionMode,
    pub depends_on: Vec<Uuid>,
    pub schedule: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

/// Partial update for a task. Unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub prompt: Option<String>,
    pub schedule: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

/// Task CRUD operations.
pub struct TaskService {
    store: Arc<dyn Store>,
    graph: DependencyGraph,
    authorizer: Arc<dyn Authorizer>,
    hub: Arc<EventHub>,
    config: OrchestratorConfig,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn Store>,
        graph: DependencyGraph,
        authorizer: Arc<dyn Authorizer>,
        hub: Arc<EventHub>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            graph,
            authorizer,
            hub,
            config,
        }
    }

    /// Create a task owned by the actor.
    ///
    /// Recurring tasks require a valid cron schedule and are created armed
    /// (`Scheduled`, `next_run_at` at the next fire time). One-shot
    /// scheduled tasks require a future `scheduled_at`. Immediate tasks
    /// start as drafts.
    pub async fn create_task(&self, actor: &Actor, new: NewTask) -> Result<Task, Error> {
        let mut task = Task::new(
            &actor.user_id,
            &actor.org_id,
            new.server_id,
            new.agent_id,
            new.title,
            new.prompt,
        )
        .with_mode(new.execution_mode)
        .with_retries(
            new.max_retries.unwrap_or(self.config.default_max_retries),
            new.retry_delay_ms
                .unwrap_or(self.config.default_retry_delay.as_millis() as u64),
        );
        task.timeout_ms = new.timeout_ms;

        match new.execution_mode {
            ExecutionMode::Immediate => {}
            ExecutionMode::Scheduled => {
                let at = new.scheduled_at.ok_or_else(|| TaskError::InvalidSchedule {
                    expr: String::new(),
                    reason: "scheduled task requires scheduled_at".to_string(),
                })?;
                if at <= Utc::now() {
                    return Err(TaskError::InvalidSchedule {
                        expr: at.to_rfc3339(),
                        reason: "scheduled_at must be in the future".to_string(),
                    }
                    .into());
                }
                task.scheduled_at = Some(at);
                task.next_run_at = Some(at);
                task.status = TaskStatus::Scheduled;
            }
            ExecutionMode::Recurring => {
                let expr = new.schedule.ok_or_else(|| TaskError::InvalidSchedule {
                    expr: String::new(),
                    reason: "recurring task requires a cron schedule".to_string(),
                })?;
                task.next_run_at = Some(scheduler::next_fire_time(&expr)?);
                task.schedule = Some(expr);
                task.status = TaskStatus::Scheduled;
            }
        }

        // Dependencies must exist and be visible to the actor's tenant.
        for dep_id in new.depends_on {
            let visible = self
                .store
                .get_task(dep_id)
                .await?
                .map(|d| self.authorizer.can_view(actor, &d))
                .unwrap_or(false);
            if !visible {
                return Err(TaskError::UnknownDependency { dependency: dep_id }.into());
            }
            if !task.depends_on.contains(&dep_id) {
                task.depends_on.push(dep_id);
            }
        }

        self.store.insert_task(&task).await?;
        tracing::info!(task = %task.id, mode = %task.execution_mode, "Task created");
        Ok(task)
    }

    /// Get a task the actor may read.
    pub async fn get_task(&self, actor: &Actor, id: Uuid) -> Result<Task, Error> {
        self.store
            .get_task(id)
            .await?
            .filter(|t| self.authorizer.can_view(actor, t))
            .ok_or_else(|| TaskError::NotFound { id }.into())
    }

    /// List the actor's organization tasks, optionally by status.
    pub async fn list_tasks(
        &self,
        actor: &Actor,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, Error> {
        let filter = TaskFilter {
            org_id: Some(actor.org_id.clone()),
            status,
            ..TaskFilter::default()
        };
        Ok(self.store.list_tasks(&filter).await?)
    }

    /// Apply a partial update. Rejected while the coordinator holds the
    /// task; `execution_mode` is immutable for the task's lifetime.
    pub async fn update_task(&self, actor: &Actor, id: Uuid, patch: TaskPatch) -> Result<Task, Error> {
        let mut task = self
            .store
            .get_task(id)
            .await?
            .filter(|t| self.authorizer.can_mutate(actor, t))
            .ok_or(TaskError::NotFound { id })?;

        if task.status.is_in_flight() {
            return Err(TaskError::NotExecutable {
                id,
                status: task.status,
            }
            .into());
        }

        if let Some(title) = patch.title {
            task.title = title;
        }
        if let Some(prompt) = patch.prompt {
            task.prompt = prompt;
        }
        if let Some(max_retries) = patch.max_retries {
            task.max_retries = max_retries;
        }
        if let Some(retry_delay_ms) = patch.retry_delay_ms {
            task.retry_delay_ms = retry_delay_ms;
        }
        if let Some(timeout_ms) = patch.timeout_ms {
            task.timeout_ms = Some(timeout_ms);
        }

        let mut rearmed = false;
        if let Some(expr) = patch.schedule {
            if task.execution_mode != ExecutionMode::Recurring {
                return Err(TaskError::ImmutableField {
                    id,
                    field: "execution_mode",
                }
                .into());
            }
            task.next_run_at = Some(scheduler::next_fire_time(&expr)?);
            task.schedule = Some(expr);
            rearmed = true;
        }
        if let Some(at) = patch.scheduled_at {
            if task.execution_mode != ExecutionMode::Scheduled {
                return Err(TaskError::ImmutableField {
                    id,
                    field: "execution_mode",
                }
                .into());
            }
            if at <= Utc::now() {
                return Err(TaskError::InvalidSchedule {
                    expr: at.to_rfc3339(),
                    reason: "scheduled_at must be in the future".to_string(),
                }
                .into());
            }
            task.scheduled_at = Some(at);
            task.next_run_at = Some(at);
            rearmed = true;
        }

        // Setting a future fire time arms a draft or pending task.
        if rearmed && matches!(task.status, TaskStatus::Draft | TaskStatus::Pending) {
            let from = task.status;
            task.status = TaskStatus::Scheduled;
            self.hub.publish(
                &Topic::Agent(task.agent_id.clone()),
                HubEvent::TaskStatus {
                    task_id: task.id,
                    from,
                    to: TaskStatus::Scheduled,
                    at: Utc::now(),
                },
            );
        }

        task.updated_at = Utc::now();
        self.store.update_task(&task).await?;
        Ok(task)
    }

    /// Delete a task. Refuses tasks the coordinator currently holds;
    /// the bulk force path cancels them first.
    pub async fn delete_task(&self, actor: &Actor, id: Uuid) -> Result<(), Error> {
        let task = self
            .store
            .get_task(id)
            .await?
            .filter(|t| self.authorizer.can_mutate(actor, t))
            .ok_or(TaskError::NotFound { id })?;

        if task.status.is_in_flight() {
            return Err(TaskError::NotExecutable {
                id,
                status: task.status,
            }
            .into());
        }

        self.store.delete_task(id).await?;
        tracing::info!(task = %id, "Task deleted");
        Ok(())
    }

    /// Get an execution whose owning task the actor may read.
    pub async fn get_execution(&self, actor: &Actor, id: Uuid) -> Result<Execution, Error> {
        let execution = self
            .store
            .get_execution(id)
            .await?
            .ok_or(ExecutionError::NotFound { id })?;
        self.get_task(actor, execution.task_id).await?;
        Ok(execution)
    }

    /// List a task's executions, most recent first.
    pub async fn list_executions(&self, actor: &Actor, task_id: Uuid) -> Result<Vec<Execution>, Error> {
        self.get_task(actor, task_id).await?;
        Ok(self.store.list_executions(task_id).await?)
    }

    /// Add a dependency edge. See [`DependencyGraph::add_dependency`].
    pub async fn add_dependency(
        &self,
        actor: &Actor,
        task_id: Uuid,
        dependency: Uuid,
    ) -> Result<Task, Error> {
        self.graph.add_dependency(task_id, dependency, actor).await
    }

    /// Tasks that directly depend on `task_id`.
    pub async fn dependents(&self, actor: &Actor, task_id: Uuid) -> Result<Vec<Task>, Error> {
        // Ensure the anchor task itself is visible before answering.
        self.get_task(actor, task_id).await?;
        self.graph.dependents(task_id, &actor.org_id).await
    }
}
