//! Bulk operations over sets of task IDs.
//!
//! Shared contract: per-item isolation. The requested IDs are filtered up
//! front into an eligible set and a rejected list (never silently dropped);
//! one item's failure never aborts or rolls back another's success, and
//! per-item errors land in the report instead of propagating.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{BulkError, Error};
use crate::exec::coordinator::ExecutionCoordinator;
use crate::store::Store;
use crate::tasks::model::{Task, TaskStatus};
use crate::tasks::{Actor, Authorizer};

/// An item excluded from the eligible set, with the reason.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedItem {
    pub id: Uuid,
    pub reason: String,
}

/// Result of applying the operation to one eligible item.
#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Aggregate result of a bulk call. Ephemeral, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct BulkReport {
    pub requested: Vec<Uuid>,
    pub accepted: Vec<Uuid>,
    pub rejected: Vec<RejectedItem>,
    pub outcomes: Vec<ItemOutcome>,
}

impl BulkReport {
    fn new(requested: Vec<Uuid>, accepted: &[Task], rejected: Vec<RejectedItem>) -> Self {
        Self {
            requested,
            accepted: accepted.iter().map(|t| t.id).collect(),
            rejected,
            outcomes: Vec::new(),
        }
    }

    /// Number of items whose operation succeeded.
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }
}

/// Applies one operation across many tasks with aggregate reporting.
pub struct BulkOrchestrator {
    store: Arc<dyn Store>,
    coordinator: Arc<ExecutionCoordinator>,
    authorizer: Arc<dyn Authorizer>,
    config: OrchestratorConfig,
}

impl BulkOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        coordinator: Arc<ExecutionCoordinator>,
        authorizer: Arc<dyn Authorizer>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            authorizer,
            config,
        }
    }

    /// Filter requested IDs into eligible tasks and rejected items.
    ///
    /// `eligible` returns `None` to accept a task or `Some(reason)` to
    /// reject it. Fails up front with `BatchTooLarge` over `max` and with
    /// `NoEligibleItems` when nothing survives the filter, so callers can
    /// tell "did nothing useful" from success-with-zero.
    async fn partition<F>(
        &self,
        ids: &[Uuid],
        actor: &Actor,
        max: usize,
        eligible: F,
    ) -> Result<(Vec<Task>, Vec<RejectedItem>), Error>
    where
        F: Fn(&Task) -> Option<String>,
    {
        if ids.len() > max {
            return Err(BulkError::BatchTooLarge {
                size: ids.len(),
                max,
            }
            .into());
        }

        let mut seen = HashSet::new();
        let mut tasks = Vec::new();
        let mut rejected = Vec::new();
        for &id in ids {
            if !seen.insert(id) {
                continue;
            }
            match self.store.get_task(id).await? {
                Some(task) if self.authorizer.can_mutate(actor, &task) => {
                    match eligible(&task) {
                        None => tasks.push(task),
                        Some(reason) => rejected.push(RejectedItem { id, reason }),
                    }
                }
                _ => rejected.push(RejectedItem {
                    id,
                    reason: "not found".to_string(),
                }),
            }
        }

        if tasks.is_empty() {
            return Err(BulkError::NoEligibleItems.into());
        }
        Ok((tasks, rejected))
    }

    /// Cancel every eligible task.
    pub async fn bulk_cancel(&self, ids: Vec<Uuid>, actor: &Actor) -> Result<BulkReport, Error> {
        let (tasks, rejected) = self
            .partition(&ids, actor, self.config.max_bulk_items, |task| {
                if task.status.is_cancellable() {
                    None
                } else {
                    Some(format!("status {} is not cancellable", task.status))
                }
            })
            .await?;

        let mut report = BulkReport::new(ids, &tasks, rejected);
        for task in &tasks {
            let outcome = match self.coordinator.cancel_task(task.id, actor).await {
                Ok(_) => ItemOutcome {
                    id: task.id,
                    success: true,
                    detail: None,
                },
                Err(e) => ItemOutcome {
                    id: task.id,
                    success: false,
                    detail: Some(e.to_string()),
                },
            };
            report.outcomes.push(outcome);
        }
        tracing::info!(
            requested = report.requested.len(),
            cancelled = report.succeeded(),
            "Bulk cancel finished"
        );
        Ok(report)
    }

    /// Delete every eligible task. With `force`, running work is cancelled
    /// first (the one path allowed to do that as a side effect); without
    /// it, in-flight tasks are reported as ineligible and left untouched.
    pub async fn bulk_delete(
        &self,
        ids: Vec<Uuid>,
        force: bool,
        actor: &Actor,
    ) -> Result<BulkReport, Error> {
        let (tasks, rejected) = self
            .partition(&ids, actor, self.config.max_bulk_items, |task| {
                if task.status.is_in_flight() && !force {
                    Some(format!("status {} requires force", task.status))
                } else {
                    None
                }
            })
            .await?;

        let mut report = BulkReport::new(ids, &tasks, rejected);
        for task in &tasks {
            if task.status.is_in_flight() {
                if let Err(e) = self.coordinator.cancel_task(task.id, actor).await {
                    // Raced into a terminal state; deletion proceeds anyway.
                    tracing::debug!(task = %task.id, error = %e, "Force-delete cancel was superseded");
                }
            }
            let outcome = match self.store.delete_task(task.id).await {
                Ok(true) => ItemOutcome {
                    id: task.id,
                    success: true,
                    detail: None,
                },
                Ok(false) => ItemOutcome {
                    id: task.id,
                    success: false,
                    detail: Some("already deleted".to_string()),
                },
                Err(e) => ItemOutcome {
                    id: task.id,
                    success: false,
                    detail: Some(e.to_string()),
                },
            };
            report.outcomes.push(outcome);
        }
        tracing::info!(
            requested = report.requested.len(),
            deleted = report.succeeded(),
            force,
            "Bulk delete finished"
        );
        Ok(report)
    }

    /// Move every eligible task to `status`. Tasks the coordinator holds
    /// and tasks whose transition table forbids the move are rejected.
    pub async fn bulk_set_status(
        &self,
        ids: Vec<Uuid>,
        status: TaskStatus,
        actor: &Actor,
    ) -> Result<BulkReport, Error> {
        let (tasks, rejected) = self
            .partition(&ids, actor, self.config.max_bulk_items, |task| {
                if task.status.is_in_flight() {
                    Some(format!("status {} is held by the coordinator", task.status))
                } else if !task.status.can_transition_to(status) {
                    Some(format!("cannot transition from {} to {status}", task.status))
                } else {
                    None
                }
            })
            .await?;

        let mut report = BulkReport::new(ids, &tasks, rejected);
        for task in &tasks {
            let outcome = match self.coordinator.set_status(task.id, status, actor).await {
                Ok(_) => ItemOutcome {
                    id: task.id,
                    success: true,
                    detail: None,
                },
                Err(e) => ItemOutcome {
                    id: task.id,
                    success: false,
                    detail: Some(e.to_string()),
                },
            };
            report.outcomes.push(outcome);
        }
        Ok(report)
    }

    /// Execute every eligible task.
    ///
    /// `sequential` runs one task to completion before starting the next;
    /// one task's failure never halts the rest of the queue. Otherwise all
    /// eligible tasks run concurrently and the call returns once every one
    /// of them has settled.
    pub async fn bulk_execute(
        &self,
        ids: Vec<Uuid>,
        sequential: bool,
        actor: &Actor,
    ) -> Result<BulkReport, Error> {
        let (tasks, rejected) = self
            .partition(&ids, actor, self.config.max_bulk_executions, |task| {
                if task.status.is_executable() {
                    None
                } else {
                    Some(format!("status {} is not executable", task.status))
                }
            })
            .await?;

        let mut report = BulkReport::new(ids, &tasks, rejected);
        if sequential {
            for task in &tasks {
                report
                    .outcomes
                    .push(self.execute_one(task.id, actor).await);
            }
        } else {
            let futures = tasks.iter().map(|task| self.execute_one(task.id, actor));
            report.outcomes = join_all(futures).await;
        }
        tracing::info!(
            requested = report.requested.len(),
            executed = report.succeeded(),
            sequential,
            "Bulk execute finished"
        );
        Ok(report)
    }

    /// Re-queue every eligible failed task, concurrently.
    pub async fn bulk_retry(&self, ids: Vec<Uuid>, actor: &Actor) -> Result<BulkReport, Error> {
        let (tasks, rejected) = self
            .partition(&ids, actor, self.config.max_bulk_executions, |task| {
                if task.status == TaskStatus::Failed {
                    None
                } else {
                    Some(format!("status {} is not failed", task.status))
                }
            })
            .await?;

        let mut report = BulkReport::new(ids, &tasks, rejected);
        let futures = tasks.iter().map(|task| self.execute_one(task.id, actor));
        report.outcomes = join_all(futures).await;
        Ok(report)
    }

    async fn execute_one(&self, task_id: Uuid, actor: &Actor) -> ItemOutcome {
        match self.coordinator.execute_task(task_id, actor).await {
            Ok(execution) if execution.status == crate::tasks::model::ExecutionStatus::Completed => {
                ItemOutcome {
                    id: task_id,
                    success: true,
                    detail: Some(format!("execution {}", execution.id)),
                }
            }
            Ok(execution) => ItemOutcome {
                id: task_id,
                success: false,
                detail: Some(format!(
                    "execution {} finished {}",
                    execution.id, execution.status
                )),
            },
            Err(e) => ItemOutcome {
                id: task_id,
                success: false,
                detail: Some(e.to_string()),
            },
        }
    }
}
