//! Dependency graph evaluation — readiness, cycle-checked edge insertion,
//! and derived reverse queries.
//!
//! Reverse ("who depends on me") queries are computed on demand from the
//! full task set rather than kept as a second index; at this domain's task
//! counts a scan is cheap and cannot drift out of sync with the forward
//! edges.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, TaskError};
use crate::store::{Store, TaskFilter};
use crate::tasks::model::{Task, TaskStatus};
use crate::tasks::{Actor, Authorizer};

/// Evaluates and mutates the dependency edges of the task graph.
///
/// All reads are snapshot-then-use: a dependency's status may change
/// between a readiness check and the run, which is why the coordinator
/// re-checks immediately before transitioning to `Running`.
#[derive(Clone)]
pub struct DependencyGraph {
    store: Arc<dyn Store>,
    authorizer: Arc<dyn Authorizer>,
}

impl DependencyGraph {
    pub fn new(store: Arc<dyn Store>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self { store, authorizer }
    }

    /// Dependencies of `task` that are not yet `Completed`. A dependency
    /// that no longer exists counts as unmet; it can never complete.
    pub async fn unmet_dependencies(&self, task: &Task) -> Result<Vec<Uuid>, Error> {
        let mut unmet = Vec::new();
        for &dep_id in &task.depends_on {
            match self.store.get_task(dep_id).await? {
                Some(dep) if dep.status == TaskStatus::Completed => {}
                _ => unmet.push(dep_id),
            }
        }
        Ok(unmet)
    }

    /// True iff `depends_on` is empty or every dependency is `Completed`.
    pub async fn is_ready(&self, task: &Task) -> Result<bool, Error> {
        Ok(self.unmet_dependencies(task).await?.is_empty())
    }

    /// Add a dependency edge `task -> candidate`.
    ///
    /// Fails with `CyclicDependency` when the edge would close a cycle
    /// (including the self-edge), and with `UnknownDependency` when the
    /// candidate does not exist or is not visible to the actor's tenant.
    /// Re-adding an existing edge is a no-op.
    pub async fn add_dependency(
        &self,
        task_id: Uuid,
        candidate: Uuid,
        actor: &Actor,
    ) -> Result<Task, Error> {
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .filter(|t| self.authorizer.can_mutate(actor, t))
            .ok_or(TaskError::NotFound { id: task_id })?;

        if task.status.is_in_flight() {
            return Err(TaskError::NotExecutable {
                id: task_id,
                status: task.status,
            }
            .into());
        }

        if candidate == task_id {
            return Err(TaskError::CyclicDependency {
                id: task_id,
                dependency: candidate,
            }
            .into());
        }

        let visible = self
            .store
            .get_task(candidate)
            .await?
            .map(|c| self.authorizer.can_view(actor, &c))
            .unwrap_or(false);
        if !visible {
            return Err(TaskError::UnknownDependency {
                dependency: candidate,
            }
            .into());
        }

        // Idempotent: duplicate edges merge silently.
        if task.depends_on.contains(&candidate) {
            return Ok(task);
        }

        // The edge closes a cycle iff `task` is already reachable from the
        // candidate by following depends_on edges.
        let snapshot = self.org_snapshot(&task.org_id).await?;
        if reachable(&snapshot, candidate, task_id) {
            return Err(TaskError::CyclicDependency {
                id: task_id,
                dependency: candidate,
            }
            .into());
        }

        task.depends_on.push(candidate);
        task.updated_at = Utc::now();
        self.store.update_task(&task).await?;
        tracing::debug!(task = %task_id, dependency = %candidate, "Dependency added");
        Ok(task)
    }

    /// Tasks that directly depend on `task_id`, derived by scanning the
    /// organization's task set.
    pub async fn dependents(&self, task_id: Uuid, org_id: &str) -> Result<Vec<Task>, Error> {
        let tasks = self.store.list_tasks(&TaskFilter::for_org(org_id)).await?;
        Ok(tasks
            .into_iter()
            .filter(|t| t.depends_on.contains(&task_id))
            .collect())
    }

    /// IDs of every task that transitively depends on `task_id`.
    pub async fn transitive_dependents(
        &self,
        task_id: Uuid,
        org_id: &str,
    ) -> Result<Vec<Uuid>, Error> {
        let tasks = self.store.list_tasks(&TaskFilter::for_org(org_id)).await?;

        let mut reverse: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for task in &tasks {
            for &dep in &task.depends_on {
                reverse.entry(dep).or_default().push(task.id);
            }
        }

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([task_id]);
        let mut found = Vec::new();
        while let Some(current) = queue.pop_front() {
            if let Some(children) = reverse.get(&current) {
                for &child in children {
                    if seen.insert(child) {
                        found.push(child);
                        queue.push_back(child);
                    }
                }
            }
        }
        Ok(found)
    }

    async fn org_snapshot(&self, org_id: &str) -> Result<HashMap<Uuid, Task>, Error> {
        let tasks = self.store.list_tasks(&TaskFilter::for_org(org_id)).await?;
        Ok(tasks.into_iter().map(|t| (t.id, t)).collect())
    }
}

/// Whether `target` is reachable from `start` following depends_on edges.
fn reachable(tasks: &HashMap<Uuid, Task>, start: Uuid, target: Uuid) -> bool {
    let mut visited = HashSet::new();
    let mut stack = vec![start];
    while let Some(current) = stack.pop() {
        if current == target {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(task) = tasks.get(&current) {
            stack.extend(task.depends_on.iter().copied());
        }
    }
    false
}
