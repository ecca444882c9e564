//! Task domain — model, dependency graph, CRUD service, and retry policy.

pub mod graph;
pub mod model;
pub mod retry;
pub mod service;

pub use graph::DependencyGraph;
pub use model::{Execution, ExecutionMode, ExecutionStatus, Task, TaskStatus};
pub use retry::{RetryDecision, RetryPolicy};
pub use service::{NewTask, TaskPatch, TaskService};

/// The principal performing an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    /// User identity.
    pub user_id: String,
    /// Organization the user belongs to.
    pub org_id: String,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            org_id: org_id.into(),
        }
    }
}

/// Resolves what an actor may do with a task. Tenant and role logic live
/// outside the core; this seam is all the core sees.
pub trait Authorizer: Send + Sync {
    /// Whether the actor may read the task.
    fn can_view(&self, actor: &Actor, task: &Task) -> bool;

    /// Whether the actor may mutate or execute the task.
    fn can_mutate(&self, actor: &Actor, task: &Task) -> bool;
}

/// Default policy: the owner mutates, organization members read.
pub struct OwnerOrgAuthorizer;

impl Authorizer for OwnerOrgAuthorizer {
    fn can_view(&self, actor: &Actor, task: &Task) -> bool {
        actor.org_id == task.org_id
    }

    fn can_mutate(&self, actor: &Actor, task: &Task) -> bool {
        actor.user_id == task.owner_id && actor.org_id == task.org_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_may_mutate() {
        let task = Task::new("alice", "acme", "srv", "agent", "T", "p");
        let auth = OwnerOrgAuthorizer;
        assert!(auth.can_mutate(&Actor::new("alice", "acme"), &task));
        assert!(!auth.can_mutate(&Actor::new("bob", "acme"), &task));
    }

    #[test]
    fn org_members_may_view() {
        let task = Task::new("alice", "acme", "srv", "agent", "T", "p");
        let auth = OwnerOrgAuthorizer;
        assert!(auth.can_view(&Actor::new("bob", "acme"), &task));
        assert!(!auth.can_view(&Actor::new("eve", "other"), &task));
    }
}
