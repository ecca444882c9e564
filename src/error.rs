//! Error types for the orchestration engine.

use std::time::Duration;

use uuid::Uuid;

use crate::tasks::model::{ExecutionStatus, TaskStatus};

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Bulk operation error: {0}")]
    Bulk(#[from] BulkError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Task lifecycle and dependency errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} is in status {status}, not executable")]
    NotExecutable { id: Uuid, status: TaskStatus },

    #[error("Task {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {id} has unsatisfied dependencies: {unmet:?}")]
    NotReady { id: Uuid, unmet: Vec<Uuid> },

    #[error("Adding dependency {dependency} to task {id} would create a cycle")]
    CyclicDependency { id: Uuid, dependency: Uuid },

    #[error("Dependency {dependency} does not exist or is not visible")]
    UnknownDependency { dependency: Uuid },

    #[error("Field {field} on task {id} is immutable")]
    ImmutableField { id: Uuid, field: &'static str },

    #[error("Invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },
}

/// Execution record errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Execution {id} not found")]
    NotFound { id: Uuid },

    #[error("Execution {id} is in status {status}, not retryable")]
    NotFailed { id: Uuid, status: ExecutionStatus },
}

/// Bulk operation errors. Per-item failures never surface here; they are
/// reported in the bulk result's rejected/failed lists.
#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    #[error("Batch of {size} items exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("No eligible items in the requested batch")]
    NoEligibleItems,
}

/// Agent transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Agent invocation failed: {reason}")]
    Request { reason: String },

    #[error("Invalid response from agent: {reason}")]
    InvalidResponse { reason: String },

    #[error("Agent invocation timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Agent invocation was cancelled")]
    Cancelled,
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflicting write: {reason}")]
    Conflict { reason: String },

    #[error("Query failed: {0}")]
    Query(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
