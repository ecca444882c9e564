//! Task and execution data model — entities, status enums, and the
//! transition table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a task. Closed enumeration; transition legality is
/// encoded in [`TaskStatus::can_transition_to`], not scattered conditionals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created but never submitted for execution.
    Draft,
    /// Submitted, waiting for the coordinator to accept it.
    Pending,
    /// Armed with a future fire time (one-shot or recurring).
    Scheduled,
    /// Accepted by the coordinator, about to run.
    Queued,
    /// An execution is in flight.
    Running,
    /// The run finished successfully.
    Completed,
    /// The run failed; may be re-queued by a retry.
    Failed,
    /// Explicitly cancelled.
    Cancelled,
}

impl TaskStatus {
    /// Whether a transition to `target` is legal.
    ///
    /// `Queued -> Pending` is the coordinator-internal revert used when the
    /// pre-run readiness recheck fails; it is not reachable from any public
    /// edit path. `Completed/Failed -> Scheduled` re-arms recurring tasks.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Draft, Pending) | (Draft, Scheduled) |
            (Pending, Scheduled) | (Pending, Queued) | (Pending, Cancelled) |
            (Scheduled, Queued) | (Scheduled, Cancelled) |
            (Queued, Running) | (Queued, Cancelled) | (Queued, Pending) |
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) |
            (Failed, Queued) | (Failed, Scheduled) |
            (Completed, Scheduled)
        )
    }

    /// Terminal for the current run (retries excepted for `Failed`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether the coordinator currently holds this task. Tasks in these
    /// states reject ordinary edits.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Whether `execute` may accept a task in this status.
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Draft | Self::Pending | Self::Scheduled | Self::Failed)
    }

    /// Whether an explicit cancel may accept a task in this status.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Scheduled | Self::Queued | Self::Running
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// How a task is triggered. Set at creation, immutable afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Runs when explicitly executed.
    Immediate,
    /// Runs once at `scheduled_at`.
    Scheduled,
    /// Runs on a cron schedule, re-armed after each run.
    Recurring,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Immediate => "immediate",
            Self::Scheduled => "scheduled",
            Self::Recurring => "recurring",
        };
        write!(f, "{s}")
    }
}

/// A user-defined unit of work executed by a remote agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique ID.
    pub id: Uuid,
    /// User that created the task; the only principal allowed to mutate it.
    pub owner_id: String,
    /// Organization the task belongs to; members may read it.
    pub org_id: String,
    /// Server hosting the agent.
    pub server_id: String,
    /// Agent that executes the prompt.
    pub agent_id: String,
    /// Short title.
    pub title: String,
    /// Prompt sent to the agent on each run.
    pub prompt: String,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Trigger mode, immutable after creation.
    pub execution_mode: ExecutionMode,
    /// IDs of tasks that must complete before this one may run.
    /// Set semantics: deduplicated, acyclic.
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    /// Cron expression for recurring tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// One-shot fire time for scheduled tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Number of runs started so far (the first attempt counts).
    pub run_count: u32,
    /// When the last run started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next due time, maintained for scheduled/recurring tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    /// Maximum automatic retries after a failed run.
    pub max_retries: u32,
    /// Flat delay before each retry, in milliseconds.
    pub retry_delay_ms: u64,
    /// Per-execution timeout in milliseconds (None = coordinator default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new draft task with sensible defaults.
    pub fn new(
        owner_id: impl Into<String>,
        org_id: impl Into<String>,
        server_id: impl Into<String>,
        agent_id: impl Into<String>,
        title: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            org_id: org_id.into(),
            server_id: server_id.into(),
            agent_id: agent_id.into(),
            title: title.into(),
            prompt: prompt.into(),
            status: TaskStatus::Draft,
            execution_mode: ExecutionMode::Immediate,
            depends_on: Vec::new(),
            schedule: None,
            scheduled_at: None,
            run_count: 0,
            last_run_at: None,
            next_run_at: None,
            max_retries: 0,
            retry_delay_ms: 30_000,
            timeout_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set the execution mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Builder: set dependencies (deduplicated).
    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        for dep in deps {
            if !self.depends_on.contains(&dep) {
                self.depends_on.push(dep);
            }
        }
        self
    }

    /// Builder: set the cron schedule.
    pub fn with_schedule(mut self, expr: impl Into<String>) -> Self {
        self.schedule = Some(expr.into());
        self
    }

    /// Builder: set the one-shot fire time.
    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Builder: set the retry parameters.
    pub fn with_retries(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    /// Builder: set the per-execution timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Status of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    /// Outcomes the retry policy will consider re-running.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }

    /// Whether the attempt has reached a final state.
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// One concrete attempt to run a task on an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Unique ID.
    pub id: Uuid,
    /// Owning task.
    pub task_id: Uuid,
    /// Agent that ran (or is running) the attempt.
    pub agent_id: String,
    /// Attempt status.
    pub status: ExecutionStatus,
    /// When the attempt started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the attempt reached a final state. Immutable afterwards except
    /// for administrative cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration of the attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Tokens consumed by the agent.
    pub tokens_used: u64,
    /// Agent process exit code, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Failure detail, when the attempt did not complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Agent output, when the attempt completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl Execution {
    /// Create a new queued execution for a task.
    pub fn new(task_id: Uuid, agent_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            agent_id: agent_id.into(),
            status: ExecutionStatus::Queued,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            tokens_used: 0,
            exit_code: None,
            error: None,
            output: None,
            created_at: Utc::now(),
        }
    }

    /// Mark the attempt as running.
    pub fn mark_running(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Mark the attempt finished with the given status, stamping
    /// `completed_at` and `duration_ms`.
    pub fn mark_finished(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        if let Some(started) = self.started_at {
            let elapsed = now.signed_duration_since(started).num_milliseconds();
            self.duration_ms = Some(elapsed.max(0) as u64);
        }
        self.status = status;
        self.completed_at = Some(now);
    }
}
