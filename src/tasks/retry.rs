//! Retry policy for failed executions.

use std::time::Duration;

use crate::tasks::model::{ExecutionStatus, Task};

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether the task should be re-queued.
    pub retry: bool,
    /// Delay before the retry starts.
    pub delay: Duration,
}

impl RetryDecision {
    /// A "do not retry" decision.
    pub fn no() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Decides whether a finished execution should be retried.
///
/// The delay is the task's fixed `retry_delay_ms`, flat rather than
/// exponential. Callers depend on the flat timing, so the shape is kept
/// as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    /// Evaluate an execution outcome against the owning task's retry
    /// parameters. Only `Failed` and `Timeout` outcomes are retried, and
    /// only while the number of retries already used (`run_count - 1`,
    /// the first attempt is not a retry) is below `max_retries`.
    /// A cancelled execution is never retried.
    pub fn decide(&self, outcome: ExecutionStatus, task: &Task) -> RetryDecision {
        if !outcome.is_retryable() {
            return RetryDecision::no();
        }
        let retries_used = task.run_count.saturating_sub(1);
        if retries_used >= task.max_retries {
            return RetryDecision::no();
        }
        RetryDecision {
            retry: true,
            delay: Duration::from_millis(task.retry_delay_ms),
        }
    }
}
