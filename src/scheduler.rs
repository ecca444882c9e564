//! Scheduler trigger — cron helpers and the periodic ticker that feeds due
//! tasks to the coordinator.
//!
//! The ticker is external wiring around the core: the coordinator does not
//! run its own clock loop, it just gets `execute_task` calls when a task's
//! `next_run_at` has elapsed.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::task::JoinHandle;

use crate::error::TaskError;
use crate::exec::coordinator::ExecutionCoordinator;
use crate::store::{Store, TaskFilter};
use crate::tasks::Actor;

/// Parse a cron expression.
///
/// Uses the 7-field cron format: sec min hour day-of-month month
/// day-of-week year.
pub fn parse_schedule(expr: &str) -> Result<Schedule, TaskError> {
    Schedule::from_str(expr).map_err(|e| TaskError::InvalidSchedule {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Next upcoming fire time for a cron expression, after now.
pub fn next_fire_time(expr: &str) -> Result<DateTime<Utc>, TaskError> {
    let schedule = parse_schedule(expr)?;
    schedule
        .upcoming(Utc)
        .next()
        .ok_or_else(|| TaskError::InvalidSchedule {
            expr: expr.to_string(),
            reason: "no upcoming fire times".to_string(),
        })
}

/// Spawn the ticker loop. Every `interval` it scans for scheduled tasks
/// whose `next_run_at` has elapsed and hands them to the coordinator, acting
/// as each task's owner. Individual failures are logged and never stop the
/// loop.
pub fn spawn_ticker(
    coordinator: Arc<ExecutionCoordinator>,
    store: Arc<dyn Store>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let due = match store.list_tasks(&TaskFilter::due(Utc::now())).await {
                Ok(due) => due,
                Err(e) => {
                    tracing::warn!(error = %e, "Ticker: failed to scan for due tasks");
                    continue;
                }
            };

            for task in due {
                let owner = Actor::new(&task.owner_id, &task.org_id);
                tracing::info!(task = %task.id, "Ticker: firing due task");
                if let Err(e) = coordinator.execute_task(task.id, &owner).await {
                    tracing::warn!(task = %task.id, error = %e, "Ticker: due task failed to start");
                }
            }
        }
    })
}
