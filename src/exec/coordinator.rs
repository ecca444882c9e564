//! Execution coordinator — drives tasks and ad hoc prompts through the
//! agent transport, owns every state transition, and publishes each one to
//! the hub before returning.
//!
//! Transitions on a single task are linearizable: the read-check-transition
//! sequence runs under a per-task async mutex, and the store's status CAS
//! backs it up, so of two concurrent callers exactly one wins and the loser
//! sees `NotExecutable`/`InvalidTransition`. The per-task lock is never
//! held across the transport round trip; that is what keeps cancellation
//! of a running task possible.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{Error, ExecutionError, TaskError, TransportError};
use crate::events::chat::ChatStreamer;
use crate::events::hub::{EventHub, HubEvent, Topic};
use crate::exec::transport::{AgentTransport, InvokeOutcome, InvokeRequest};
use crate::store::Store;
use crate::tasks::graph::DependencyGraph;
use crate::tasks::model::{Execution, ExecutionStatus, Task, TaskStatus};
use crate::tasks::retry::RetryPolicy;
use crate::tasks::{Actor, Authorizer};

/// Bookkeeping for an execution the coordinator currently holds.
struct InFlight {
    execution_id: Uuid,
    cancel_tx: oneshot::Sender<()>,
}

/// Coordinates task and prompt execution against the agent transport.
pub struct ExecutionCoordinator {
    store: Arc<dyn Store>,
    transport: Arc<dyn AgentTransport>,
    hub: Arc<EventHub>,
    graph: DependencyGraph,
    authorizer: Arc<dyn Authorizer>,
    retry_policy: RetryPolicy,
    default_timeout: Option<Duration>,
    /// Per-task guards for the read-check-transition sections.
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    /// In-flight executions, keyed by task.
    running: Mutex<HashMap<Uuid, InFlight>>,
    /// Handle to ourselves for self-scheduled retries.
    me: Weak<Self>,
}

impl ExecutionCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn AgentTransport>,
        hub: Arc<EventHub>,
        graph: DependencyGraph,
        authorizer: Arc<dyn Authorizer>,
        config: &OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            store,
            transport,
            hub,
            graph,
            authorizer,
            retry_policy: RetryPolicy,
            default_timeout: config.default_timeout,
            locks: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    fn task_lock(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .entry(id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Apply a legal transition via the store CAS and publish it. Fails
    /// without writing when the table forbids the move or when a concurrent
    /// writer got there first.
    async fn transition(&self, task: &mut Task, to: TaskStatus) -> Result<(), Error> {
        let from = task.status;
        if !from.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                id: task.id,
                from,
                to,
            }
            .into());
        }
        let moved = self.store.set_task_status(task.id, from, to).await?;
        if !moved {
            let current = self
                .store
                .get_task(task.id)
                .await?
                .map(|t| t.status)
                .unwrap_or(from);
            return Err(TaskError::NotExecutable {
                id: task.id,
                status: current,
            }
            .into());
        }
        task.status = to;
        tracing::info!(task = %task.id, %from, %to, "Task transitioned");
        self.publish_task_event(
            task,
            HubEvent::TaskStatus {
                task_id: task.id,
                from,
                to,
                at: Utc::now(),
            },
        );
        Ok(())
    }

    fn publish_task_event(&self, task: &Task, event: HubEvent) {
        self.publish_event(&task.server_id, &task.agent_id, event);
    }

    fn publish_event(&self, server_id: &str, agent_id: &str, event: HubEvent) {
        self.hub
            .publish(&Topic::Agent(agent_id.to_string()), event.clone());
        self.hub.publish(&Topic::Server(server_id.to_string()), event);
    }

    /// Execute a task through its agent.
    ///
    /// Validates ownership and readiness, walks the task through
    /// `Queued -> Running`, runs the transport race (completion vs timeout
    /// vs cancel), records the execution, and applies the retry policy to
    /// the outcome. Every transition is published before this returns.
    pub async fn execute_task(&self, task_id: Uuid, actor: &Actor) -> Result<Execution, Error> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .filter(|t| self.authorizer.can_mutate(actor, t))
            .ok_or(TaskError::NotFound { id: task_id })?;

        if !task.status.is_executable() {
            return Err(TaskError::NotExecutable {
                id: task_id,
                status: task.status,
            }
            .into());
        }

        let unmet = self.graph.unmet_dependencies(&task).await?;
        if !unmet.is_empty() {
            return Err(TaskError::NotReady { id: task_id, unmet }.into());
        }

        let lock = self.task_lock(task_id);

        // Admission: re-read under the lock so a concurrent caller cannot
        // queue the same task twice.
        let (mut task, mut execution, cancel_rx) = {
            let _guard = lock.lock().await;
            let mut task = self
                .store
                .get_task(task_id)
                .await?
                .ok_or(TaskError::NotFound { id: task_id })?;
            if !task.status.is_executable() {
                return Err(TaskError::NotExecutable {
                    id: task_id,
                    status: task.status,
                }
                .into());
            }

            // A draft becomes pending on explicit execute.
            if task.status == TaskStatus::Draft {
                self.transition(&mut task, TaskStatus::Pending).await?;
            }
            self.transition(&mut task, TaskStatus::Queued).await?;

            let execution = Execution::new(task_id, task.agent_id.clone());
            self.store.insert_execution(&execution).await?;

            let (cancel_tx, cancel_rx) = oneshot::channel();
            self.running.lock().insert(
                task_id,
                InFlight {
                    execution_id: execution.id,
                    cancel_tx,
                },
            );
            (task, execution, cancel_rx)
        };

        // Dependency reads are snapshot-then-use: a dependency may have
        // regressed between the first check and now, so re-check before
        // running and abandon the run if it did.
        let unmet = self.graph.unmet_dependencies(&task).await?;
        if !unmet.is_empty() {
            let _guard = lock.lock().await;
            self.running.lock().remove(&task_id);
            execution.mark_finished(ExecutionStatus::Cancelled);
            self.store.update_execution(&execution).await?;
            let _ = self.transition(&mut task, TaskStatus::Pending).await;
            return Err(TaskError::NotReady { id: task_id, unmet }.into());
        }

        // Start running.
        {
            let _guard = lock.lock().await;
            if let Err(err) = self.transition(&mut task, TaskStatus::Running).await {
                // Lost to a concurrent cancel during admission.
                self.running.lock().remove(&task_id);
                return Err(err);
            }
            execution.mark_running();
            task.run_count += 1;
            task.last_run_at = execution.started_at;
            // Consumed; recurring tasks get a fresh one when re-armed.
            task.next_run_at = None;
            self.store.update_task(&task).await?;
            self.store.update_execution(&execution).await?;
            self.publish_task_event(
                &task,
                HubEvent::ExecutionStarted {
                    execution_id: execution.id,
                    task_id: Some(task_id),
                    agent_id: task.agent_id.clone(),
                    at: Utc::now(),
                },
            );
        }

        // The transport round trip (the dominant latency source), raced
        // against the task timeout and cooperative cancellation. The
        // per-task lock is not held here.
        let timeout = task
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.default_timeout);
        let request = InvokeRequest {
            execution_id: execution.id,
            agent_id: task.agent_id.clone(),
            prompt: task.prompt.clone(),
            timeout,
        };

        let invoke = self.transport.invoke(request);
        tokio::pin!(invoke);
        let raced = tokio::select! {
            result = &mut invoke => Some(result),
            _ = sleep_or_forever(timeout) => None,
            _ = cancel_rx => {
                // cancel_task already moved the task and execution to
                // Cancelled; just report the final record.
                tracing::info!(task = %task_id, execution = %execution.id, "Run cancelled mid-flight");
                return Ok(self
                    .store
                    .get_execution(execution.id)
                    .await?
                    .unwrap_or(execution));
            }
        };

        let outcome_status = match &raced {
            Some(Ok(outcome)) if outcome.error.is_none() => ExecutionStatus::Completed,
            Some(_) => ExecutionStatus::Failed,
            None => ExecutionStatus::Timeout,
        };

        if outcome_status == ExecutionStatus::Timeout {
            // Tell the remote side to stop; local state moves on regardless.
            let transport = Arc::clone(&self.transport);
            let execution_id = execution.id;
            tokio::spawn(async move {
                if let Err(e) = transport.cancel(execution_id).await {
                    tracing::warn!(execution = %execution_id, error = %e, "Transport cancel signal failed");
                }
            });
        }

        // Record the outcome and settle the task.
        let mut task = {
            let _guard = lock.lock().await;
            self.running.lock().remove(&task_id);

            // A cancel that landed after the transport finished wins.
            if let Some(stored) = self.store.get_execution(execution.id).await? {
                if stored.status == ExecutionStatus::Cancelled {
                    return Ok(stored);
                }
            }

            match raced {
                Some(Ok(outcome)) => {
                    execution.output = outcome.output;
                    execution.tokens_used = outcome.tokens_used;
                    execution.exit_code = outcome.exit_code;
                    execution.error = outcome.error;
                }
                Some(Err(e)) => execution.error = Some(e.to_string()),
                None => {
                    execution.error = Some(format!(
                        "timed out after {}ms",
                        timeout.map(|t| t.as_millis()).unwrap_or_default()
                    ));
                }
            }
            execution.mark_finished(outcome_status);
            self.store.update_execution(&execution).await?;

            let target = if outcome_status == ExecutionStatus::Completed {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            match self.transition(&mut task, target).await {
                Ok(()) => {}
                Err(_) => {
                    // Lost to a concurrent writer; reload the truth.
                    if let Some(current) = self.store.get_task(task_id).await? {
                        task = current;
                    }
                }
            }

            self.publish_task_event(
                &task,
                HubEvent::ExecutionFinished {
                    execution_id: execution.id,
                    task_id: Some(task_id),
                    agent_id: task.agent_id.clone(),
                    status: execution.status,
                    duration_ms: execution.duration_ms.unwrap_or_default(),
                    tokens_used: execution.tokens_used,
                    error: execution.error.clone(),
                    at: Utc::now(),
                },
            );
            task
        };

        // Outcome handling: retry failed runs, re-arm recurring ones.
        if execution.status.is_retryable() {
            let decision = self.retry_policy.decide(execution.status, &task);
            if decision.retry {
                self.schedule_retry(task_id, actor.clone(), decision.delay);
            } else if let Err(e) = self.rearm_recurring(&mut task).await {
                tracing::warn!(task = %task_id, error = %e, "Failed to re-arm recurring task");
            }
        } else if execution.status == ExecutionStatus::Completed {
            if let Err(e) = self.rearm_recurring(&mut task).await {
                tracing::warn!(task = %task_id, error = %e, "Failed to re-arm recurring task");
            }
        }

        Ok(execution)
    }

    /// Ad hoc pass-through invocation: no task, no persistence. With a
    /// session the response is token-streamed to `chat:<session>`.
    pub async fn execute_prompt(
        &self,
        server_id: &str,
        agent_id: &str,
        prompt: &str,
        session_id: Option<&str>,
    ) -> Result<InvokeOutcome, Error> {
        let execution_id = Uuid::new_v4();
        self.publish_event(
            server_id,
            agent_id,
            HubEvent::ExecutionStarted {
                execution_id,
                task_id: None,
                agent_id: agent_id.to_string(),
                at: Utc::now(),
            },
        );

        let request = InvokeRequest {
            execution_id,
            agent_id: agent_id.to_string(),
            prompt: prompt.to_string(),
            timeout: self.default_timeout,
        };
        let started = std::time::Instant::now();

        let result: Result<InvokeOutcome, Error> = match session_id {
            Some(session) => {
                let streamer = ChatStreamer::new(Arc::clone(&self.hub));
                match self.transport.invoke_stream(request).await {
                    Ok(stream) => streamer
                        .stream(session, execution_id, stream)
                        .await
                        .map(|message| InvokeOutcome {
                            output: Some(message.content),
                            tokens_used: message.tokens_used,
                            exit_code: message.exit_code,
                            error: None,
                            tool_calls: message.tool_calls,
                        })
                        .map_err(Into::into),
                    Err(e) => Err(e.into()),
                }
            }
            None => {
                let invoke = self.transport.invoke(request);
                tokio::pin!(invoke);
                tokio::select! {
                    result = &mut invoke => result.map_err(Into::into),
                    _ = sleep_or_forever(self.default_timeout) => {
                        Err(TransportError::Timeout {
                            after: self.default_timeout.unwrap_or_default(),
                        }
                        .into())
                    }
                }
            }
        };

        let (status, tokens_used, error) = match &result {
            Ok(outcome) => (
                ExecutionStatus::Completed,
                outcome.tokens_used,
                outcome.error.clone(),
            ),
            Err(Error::Transport(TransportError::Timeout { .. })) => {
                (ExecutionStatus::Timeout, 0, Some("timed out".to_string()))
            }
            Err(e) => (ExecutionStatus::Failed, 0, Some(e.to_string())),
        };
        self.publish_event(
            server_id,
            agent_id,
            HubEvent::ExecutionFinished {
                execution_id,
                task_id: None,
                agent_id: agent_id.to_string(),
                status,
                duration_ms: started.elapsed().as_millis() as u64,
                tokens_used,
                error,
                at: Utc::now(),
            },
        );

        result
    }

    /// Re-run the task behind a failed or timed-out execution.
    pub async fn retry_execution(
        &self,
        execution_id: Uuid,
        actor: &Actor,
    ) -> Result<Execution, Error> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(ExecutionError::NotFound { id: execution_id })?;
        if !execution.status.is_retryable() {
            return Err(ExecutionError::NotFailed {
                id: execution_id,
                status: execution.status,
            }
            .into());
        }
        self.execute_task(execution.task_id, actor).await
    }

    /// Cancel a task. Legal from `Pending`, `Scheduled`, `Queued`, and
    /// `Running`; in-flight executions are marked cancelled locally first
    /// and the transport is signalled cooperatively after.
    pub async fn cancel_task(&self, task_id: Uuid, actor: &Actor) -> Result<Task, Error> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .filter(|t| self.authorizer.can_mutate(actor, t))
            .ok_or(TaskError::NotFound { id: task_id })?;

        if !task.status.is_cancellable() {
            return Err(TaskError::InvalidTransition {
                id: task_id,
                from: task.status,
                to: TaskStatus::Cancelled,
            }
            .into());
        }

        self.transition(&mut task, TaskStatus::Cancelled).await?;

        let inflight = self.running.lock().remove(&task_id);
        if let Some(inflight) = inflight {
            if let Some(mut execution) = self.store.get_execution(inflight.execution_id).await? {
                if !execution.status.is_finished() {
                    execution.mark_finished(ExecutionStatus::Cancelled);
                    self.store.update_execution(&execution).await?;
                    self.publish_task_event(
                        &task,
                        HubEvent::ExecutionFinished {
                            execution_id: execution.id,
                            task_id: Some(task_id),
                            agent_id: task.agent_id.clone(),
                            status: ExecutionStatus::Cancelled,
                            duration_ms: execution.duration_ms.unwrap_or_default(),
                            tokens_used: execution.tokens_used,
                            error: None,
                            at: Utc::now(),
                        },
                    );
                }
            }
            // Wake the waiting executor, then signal the remote side.
            let _ = inflight.cancel_tx.send(());
            let transport = Arc::clone(&self.transport);
            let execution_id = inflight.execution_id;
            tokio::spawn(async move {
                if let Err(e) = transport.cancel(execution_id).await {
                    tracing::warn!(execution = %execution_id, error = %e, "Transport cancel signal failed");
                }
            });
        }

        Ok(task)
    }

    /// Administrative status change used by the bulk orchestrator. Refuses
    /// tasks the coordinator currently holds.
    pub async fn set_status(
        &self,
        task_id: Uuid,
        to: TaskStatus,
        actor: &Actor,
    ) -> Result<Task, Error> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;

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

        self.transition(&mut task, to).await?;
        Ok(task)
    }

    fn schedule_retry(&self, task_id: Uuid, actor: Actor, delay: Duration) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        tracing::info!(task = %task_id, delay_ms = delay.as_millis() as u64, "Retry scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = me.execute_task(task_id, &actor).await {
                tracing::warn!(task = %task_id, error = %e, "Retry attempt did not start");
            }
        });
    }

    /// After a terminal run, put a recurring task back on its schedule.
    async fn rearm_recurring(&self, task: &mut Task) -> Result<(), Error> {
        let Some(expr) = task.schedule.clone() else {
            return Ok(());
        };
        if !task.status.can_transition_to(TaskStatus::Scheduled) {
            return Ok(());
        }
        let next = crate::scheduler::next_fire_time(&expr)?;
        task.next_run_at = Some(next);
        self.store.update_task(task).await?;
        self.transition(task, TaskStatus::Scheduled).await?;
        tracing::info!(task = %task.id, next_run = %next, "Recurring task re-armed");
        Ok(())
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}
