//! End-to-end orchestration scenarios over the in-memory store and a stub
//! agent transport: lifecycle transitions, dependency gating, retries,
//! timeouts, cancellation, and bulk semantics.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use conductor::config::OrchestratorConfig;
use conductor::error::{BulkError, Error, ExecutionError, TaskError, TransportError};
use conductor::events::{EventHub, HubEvent, Topic};
use conductor::exec::{
    AgentTransport, BulkOrchestrator, ExecutionCoordinator, InvokeOutcome, InvokeRequest,
};
use conductor::store::{MemoryStore, Store};
use conductor::tasks::graph::DependencyGraph;
use conductor::tasks::model::{ExecutionStatus, Task, TaskStatus};
use conductor::tasks::{Actor, Authorizer, OwnerOrgAuthorizer};

/// How the stub transport behaves per invocation.
enum Behavior {
    /// Return output successfully.
    Succeed,
    /// Return an agent-side error every time.
    FailAlways,
    /// Never return (for timeout and cancellation tests).
    Hang,
}

/// Stub agent transport (no real agents).
struct StubTransport {
    behavior: Behavior,
    delay: Duration,
    calls: AtomicU32,
}

impl StubTransport {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentTransport for StubTransport {
    async fn invoke(&self, _request: InvokeRequest) -> Result<InvokeOutcome, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        match self.behavior {
            Behavior::Succeed => Ok(InvokeOutcome {
                output: Some("done".to_string()),
                tokens_used: 5,
                exit_code: Some(0),
                error: None,
                tool_calls: vec![],
            }),
            Behavior::FailAlways => Ok(InvokeOutcome {
                error: Some("agent exploded".to_string()),
                ..InvokeOutcome::default()
            }),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn cancel(&self, _execution_id: Uuid) -> Result<(), TransportError> {
        Ok(())
    }
}

struct Harness {
    store: Arc<dyn Store>,
    hub: Arc<EventHub>,
    coordinator: Arc<ExecutionCoordinator>,
    bulk: BulkOrchestrator,
    transport: Arc<StubTransport>,
}

fn harness(transport: StubTransport) -> Harness {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let hub = Arc::new(EventHub::new());
    let authorizer: Arc<dyn Authorizer> = Arc::new(OwnerOrgAuthorizer);
    let transport = Arc::new(transport);
    let graph = DependencyGraph::new(Arc::clone(&store), Arc::clone(&authorizer));
    let config = OrchestratorConfig::default();

    let coordinator = ExecutionCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&transport) as Arc<dyn AgentTransport>,
        Arc::clone(&hub),
        graph,
        Arc::clone(&authorizer),
        &config,
    );
    let bulk = BulkOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&coordinator),
        authorizer,
        config,
    );

    Harness {
        store,
        hub,
        coordinator,
        bulk,
        transport,
    }
}

fn actor() -> Actor {
    Actor::new("u1", "org1")
}

async fn seed_task(store: &Arc<dyn Store>) -> Task {
    let task = Task::new("u1", "org1", "srv1", "agent1", "T", "run it");
    store.insert_task(&task).await.unwrap();
    task
}

async fn task_status(store: &Arc<dyn Store>, id: Uuid) -> TaskStatus {
    store.get_task(id).await.unwrap().unwrap().status
}

// ── Lifecycle ───────────────────────────────────────────────────────────

#[tokio::test]
async fn draft_task_runs_through_full_lifecycle() {
    let h = harness(StubTransport::new(Behavior::Succeed));
    let task = seed_task(&h.store).await;
    let mut sub = h.hub.subscribe(Topic::Agent("agent1".into()));

    let execution = h.coordinator.execute_task(task.id, &actor()).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output.as_deref(), Some("done"));
    assert_eq!(execution.tokens_used, 5);
    assert_eq!(task_status(&h.store, task.id).await, TaskStatus::Completed);

    let stored = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.run_count, 1);
    assert!(stored.last_run_at.is_some());

    // The observer saw every transition, in publish order.
    let mut transitions = Vec::new();
    while let Some(event) = sub.try_recv() {
        if let HubEvent::TaskStatus { from, to, .. } = event {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (TaskStatus::Draft, TaskStatus::Pending),
            (TaskStatus::Pending, TaskStatus::Queued),
            (TaskStatus::Queued, TaskStatus::Running),
            (TaskStatus::Running, TaskStatus::Completed),
        ]
    );
}

#[tokio::test]
async fn cancel_after_completion_is_invalid_transition() {
    let h = harness(StubTransport::new(Behavior::Succeed));
    let task = seed_task(&h.store).await;

    h.coordinator.execute_task(task.id, &actor()).await.unwrap();
    let err = h.coordinator.cancel_task(task.id, &actor()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Task(TaskError::InvalidTransition { .. })
    ));
    assert_eq!(task_status(&h.store, task.id).await, TaskStatus::Completed);
}

#[tokio::test]
async fn completed_task_is_not_executable_again() {
    let h = harness(StubTransport::new(Behavior::Succeed));
    let task = seed_task(&h.store).await;

    h.coordinator.execute_task(task.id, &actor()).await.unwrap();
    let err = h.coordinator.execute_task(task.id, &actor()).await.unwrap_err();
    assert!(matches!(err, Error::Task(TaskError::NotExecutable { .. })));
}

#[tokio::test]
async fn cross_org_actor_sees_not_found() {
    let h = harness(StubTransport::new(Behavior::Succeed));
    let task = seed_task(&h.store).await;

    let outsider = Actor::new("eve", "other-org");
    let err = h
        .coordinator
        .execute_task(task.id, &outsider)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Task(TaskError::NotFound { .. })));
}

// ── Dependencies ────────────────────────────────────────────────────────

#[tokio::test]
async fn dependent_task_gated_until_dependency_completes() {
    let h = harness(StubTransport::new(Behavior::Succeed));
    let a = seed_task(&h.store).await;
    let b = {
        let task = Task::new("u1", "org1", "srv1", "agent1", "B", "after A")
            .with_dependencies(vec![a.id]);
        h.store.insert_task(&task).await.unwrap();
        task
    };

    let err = h.coordinator.execute_task(b.id, &actor()).await.unwrap_err();
    match err {
        Error::Task(TaskError::NotReady { unmet, .. }) => assert_eq!(unmet, vec![a.id]),
        other => panic!("expected NotReady, got {other}"),
    }
    // The failed admission left B untouched.
    assert_eq!(task_status(&h.store, b.id).await, TaskStatus::Draft);

    h.coordinator.execute_task(a.id, &actor()).await.unwrap();

    // Retried after the dependency completed, it goes straight through.
    let execution = h.coordinator.execute_task(b.id, &actor()).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
}

// ── Retry policy ────────────────────────────────────────────────────────

#[tokio::test]
async fn failing_task_retried_exactly_max_retries_times() {
    let h = harness(StubTransport::new(Behavior::FailAlways));
    let mut task = Task::new("u1", "org1", "srv1", "agent1", "T", "p").with_retries(2, 25);
    h.store.insert_task(&task).await.unwrap();

    let execution = h.coordinator.execute_task(task.id, &actor()).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);

    // Two self-scheduled retries land asynchronously, then it stays failed.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.transport.call_count(), 3);

    task = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.run_count, 3);

    // No further attempts after settling.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.transport.call_count(), 3);
}

#[tokio::test]
async fn retry_execution_rejects_non_failed_outcomes() {
    let h = harness(StubTransport::new(Behavior::Succeed));
    let task = seed_task(&h.store).await;

    let execution = h.coordinator.execute_task(task.id, &actor()).await.unwrap();
    let err = h
        .coordinator
        .retry_execution(execution.id, &actor())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Execution(ExecutionError::NotFailed { .. })
    ));
}

#[tokio::test]
async fn retry_execution_reruns_failed_task() {
    let h = harness(StubTransport::new(Behavior::FailAlways));
    let task = Task::new("u1", "org1", "srv1", "agent1", "T", "p");
    h.store.insert_task(&task).await.unwrap();

    let failed = h.coordinator.execute_task(task.id, &actor()).await.unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(task_status(&h.store, task.id).await, TaskStatus::Failed);

    let second = h
        .coordinator
        .retry_execution(failed.id, &actor())
        .await
        .unwrap();
    assert_ne!(second.id, failed.id);
    assert_eq!(h.transport.call_count(), 2);
}

#[tokio::test]
async fn unknown_execution_cannot_be_retried() {
    let h = harness(StubTransport::new(Behavior::Succeed));
    let err = h
        .coordinator
        .retry_execution(Uuid::new_v4(), &actor())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Execution(ExecutionError::NotFound { .. })
    ));
}

// ── Timeout & cancellation ──────────────────────────────────────────────

#[tokio::test]
async fn hung_agent_times_out_and_fails_the_task() {
    let h = harness(StubTransport::new(Behavior::Hang));
    let task = Task::new("u1", "org1", "srv1", "agent1", "T", "p").with_timeout_ms(50);
    h.store.insert_task(&task).await.unwrap();

    let execution = h.coordinator.execute_task(task.id, &actor()).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Timeout);
    assert!(execution.error.unwrap().contains("timed out"));
    assert_eq!(task_status(&h.store, task.id).await, TaskStatus::Failed);
}

#[tokio::test]
async fn cancelling_a_running_task_updates_both_records() {
    let h = harness(StubTransport::new(Behavior::Hang));
    let task = seed_task(&h.store).await;

    let coordinator = Arc::clone(&h.coordinator);
    let task_id = task.id;
    let run = tokio::spawn(async move { coordinator.execute_task(task_id, &actor()).await });

    // Wait for the run to reach Running.
    for _ in 0..50 {
        if task_status(&h.store, task.id).await == TaskStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(task_status(&h.store, task.id).await, TaskStatus::Running);

    let cancelled = h.coordinator.cancel_task(task.id, &actor()).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    // The in-flight executor observed the cancel and returned the record.
    let execution = run.await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);

    // Cancelled runs are never retried.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.transport.call_count(), 1);
}

#[tokio::test]
async fn concurrent_executes_have_a_single_winner() {
    let h = harness(StubTransport::new(Behavior::Succeed).with_delay(Duration::from_millis(100)));
    let task = seed_task(&h.store).await;

    let c1 = Arc::clone(&h.coordinator);
    let c2 = Arc::clone(&h.coordinator);
    let id = task.id;
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { c1.execute_task(id, &actor()).await }),
        tokio::spawn(async move { c2.execute_task(id, &actor()).await }),
    );
    let results = [r1.unwrap(), r2.unwrap()];

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(Error::Task(TaskError::NotExecutable { .. }))
    )));
    assert_eq!(h.transport.call_count(), 1);
}

// ── Bulk operations ─────────────────────────────────────────────────────

#[tokio::test]
async fn bulk_execute_rejects_oversized_batches_up_front() {
    let h = harness(StubTransport::new(Behavior::Succeed));
    let ids: Vec<Uuid> = (0..21).map(|_| Uuid::new_v4()).collect();
    let err = h.bulk.bulk_execute(ids, true, &actor()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Bulk(BulkError::BatchTooLarge { size: 21, max: 20 })
    ));
    assert_eq!(h.transport.call_count(), 0);
}

#[tokio::test]
async fn bulk_with_nothing_eligible_fails_distinctly() {
    let h = harness(StubTransport::new(Behavior::Succeed));
    let task = seed_task(&h.store).await;
    h.coordinator.execute_task(task.id, &actor()).await.unwrap();

    // A completed task is not executable; the batch has nothing to do.
    let err = h
        .bulk
        .bulk_execute(vec![task.id, Uuid::new_v4()], true, &actor())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Bulk(BulkError::NoEligibleItems)));
}

#[tokio::test]
async fn bulk_execute_sequential_skips_dependent_of_failed_task() {
    let h = harness(StubTransport::new(Behavior::FailAlways));
    let a = seed_task(&h.store).await;
    let b = {
        let task = Task::new("u1", "org1", "srv1", "agent1", "B", "after A")
            .with_dependencies(vec![a.id]);
        h.store.insert_task(&task).await.unwrap();
        task
    };

    let report = h
        .bulk
        .bulk_execute(vec![a.id, b.id], true, &actor())
        .await
        .unwrap();

    assert_eq!(report.accepted, vec![a.id, b.id]);
    assert_eq!(report.outcomes.len(), 2);
    assert!(!report.outcomes[0].success);
    // B was reported, not silently executed out of order.
    assert!(!report.outcomes[1].success);
    assert!(
        report.outcomes[1]
            .detail
            .as_deref()
            .unwrap()
            .contains("unsatisfied"),
    );
    assert_eq!(h.transport.call_count(), 1);
}

#[tokio::test]
async fn bulk_execute_parallel_settles_every_item() {
    let h = harness(StubTransport::new(Behavior::Succeed).with_delay(Duration::from_millis(30)));
    let a = seed_task(&h.store).await;
    let b = seed_task(&h.store).await;
    let c = seed_task(&h.store).await;

    let report = h
        .bulk
        .bulk_execute(vec![a.id, b.id, c.id], false, &actor())
        .await
        .unwrap();

    assert_eq!(report.succeeded(), 3);
    assert_eq!(h.transport.call_count(), 3);
    for id in [a.id, b.id, c.id] {
        assert_eq!(task_status(&h.store, id).await, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn bulk_execute_isolates_per_item_failures() {
    let h = harness(StubTransport::new(Behavior::Succeed));
    let good = seed_task(&h.store).await;
    let missing = Uuid::new_v4();

    let report = h
        .bulk
        .bulk_execute(vec![good.id, missing], true, &actor())
        .await
        .unwrap();

    assert_eq!(report.accepted, vec![good.id]);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].id, missing);
    assert_eq!(report.rejected[0].reason, "not found");
    assert_eq!(report.succeeded(), 1);
    assert_eq!(task_status(&h.store, good.id).await, TaskStatus::Completed);
}

#[tokio::test]
async fn bulk_cancel_reports_ineligible_statuses() {
    let h = harness(StubTransport::new(Behavior::Hang));
    let running = seed_task(&h.store).await;
    let draft = seed_task(&h.store).await;

    let coordinator = Arc::clone(&h.coordinator);
    let running_id = running.id;
    tokio::spawn(async move {
        let _ = coordinator.execute_task(running_id, &actor()).await;
    });
    for _ in 0..50 {
        if task_status(&h.store, running.id).await == TaskStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let report = h
        .bulk
        .bulk_cancel(vec![running.id, draft.id], &actor())
        .await
        .unwrap();

    // Draft is not cancellable; the running task went down.
    assert_eq!(report.accepted, vec![running.id]);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].id, draft.id);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(task_status(&h.store, running.id).await, TaskStatus::Cancelled);
    assert_eq!(task_status(&h.store, draft.id).await, TaskStatus::Draft);
}

#[tokio::test]
async fn bulk_delete_requires_force_for_running_tasks() {
    let h = harness(StubTransport::new(Behavior::Hang));
    let running = seed_task(&h.store).await;

    let coordinator = Arc::clone(&h.coordinator);
    let running_id = running.id;
    tokio::spawn(async move {
        let _ = coordinator.execute_task(running_id, &actor()).await;
    });
    for _ in 0..50 {
        if task_status(&h.store, running.id).await == TaskStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Without force the running task is rejected, untouched.
    let err = h
        .bulk
        .bulk_delete(vec![running.id], false, &actor())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Bulk(BulkError::NoEligibleItems)));
    assert_eq!(task_status(&h.store, running.id).await, TaskStatus::Running);

    // Force cancels the running work, then deletes.
    let report = h
        .bulk
        .bulk_delete(vec![running.id], true, &actor())
        .await
        .unwrap();
    assert_eq!(report.succeeded(), 1);
    assert!(h.store.get_task(running.id).await.unwrap().is_none());
}

#[tokio::test]
async fn bulk_set_status_respects_the_transition_table() {
    let h = harness(StubTransport::new(Behavior::Succeed));
    let draft = seed_task(&h.store).await;
    let completed = seed_task(&h.store).await;
    h.coordinator
        .execute_task(completed.id, &actor())
        .await
        .unwrap();

    let report = h
        .bulk
        .bulk_set_status(vec![draft.id, completed.id], TaskStatus::Pending, &actor())
        .await
        .unwrap();

    assert_eq!(report.accepted, vec![draft.id]);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(task_status(&h.store, draft.id).await, TaskStatus::Pending);
    assert_eq!(
        task_status(&h.store, completed.id).await,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn bulk_retry_requeues_only_failed_tasks() {
    let h = harness(StubTransport::new(Behavior::FailAlways));
    let failed = seed_task(&h.store).await;
    h.coordinator.execute_task(failed.id, &actor()).await.unwrap();
    let draft = seed_task(&h.store).await;

    let report = h
        .bulk
        .bulk_retry(vec![failed.id, draft.id], &actor())
        .await
        .unwrap();

    assert_eq!(report.accepted, vec![failed.id]);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].id, draft.id);
    // The re-run also failed, and that is reported per item, not thrown.
    assert_eq!(report.succeeded(), 0);
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(h.transport.call_count(), 2);
}

// ── Ad hoc prompts ──────────────────────────────────────────────────────

#[tokio::test]
async fn execute_prompt_is_a_stateless_passthrough() {
    let h = harness(StubTransport::new(Behavior::Succeed));

    let outcome = h
        .coordinator
        .execute_prompt("srv1", "agent1", "quick question", None)
        .await
        .unwrap();
    assert_eq!(outcome.output.as_deref(), Some("done"));

    // No task rows were created.
    let tasks = h
        .store
        .list_tasks(&conductor::store::TaskFilter::default())
        .await
        .unwrap();
    assert!(tasks.is_empty());
}

#[tokio::test]
async fn chat_prompt_streams_start_chunk_end() {
    let h = harness(StubTransport::new(Behavior::Succeed));
    let mut sub = h.hub.subscribe(Topic::Chat("s1".into()));

    h.coordinator
        .execute_prompt("srv1", "agent1", "hello", Some("s1"))
        .await
        .unwrap();

    assert!(matches!(
        sub.recv().await.unwrap(),
        HubEvent::ChatStart { .. }
    ));
    match sub.recv().await.unwrap() {
        HubEvent::ChatChunk {
            delta, accumulated, ..
        } => {
            assert_eq!(delta, "done");
            assert_eq!(accumulated, "done");
        }
        other => panic!("expected chunk, got {other:?}"),
    }
    match sub.recv().await.unwrap() {
        HubEvent::ChatEnd { content, .. } => assert_eq!(content, "done"),
        other => panic!("expected end, got {other:?}"),
    }
}
