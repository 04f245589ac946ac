//! Development cycle integration tests.
//!
//! These tests drive cycles through their phases, both directly through the
//! state machine and end to end through the coordinator, including phase
//! retries, human queries and cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use conductor::core::ItemStatus;
use conductor::events::{CycleEvent, Notification};
use conductor::orchestration::{
    BlockerCategory, Coordinator, ExecutionOutcome, ExecutionRequest, Executor, ProjectPhase,
};
use conductor::state::{MemoryStore, Store};
use conductor::workflow::{
    Cycle, CyclePhase, CycleStatus, PhaseOutcome, Resolution, Transition, MAX_PHASE_ATTEMPTS,
};
use conductor::{Error, Result, WorkItemId};

use crate::fixtures::{
    create_test_config, create_test_coordinator, create_test_memory_coordinator, failure, project,
    success, task, transport_error, ScriptedExecutor,
};

fn create_test_cycle() -> Cycle {
    Cycle::new(project("cycles"), WorkItemId::new(), "add search", "search returns hits", Utc::now())
}

fn succeed(cycle: &mut Cycle) -> Transition {
    let now = Utc::now();
    cycle.begin_attempt(now).unwrap();
    cycle.apply(PhaseOutcome::succeeded(vec!["ok".to_string()]), now).unwrap()
}

/// Test: phase retry budget
/// Given a cycle at Implement
/// When Implement fails with a retryable error three times
/// Then the cycle is Failed at Implement
#[test]
fn test_implement_fails_after_three_attempts() {
    let mut cycle = create_test_cycle();
    succeed(&mut cycle);
    succeed(&mut cycle);
    assert_eq!(cycle.phase, CyclePhase::Implement);

    let mut transitions = Vec::new();
    for _ in 0..MAX_PHASE_ATTEMPTS {
        let now = Utc::now();
        cycle.begin_attempt(now).unwrap();
        transitions.push(
            cycle
                .apply(PhaseOutcome::failed("tests still red", true), now)
                .unwrap(),
        );
    }

    assert_eq!(
        transitions[..2],
        [
            Transition::Retrying {
                phase: CyclePhase::Implement,
                attempt: 1
            },
            Transition::Retrying {
                phase: CyclePhase::Implement,
                attempt: 2
            },
        ]
    );
    assert!(matches!(
        transitions[2],
        Transition::Failed {
            phase: CyclePhase::Implement,
            ..
        }
    ));
    assert_eq!(cycle.status, CycleStatus::Failed);
    assert_eq!(cycle.phase, CyclePhase::Implement);
    assert!(cycle.begin_attempt(Utc::now()).is_err());
}

#[test]
fn test_full_cycle_records_history() {
    let mut cycle = create_test_cycle();
    let mut last = None;
    for _ in 0..5 {
        last = Some(succeed(&mut cycle));
    }

    assert_eq!(last, Some(Transition::Completed));
    assert_eq!(cycle.status, CycleStatus::Completed);
    let phases: Vec<CyclePhase> = cycle.phase_history.iter().map(|r| r.phase).collect();
    assert_eq!(
        phases,
        vec![
            CyclePhase::Define,
            CyclePhase::Test,
            CyclePhase::Implement,
            CyclePhase::Refactor,
            CyclePhase::Review,
            CyclePhase::Completed,
        ]
    );
    assert!(cycle.phase_history.iter().all(|r| r.completed_at.is_some()));
}

#[tokio::test]
async fn test_coordinator_emits_phase_events_in_order() {
    let (coordinator, _executor, _store) = create_test_memory_coordinator();
    let mut rx = coordinator.events().subscribe();
    let p = project("events");
    coordinator.submit(&p, task("search")).await.unwrap();

    let report = coordinator.drive_project(&p).await.unwrap();
    assert_eq!(report.phase, ProjectPhase::Completed);

    let mut started = Vec::new();
    let mut completed = false;
    while let Ok(notification) = rx.try_recv() {
        match notification {
            Notification::Cycle(CycleEvent::PhaseStarted { phase, .. }) => started.push(phase),
            Notification::Cycle(CycleEvent::Completed { .. }) => completed = true,
            _ => {}
        }
    }
    assert_eq!(
        started,
        vec![
            CyclePhase::Define,
            CyclePhase::Test,
            CyclePhase::Implement,
            CyclePhase::Refactor,
            CyclePhase::Review,
        ]
    );
    assert!(completed);
}

/// Test: ambiguous output blocks the cycle
/// Given an executor that reports an ambiguity at Test
/// When the project is driven
/// Then it is Blocked on a human query until the query is answered
#[tokio::test]
async fn test_query_blocks_and_answer_resumes_same_phase() {
    let executor = Arc::new(ScriptedExecutor::new(vec![
        Ok(success()),
        failure("Which approach should be used: REST or GraphQL?"),
    ]));
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let coordinator = create_test_coordinator(executor.clone(), store.clone(), create_test_config());
    let p = project("api");
    coordinator.submit(&p, task("endpoints")).await.unwrap();

    let report = coordinator.drive_project(&p).await.unwrap();
    assert_eq!(report.phase, ProjectPhase::Blocked);
    assert!(report.is_blocked());
    assert_eq!(report.blockers[0].category, BlockerCategory::HumanInput);
    let query = &report.pending_queries[0];
    assert!(query.question.contains("REST or GraphQL"));
    assert_eq!(report.active_cycles[0].phase, CyclePhase::Test);

    // The blocking query is persisted with the project.
    let snapshot = store.load(&p).await.unwrap().unwrap();
    assert_eq!(snapshot.queries.len(), 1);

    let report = coordinator
        .resolve_query(&p, query.id, Resolution::Answer("GraphQL".to_string()))
        .await
        .unwrap();
    assert_eq!(report.phase, ProjectPhase::Completed);

    let requests = executor.requests();
    assert_eq!(requests.len(), 6);
    assert_eq!(requests[2].phase, Some(CyclePhase::Test));
    assert!(requests[2].working_context.contains("GraphQL"));
}

#[tokio::test]
async fn test_dismissed_query_resumes_without_guidance() {
    let executor = Arc::new(ScriptedExecutor::new(vec![failure(
        "The requirements are unclear, please clarify the scope",
    )]));
    let coordinator = create_test_coordinator(executor.clone(), Arc::new(MemoryStore::new()), create_test_config());
    let p = project("scope");
    coordinator.submit(&p, task("scope")).await.unwrap();

    let report = coordinator.drive_project(&p).await.unwrap();
    let query_id = report.pending_queries[0].id;
    let report = coordinator
        .resolve_query(&p, query_id, Resolution::Dismiss)
        .await
        .unwrap();
    assert_eq!(report.phase, ProjectPhase::Completed);
    assert!(report.pending_queries.is_empty());
}

#[tokio::test]
async fn test_transport_errors_exhaust_phase_then_retry_item() {
    let executor = Arc::new(ScriptedExecutor::new(vec![
        transport_error(),
        transport_error(),
        transport_error(),
    ]));
    let coordinator = create_test_coordinator(executor.clone(), Arc::new(MemoryStore::new()), create_test_config());
    let p = project("flaky");
    coordinator.submit(&p, task("flaky")).await.unwrap();

    let report = coordinator.drive_project(&p).await.unwrap();
    assert_eq!(executor.calls(), 3);
    assert_eq!(report.scheduled_retries, 1);
    assert_eq!(report.phase, ProjectPhase::Idle);

    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    let report = coordinator.report(&p).await.unwrap();
    assert_eq!(report.phase, ProjectPhase::Completed);
    assert_eq!(executor.calls(), 8);
    assert_eq!(report.queue_stats.total_retries, 1);
    assert_eq!(report.queue_stats.total_completed, 1);
}

#[tokio::test]
async fn test_cancel_pending_item_aborts_nothing_else() {
    let (coordinator, executor, _store) = create_test_memory_coordinator();
    let p = project("cancel");
    let keep = coordinator.submit(&p, task("keep")).await.unwrap();
    let drop = coordinator.submit(&p, task("drop")).await.unwrap();

    assert_eq!(coordinator.cancel(&p, drop).await.unwrap(), ItemStatus::Pending);
    let report = coordinator.drive_project(&p).await.unwrap();

    assert_eq!(report.phase, ProjectPhase::Completed);
    assert_eq!(executor.calls(), 5);
    assert!(executor.requests().iter().all(|r| r.item_id == keep));
    assert_eq!(report.queue_stats.total_cancelled, 1);
}

/// Panics inside every execution.
struct PanickingExecutor;

#[async_trait]
impl Executor for PanickingExecutor {
    async fn execute(&self, _request: ExecutionRequest, _cancel: CancellationToken) -> Result<ExecutionOutcome> {
        panic!("worker exploded")
    }
}

/// Runs until cancelled, signalling once it has started.
#[derive(Default)]
struct HangingExecutor {
    started: Notify,
}

#[async_trait]
impl Executor for HangingExecutor {
    async fn execute(&self, _request: ExecutionRequest, cancel: CancellationToken) -> Result<ExecutionOutcome> {
        self.started.notify_one();
        cancel.cancelled().await;
        Err(Error::Cancelled)
    }
}

/// Test: executor panic at the loop boundary
/// Given an executor that panics during a phase
/// When the project is driven twice
/// Then it reports an Internal blocker, and the aborted executions leave no
/// reserved tokens behind
#[tokio::test]
async fn test_executor_panic_is_contained_and_releases_reservations() {
    let coordinator = Coordinator::new(create_test_config(), Arc::new(PanickingExecutor), Arc::new(MemoryStore::new()));
    let p = project("panics");
    coordinator
        .submit(&p, task("explode").estimated_tokens(4000))
        .await
        .unwrap();

    for _ in 0..2 {
        let report = coordinator.drive_project(&p).await.unwrap();
        assert_eq!(report.phase, ProjectPhase::Blocked);
        assert_eq!(report.blockers[0].category, BlockerCategory::Internal);
        assert!(report.blockers[0].reason.contains("worker exploded"));
        assert_eq!(report.budget.used_tokens, 0);
        assert_eq!(report.active_agents, 0);
    }

    // The cycle is intact and still at its first phase.
    let report = coordinator.report(&p).await.unwrap();
    assert_eq!(report.active_cycles.len(), 1);
    assert_eq!(report.active_cycles[0].phase, CyclePhase::Define);
    assert_eq!(report.budget.used_tokens, 0);
}

/// Test: cancel while a phase is executing
/// Given an execution that runs until cancelled
/// When the item is cancelled mid-execution
/// Then the execution stops, the item is Cancelled, the cycle is aborted and
/// no tokens are charged
#[tokio::test]
async fn test_cancel_during_execution_stops_work() {
    let executor = Arc::new(HangingExecutor::default());
    let coordinator = Coordinator::new(create_test_config(), executor.clone(), Arc::new(MemoryStore::new()));
    let p = project("cancel-running");
    let id = coordinator.submit(&p, task("long job")).await.unwrap();
    // Start the cycle; the first phase runs on the next iteration.
    assert_eq!(coordinator.run_project(&p).await.unwrap().phase, ProjectPhase::Running);

    let runner = tokio::spawn({
        let coordinator = coordinator.clone();
        let p = p.clone();
        async move { coordinator.run_project(&p).await }
    });
    tokio::time::timeout(Duration::from_secs(5), executor.started.notified())
        .await
        .unwrap();

    assert_eq!(coordinator.cancel(&p, id).await.unwrap(), ItemStatus::Processing);
    let report = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(report.queue_stats.total_cancelled, 1);
    assert!(report.active_cycles.is_empty());
    assert_eq!(report.active_agents, 0);
    assert_eq!(report.budget.used_tokens, 0);
    assert_eq!(report.budget.requests_last_minute, 0);
}
