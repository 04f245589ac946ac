//! Admission and budget integration tests.
//!
//! These tests verify token caps, request rate windows, reservations under
//! concurrent admission, cost-aware assignment and how a project reports
//! budget exhaustion.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::join_all;
use tokio::sync::Mutex;

use conductor::admission::{AdmissionController, BudgetLimits, BudgetStatus, ProjectLoad, Refusal};
use conductor::core::{Priority, WorkItem};
use conductor::events::{BudgetEvent, EventBus, Notification};
use conductor::state::MemoryStore;
use conductor::Error;
use conductor::orchestration::{
    AssignmentContext, BlockerCategory, CostBudget, ProjectPhase, ProjectRequirements, Strategy,
    WorkerCapability,
};

use crate::fixtures::{
    create_test_config, create_test_coordinator, create_test_memory_coordinator, create_test_queue,
    create_test_registry, project, task, ScriptedExecutor,
};

fn create_test_controller(limits: BudgetLimits) -> AdmissionController {
    AdmissionController::new(project("budget"), limits)
}

fn idle() -> ProjectLoad {
    ProjectLoad::default()
}

/// Test: daily cap
/// Given a 1000 token daily cap
/// When two 600 token requests arrive
/// Then the first is admitted and the second refused
#[test]
fn test_daily_cap_refuses_second_request() {
    let now = Utc::now();
    let mut controller = create_test_controller(BudgetLimits {
        daily_token_cap: 1000,
        ..BudgetLimits::default()
    });

    let first = controller.admit(600, idle(), now).unwrap();
    controller.settle(first, 400, 200, true, now);

    let refused = controller.admit(600, idle(), now).unwrap_err();
    assert!(!refused.allowed);
    assert_eq!(refused.refusal, Some(Refusal::DailyBudget));
    assert!(refused.reason.unwrap().contains("Daily token limit"));
    assert!(refused.reset_at.unwrap() > now);
}

#[test]
fn test_outstanding_reservation_counts_against_cap() {
    let now = Utc::now();
    let mut controller = create_test_controller(BudgetLimits {
        daily_token_cap: 1000,
        ..BudgetLimits::default()
    });

    let held = controller.admit(600, idle(), now).unwrap();
    assert!(controller.admit(600, idle(), now).is_err());

    controller.release(held);
    assert!(controller.admit(600, idle(), now).is_ok());
}

/// Test: minute rate window
/// Given N requests per minute
/// When N requests have been recorded
/// Then request N+1 is refused until the window slides
#[test]
fn test_minute_rate_refuses_request_over_limit() {
    let now = Utc::now();
    let per_minute = 5;
    let mut controller = create_test_controller(BudgetLimits {
        requests_per_minute: per_minute,
        ..BudgetLimits::default()
    });

    for _ in 0..per_minute {
        let reservation = controller.admit(10, idle(), now).unwrap();
        controller.settle(reservation, 5, 5, true, now);
    }

    let refused = controller.admit(10, idle(), now).unwrap_err();
    assert_eq!(refused.refusal, Some(Refusal::MinuteRate));
    let reset_at = refused.reset_at.unwrap();
    assert!(reset_at <= now + Duration::minutes(1));

    let later = now + Duration::seconds(61);
    assert!(controller.can_admit(10, idle(), later).allowed);
}

#[test]
fn test_load_limits() {
    let now = Utc::now();
    let controller = create_test_controller(BudgetLimits {
        max_parallel_workers: 2,
        max_queue_depth: 3,
        ..BudgetLimits::default()
    });

    let busy = ProjectLoad {
        active_workers: 2,
        queue_depth: 0,
    };
    assert_eq!(
        controller.can_admit(10, busy, now).refusal,
        Some(Refusal::ParallelWorkers)
    );

    let deep = ProjectLoad {
        active_workers: 0,
        queue_depth: 4,
    };
    assert_eq!(controller.can_admit(10, deep, now).refusal, Some(Refusal::QueueDepth));

    let at_limit = ProjectLoad {
        active_workers: 1,
        queue_depth: 3,
    };
    assert!(controller.can_admit(10, at_limit, now).allowed);
}

#[tokio::test]
async fn test_concurrent_admissions_never_overspend() {
    let controller = Arc::new(Mutex::new(create_test_controller(BudgetLimits {
        daily_token_cap: 1000,
        ..BudgetLimits::default()
    })));

    let attempts = (0..20).map(|_| {
        let controller = Arc::clone(&controller);
        async move { controller.lock().await.admit(150, ProjectLoad::default(), Utc::now()).is_ok() }
    });
    let admitted = join_all(attempts).await.into_iter().filter(|ok| *ok).count();

    assert_eq!(admitted, 6);
    let report = controller.lock().await.status(Utc::now());
    assert!(report.used_tokens <= 1000);
}

#[tokio::test]
async fn test_status_transitions_publish_events() {
    let events = EventBus::new(16);
    let mut rx = events.subscribe();
    let now = Utc::now();
    let mut controller = create_test_controller(BudgetLimits {
        daily_token_cap: 100,
        ..BudgetLimits::default()
    })
    .with_events(events);

    controller.record_usage(85, 0, now);
    assert_eq!(controller.status(now).status, BudgetStatus::Warning);
    assert!(matches!(
        rx.recv().await.unwrap(),
        Notification::Budget(BudgetEvent::Warning { used_tokens: 85, .. })
    ));

    controller.record_usage(15, 0, now);
    let report = controller.status(now);
    assert_eq!(report.status, BudgetStatus::Blocked);
    assert_eq!(report.remaining_tokens, 0);
    assert!(matches!(
        rx.recv().await.unwrap(),
        Notification::Budget(BudgetEvent::Blocked { .. })
    ));
}

/// Test: cost-optimized assignment
/// Given a budget of 100 tokens and two workers that would each cost 60
/// When two items are planned
/// Then only the first is assigned and the second warns
#[test]
fn test_cost_optimized_assignment_respects_budget() {
    let now = Utc::now();
    let registry = create_test_registry(
        vec![
            WorkerCapability::new("alpha", &["general"]).with_history(1000.0, 0.9),
            WorkerCapability::new("beta", &["general"]).with_history(1000.0, 0.9),
        ],
        now,
    );
    let mut queue = create_test_queue(5);
    queue.enqueue(task("first").estimated_tokens(60)).unwrap();
    queue.enqueue(task("second").estimated_tokens(60)).unwrap();
    let items: Vec<WorkItem> = queue.ready_items().into_iter().cloned().collect();

    let plan = Strategy::CostOptimized.assign(&AssignmentContext {
        agents: registry.available_agents(now),
        items: items.clone(),
        requirements: ProjectRequirements {
            urgent: false,
            required_skills: BTreeSet::new(),
            budget: Some(CostBudget {
                max_tokens: 100,
                cost_per_token: 1.0,
            }),
        },
        now,
    });

    assert_eq!(plan.assignments.len(), 1);
    assert_eq!(plan.assignments[0].item_id, items[0].id);
    assert_eq!(plan.estimated_cost, 60.0);
    assert!(plan.warnings.iter().any(|w| w.contains("exceeds budget")));
}

#[test]
fn test_priority_first_places_urgent_work_on_best_worker() {
    let now = Utc::now();
    let registry = create_test_registry(
        vec![
            WorkerCapability::new("steady", &["general"]).with_history(1000.0, 0.99),
            WorkerCapability::new("flaky", &["general"]).with_history(1000.0, 0.5),
        ],
        now,
    );
    let steady = registry
        .instances()
        .find(|i| i.capability_id.as_str() == "steady")
        .unwrap()
        .id;
    let mut queue = create_test_queue(5);
    queue.enqueue(task("routine")).unwrap();
    let urgent = queue.enqueue(task("urgent").priority(Priority::Critical)).unwrap();
    let items: Vec<WorkItem> = queue.ready_items().into_iter().cloned().collect();

    let plan = Strategy::PriorityFirst.assign(&AssignmentContext {
        agents: registry.available_agents(now),
        items,
        requirements: ProjectRequirements::default(),
        now,
    });

    assert_eq!(plan.assignments.len(), 2);
    assert_eq!(plan.worker_for(&urgent), Some(steady));
}

#[tokio::test]
async fn test_project_blocks_on_exhausted_budget_until_limits_raised() {
    let (coordinator, _executor, _store) = create_test_memory_coordinator();
    let p = project("tight");
    coordinator.submit(&p, task("login").estimated_tokens(15)).await.unwrap();
    coordinator
        .set_limits(
            &p,
            BudgetLimits {
                daily_token_cap: 30,
                ..BudgetLimits::default()
            },
        )
        .await
        .unwrap();

    let report = coordinator.drive_project(&p).await.unwrap();
    assert_eq!(report.phase, ProjectPhase::Blocked);
    assert!(report
        .blockers
        .iter()
        .any(|b| b.category == BlockerCategory::Budget));
    assert_eq!(report.active_agents, 0);

    coordinator.set_limits(&p, BudgetLimits::default()).await.unwrap();
    let report = coordinator.drive_project(&p).await.unwrap();
    assert_eq!(report.phase, ProjectPhase::Completed);
}

/// Test: queue depth limit
/// Given a project limited to two queued items
/// When a third item is submitted
/// Then admission refuses it with the queue depth reason, and accepts it
/// again once an item leaves the queue
#[tokio::test]
async fn test_submit_refused_at_queue_depth_limit() {
    let mut config = create_test_config();
    config.limits.max_queue_depth = 2;
    let coordinator = create_test_coordinator(Arc::new(ScriptedExecutor::default()), Arc::new(MemoryStore::new()), config);
    let p = project("deep");

    coordinator.submit(&p, task("one")).await.unwrap();
    let second = coordinator.submit(&p, task("two")).await.unwrap();

    match coordinator.submit(&p, task("three")).await {
        Err(Error::AdmissionRefused(decision)) => {
            assert!(!decision.allowed);
            assert_eq!(decision.refusal, Some(Refusal::QueueDepth));
            assert!(decision.reason.unwrap().contains("Queue depth limit"));
        }
        other => panic!("expected a queue depth refusal, got {:?}", other),
    }
    let report = coordinator.report(&p).await.unwrap();
    assert_eq!(report.pending_items, 2);

    coordinator.cancel(&p, second).await.unwrap();
    coordinator.submit(&p, task("three")).await.unwrap();
}
