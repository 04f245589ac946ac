//! Persistence and recovery integration tests.
//!
//! These tests verify that a project rebuilt from its store resumes at the
//! last committed phase, that crash-interrupted work is picked up again,
//! and that the worker registry sweeps silent workers offline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use conductor::core::{ItemStatus, ProjectId};
use conductor::events::{AgentEvent, Notification};
use conductor::orchestration::{
    BlockerCategory, ProjectPhase, WorkerCapability, WorkerRegistry, WorkerStatus,
};
use conductor::state::{FileStore, MemoryStore, ProjectSnapshot, Store};
use conductor::workflow::{CyclePhase, CycleStatus, Resolution};
use conductor::{Error, EventBus, Result};

use crate::fixtures::{
    create_test_config, create_test_coordinator, failure, project, success, task, transport_error,
    ScriptedExecutor,
};

/// Test: restart while blocked
/// Given a project blocked on a query at Implement
/// When a fresh coordinator restores it from the store
/// Then the cycle is still at Implement and resumes there once answered
#[tokio::test]
async fn test_restore_resumes_at_committed_phase() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let p = project("restart");

    let first = Arc::new(ScriptedExecutor::new(vec![
        Ok(success()),
        Ok(success()),
        failure("Design decision needed: should I use a trie or a hash map?"),
    ]));
    let before = create_test_coordinator(first.clone(), store.clone(), create_test_config());
    before.submit(&p, task("autocomplete")).await.unwrap();
    let report = before.drive_project(&p).await.unwrap();
    assert_eq!(report.phase, ProjectPhase::Blocked);
    drop(before);

    let second = Arc::new(ScriptedExecutor::default());
    let after = create_test_coordinator(second.clone(), store.clone(), create_test_config());
    assert!(after.restore_project(&p).await.unwrap());

    let report = after.report(&p).await.unwrap();
    assert_eq!(report.phase, ProjectPhase::Blocked);
    assert_eq!(report.active_cycles[0].phase, CyclePhase::Implement);
    assert_eq!(report.active_cycles[0].status, CycleStatus::Blocked);
    let query_id = report.pending_queries[0].id;

    let report = after
        .resolve_query(&p, query_id, Resolution::Answer("trie".to_string()))
        .await
        .unwrap();
    assert_eq!(report.phase, ProjectPhase::Completed);

    let phases: Vec<CyclePhase> = second.requests().iter().filter_map(|r| r.phase).collect();
    assert_eq!(
        phases,
        vec![CyclePhase::Implement, CyclePhase::Refactor, CyclePhase::Review]
    );
    assert_eq!(report.budget.used_tokens, first_run_tokens() + 3 * 15);
}

/// Two successes at 15 tokens each plus one failure charged its input only.
fn first_run_tokens() -> u64 {
    15 + 15 + 10
}

#[tokio::test]
async fn test_lookup_restores_project_lazily() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let p = project("lazy");

    let before = create_test_coordinator(
        Arc::new(ScriptedExecutor::default()),
        store.clone(),
        create_test_config(),
    );
    let id = before.submit(&p, task("queued")).await.unwrap();
    drop(before);

    let after = create_test_coordinator(
        Arc::new(ScriptedExecutor::default()),
        store.clone(),
        create_test_config(),
    );
    assert!(after.projects().await.is_empty());
    let report = after.drive_project(&p).await.unwrap();
    assert_eq!(report.phase, ProjectPhase::Completed);
    assert_eq!(after.projects().await, vec![p.clone()]);

    let snapshot = store.load(&p).await.unwrap().unwrap();
    assert!(snapshot
        .queue
        .items
        .iter()
        .any(|item| item.id == id && item.status == ItemStatus::Completed));
}

#[tokio::test]
async fn test_restore_unknown_project() {
    let coordinator = create_test_coordinator(
        Arc::new(ScriptedExecutor::default()),
        Arc::new(MemoryStore::new()),
        create_test_config(),
    );
    assert!(!coordinator.restore_project(&project("ghost")).await.unwrap());
    assert!(matches!(
        coordinator.report(&project("ghost")).await,
        Err(Error::ProjectNotFound(_))
    ));
}

#[tokio::test]
async fn test_file_store_keeps_retry_schedule_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let p = project("on-disk");
    // Long enough that the first coordinator's wake-up never fires here.
    let mut config = create_test_config();
    config.queue.retry_base_delay = Duration::from_secs(60);

    let first = Arc::new(ScriptedExecutor::new(vec![
        transport_error(),
        transport_error(),
        transport_error(),
    ]));
    let before = create_test_coordinator(first.clone(), Arc::new(FileStore::new(dir.path())), config.clone());
    before.submit(&p, task("migrate")).await.unwrap();
    let report = before.drive_project(&p).await.unwrap();
    assert_eq!(report.scheduled_retries, 1);
    let retry_at = report.next_retry_at.unwrap();

    let store = FileStore::new(dir.path());
    assert_eq!(store.projects().await.unwrap(), vec![p.clone()]);

    let second = Arc::new(ScriptedExecutor::default());
    let after = create_test_coordinator(second.clone(), Arc::new(store), config);
    let report = after.run_project(&p).await.unwrap();

    assert_eq!(report.phase, ProjectPhase::Idle);
    assert_eq!(report.scheduled_retries, 1);
    assert_eq!(report.next_retry_at, Some(retry_at));
    assert_eq!(second.calls(), 0);
    assert_eq!(report.active_cycles.len(), 0);
}

/// Test: silent workers go offline
/// Given a registry with a short liveness window and a running sweeper
/// When a worker stops heartbeating
/// Then it is marked Offline, excluded from assignment, and an event fires
#[tokio::test]
async fn test_sweeper_marks_silent_worker_offline() {
    let events = EventBus::new(16);
    let mut rx = events.subscribe();
    let mut registry = WorkerRegistry::new(Duration::from_millis(50)).with_events(events);
    registry.register_capability(WorkerCapability::new("coder", &["general"]));
    let worker = registry.register(&"coder".into(), Utc::now()).unwrap();
    let registry = Arc::new(tokio::sync::RwLock::new(registry));

    let cancel = CancellationToken::new();
    let sweeper = WorkerRegistry::spawn_sweeper(Arc::clone(&registry), Duration::from_millis(20), cancel.clone());

    tokio::time::sleep(Duration::from_millis(200)).await;
    {
        let registry = registry.read().await;
        assert_eq!(registry.instance(&worker).unwrap().status, WorkerStatus::Offline);
        assert!(registry.available_agents(Utc::now()).is_empty());
    }
    assert!(matches!(
        rx.recv().await.unwrap(),
        Notification::Agent(AgentEvent::Offline { worker_id, .. }) if worker_id == worker
    ));

    registry.write().await.heartbeat(&worker, None, Utc::now()).unwrap();
    assert_eq!(
        registry.read().await.instance(&worker).unwrap().status,
        WorkerStatus::Idle
    );

    cancel.cancel();
    sweeper.await.unwrap();
}

/// Memory store whose writes can be switched off.
#[derive(Default)]
struct UnreliableStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

#[async_trait]
impl Store for UnreliableStore {
    async fn save(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("disk full")));
        }
        self.inner.save(snapshot).await
    }

    async fn load(&self, project_id: &ProjectId) -> Result<Option<ProjectSnapshot>> {
        self.inner.load(project_id).await
    }

    async fn projects(&self) -> Result<Vec<ProjectId>> {
        self.inner.projects().await
    }
}

/// Test: persistence failure mid-iteration
/// Given a project whose store starts failing after its cycle was created
/// When the loop fails to persist the started phase
/// Then it reports an Internal blocker without holding tokens, and completes
/// normally once the store recovers
#[tokio::test]
async fn test_persist_failure_releases_reservations() {
    let store = Arc::new(UnreliableStore::default());
    let executor = Arc::new(ScriptedExecutor::default());
    let coordinator = create_test_coordinator(executor.clone(), store.clone(), create_test_config());
    let p = project("flaky-disk");
    coordinator.submit(&p, task("index").estimated_tokens(500)).await.unwrap();
    assert_eq!(coordinator.run_project(&p).await.unwrap().phase, ProjectPhase::Running);

    store.failing.store(true, Ordering::SeqCst);
    let report = coordinator.run_project(&p).await.unwrap();
    assert_eq!(report.phase, ProjectPhase::Blocked);
    assert_eq!(report.blockers[0].category, BlockerCategory::Internal);
    assert!(report.blockers[0].reason.contains("disk full"));
    assert_eq!(report.budget.used_tokens, 0);
    assert_eq!(executor.calls(), 0);

    store.failing.store(false, Ordering::SeqCst);
    let report = coordinator.drive_project(&p).await.unwrap();
    assert_eq!(report.phase, ProjectPhase::Completed);
    assert_eq!(executor.calls(), 5);
    assert_eq!(report.budget.used_tokens, 5 * 15);
}
