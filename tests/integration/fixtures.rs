//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted executor that replays canned outcomes
//! - Coordinators wired to in-memory or on-disk stores
//! - Queue and worker setups shared across suites

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use conductor::core::{ProjectId, Submission};
use conductor::orchestration::{
    Coordinator, CoordinatorConfig, ExecutionOutcome, ExecutionRequest, Executor, TokenUsage,
    WorkerCapability, WorkerRegistry,
};
use conductor::queue::{QueueConfig, WorkQueue};
use conductor::state::{MemoryStore, Store};
use conductor::{Error, Result};

/// Replays canned results in order, then succeeds with a fixed usage.
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<ExecutionOutcome>>>,
    requests: Mutex<Vec<ExecutionRequest>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Result<ExecutionOutcome>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, request: ExecutionRequest, _cancel: CancellationToken) -> Result<ExecutionOutcome> {
        self.requests.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(success()))
    }
}

pub fn success() -> ExecutionOutcome {
    ExecutionOutcome::success("done", TokenUsage::new(10, 5))
}

pub fn failure(error: &str) -> Result<ExecutionOutcome> {
    Ok(ExecutionOutcome::failure(error, TokenUsage::new(10, 0)))
}

pub fn transport_error() -> Result<ExecutionOutcome> {
    Err(Error::Timeout(Duration::from_secs(1)))
}

/// Coordinator config with millisecond retry backoff.
pub fn create_test_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.queue.retry_base_delay = Duration::from_millis(50);
    config
}

pub fn create_test_coordinator(
    executor: Arc<ScriptedExecutor>,
    store: Arc<dyn Store>,
    config: CoordinatorConfig,
) -> Coordinator {
    Coordinator::new(config, executor, store)
}

/// Coordinator over a fresh `MemoryStore` that always succeeds.
pub fn create_test_memory_coordinator() -> (Coordinator, Arc<ScriptedExecutor>, Arc<MemoryStore>) {
    let executor = Arc::new(ScriptedExecutor::default());
    let store = Arc::new(MemoryStore::new());
    let coordinator = create_test_coordinator(executor.clone(), store.clone(), create_test_config());
    (coordinator, executor, store)
}

pub fn create_test_queue(max_concurrent: usize) -> WorkQueue {
    WorkQueue::new(QueueConfig {
        max_concurrent,
        retry_base_delay: Duration::from_millis(10),
        ..QueueConfig::default()
    })
}

/// Registry with one capability per entry and one live instance of each.
pub fn create_test_registry(capabilities: Vec<WorkerCapability>, now: DateTime<Utc>) -> WorkerRegistry {
    let mut registry = WorkerRegistry::new(Duration::from_secs(60));
    for capability in capabilities {
        let id = capability.id.clone();
        registry.register_capability(capability);
        registry.register(&id, now).unwrap();
    }
    registry
}

pub fn project(name: &str) -> ProjectId {
    ProjectId::from(name)
}

pub fn task(directive: &str) -> Submission {
    Submission::new(directive, &format!("{} works", directive))
}
