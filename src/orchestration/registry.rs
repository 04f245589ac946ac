//! Worker registry and liveness tracking.
//!
//! Capabilities are static descriptors shared by any number of instances.
//! Instances report liveness through heartbeats; `sweep` marks any instance
//! whose last heartbeat is older than the liveness window Offline, whatever
//! status it last reported. Offline instances are never offered for
//! assignment until a fresh heartbeat brings them back as Idle.
//!
//! The registry is a plain struct. Shared use goes through
//! `Arc<RwLock<WorkerRegistry>>`, and the only periodic task touching it is
//! the one started by `WorkerRegistry::spawn_sweeper`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::ids::{CapabilityId, WorkerId};
use crate::core::item::WorkItemId;
use crate::error::{Error, Result};
use crate::events::{AgentEvent, EventBus, Notification};

/// Default time without a heartbeat before an instance is Offline.
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(120);

/// Default period of the sweeper task.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Task type a capability accepts for any work.
pub const ANY_TASK_TYPE: &str = "*";

/// Static description of a kind of worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapability {
    pub id: CapabilityId,
    pub task_types: BTreeSet<String>,
    pub max_concurrent_tasks: usize,
    /// Running mean over finished tasks, in milliseconds.
    pub average_execution_ms: f64,
    /// Fraction of finished tasks that succeeded, in [0, 1].
    pub success_rate: f64,
    pub specializations: BTreeSet<String>,
    /// Finished tasks the statistics are based on.
    pub samples: u64,
}

impl WorkerCapability {
    pub fn new(id: impl Into<CapabilityId>, task_types: &[&str]) -> Self {
        Self {
            id: id.into(),
            task_types: task_types.iter().map(|t| t.to_string()).collect(),
            max_concurrent_tasks: 1,
            average_execution_ms: 0.0,
            success_rate: 1.0,
            specializations: BTreeSet::new(),
            samples: 0,
        }
    }

    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Seed the historical statistics.
    pub fn with_history(mut self, average_execution_ms: f64, success_rate: f64) -> Self {
        self.average_execution_ms = average_execution_ms;
        self.success_rate = success_rate.clamp(0.0, 1.0);
        self
    }

    pub fn specialization(mut self, tag: &str) -> Self {
        self.specializations.insert(tag.to_string());
        self
    }

    pub fn supports(&self, task_type: &str) -> bool {
        self.task_types.contains(task_type) || self.task_types.contains(ANY_TASK_TYPE)
    }

    /// Fold one finished task into the running statistics.
    pub fn record(&mut self, execution_ms: u64, success: bool) {
        self.samples += 1;
        let n = self.samples as f64;
        self.average_execution_ms += (execution_ms as f64 - self.average_execution_ms) / n;
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate += (outcome - self.success_rate) / n;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
    Error,
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "idle"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Error => write!(f, "error"),
            WorkerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Runtime state of one registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub id: WorkerId,
    pub capability_id: CapabilityId,
    pub status: WorkerStatus,
    pub current_tasks: Vec<WorkItemId>,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_execution_ms: u64,
}

impl WorkerInstance {
    pub fn current_task(&self) -> Option<WorkItemId> {
        self.current_tasks.first().copied()
    }

    pub fn load(&self) -> usize {
        self.current_tasks.len()
    }

    pub fn is_alive(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let silent = (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO);
        silent <= window
    }
}

/// A worker that can take work right now, with its capability resolved.
#[derive(Debug, Clone)]
pub struct AvailableAgent {
    pub worker_id: WorkerId,
    pub capability: WorkerCapability,
    pub load: usize,
}

impl AvailableAgent {
    pub fn free_slots(&self) -> usize {
        self.capability.max_concurrent_tasks.saturating_sub(self.load)
    }
}

pub struct WorkerRegistry {
    capabilities: HashMap<CapabilityId, WorkerCapability>,
    instances: HashMap<WorkerId, WorkerInstance>,
    liveness_window: Duration,
    events: Option<EventBus>,
}

impl WorkerRegistry {
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            capabilities: HashMap::new(),
            instances: HashMap::new(),
            liveness_window,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn liveness_window(&self) -> Duration {
        self.liveness_window
    }

    /// Add or replace a capability descriptor.
    pub fn register_capability(&mut self, capability: WorkerCapability) {
        tracing::debug!(capability = %capability.id, "capability registered");
        self.capabilities.insert(capability.id.clone(), capability);
    }

    pub fn capability(&self, id: &CapabilityId) -> Option<&WorkerCapability> {
        self.capabilities.get(id)
    }

    /// Register a new instance of an existing capability. The instance starts
    /// Idle with a heartbeat at `now`.
    pub fn register(&mut self, capability_id: &CapabilityId, now: DateTime<Utc>) -> Result<WorkerId> {
        if !self.capabilities.contains_key(capability_id) {
            return Err(Error::CapabilityNotFound(capability_id.clone()));
        }
        let id = WorkerId::new();
        self.instances.insert(
            id,
            WorkerInstance {
                id,
                capability_id: capability_id.clone(),
                status: WorkerStatus::Idle,
                current_tasks: Vec::new(),
                last_heartbeat: now,
                registered_at: now,
                tasks_completed: 0,
                tasks_failed: 0,
                total_execution_ms: 0,
            },
        );
        tracing::info!(worker = %id.short(), capability = %capability_id, "worker registered");
        Ok(id)
    }

    pub fn deregister(&mut self, id: &WorkerId) -> Result<WorkerInstance> {
        let instance = self
            .instances
            .remove(id)
            .ok_or(Error::WorkerNotFound(*id))?;
        tracing::info!(worker = %id.short(), "worker deregistered");
        Ok(instance)
    }

    /// Record a heartbeat, optionally with a self-reported status. An Offline
    /// instance comes back as Idle unless it reports an error.
    pub fn heartbeat(
        &mut self,
        id: &WorkerId,
        reported: Option<WorkerStatus>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let instance = self
            .instances
            .get_mut(id)
            .ok_or(Error::WorkerNotFound(*id))?;
        instance.last_heartbeat = now;

        let was_offline = instance.status == WorkerStatus::Offline;
        instance.status = match (was_offline, reported) {
            (_, Some(WorkerStatus::Error)) => WorkerStatus::Error,
            (true, _) => WorkerStatus::Idle,
            (false, Some(WorkerStatus::Offline)) | (false, None) => instance.status,
            (false, Some(status)) => status,
        };

        if was_offline {
            tracing::info!(worker = %id.short(), status = %instance.status, "worker back online");
            self.emit(AgentEvent::Online { worker_id: *id });
        }
        Ok(())
    }

    /// Mark every instance whose heartbeat is older than the liveness window
    /// Offline. Returns the instances that changed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<WorkerId> {
        let window = self.liveness_window;
        let mut gone = Vec::new();
        for instance in self.instances.values_mut() {
            if instance.status != WorkerStatus::Offline && !instance.is_alive(now, window) {
                instance.status = WorkerStatus::Offline;
                gone.push((instance.id, instance.last_heartbeat));
            }
        }

        for (worker_id, last_heartbeat) in &gone {
            tracing::warn!(worker = %worker_id.short(), last_heartbeat = %last_heartbeat, "worker offline");
            self.emit(AgentEvent::Offline {
                worker_id: *worker_id,
                last_heartbeat: *last_heartbeat,
            });
        }
        gone.into_iter().map(|(id, _)| id).collect()
    }

    /// Instances that can accept work: alive, not Offline or in Error, and
    /// below their capability's concurrency limit. Sorted by id for stable
    /// assignment.
    pub fn available_agents(&self, now: DateTime<Utc>) -> Vec<AvailableAgent> {
        let mut agents: Vec<AvailableAgent> = self
            .instances
            .values()
            .filter(|i| matches!(i.status, WorkerStatus::Idle | WorkerStatus::Busy))
            .filter(|i| i.is_alive(now, self.liveness_window))
            .filter_map(|i| {
                let capability = self.capabilities.get(&i.capability_id)?;
                (i.load() < capability.max_concurrent_tasks).then(|| AvailableAgent {
                    worker_id: i.id,
                    capability: capability.clone(),
                    load: i.load(),
                })
            })
            .collect();
        agents.sort_by_key(|a| a.worker_id);
        agents
    }

    /// Bind a work item to an instance.
    pub fn begin_task(&mut self, id: &WorkerId, item: WorkItemId) -> Result<()> {
        let instance = self
            .instances
            .get_mut(id)
            .ok_or(Error::WorkerNotFound(*id))?;
        instance.current_tasks.push(item);
        if instance.status == WorkerStatus::Idle {
            instance.status = WorkerStatus::Busy;
        }
        Ok(())
    }

    /// Release a work item and fold the result into the instance counters
    /// and its capability statistics.
    pub fn finish_task(
        &mut self,
        id: &WorkerId,
        item: WorkItemId,
        execution_ms: u64,
        success: bool,
    ) -> Result<()> {
        let instance = self
            .instances
            .get_mut(id)
            .ok_or(Error::WorkerNotFound(*id))?;
        instance.current_tasks.retain(|t| *t != item);
        instance.total_execution_ms += execution_ms;
        if success {
            instance.tasks_completed += 1;
        } else {
            instance.tasks_failed += 1;
        }
        if instance.status == WorkerStatus::Busy && instance.current_tasks.is_empty() {
            instance.status = WorkerStatus::Idle;
        }

        if let Some(capability) = self.capabilities.get_mut(&instance.capability_id) {
            capability.record(execution_ms, success);
        }
        Ok(())
    }

    pub fn instance(&self, id: &WorkerId) -> Option<&WorkerInstance> {
        self.instances.get(id)
    }

    pub fn instances(&self) -> impl Iterator<Item = &WorkerInstance> {
        self.instances.values()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Run `sweep` every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        registry: Arc<RwLock<WorkerRegistry>>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.write().await.sweep(Utc::now());
                    }
                }
            }
            tracing::debug!("registry sweeper stopped");
        })
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            events.publish(Notification::Agent(event));
        }
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_LIVENESS_WINDOW)
    }
}
