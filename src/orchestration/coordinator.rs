//! Coordination loop driving each project's work through admission, the
//! queue, the cycle state machine and worker assignment.
//!
//! Every project owns one `ProjectState` behind its own mutex; projects never
//! share a lock. One iteration of the loop:
//!
//! 1. If the budget is blocked, report Blocked and pause idle cycles.
//! 2. If a blocking query is pending, report Blocked and surface it.
//! 3. Advance every active cycle by one phase. Executions run concurrently
//!    and outside the project lock; one failure never affects the others.
//! 4. Fill free queue slots with new cycles while admission allows it.
//! 5. Otherwise report Idle or Completed.
//!
//! State is persisted after every locked section, so a restart resumes each
//! cycle at its last committed phase.

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::{
    AdmissionController, AdmissionDecision, BudgetLimits, BudgetReport, BudgetStatus, ProjectLoad,
    Refusal, ReservationId,
};
use crate::core::ids::{CycleId, ProjectId, QueryId, WorkerId};
use crate::core::item::{ItemStatus, Priority, Submission, WorkItem, WorkItemId};
use crate::error::{Error, Result};
use crate::events::{AssignmentEvent, CycleEvent, EventBus, Notification};
use crate::orchestration::assignment::{AssignmentContext, ProjectRequirements, Strategy};
use crate::orchestration::executor::{
    ExecutionOutcome, ExecutionRequest, Executor, DEFAULT_EXECUTION_TIMEOUT, DEFAULT_INIT_TIMEOUT,
};
use crate::orchestration::registry::WorkerRegistry;
use crate::queue::{FailureOutcome, QueueConfig, QueueStats, WorkQueue};
use crate::state::{ProjectSnapshot, Store, SNAPSHOT_VERSION};
use crate::workflow::{
    extract_question, Cycle, CyclePhase, CycleStatus, ErrorClass, ErrorClassifier,
    KeywordClassifier, PhaseOutcome, Query, Resolution, Transition,
};

/// Upper bound on loop iterations in one `drive_project` call.
pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

/// Items of this task type get the initialization timeout.
pub const INIT_TASK_TYPE: &str = "init";

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub queue: QueueConfig,
    pub limits: BudgetLimits,
    pub strategy: Strategy,
    pub requirements: ProjectRequirements,
    pub execution_timeout: Duration,
    pub init_timeout: Duration,
    pub max_iterations: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            limits: BudgetLimits::default(),
            strategy: Strategy::LoadBalanced,
            requirements: ProjectRequirements::default(),
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// Coarse state of a project after one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPhase {
    Idle,
    Running,
    Blocked,
    Completed,
}

impl std::fmt::Display for ProjectPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectPhase::Idle => write!(f, "idle"),
            ProjectPhase::Running => write!(f, "running"),
            ProjectPhase::Blocked => write!(f, "blocked"),
            ProjectPhase::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerCategory {
    Budget,
    RateLimit,
    Concurrency,
    HumanInput,
    Dependency,
    Internal,
}

/// Why a project cannot make progress, and what would unblock it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blocker {
    pub category: BlockerCategory,
    pub reason: String,
    pub next_step: String,
    pub reset_at: Option<DateTime<Utc>>,
}

impl Blocker {
    fn new(category: BlockerCategory, reason: impl Into<String>, next_step: impl Into<String>) -> Self {
        Self {
            category,
            reason: reason.into(),
            next_step: next_step.into(),
            reset_at: None,
        }
    }

    pub fn from_decision(decision: &AdmissionDecision) -> Self {
        let category = match decision.refusal {
            Some(refusal) if refusal.is_rate() => BlockerCategory::RateLimit,
            Some(Refusal::ParallelWorkers | Refusal::QueueDepth) => BlockerCategory::Concurrency,
            _ => BlockerCategory::Budget,
        };
        Self {
            category,
            reason: decision
                .reason
                .clone()
                .unwrap_or_else(|| "Admission refused".to_string()),
            next_step: decision
                .refusal
                .map(|r| r.next_step())
                .unwrap_or("wait and retry")
                .to_string(),
            reset_at: decision.reset_at,
        }
    }

    fn from_budget(report: &BudgetReport) -> Self {
        let daily = report.remaining_tokens == 0;
        Self {
            category: if daily {
                BlockerCategory::Budget
            } else {
                BlockerCategory::RateLimit
            },
            reason: report
                .reason
                .clone()
                .unwrap_or_else(|| "Budget blocked".to_string()),
            next_step: if daily {
                Refusal::DailyBudget.next_step().to_string()
            } else {
                Refusal::MinuteRate.next_step().to_string()
            },
            reset_at: report.reset_at,
        }
    }

    fn from_query(query: &Query) -> Self {
        Self::new(
            BlockerCategory::HumanInput,
            query.question.clone(),
            format!("answer or dismiss query {}", query.id),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub id: CycleId,
    pub item_id: WorkItemId,
    pub phase: CyclePhase,
    pub status: CycleStatus,
    pub attempt: u32,
}

impl From<&Cycle> for CycleSummary {
    fn from(cycle: &Cycle) -> Self {
        Self {
            id: cycle.id,
            item_id: cycle.item_id,
            phase: cycle.phase,
            status: cycle.status,
            attempt: cycle.attempt,
        }
    }
}

/// Result of one loop iteration, or of a status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectReport {
    pub project_id: ProjectId,
    pub phase: ProjectPhase,
    pub blockers: Vec<Blocker>,
    pub pending_queries: Vec<Query>,
    pub active_cycles: Vec<CycleSummary>,
    /// Executions currently running.
    pub active_agents: usize,
    pub budget: BudgetReport,
    pub pending_items: usize,
    pub processing_items: usize,
    pub scheduled_retries: usize,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub queue_stats: QueueStats,
    /// Assignment warnings from this iteration.
    pub warnings: Vec<String>,
}

impl ProjectReport {
    pub fn is_blocked(&self) -> bool {
        self.phase == ProjectPhase::Blocked
    }
}

struct ProjectState {
    id: ProjectId,
    queue: WorkQueue,
    admission: AdmissionController,
    cycles: Vec<Cycle>,
    queries: Vec<Query>,
    in_flight: HashMap<WorkItemId, Running>,
    /// Time of the scheduled retry wake-up, if any.
    wake_at: Option<DateTime<Utc>>,
}

impl ProjectState {
    fn new(id: ProjectId, config: &CoordinatorConfig, events: &EventBus) -> Self {
        Self {
            queue: WorkQueue::new(config.queue.clone()).with_events(events.clone()),
            admission: AdmissionController::new(id.clone(), config.limits.clone())
                .with_events(events.clone()),
            id,
            cycles: Vec::new(),
            queries: Vec::new(),
            in_flight: HashMap::new(),
            wake_at: None,
        }
    }

    fn restore(snapshot: ProjectSnapshot, config: &CoordinatorConfig, events: &EventBus) -> Self {
        let mut cycles = snapshot.cycles;
        for cycle in cycles.iter_mut().filter(|c| c.status == CycleStatus::InProgress) {
            // The attempt in progress died with the process.
            cycle.attempt_started_at = None;
        }
        Self {
            queue: WorkQueue::restore(config.queue.clone(), snapshot.queue).with_events(events.clone()),
            admission: AdmissionController::from_ledger(snapshot.project_id.clone(), snapshot.ledger)
                .with_events(events.clone()),
            id: snapshot.project_id,
            cycles,
            queries: snapshot.queries,
            in_flight: HashMap::new(),
            wake_at: None,
        }
    }

    fn snapshot(&self, now: DateTime<Utc>) -> ProjectSnapshot {
        ProjectSnapshot {
            version: SNAPSHOT_VERSION,
            project_id: self.id.clone(),
            queue: self.queue.snapshot(),
            ledger: self.admission.ledger().clone(),
            cycles: self.cycles.clone(),
            queries: self.queries.clone(),
            saved_at: now,
        }
    }

    fn load(&self) -> ProjectLoad {
        ProjectLoad {
            active_workers: self.in_flight.len(),
            queue_depth: self.queue.pending_count() + self.queue.processing_count(),
        }
    }

    fn cycle_mut(&mut self, id: CycleId) -> Option<&mut Cycle> {
        self.cycles.iter_mut().find(|c| c.id == id)
    }

    fn live_cycle_for(&mut self, item: WorkItemId) -> Option<&mut Cycle> {
        self.cycles
            .iter_mut()
            .find(|c| c.item_id == item && !c.status.is_terminal())
    }

    /// Undo the executions of an iteration that never got to fold its
    /// results back: cancel them, hand their reservations back and let the
    /// cycles start the same phase again.
    fn abandon_in_flight(&mut self) -> Vec<(WorkItemId, Running)> {
        let abandoned: Vec<(WorkItemId, Running)> = self.in_flight.drain().collect();
        for (_, running) in abandoned.iter() {
            running.cancel.cancel();
            self.admission.release(running.reservation);
            if let Some(cycle) = self.cycle_mut(running.cycle_id) {
                if cycle.status == CycleStatus::InProgress {
                    cycle.attempt_started_at = None;
                }
            }
        }
        abandoned
    }

    fn has_blocking_query(&self) -> bool {
        self.queries.iter().any(Query::blocks)
    }

    fn pause_idle_cycles(&mut self, now: DateTime<Utc>) {
        for cycle in self.cycles.iter_mut() {
            if matches!(cycle.status, CycleStatus::Pending | CycleStatus::InProgress)
                && !self.in_flight.contains_key(&cycle.item_id)
            {
                if let Err(err) = cycle.pause(now) {
                    tracing::warn!(project = %self.id, cycle = %cycle.id.short(), error = %err, "cannot pause cycle");
                }
            }
        }
    }
}

/// Bookkeeping for an execution between `prepare` and `apply`.
struct Running {
    cycle_id: CycleId,
    worker_id: Option<WorkerId>,
    reservation: ReservationId,
    cancel: CancellationToken,
}

/// One execution prepared under the project lock.
struct Prepared {
    cycle_id: CycleId,
    item_id: WorkItemId,
    worker_id: Option<WorkerId>,
    reservation: ReservationId,
    request: ExecutionRequest,
    cancel: CancellationToken,
}

struct Executed {
    prepared: Prepared,
    result: Result<ExecutionOutcome>,
    elapsed_ms: u64,
}

/// What step 3 produced before executions start.
#[derive(Default)]
struct Preparation {
    prepared: Vec<Prepared>,
    blockers: Vec<Blocker>,
    warnings: Vec<String>,
}

struct Inner {
    config: CoordinatorConfig,
    executor: Arc<dyn Executor>,
    store: Arc<dyn Store>,
    registry: Arc<RwLock<WorkerRegistry>>,
    classifier: Arc<dyn ErrorClassifier>,
    events: EventBus,
    projects: RwLock<HashMap<ProjectId, Arc<Mutex<ProjectState>>>>,
}

/// Drives every project. Cloning shares the same projects.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, executor: Arc<dyn Executor>, store: Arc<dyn Store>) -> Self {
        let events = EventBus::default();
        let registry = WorkerRegistry::default().with_events(events.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                executor,
                store,
                registry: Arc::new(RwLock::new(registry)),
                classifier: Arc::new(KeywordClassifier::default()),
                events,
                projects: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Replace the worker registry. Must be called before any project runs.
    pub fn with_registry(self, registry: WorkerRegistry) -> Self {
        self.rebuild(|inner| {
            inner.registry = Arc::new(RwLock::new(registry.with_events(inner.events.clone())));
        })
    }

    pub fn with_classifier(self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.rebuild(|inner| inner.classifier = classifier)
    }

    fn rebuild(self, f: impl FnOnce(&mut Inner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                f(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => Self { inner },
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn registry(&self) -> Arc<RwLock<WorkerRegistry>> {
        Arc::clone(&self.inner.registry)
    }

    /// Start the periodic liveness sweep over the shared registry.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        WorkerRegistry::spawn_sweeper(self.registry(), interval, cancel)
    }

    /// Enqueue work for a project, creating the project on first use.
    pub async fn submit(&self, project_id: &ProjectId, submission: Submission) -> Result<WorkItemId> {
        let state = self.project_or_create(project_id).await?;
        let mut guard = state.lock().await;
        let decision = guard.admission.can_enqueue(guard.load());
        if !decision.allowed {
            return Err(Error::AdmissionRefused(decision));
        }
        let id = guard.queue.enqueue(submission)?;
        tracing::info!(project = %project_id, item = %id.short(), "work submitted");
        self.persist(&guard, Utc::now()).await?;
        Ok(id)
    }

    /// Cancel a work item, killing its execution if one is running.
    /// Returns the status the item had before.
    pub async fn cancel(&self, project_id: &ProjectId, item_id: WorkItemId) -> Result<ItemStatus> {
        let state = self.project(project_id).await?;
        let mut guard = state.lock().await;
        let now = Utc::now();

        let previous = guard.queue.cancel_at(item_id, now)?;
        // The entry stays until the execution returns and its usage is settled.
        if let Some(running) = guard.in_flight.get(&item_id) {
            running.cancel.cancel();
        }

        let mut aborted = Vec::new();
        for cycle in guard.cycles.iter_mut().filter(|c| c.item_id == item_id) {
            if !cycle.status.is_terminal() {
                cycle.abort("work item cancelled", now);
                aborted.push(cycle.id);
            }
        }
        for query in guard.queries.iter_mut() {
            if query.is_pending() && query.cycle_id.is_some_and(|id| aborted.contains(&id)) {
                if let Err(err) = query.resolve(Resolution::Dismiss, now) {
                    tracing::warn!(project = %project_id, query = %query.id.short(), error = %err, "cannot dismiss query");
                }
            }
        }
        for cycle_id in aborted {
            self.emit(CycleEvent::Failed {
                project_id: project_id.clone(),
                cycle_id,
                error: "work item cancelled".to_string(),
            });
        }

        tracing::info!(project = %project_id, item = %item_id.short(), %previous, "work item cancelled");
        self.persist(&guard, now).await?;
        Ok(previous)
    }

    pub async fn reschedule(&self, project_id: &ProjectId, item_id: WorkItemId, priority: Priority) -> Result<()> {
        let state = self.project(project_id).await?;
        let mut guard = state.lock().await;
        guard.queue.reschedule(item_id, priority)?;
        self.persist(&guard, Utc::now()).await
    }

    pub async fn set_limits(&self, project_id: &ProjectId, limits: BudgetLimits) -> Result<()> {
        let state = self.project_or_create(project_id).await?;
        let mut guard = state.lock().await;
        guard.admission.set_limits(limits);
        self.persist(&guard, Utc::now()).await
    }

    /// Record a human decision and re-run the owning project's loop.
    pub async fn resolve_query(
        &self,
        project_id: &ProjectId,
        query_id: QueryId,
        resolution: Resolution,
    ) -> Result<ProjectReport> {
        let state = self.project(project_id).await?;
        {
            let mut guard = state.lock().await;
            let now = Utc::now();
            let query = guard
                .queries
                .iter_mut()
                .find(|q| q.id == query_id)
                .ok_or(Error::QueryNotFound(query_id))?;
            let guidance = query.resolve(resolution, now)?;
            let cycle_id = query.cycle_id;
            tracing::info!(project = %project_id, query = %query_id.short(), status = %query.status, "query resolved");

            if let Some(cycle_id) = cycle_id {
                let cycle = guard.cycle_mut(cycle_id).ok_or(Error::CycleNotFound(cycle_id))?;
                if cycle.blocking_query == Some(query_id) {
                    cycle.unblock(query_id, guidance, now)?;
                    self.emit(CycleEvent::Resumed {
                        project_id: project_id.clone(),
                        cycle_id,
                    });
                }
            }
            self.persist(&guard, now).await?;
        }
        self.drive_project(project_id).await
    }

    /// Rebuild a project from the store. Returns false when nothing was
    /// stored for it.
    pub async fn restore_project(&self, project_id: &ProjectId) -> Result<bool> {
        let Some(snapshot) = self.inner.store.load(project_id).await? else {
            return Ok(false);
        };
        let state = ProjectState::restore(snapshot, &self.inner.config, &self.inner.events);
        tracing::info!(
            project = %project_id,
            items = state.queue.len(),
            cycles = state.cycles.len(),
            "project restored"
        );
        self.inner
            .projects
            .write()
            .await
            .insert(project_id.clone(), Arc::new(Mutex::new(state)));
        Ok(true)
    }

    /// Current state without running anything.
    pub async fn report(&self, project_id: &ProjectId) -> Result<ProjectReport> {
        let state = self.project(project_id).await?;
        let guard = state.lock().await;
        let phase = self.settled_phase(&guard, guard.in_flight.is_empty(), &[]);
        Ok(self.build_report(&guard, phase, Vec::new(), Vec::new(), Utc::now()))
    }

    pub async fn projects(&self) -> Vec<ProjectId> {
        let mut ids: Vec<ProjectId> = self.inner.projects.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run the loop until the project is no longer Running.
    pub async fn drive_project(&self, project_id: &ProjectId) -> Result<ProjectReport> {
        let mut report = self.run_project(project_id).await?;
        let mut iterations = 1;
        while report.phase == ProjectPhase::Running {
            if iterations >= self.inner.config.max_iterations {
                tracing::warn!(project = %project_id, iterations, "iteration limit reached");
                break;
            }
            report = self.run_project(project_id).await?;
            iterations += 1;
        }
        Ok(report)
    }

    /// One loop iteration. Internal failures are contained and reported as
    /// an `Internal` blocker.
    pub async fn run_project(&self, project_id: &ProjectId) -> Result<ProjectReport> {
        let state = self.project(project_id).await?;
        let outcome = AssertUnwindSafe(self.iterate(&state)).catch_unwind().await;

        let reason = match outcome {
            Ok(Ok(report)) => return Ok(report),
            Ok(Err(err)) => err.to_string(),
            Err(panic) => panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "coordination loop panicked".to_string()),
        };
        tracing::error!(project = %project_id, %reason, "coordination loop failed");

        let mut guard = state.lock().await;
        // Executions of the failed iteration were dropped with it.
        let abandoned = guard.abandon_in_flight();
        if !abandoned.is_empty() {
            tracing::warn!(project = %project_id, executions = abandoned.len(), "abandoned in-flight executions");
            let mut registry = self.inner.registry.write().await;
            for (item_id, running) in abandoned {
                if let Some(worker) = running.worker_id {
                    if let Err(err) = registry.finish_task(&worker, item_id, 0, false) {
                        tracing::debug!(worker = %worker.short(), error = %err, "abandoned task on unknown worker");
                    }
                }
            }
        }
        if let Err(err) = self.persist(&guard, Utc::now()).await {
            tracing::warn!(project = %project_id, error = %err, "failed to persist after loop failure");
        }
        let blocker = Blocker::new(
            BlockerCategory::Internal,
            format!("Internal coordination error: {}", reason),
            "check the conductor log and re-run the project",
        );
        Ok(self.build_report(&guard, ProjectPhase::Blocked, vec![blocker], Vec::new(), Utc::now()))
    }

    async fn iterate(&self, state: &Arc<Mutex<ProjectState>>) -> Result<ProjectReport> {
        let now = Utc::now();
        let mut guard = state.lock().await;
        guard.admission.prune(now);
        guard.queue.promote_due_retries(now);

        let budget = guard.admission.status(now);
        if budget.status == BudgetStatus::Blocked {
            guard.pause_idle_cycles(now);
            self.persist(&guard, now).await?;
            self.schedule_wake(&mut guard);
            let blockers = vec![Blocker::from_budget(&budget)];
            return Ok(self.build_report(&guard, ProjectPhase::Blocked, blockers, Vec::new(), now));
        }

        if guard.has_blocking_query() {
            return Ok(self.build_report(&guard, ProjectPhase::Blocked, Vec::new(), Vec::new(), now));
        }

        let Preparation {
            prepared,
            mut blockers,
            warnings,
        } = self.prepare(&mut guard, now).await;
        let executing = prepared.len();
        let started = self.start_cycles(&mut guard, now, &mut blockers);
        self.persist(&guard, now).await?;
        drop(guard);

        let executed = join_all(prepared.into_iter().map(|p| self.execute(p))).await;

        let mut guard = state.lock().await;
        let now = Utc::now();
        for done in executed {
            let item_id = done.prepared.item_id;
            if let Err(err) = self.apply(&mut guard, done, now).await {
                tracing::warn!(project = %guard.id, item = %item_id.short(), error = %err, "failed to apply execution result");
            }
        }
        self.persist(&guard, now).await?;
        self.schedule_wake(&mut guard);

        let progressed = executing > 0 || started > 0;
        let phase = self.settled_phase(&guard, !progressed, &blockers);
        Ok(self.build_report(&guard, phase, blockers, warnings, now))
    }

    /// Step 3: admit and start one phase attempt for every runnable cycle.
    async fn prepare(&self, state: &mut ProjectState, now: DateTime<Utc>) -> Preparation {
        let mut preparation = Preparation::default();

        let candidates: Vec<(CycleId, WorkItem)> = state
            .cycles
            .iter()
            .filter(|c| c.status.is_runnable() && !state.in_flight.contains_key(&c.item_id))
            .filter_map(|c| {
                state
                    .queue
                    .get(&c.item_id)
                    .filter(|item| item.status == ItemStatus::Processing)
                    .map(|item| (c.id, item.clone()))
            })
            .collect();
        if candidates.is_empty() {
            return preparation;
        }

        let mut registry = self.inner.registry.write().await;
        let workers: Option<HashMap<WorkItemId, WorkerId>> = if registry.is_empty() {
            None
        } else {
            let context = AssignmentContext {
                agents: registry.available_agents(now),
                items: candidates.iter().map(|(_, item)| item.clone()).collect(),
                requirements: self.inner.config.requirements.clone(),
                now,
            };
            let plan = self.inner.config.strategy.assign(&context);
            preparation.warnings.extend(plan.warnings.iter().cloned());
            Some(
                plan.assignments
                    .iter()
                    .map(|a| (a.item_id, a.worker_id))
                    .collect(),
            )
        };

        for (cycle_id, item) in candidates {
            let worker_id = match &workers {
                None => None,
                Some(assigned) => match assigned.get(&item.id) {
                    Some(worker) => Some(*worker),
                    None => {
                        preparation.blockers.push(Blocker::new(
                            BlockerCategory::Concurrency,
                            format!("No eligible worker for item {}", item.id.short()),
                            "register a worker for this task type or wait for a free slot",
                        ));
                        continue;
                    }
                },
            };

            let load = state.load();
            let reservation = match state.admission.admit(item.estimated_tokens, load, now) {
                Ok(reservation) => reservation,
                Err(decision) => {
                    if let Some(cycle) = state.cycle_mut(cycle_id) {
                        if cycle.status != CycleStatus::Paused {
                            if let Err(err) = cycle.pause(now) {
                                tracing::warn!(cycle = %cycle_id.short(), error = %err, "cannot pause cycle");
                            }
                        }
                    }
                    preparation.blockers.push(Blocker::from_decision(&decision));
                    break;
                }
            };

            let Some(cycle) = state.cycle_mut(cycle_id) else {
                state.admission.release(reservation);
                continue;
            };
            if cycle.status == CycleStatus::Paused {
                if let Err(err) = cycle.resume(now) {
                    tracing::warn!(cycle = %cycle_id.short(), error = %err, "cannot resume cycle");
                    state.admission.release(reservation);
                    continue;
                }
            }
            if let Err(err) = cycle.begin_attempt(now) {
                tracing::warn!(cycle = %cycle_id.short(), error = %err, "cannot start phase");
                state.admission.release(reservation);
                continue;
            }
            let phase = cycle.phase;
            let working_context = cycle.working_context();
            let request = ExecutionRequest {
                project_id: state.id.clone(),
                item_id: item.id,
                cycle_id: Some(cycle_id),
                phase: Some(phase),
                worker_id,
                directive: item.directive.clone(),
                working_context,
                timeout: if item.task_type == INIT_TASK_TYPE {
                    self.inner.config.init_timeout
                } else {
                    self.inner.config.execution_timeout
                },
            };

            if let Some(worker) = worker_id {
                if let Err(err) = registry.begin_task(&worker, item.id) {
                    tracing::warn!(worker = %worker.short(), error = %err, "worker vanished before assignment");
                }
            }
            let cancel = CancellationToken::new();
            state.in_flight.insert(
                item.id,
                Running {
                    cycle_id,
                    worker_id,
                    reservation,
                    cancel: cancel.clone(),
                },
            );

            tracing::info!(
                project = %state.id,
                cycle = %cycle_id.short(),
                item = %item.id.short(),
                %phase,
                worker = ?worker_id.map(|w| w.short()),
                "phase started"
            );
            self.emit(CycleEvent::PhaseStarted {
                project_id: state.id.clone(),
                cycle_id,
                phase,
            });
            preparation.prepared.push(Prepared {
                cycle_id,
                item_id: item.id,
                worker_id,
                reservation,
                request,
                cancel,
            });
        }
        preparation
    }

    /// Step 4: start cycles for ready items while slots and admission allow.
    fn start_cycles(&self, state: &mut ProjectState, now: DateTime<Utc>, blockers: &mut Vec<Blocker>) -> usize {
        let mut started = 0;
        while state.queue.has_free_slot() {
            let Some(estimate) = state.queue.ready_items().first().map(|item| item.estimated_tokens) else {
                break;
            };
            let decision = state.admission.can_admit(estimate, state.load(), now);
            if !decision.allowed {
                blockers.push(Blocker::from_decision(&decision));
                break;
            }
            let Some(item) = state.queue.dequeue_at(now) else {
                break;
            };

            // A restored item keeps the cycle it had before the restart.
            if let Some(cycle) = state.live_cycle_for(item.id) {
                tracing::info!(cycle = %cycle.id.short(), phase = %cycle.phase, "cycle resumed");
            } else {
                let cycle = Cycle::new(state.id.clone(), item.id, &item.directive, &item.expected_outcome, now);
                tracing::info!(
                    project = %state.id,
                    cycle = %cycle.id.short(),
                    item = %item.id.short(),
                    priority = %item.priority,
                    "cycle created"
                );
                state.cycles.push(cycle);
            }
            started += 1;
        }
        started
    }

    async fn execute(&self, prepared: Prepared) -> Executed {
        self.emit(AssignmentEvent::Started {
            project_id: prepared.request.project_id.clone(),
            item_id: prepared.item_id,
            worker_id: prepared.worker_id,
        });
        let started = Instant::now();
        let result = self
            .inner
            .executor
            .execute(prepared.request.clone(), prepared.cancel.clone())
            .await;
        Executed {
            elapsed_ms: started.elapsed().as_millis() as u64,
            prepared,
            result,
        }
    }

    /// Fold one execution result back into the project.
    async fn apply(&self, state: &mut ProjectState, executed: Executed, now: DateTime<Utc>) -> Result<()> {
        let Executed {
            prepared,
            result,
            elapsed_ms,
        } = executed;
        let project_id = state.id.clone();
        state.in_flight.remove(&prepared.item_id);

        let success = matches!(&result, Ok(outcome) if outcome.success);
        if let Some(worker) = prepared.worker_id {
            let mut registry = self.inner.registry.write().await;
            if let Err(err) = registry.finish_task(&worker, prepared.item_id, elapsed_ms, success) {
                tracing::debug!(worker = %worker.short(), error = %err, "finished task on unknown worker");
            }
        }

        let item_live = state.queue.status(&prepared.item_id) == Some(ItemStatus::Processing);
        let cycle_live = state
            .cycles
            .iter()
            .any(|c| c.id == prepared.cycle_id && c.status == CycleStatus::InProgress);
        if !item_live || !cycle_live {
            // Cancelled while running.
            match &result {
                Ok(outcome) => {
                    state.admission.settle(
                        prepared.reservation,
                        outcome.usage.input_tokens,
                        outcome.usage.output_tokens,
                        outcome.success,
                        now,
                    );
                }
                Err(_) => state.admission.release(prepared.reservation),
            }
            return Ok(());
        }

        let error = match result {
            Ok(outcome) if outcome.success => {
                state.admission.settle(
                    prepared.reservation,
                    outcome.usage.input_tokens,
                    outcome.usage.output_tokens,
                    true,
                    now,
                );
                self.emit(AssignmentEvent::Completed {
                    project_id: project_id.clone(),
                    item_id: prepared.item_id,
                    worker_id: prepared.worker_id,
                });
                return self.advance(state, prepared.cycle_id, outcome, now);
            }
            Ok(outcome) => {
                state.admission.settle(
                    prepared.reservation,
                    outcome.usage.input_tokens,
                    outcome.usage.output_tokens,
                    false,
                    now,
                );
                outcome
                    .error
                    .unwrap_or_else(|| "execution reported failure".to_string())
            }
            Err(err) => {
                // Still counts as a request against the rate windows.
                state.admission.settle(prepared.reservation, 0, 0, false, now);
                err.to_string()
            }
        };

        self.emit(AssignmentEvent::Failed {
            project_id,
            item_id: prepared.item_id,
            worker_id: prepared.worker_id,
            error: error.clone(),
        });
        self.handle_failure(state, prepared.cycle_id, &error, now)
    }

    fn advance(
        &self,
        state: &mut ProjectState,
        cycle_id: CycleId,
        outcome: ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let project_id = state.id.clone();
        let cycle = state.cycle_mut(cycle_id).ok_or(Error::CycleNotFound(cycle_id))?;
        let phase = cycle.phase;
        let item_id = cycle.item_id;
        let phase_outcome = PhaseOutcome::succeeded(vec![outcome.output.clone()]).with_tokens(outcome.usage.total());
        let transition = cycle.apply(phase_outcome, now)?;

        tracing::info!(project = %project_id, cycle = %cycle_id.short(), %phase, "phase completed");
        self.emit(CycleEvent::PhaseCompleted {
            project_id: project_id.clone(),
            cycle_id,
            phase,
        });

        if transition == Transition::Completed {
            state.queue.complete_at(item_id, &outcome.output, now)?;
            tracing::info!(project = %project_id, cycle = %cycle_id.short(), item = %item_id.short(), "cycle completed");
            self.emit(CycleEvent::Completed { project_id, cycle_id });
        }
        Ok(())
    }

    fn handle_failure(&self, state: &mut ProjectState, cycle_id: CycleId, error: &str, now: DateTime<Utc>) -> Result<()> {
        let project_id = state.id.clone();
        let class = self.inner.classifier.classify(error);
        let cycle = state.cycle_mut(cycle_id).ok_or(Error::CycleNotFound(cycle_id))?;

        if class == ErrorClass::NeedsHumanInput {
            let query = Query::blocking(
                project_id.clone(),
                cycle_id,
                &extract_question(error),
                &format!("{} phase of: {}", cycle.phase, cycle.directive),
                now,
            );
            cycle.block(query.id, now)?;
            tracing::info!(project = %project_id, cycle = %cycle_id.short(), query = %query.id.short(), "cycle blocked on human input");
            self.emit(CycleEvent::Blocked {
                project_id,
                cycle_id,
                query_id: query.id,
            });
            state.queries.push(query);
            return Ok(());
        }

        let item_id = cycle.item_id;
        let transition = cycle.apply(PhaseOutcome::failed(error, class == ErrorClass::Transient), now)?;
        match transition {
            Transition::Retrying { phase, attempt } => {
                tracing::info!(project = %project_id, cycle = %cycle_id.short(), %phase, attempt, "phase will be retried");
            }
            Transition::Failed { phase, error } => {
                tracing::warn!(project = %project_id, cycle = %cycle_id.short(), %phase, %error, "cycle failed");
                self.emit(CycleEvent::Failed {
                    project_id: project_id.clone(),
                    cycle_id,
                    error: error.clone(),
                });
                match state.queue.fail_at(item_id, &error, now)? {
                    FailureOutcome::RetryScheduled { retry_count, retry_at } => {
                        tracing::info!(project = %project_id, item = %item_id.short(), retry_count, %retry_at, "item retry scheduled");
                    }
                    FailureOutcome::Failed => {
                        tracing::warn!(project = %project_id, item = %item_id.short(), "item failed permanently");
                    }
                }
            }
            Transition::Advanced { .. } | Transition::Completed => {}
        }
        Ok(())
    }

    /// Phase once nothing else is happening in this iteration.
    fn settled_phase(&self, state: &ProjectState, quiet: bool, blockers: &[Blocker]) -> ProjectPhase {
        if state.has_blocking_query() {
            ProjectPhase::Blocked
        } else if !quiet {
            ProjectPhase::Running
        } else if !blockers.is_empty() || !state.queue.stalled().is_empty() {
            ProjectPhase::Blocked
        } else if state.queue.is_empty() && state.queue.history().next().is_some() {
            ProjectPhase::Completed
        } else {
            ProjectPhase::Idle
        }
    }

    fn build_report(
        &self,
        state: &ProjectState,
        phase: ProjectPhase,
        mut blockers: Vec<Blocker>,
        warnings: Vec<String>,
        now: DateTime<Utc>,
    ) -> ProjectReport {
        let pending_queries: Vec<Query> = state.queries.iter().filter(|q| q.is_pending()).cloned().collect();
        blockers.extend(pending_queries.iter().filter(|q| q.blocks()).map(Blocker::from_query));
        if phase == ProjectPhase::Blocked {
            for id in state.queue.stalled() {
                blockers.push(Blocker::new(
                    BlockerCategory::Dependency,
                    format!("Item {} depends on work that failed or was cancelled", id.short()),
                    "cancel the item or resubmit its dependency",
                ));
            }
        }

        let budget = state.admission.status(now);
        ProjectReport {
            project_id: state.id.clone(),
            phase,
            blockers,
            pending_queries,
            active_cycles: state
                .cycles
                .iter()
                .filter(|c| !c.status.is_terminal())
                .map(CycleSummary::from)
                .collect(),
            active_agents: if budget.status == BudgetStatus::Blocked {
                0
            } else {
                state.in_flight.len()
            },
            budget,
            pending_items: state.queue.pending_count(),
            processing_items: state.queue.processing_count(),
            scheduled_retries: state.queue.scheduled_retry_count(),
            next_retry_at: state.queue.next_retry_at(),
            queue_stats: state.queue.stats().clone(),
            warnings,
        }
    }

    /// Wake the project when its earliest retry timer is due.
    fn schedule_wake(&self, state: &mut ProjectState) {
        let Some(at) = state.queue.next_retry_at() else {
            return;
        };
        if state.wake_at.is_some_and(|scheduled| scheduled <= at) {
            return;
        }
        state.wake_at = Some(at);
        tracing::debug!(project = %state.id, %at, "retry wake-up scheduled");
        tokio::spawn(self.retry_wake(state.id.clone(), at));
    }

    fn retry_wake(&self, project_id: ProjectId, at: DateTime<Utc>) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move {
            let delay = (at - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(delay).await;
            if let Ok(state) = this.project(&project_id).await {
                let mut guard = state.lock().await;
                if guard.wake_at == Some(at) {
                    guard.wake_at = None;
                }
            }
            if let Err(err) = this.drive_project(&project_id).await {
                tracing::warn!(project = %project_id, error = %err, "retry wake-up failed");
            }
        }
        .boxed()
    }

    async fn persist(&self, state: &ProjectState, now: DateTime<Utc>) -> Result<()> {
        self.inner.store.save(&state.snapshot(now)).await
    }

    async fn project(&self, project_id: &ProjectId) -> Result<Arc<Mutex<ProjectState>>> {
        if let Some(state) = self.inner.projects.read().await.get(project_id) {
            return Ok(Arc::clone(state));
        }
        if self.restore_project(project_id).await? {
            if let Some(state) = self.inner.projects.read().await.get(project_id) {
                return Ok(Arc::clone(state));
            }
        }
        Err(Error::ProjectNotFound(project_id.clone()))
    }

    async fn project_or_create(&self, project_id: &ProjectId) -> Result<Arc<Mutex<ProjectState>>> {
        match self.project(project_id).await {
            Ok(state) => Ok(state),
            Err(Error::ProjectNotFound(_)) => {
                let mut projects = self.inner.projects.write().await;
                let state = projects.entry(project_id.clone()).or_insert_with(|| {
                    tracing::info!(project = %project_id, "project created");
                    Arc::new(Mutex::new(ProjectState::new(
                        project_id.clone(),
                        &self.inner.config,
                        &self.inner.events,
                    )))
                });
                Ok(Arc::clone(state))
            }
            Err(err) => Err(err),
        }
    }

    fn emit(&self, event: impl Into<Notification>) {
        self.inner.events.publish(event.into());
    }
}
