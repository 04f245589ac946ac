//! Admission decisions for one project.
//!
//! `AdmissionController` answers "may this project start one more execution
//! of N tokens right now?" by re-aggregating its ledger. Checks run in a fixed
//! order and stop at the first violation:
//!
//! 1. per-request token cap
//! 2. daily token cap (current UTC day, including outstanding reservations)
//! 3. requests per minute, then per hour (trailing windows)
//! 4. parallel executions of the project
//! 5. queue depth (Pending + Processing)
//!
//! Refusals are values, not errors: the caller gets a reason and, for window
//! limits, the time the window resets.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::admission::ledger::{next_day_start, BudgetLedger, BudgetLimits, ReservationId, UsageEvent};
use crate::core::ids::ProjectId;
use crate::events::{BudgetEvent, EventBus, Notification};

/// Which check refused an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Refusal {
    RequestTooLarge,
    DailyBudget,
    MinuteRate,
    HourRate,
    ParallelWorkers,
    QueueDepth,
}

impl Refusal {
    /// Token budget exhaustion, as opposed to rate or concurrency pressure.
    pub fn is_budget(&self) -> bool {
        matches!(self, Refusal::RequestTooLarge | Refusal::DailyBudget)
    }

    pub fn is_rate(&self) -> bool {
        matches!(self, Refusal::MinuteRate | Refusal::HourRate)
    }

    /// Actionable hint shown alongside the reason.
    pub fn next_step(&self) -> &'static str {
        match self {
            Refusal::RequestTooLarge => "split the work item or raise per_request_token_cap",
            Refusal::DailyBudget => "wait for the daily reset or raise daily_token_cap",
            Refusal::MinuteRate | Refusal::HourRate => "wait for the rate window to reset",
            Refusal::ParallelWorkers => "wait for running work to finish or raise max_parallel_workers",
            Refusal::QueueDepth => "cancel queued work or raise max_queue_depth",
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub refusal: Option<Refusal>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            refusal: None,
            reset_at: None,
        }
    }

    pub fn deny(refusal: Refusal, reason: String, reset_at: Option<DateTime<Utc>>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            refusal: Some(refusal),
            reset_at,
        }
    }
}

/// Current execution load of a project, supplied by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectLoad {
    pub active_workers: usize,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    #[default]
    Healthy,
    Warning,
    Blocked,
}

impl std::fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetStatus::Healthy => write!(f, "healthy"),
            BudgetStatus::Warning => write!(f, "warning"),
            BudgetStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Budget summary for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetReport {
    pub status: BudgetStatus,
    pub used_tokens: u64,
    pub remaining_tokens: u64,
    pub daily_cap: u64,
    pub requests_last_minute: usize,
    pub requests_last_hour: usize,
    pub reason: Option<String>,
    pub reset_at: Option<DateTime<Utc>>,
}

pub struct AdmissionController {
    project_id: ProjectId,
    ledger: BudgetLedger,
    last_status: BudgetStatus,
    events: Option<EventBus>,
}

impl AdmissionController {
    pub fn new(project_id: ProjectId, limits: BudgetLimits) -> Self {
        Self::from_ledger(project_id, BudgetLedger::new(limits))
    }

    pub fn from_ledger(project_id: ProjectId, ledger: BudgetLedger) -> Self {
        Self {
            project_id,
            ledger,
            last_status: BudgetStatus::Healthy,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.ledger.limits
    }

    pub fn set_limits(&mut self, limits: BudgetLimits) {
        tracing::info!(project = %self.project_id, ?limits, "budget limits updated");
        self.ledger.limits = limits;
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    /// Decide without reserving anything.
    pub fn can_admit(&self, estimated_tokens: u64, load: ProjectLoad, now: DateTime<Utc>) -> AdmissionDecision {
        let limits = &self.ledger.limits;

        if estimated_tokens > limits.per_request_token_cap {
            return AdmissionDecision::deny(
                Refusal::RequestTooLarge,
                format!(
                    "Request of {} tokens exceeds per-request limit of {}",
                    estimated_tokens, limits.per_request_token_cap
                ),
                None,
            );
        }

        let used = self.ledger.tokens_today(now);
        if used.saturating_add(estimated_tokens) > limits.daily_token_cap {
            return AdmissionDecision::deny(
                Refusal::DailyBudget,
                format!(
                    "Daily token limit reached: {} of {} used, {} requested",
                    used, limits.daily_token_cap, estimated_tokens
                ),
                Some(next_day_start(now)),
            );
        }

        let windows = [
            (Refusal::MinuteRate, Duration::minutes(1), limits.requests_per_minute, "minute"),
            (Refusal::HourRate, Duration::hours(1), limits.requests_per_hour, "hour"),
        ];
        for (refusal, window, cap, label) in windows {
            let count = self.ledger.requests_within(window, now);
            if count >= cap {
                return AdmissionDecision::deny(
                    refusal,
                    format!(
                        "Rate limit reached: {} requests in the last {} (limit {})",
                        count, label, cap
                    ),
                    self.ledger.window_reset(window, now),
                );
            }
        }

        if load.active_workers >= limits.max_parallel_workers {
            return AdmissionDecision::deny(
                Refusal::ParallelWorkers,
                format!(
                    "Parallel worker limit reached: {} of {} active",
                    load.active_workers, limits.max_parallel_workers
                ),
                None,
            );
        }

        if let Some(refused) = self.queue_depth_refusal(load.queue_depth) {
            return refused;
        }

        AdmissionDecision::allow()
    }

    /// Whether one more item may join the queue. Only the depth limit
    /// applies here; tokens and rates are judged when the item is started.
    pub fn can_enqueue(&self, load: ProjectLoad) -> AdmissionDecision {
        match self.queue_depth_refusal(load.queue_depth + 1) {
            Some(refused) => {
                tracing::info!(
                    project = %self.project_id,
                    queue_depth = load.queue_depth,
                    "submission refused"
                );
                refused
            }
            None => AdmissionDecision::allow(),
        }
    }

    fn queue_depth_refusal(&self, depth: usize) -> Option<AdmissionDecision> {
        let max = self.ledger.limits.max_queue_depth;
        (depth > max).then(|| {
            AdmissionDecision::deny(
                Refusal::QueueDepth,
                format!("Queue depth limit reached: {} items (limit {})", depth, max),
                None,
            )
        })
    }

    /// Check and, when allowed, reserve `estimated_tokens` in the same step.
    /// The caller must hand the reservation back through `settle` or
    /// `release`.
    pub fn admit(
        &mut self,
        estimated_tokens: u64,
        load: ProjectLoad,
        now: DateTime<Utc>,
    ) -> std::result::Result<ReservationId, AdmissionDecision> {
        let decision = self.can_admit(estimated_tokens, load, now);
        if !decision.allowed {
            tracing::info!(
                project = %self.project_id,
                estimated_tokens,
                reason = decision.reason.as_deref().unwrap_or_default(),
                "admission refused"
            );
            if decision.refusal.is_some_and(|r| r.is_budget() || r.is_rate()) {
                self.transition(BudgetStatus::Blocked, &decision, now);
            }
            return Err(decision);
        }

        let reservation = self.ledger.reserve(estimated_tokens, now);
        tracing::debug!(project = %self.project_id, estimated_tokens, "admitted");
        self.observe(now);
        Ok(reservation)
    }

    /// Replace a reservation with actual usage. A failed execution is charged
    /// its input tokens only.
    pub fn settle(
        &mut self,
        reservation: ReservationId,
        input_tokens: u64,
        output_tokens: u64,
        success: bool,
        now: DateTime<Utc>,
    ) -> UsageEvent {
        let output_tokens = if success { output_tokens } else { 0 };
        let event = self.ledger.settle(reservation, input_tokens, output_tokens, now);
        tracing::debug!(
            project = %self.project_id,
            input_tokens = event.input_tokens,
            output_tokens = event.output_tokens,
            success,
            "usage settled"
        );
        self.observe(now);
        event
    }

    pub fn release(&mut self, reservation: ReservationId) {
        self.ledger.release(reservation);
    }

    /// Record usage that did not go through `admit`.
    pub fn record_usage(&mut self, input_tokens: u64, output_tokens: u64, now: DateTime<Utc>) {
        self.ledger.record(UsageEvent {
            at: now,
            input_tokens,
            output_tokens,
        });
        self.observe(now);
    }

    pub fn status(&self, now: DateTime<Utc>) -> BudgetReport {
        let limits = &self.ledger.limits;
        let used = self.ledger.tokens_today(now);
        let remaining = limits.daily_token_cap.saturating_sub(used);
        let per_minute = self.ledger.requests_within(Duration::minutes(1), now);
        let per_hour = self.ledger.requests_within(Duration::hours(1), now);

        let (status, reason, reset_at) = if remaining == 0 {
            (
                BudgetStatus::Blocked,
                Some("Daily token limit reached".to_string()),
                Some(next_day_start(now)),
            )
        } else if per_minute >= limits.requests_per_minute {
            (
                BudgetStatus::Blocked,
                Some("Per-minute request limit reached".to_string()),
                self.ledger.window_reset(Duration::minutes(1), now),
            )
        } else if per_hour >= limits.requests_per_hour {
            (
                BudgetStatus::Blocked,
                Some("Per-hour request limit reached".to_string()),
                self.ledger.window_reset(Duration::hours(1), now),
            )
        } else if used as f64 >= limits.daily_token_cap as f64 * limits.warning_threshold {
            (BudgetStatus::Warning, None, None)
        } else {
            (BudgetStatus::Healthy, None, None)
        };

        BudgetReport {
            status,
            used_tokens: used,
            remaining_tokens: remaining,
            daily_cap: limits.daily_token_cap,
            requests_last_minute: per_minute,
            requests_last_hour: per_hour,
            reason,
            reset_at,
        }
    }

    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        self.ledger.prune(now)
    }

    fn observe(&mut self, now: DateTime<Utc>) {
        let report = self.status(now);
        let decision = AdmissionDecision {
            allowed: report.status != BudgetStatus::Blocked,
            reason: report.reason.clone(),
            refusal: None,
            reset_at: report.reset_at,
        };
        self.transition(report.status, &decision, now);
    }

    fn transition(&mut self, status: BudgetStatus, decision: &AdmissionDecision, now: DateTime<Utc>) {
        if status == self.last_status {
            return;
        }
        self.last_status = status;
        let project_id = self.project_id.clone();
        match status {
            BudgetStatus::Healthy => {}
            BudgetStatus::Warning => {
                let used_tokens = self.ledger.tokens_today(now);
                tracing::warn!(project = %project_id, used_tokens, "budget warning");
                self.emit(BudgetEvent::Warning {
                    project_id,
                    used_tokens,
                    daily_cap: self.ledger.limits.daily_token_cap,
                });
            }
            BudgetStatus::Blocked => {
                let reason = decision.reason.clone().unwrap_or_default();
                tracing::warn!(project = %project_id, reason = %reason, "budget blocked");
                self.emit(BudgetEvent::Blocked {
                    project_id,
                    reason,
                    reset_at: decision.reset_at,
                });
            }
        }
    }

    fn emit(&self, event: BudgetEvent) {
        if let Some(events) = &self.events {
            events.publish(Notification::Budget(event));
        }
    }
}
