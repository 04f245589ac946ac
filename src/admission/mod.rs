//! Per-project admission control: token budgets, request rates and
//! concurrency limits.

mod controller;
mod ledger;

pub use controller::{
    AdmissionController, AdmissionDecision, BudgetReport, BudgetStatus, ProjectLoad, Refusal,
};
pub use ledger::{
    day_start, next_day_start, BudgetLedger, BudgetLimits, ReservationId, UsageEvent,
    DEFAULT_DAILY_TOKEN_CAP, DEFAULT_MAX_PARALLEL_WORKERS, DEFAULT_MAX_QUEUE_DEPTH,
    DEFAULT_PER_REQUEST_TOKEN_CAP, DEFAULT_REQUESTS_PER_HOUR, DEFAULT_REQUESTS_PER_MINUTE,
    DEFAULT_WARNING_THRESHOLD,
};
