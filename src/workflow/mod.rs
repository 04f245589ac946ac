//! The development cycle state machine.
//!
//! Each work item is driven through Define, Test, Implement, Refactor and
//! Review by a `Cycle`. Cycles can be blocked on human queries, paused, and
//! retried in place a bounded number of times.

mod classify;
mod query;
mod state;
mod types;

pub use classify::{extract_question, ErrorClass, ErrorClassifier, KeywordClassifier};
pub use query::{expire_advisory, Query, QueryStatus, Resolution, Urgency};
pub use state::{can_transition, PhaseOutcome, Transition, ValidationResults, MAX_PHASE_ATTEMPTS};
pub use types::{Cycle, CycleMetrics, CyclePhase, CycleStatus, PhaseRecord};
