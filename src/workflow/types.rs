//! Cycle type definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::ids::{CycleId, ProjectId, QueryId};
use crate::core::item::WorkItemId;

/// Phases of the development methodology, in execution order.
///
/// Define -> Test -> Implement -> Refactor -> Review -> Completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    /// Clarify acceptance criteria for the directive
    Define,
    /// Write failing tests that capture the expected outcome
    Test,
    /// Make the tests pass
    Implement,
    /// Improve structure without changing behaviour
    Refactor,
    /// Verify the result against the expected outcome
    Review,
    /// All phases finished
    Completed,
}

impl CyclePhase {
    /// Every phase in order, ending with `Completed`.
    pub const ALL: [CyclePhase; 6] = [
        CyclePhase::Define,
        CyclePhase::Test,
        CyclePhase::Implement,
        CyclePhase::Refactor,
        CyclePhase::Review,
        CyclePhase::Completed,
    ];

    /// The phase that follows this one, or `None` after `Completed`.
    pub fn next(&self) -> Option<CyclePhase> {
        match self {
            CyclePhase::Define => Some(CyclePhase::Test),
            CyclePhase::Test => Some(CyclePhase::Implement),
            CyclePhase::Implement => Some(CyclePhase::Refactor),
            CyclePhase::Refactor => Some(CyclePhase::Review),
            CyclePhase::Review => Some(CyclePhase::Completed),
            CyclePhase::Completed => None,
        }
    }

    /// Instruction given to the worker for this phase.
    pub fn directive(&self) -> &'static str {
        match self {
            CyclePhase::Define => {
                "Clarify the acceptance criteria for the task below. List the observable behaviours that must hold when it is done."
            }
            CyclePhase::Test => {
                "Write failing tests that capture the expected outcome below. Do not implement the behaviour yet."
            }
            CyclePhase::Implement => "Implement the task below so that the tests written for it pass.",
            CyclePhase::Refactor => {
                "Refactor the implementation of the task below without changing its behaviour. Keep all tests passing."
            }
            CyclePhase::Review => {
                "Review the finished work against the expected outcome below and report any gaps."
            }
            CyclePhase::Completed => "",
        }
    }
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CyclePhase::Define => write!(f, "define"),
            CyclePhase::Test => write!(f, "test"),
            CyclePhase::Implement => write!(f, "implement"),
            CyclePhase::Refactor => write!(f, "refactor"),
            CyclePhase::Review => write!(f, "review"),
            CyclePhase::Completed => write!(f, "completed"),
        }
    }
}

/// Status of a cycle in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// Created, first phase not started yet
    #[default]
    Pending,
    /// A phase is being executed or is ready to execute
    InProgress,
    /// Waiting on a blocking human query
    Blocked,
    /// Suspended explicitly or by admission refusal
    Paused,
    Completed,
    Failed,
}

impl CycleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleStatus::Completed | CycleStatus::Failed)
    }

    /// Whether the coordinator may run the cycle's current phase.
    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            CycleStatus::Pending | CycleStatus::InProgress | CycleStatus::Paused
        )
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleStatus::Pending => write!(f, "pending"),
            CycleStatus::InProgress => write!(f, "in_progress"),
            CycleStatus::Blocked => write!(f, "blocked"),
            CycleStatus::Paused => write!(f, "paused"),
            CycleStatus::Completed => write!(f, "completed"),
            CycleStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Accumulated measurements for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub total_elapsed_ms: u64,
    pub phase_elapsed_ms: BTreeMap<CyclePhase, u64>,
    /// Phase executions, successful or not.
    pub iterations: u32,
    pub validations_passed: u32,
    pub validations_failed: u32,
    pub tokens_used: u64,
}

/// A record of one phase visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: CyclePhase,
    pub entered_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The methodology state machine bound to one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cycle {
    pub id: CycleId,
    pub project_id: ProjectId,
    pub item_id: WorkItemId,
    pub directive: String,
    pub expected_outcome: String,
    pub phase: CyclePhase,
    pub status: CycleStatus,
    /// Failed attempts at the current phase. Reset when the phase advances.
    pub attempt: u32,
    pub metrics: CycleMetrics,
    pub phase_history: Vec<PhaseRecord>,
    /// Answers from resolved queries, passed to later executions.
    pub human_guidance: Vec<String>,
    /// Output of the last successful phase execution.
    pub artifacts: Vec<String>,
    pub blocking_query: Option<QueryId>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Start of the current phase attempt, used for elapsed-time metrics.
    pub attempt_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Cycle {
    pub fn new(
        project_id: ProjectId,
        item_id: WorkItemId,
        directive: &str,
        expected_outcome: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CycleId::new(),
            project_id,
            item_id,
            directive: directive.to_string(),
            expected_outcome: expected_outcome.to_string(),
            phase: CyclePhase::Define,
            status: CycleStatus::Pending,
            attempt: 0,
            metrics: CycleMetrics::default(),
            phase_history: vec![PhaseRecord {
                phase: CyclePhase::Define,
                entered_at: now,
                completed_at: None,
            }],
            human_guidance: Vec::new(),
            artifacts: Vec::new(),
            blocking_query: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            attempt_started_at: None,
            completed_at: None,
        }
    }

    /// Working context handed to the executor for the current phase.
    pub fn working_context(&self) -> String {
        let mut context = format!(
            "Phase: {}\n{}\n\nTask: {}\nExpected outcome: {}",
            self.phase,
            self.phase.directive(),
            self.directive,
            self.expected_outcome
        );
        if !self.artifacts.is_empty() {
            context.push_str("\n\nPrevious phase output:\n");
            context.push_str(&self.artifacts.join("\n"));
        }
        if !self.human_guidance.is_empty() {
            context.push_str("\n\nGuidance:\n");
            for answer in &self.human_guidance {
                context.push_str("- ");
                context.push_str(answer);
                context.push('\n');
            }
        }
        if let Some(error) = &self.last_error {
            context.push_str("\n\nPrevious attempt failed: ");
            context.push_str(error);
        }
        context
    }
}
