//! Cycle phase transitions.
//!
//! A cycle moves forward one phase at a time:
//!
//! Define -> Test -> Implement -> Refactor -> Review -> Completed
//!
//! A failed phase may be retried in place up to `MAX_PHASE_ATTEMPTS` times
//! before the cycle fails. A blocking query parks the cycle in Blocked until
//! the query is resolved; it then resumes at the same phase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::QueryId;
use crate::error::{Error, Result};

use super::{Cycle, CyclePhase, CycleStatus, PhaseRecord};

/// Failed attempts at one phase before the cycle is marked Failed.
pub const MAX_PHASE_ATTEMPTS: u32 = 3;

/// Pass/fail counts reported by a phase execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResults {
    pub passed: u32,
    pub failed: u32,
}

/// Result of executing the current phase once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub success: bool,
    pub artifacts: Vec<String>,
    pub validation: ValidationResults,
    /// Explicit next phase; defaults to the natural successor.
    pub next_phase: Option<CyclePhase>,
    pub should_retry: bool,
    pub error: Option<String>,
    pub tokens_used: u64,
}

impl PhaseOutcome {
    pub fn succeeded(artifacts: Vec<String>) -> Self {
        Self {
            success: true,
            artifacts,
            ..Self::default()
        }
    }

    pub fn failed(error: &str, should_retry: bool) -> Self {
        Self {
            success: false,
            should_retry,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }
}

/// What `Cycle::apply` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Advanced { from: CyclePhase, to: CyclePhase },
    Completed,
    Retrying { phase: CyclePhase, attempt: u32 },
    Failed { phase: CyclePhase, error: String },
}

/// Whether `to` directly follows `from`.
pub fn can_transition(from: CyclePhase, to: CyclePhase) -> bool {
    matches!(
        (from, to),
        (CyclePhase::Define, CyclePhase::Test)
            | (CyclePhase::Test, CyclePhase::Implement)
            | (CyclePhase::Implement, CyclePhase::Refactor)
            | (CyclePhase::Refactor, CyclePhase::Review)
            | (CyclePhase::Review, CyclePhase::Completed)
    )
}

impl Cycle {
    /// Mark the current phase as being executed.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.status.is_runnable() {
            return Err(self.invalid_status("in_progress"));
        }
        self.status = CycleStatus::InProgress;
        self.attempt_started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Apply the outcome of one phase execution.
    pub fn apply(&mut self, outcome: PhaseOutcome, now: DateTime<Utc>) -> Result<Transition> {
        if self.status != CycleStatus::InProgress {
            return Err(self.invalid_status("apply"));
        }

        if outcome.success {
            let target = match outcome.next_phase.or_else(|| self.phase.next()) {
                Some(target) => target,
                None => return Err(self.invalid_status("advance")),
            };
            if !can_transition(self.phase, target) {
                return Err(Error::InvalidPhaseTransition {
                    from: self.phase.to_string(),
                    to: target.to_string(),
                });
            }
        }

        self.record_attempt(&outcome, now);

        if outcome.success {
            let from = self.phase;
            let to = outcome.next_phase.or_else(|| from.next()).unwrap_or(CyclePhase::Completed);
            self.artifacts = outcome.artifacts;
            self.last_error = None;
            self.attempt = 0;
            if let Some(record) = self.phase_history.last_mut() {
                record.completed_at = Some(now);
            }
            self.phase = to;
            self.phase_history.push(PhaseRecord {
                phase: to,
                entered_at: now,
                completed_at: None,
            });

            if to == CyclePhase::Completed {
                self.status = CycleStatus::Completed;
                self.completed_at = Some(now);
                if let Some(record) = self.phase_history.last_mut() {
                    record.completed_at = Some(now);
                }
                return Ok(Transition::Completed);
            }
            return Ok(Transition::Advanced { from, to });
        }

        let error = outcome
            .error
            .unwrap_or_else(|| format!("{} phase failed", self.phase));
        self.attempt += 1;
        self.last_error = Some(error.clone());

        if outcome.should_retry && self.attempt < MAX_PHASE_ATTEMPTS {
            return Ok(Transition::Retrying {
                phase: self.phase,
                attempt: self.attempt,
            });
        }

        self.status = CycleStatus::Failed;
        self.completed_at = Some(now);
        Ok(Transition::Failed {
            phase: self.phase,
            error,
        })
    }

    /// Fail the cycle without executing anything, e.g. when its work item
    /// was cancelled.
    pub fn abort(&mut self, error: &str, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = CycleStatus::Failed;
        self.last_error = Some(error.to_string());
        self.blocking_query = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Park the cycle until `query` is resolved.
    pub fn block(&mut self, query: QueryId, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() || self.status == CycleStatus::Blocked {
            return Err(self.invalid_status("blocked"));
        }
        self.status = CycleStatus::Blocked;
        self.blocking_query = Some(query);
        self.attempt_started_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Resume at the same phase after `query` was answered or dismissed.
    pub fn unblock(&mut self, query: QueryId, guidance: Option<String>, now: DateTime<Utc>) -> Result<()> {
        if self.status != CycleStatus::Blocked || self.blocking_query != Some(query) {
            return Err(self.invalid_status("in_progress"));
        }
        self.status = CycleStatus::InProgress;
        self.blocking_query = None;
        // The answer supersedes the error that raised the query.
        self.last_error = None;
        if let Some(answer) = guidance {
            self.human_guidance.push(answer);
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !matches!(self.status, CycleStatus::Pending | CycleStatus::InProgress) {
            return Err(self.invalid_status("paused"));
        }
        self.status = CycleStatus::Paused;
        self.attempt_started_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != CycleStatus::Paused {
            return Err(self.invalid_status("in_progress"));
        }
        self.status = CycleStatus::InProgress;
        self.updated_at = now;
        Ok(())
    }

    fn record_attempt(&mut self, outcome: &PhaseOutcome, now: DateTime<Utc>) {
        let elapsed = self
            .attempt_started_at
            .take()
            .map(|started| (now - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let metrics = &mut self.metrics;
        metrics.iterations += 1;
        metrics.total_elapsed_ms += elapsed;
        *metrics.phase_elapsed_ms.entry(self.phase).or_insert(0) += elapsed;
        metrics.validations_passed += outcome.validation.passed;
        metrics.validations_failed += outcome.validation.failed;
        metrics.tokens_used += outcome.tokens_used;
        self.updated_at = now;
    }

    fn invalid_status(&self, to: &str) -> Error {
        Error::InvalidPhaseTransition {
            from: format!("{}/{}", self.phase, self.status),
            to: to.to_string(),
        }
    }
}
