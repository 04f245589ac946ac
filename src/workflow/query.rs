//! Human decision points raised by cycles.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::{CycleId, ProjectId, QueryId};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    /// Halts the owning cycle until resolved. Never expires.
    Blocking,
    /// Informational; work continues and the query may expire.
    Advisory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    #[default]
    Pending,
    Answered,
    Dismissed,
    Expired,
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryStatus::Pending => write!(f, "pending"),
            QueryStatus::Answered => write!(f, "answered"),
            QueryStatus::Dismissed => write!(f, "dismissed"),
            QueryStatus::Expired => write!(f, "expired"),
        }
    }
}

/// How a human resolved a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Answer(String),
    Dismiss,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: QueryId,
    pub project_id: ProjectId,
    pub cycle_id: Option<CycleId>,
    pub question: String,
    pub context: String,
    pub urgency: Urgency,
    pub status: QueryStatus,
    pub decision: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Query {
    /// A query that halts `cycle_id` until answered.
    pub fn blocking(
        project_id: ProjectId,
        cycle_id: CycleId,
        question: &str,
        context: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(project_id, Some(cycle_id), question, context, Urgency::Blocking, now)
    }

    pub fn advisory(project_id: ProjectId, question: &str, context: &str, now: DateTime<Utc>) -> Self {
        Self::new(project_id, None, question, context, Urgency::Advisory, now)
    }

    fn new(
        project_id: ProjectId,
        cycle_id: Option<CycleId>,
        question: &str,
        context: &str,
        urgency: Urgency,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: QueryId::new(),
            project_id,
            cycle_id,
            question: question.to_string(),
            context: context.to_string(),
            urgency,
            status: QueryStatus::Pending,
            decision: None,
            created_at: now,
            resolved_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    /// Whether this query currently halts its cycle.
    pub fn blocks(&self) -> bool {
        self.is_pending() && self.urgency == Urgency::Blocking
    }

    /// Record the human decision. Returns the guidance to hand to the cycle,
    /// if any.
    pub fn resolve(&mut self, resolution: Resolution, now: DateTime<Utc>) -> Result<Option<String>> {
        if !self.is_pending() {
            return Err(Error::QueryAlreadyResolved(self.id));
        }
        self.resolved_at = Some(now);
        match resolution {
            Resolution::Answer(decision) => {
                self.status = QueryStatus::Answered;
                self.decision = Some(decision.clone());
                Ok(Some(decision))
            }
            Resolution::Dismiss => {
                self.status = QueryStatus::Dismissed;
                Ok(None)
            }
        }
    }

    /// Expire an advisory query older than `ttl`. Blocking queries wait for
    /// a human indefinitely.
    pub fn expire_if_stale(&mut self, now: DateTime<Utc>, ttl: Duration) -> bool {
        if self.urgency != Urgency::Advisory || !self.is_pending() {
            return false;
        }
        if now - self.created_at < ttl {
            return false;
        }
        self.status = QueryStatus::Expired;
        self.resolved_at = Some(now);
        true
    }
}

/// Expire every stale advisory query, returning how many changed.
pub fn expire_advisory<'a>(
    queries: impl IntoIterator<Item = &'a mut Query>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> usize {
    queries
        .into_iter()
        .map(|q| q.expire_if_stale(now, ttl))
        .filter(|expired| *expired)
        .count()
}
