//! Work item data model for the scheduling queue.
//!
//! A work item is one instruction: an opaque directive plus the outcome the
//! caller expects. Items carry their own retry budget and dependency set;
//! only the `WorkQueue` changes their status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

pub use super::ids::WorkItemId;

/// Scheduling priority. Ordering follows urgency: `Critical` is the greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Background,
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Whether the priority is at or above the "high" threshold used by
    /// priority-first assignment.
    pub fn is_high(&self) -> bool {
        *self >= Priority::High
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Background => write!(f, "background"),
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "background" => Ok(Priority::Background),
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Work item status in its lifecycle.
///
/// Pending -> Processing -> {Completed | Failed | RetryScheduled | Cancelled},
/// with RetryScheduled returning to Pending once its backoff timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    RetryScheduled,
}

impl ItemStatus {
    /// Completed, Failed and Cancelled are final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemStatus::Pending => write!(f, "pending"),
            ItemStatus::Processing => write!(f, "processing"),
            ItemStatus::Completed => write!(f, "completed"),
            ItemStatus::Failed => write!(f, "failed"),
            ItemStatus::Cancelled => write!(f, "cancelled"),
            ItemStatus::RetryScheduled => write!(f, "retry_scheduled"),
        }
    }
}

/// Caller-facing description of new work, turned into a `WorkItem` on enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub directive: String,
    pub expected_outcome: String,
    pub priority: Priority,
    pub dependencies: BTreeSet<WorkItemId>,
    /// Task type matched against worker capabilities.
    pub task_type: String,
    pub tags: BTreeSet<String>,
    /// Token estimate for a single execution attempt.
    pub estimated_tokens: Option<u64>,
    pub estimated_duration: Option<Duration>,
    /// Overrides the queue's default retry budget.
    pub max_retries: Option<u32>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Submission {
    pub fn new(directive: &str, expected_outcome: &str) -> Self {
        Self {
            directive: directive.to_string(),
            expected_outcome: expected_outcome.to_string(),
            priority: Priority::Normal,
            dependencies: BTreeSet::new(),
            task_type: "general".to_string(),
            tags: BTreeSet::new(),
            estimated_tokens: None,
            estimated_duration: None,
            max_retries: None,
            metadata: HashMap::new(),
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, id: WorkItemId) -> Self {
        self.dependencies.insert(id);
        self
    }

    pub fn task_type(mut self, task_type: &str) -> Self {
        self.task_type = task_type.to_string();
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }

    pub fn estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A single schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub directive: String,
    pub expected_outcome: String,
    pub task_type: String,
    pub priority: Priority,
    pub status: ItemStatus,
    /// Items that must reach Completed before this one may be dequeued.
    pub dependencies: BTreeSet<WorkItemId>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub retry_delay_ms: u64,
    pub tags: BTreeSet<String>,
    pub estimated_tokens: u64,
    pub estimated_duration_ms: Option<u64>,
    /// Arrival sequence number, assigned by the queue. Breaks priority ties.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When a RetryScheduled item becomes Pending again.
    pub retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkItem {
    /// Build a pending item from a submission, filling unset fields from
    /// the queue defaults.
    pub fn from_submission(
        submission: Submission,
        default_max_retries: u32,
        retry_delay: Duration,
        default_tokens: u64,
    ) -> Self {
        Self {
            id: WorkItemId::new(),
            directive: submission.directive,
            expected_outcome: submission.expected_outcome,
            task_type: submission.task_type,
            priority: submission.priority,
            status: ItemStatus::Pending,
            dependencies: submission.dependencies,
            retry_count: 0,
            max_retries: submission.max_retries.unwrap_or(default_max_retries),
            retry_delay_ms: retry_delay.as_millis() as u64,
            tags: submission.tags,
            estimated_tokens: submission.estimated_tokens.unwrap_or(default_tokens),
            estimated_duration_ms: submission.estimated_duration.map(|d| d.as_millis() as u64),
            seq: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_at: None,
            last_error: None,
            result: None,
            metadata: submission.metadata,
        }
    }

    /// Transition to Processing and record the start time.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = ItemStatus::Processing;
        self.started_at = Some(now);
    }

    pub fn complete(&mut self, result: &str, now: DateTime<Utc>) {
        self.status = ItemStatus::Completed;
        self.result = Some(result.to_string());
        self.completed_at = Some(now);
    }

    /// Terminal failure.
    pub fn fail(&mut self, error: &str, now: DateTime<Utc>) {
        self.status = ItemStatus::Failed;
        self.last_error = Some(error.to_string());
        self.completed_at = Some(now);
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = ItemStatus::Cancelled;
        self.completed_at = Some(now);
    }

    /// Backoff delay for the retry that is about to be scheduled:
    /// `base * 2^(retry_count - 1)`, with the exponent capped at 5.
    pub fn backoff_delay(&self) -> Duration {
        let exponent = self.retry_count.saturating_sub(1).min(5);
        Duration::from_millis(self.retry_delay_ms.saturating_mul(1u64 << exponent))
    }

    /// Whether another attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Time spent waiting before processing began.
    pub fn wait_time(&self) -> Option<chrono::Duration> {
        self.started_at.map(|s| s - self.created_at)
    }
}
