//! Typed notifications for UI and alerting consumers.
//!
//! Every component publishes through one `EventBus`. Subscribers receive the
//! full `Notification` stream and can match on the category they care about;
//! `Notification::topic` gives the stable wire name (`agent:offline`,
//! `cycle:blocked`, ...).

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::core::ids::{CycleId, ProjectId, QueryId, WorkerId};
use crate::core::item::WorkItemId;
use crate::workflow::CyclePhase;

/// Capacity of the broadcast buffer. Slow subscribers lag instead of
/// blocking publishers.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Worker liveness changes.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Offline {
        worker_id: WorkerId,
        last_heartbeat: DateTime<Utc>,
    },
    Online {
        worker_id: WorkerId,
    },
}

/// One execution attempt bound to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignmentEvent {
    Started {
        project_id: ProjectId,
        item_id: WorkItemId,
        worker_id: Option<WorkerId>,
    },
    Completed {
        project_id: ProjectId,
        item_id: WorkItemId,
        worker_id: Option<WorkerId>,
    },
    Failed {
        project_id: ProjectId,
        item_id: WorkItemId,
        worker_id: Option<WorkerId>,
        error: String,
    },
}

/// Cycle phase lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleEvent {
    PhaseStarted {
        project_id: ProjectId,
        cycle_id: CycleId,
        phase: CyclePhase,
    },
    PhaseCompleted {
        project_id: ProjectId,
        cycle_id: CycleId,
        phase: CyclePhase,
    },
    Blocked {
        project_id: ProjectId,
        cycle_id: CycleId,
        query_id: QueryId,
    },
    Resumed {
        project_id: ProjectId,
        cycle_id: CycleId,
    },
    Completed {
        project_id: ProjectId,
        cycle_id: CycleId,
    },
    Failed {
        project_id: ProjectId,
        cycle_id: CycleId,
        error: String,
    },
}

/// Budget threshold crossings.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetEvent {
    Warning {
        project_id: ProjectId,
        used_tokens: u64,
        daily_cap: u64,
    },
    Blocked {
        project_id: ProjectId,
        reason: String,
        reset_at: Option<DateTime<Utc>>,
    },
}

/// Work queue lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued { item_id: WorkItemId },
    Started { item_id: WorkItemId },
    Completed { item_id: WorkItemId },
    Failed { item_id: WorkItemId, error: String },
    RetryScheduled { item_id: WorkItemId, retry_at: DateTime<Utc> },
    Cancelled { item_id: WorkItemId },
    Rescheduled { item_id: WorkItemId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Agent(AgentEvent),
    Assignment(AssignmentEvent),
    Cycle(CycleEvent),
    Budget(BudgetEvent),
    Queue(QueueEvent),
}

impl Notification {
    /// Stable topic name for external transports.
    pub fn topic(&self) -> &'static str {
        match self {
            Notification::Agent(AgentEvent::Offline { .. }) => "agent:offline",
            Notification::Agent(AgentEvent::Online { .. }) => "agent:online",
            Notification::Assignment(AssignmentEvent::Started { .. }) => "assignment:started",
            Notification::Assignment(AssignmentEvent::Completed { .. }) => "assignment:completed",
            Notification::Assignment(AssignmentEvent::Failed { .. }) => "assignment:failed",
            Notification::Cycle(CycleEvent::PhaseStarted { .. }) => "cycle:phase_started",
            Notification::Cycle(CycleEvent::PhaseCompleted { .. }) => "cycle:phase_completed",
            Notification::Cycle(CycleEvent::Blocked { .. }) => "cycle:blocked",
            Notification::Cycle(CycleEvent::Resumed { .. }) => "cycle:resumed",
            Notification::Cycle(CycleEvent::Completed { .. }) => "cycle:completed",
            Notification::Cycle(CycleEvent::Failed { .. }) => "cycle:failed",
            Notification::Budget(BudgetEvent::Warning { .. }) => "budget:warning",
            Notification::Budget(BudgetEvent::Blocked { .. }) => "budget:blocked",
            Notification::Queue(QueueEvent::Enqueued { .. }) => "queue:enqueued",
            Notification::Queue(QueueEvent::Started { .. }) => "queue:started",
            Notification::Queue(QueueEvent::Completed { .. }) => "queue:completed",
            Notification::Queue(QueueEvent::Failed { .. }) => "queue:failed",
            Notification::Queue(QueueEvent::RetryScheduled { .. }) => "queue:retry_scheduled",
            Notification::Queue(QueueEvent::Cancelled { .. }) => "queue:cancelled",
            Notification::Queue(QueueEvent::Rescheduled { .. }) => "queue:rescheduled",
        }
    }
}

macro_rules! notification_from {
    ($($event:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$event> for Notification {
                fn from(event: $event) -> Self {
                    Notification::$variant(event)
                }
            }
        )*
    };
}

notification_from! {
    AgentEvent => Agent,
    AssignmentEvent => Assignment,
    CycleEvent => Cycle,
    BudgetEvent => Budget,
    QueueEvent => Queue,
}

/// Fan-out channel for notifications.
///
/// Cloning the bus shares the underlying channel. Publishing never blocks
/// and succeeds even when nobody is subscribed.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Notification>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, notification: Notification) {
        tracing::trace!(topic = notification.topic(), "publish");
        // An error only means there are no subscribers right now.
        let _ = self.tx.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
