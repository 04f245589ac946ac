//! Priority- and dependency-aware work queue.
//!
//! The `WorkQueue` owns every work item of one project. Pending items are kept
//! sorted by priority, ties broken by arrival order. `dequeue` hands out the
//! first pending item whose dependencies have all completed, skipping (but not
//! reordering) items that still wait on something. The number of items in
//! Processing is bounded by `max_concurrent`.
//!
//! Failed attempts are retried with exponential backoff. A retrying item sits
//! in RetryScheduled, holds no concurrency slot, and re-enters the pending
//! order once its `retry_at` passes. The owner is expected to sleep until
//! `next_retry_at()` rather than poll.
//!
//! The queue is a plain struct; callers serialize access to it (one lock per
//! project).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use crate::core::item::{ItemStatus, Priority, Submission, WorkItem, WorkItemId};
use crate::error::{Error, Result};
use crate::events::{EventBus, Notification, QueueEvent};
use crate::queue::stats::QueueStats;

/// Default number of items that may be Processing at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 2;

/// Default number of live (non-terminal) items the queue accepts. Kept above
/// the admission queue-depth limit so submissions are refused by admission
/// first.
pub const DEFAULT_MAX_SIZE: usize = 500;

/// Default number of finished items retained for inspection.
pub const DEFAULT_COMPLETED_HISTORY: usize = 100;

/// Default retry budget per item.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default token estimate for one execution attempt.
pub const DEFAULT_ITEM_TOKENS: u64 = 4000;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub max_size: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub completed_history: usize,
    pub default_tokens: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_size: DEFAULT_MAX_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            completed_history: DEFAULT_COMPLETED_HISTORY,
            default_tokens: DEFAULT_ITEM_TOKENS,
        }
    }
}

/// What `fail` did with the item.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// The item will become Pending again at `retry_at`.
    RetryScheduled {
        retry_count: u32,
        retry_at: DateTime<Utc>,
    },
    /// The retry budget is exhausted; the item is terminally Failed.
    Failed,
}

/// Serializable queue contents used for persistence and recovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub items: Vec<WorkItem>,
    pub next_seq: u64,
}

pub struct WorkQueue {
    config: QueueConfig,
    /// Live items: Pending, Processing and RetryScheduled.
    items: HashMap<WorkItemId, WorkItem>,
    /// Pending ids in dequeue order.
    pending: Vec<WorkItemId>,
    processing: HashSet<WorkItemId>,
    /// Terminal status of every retired item. Ids outlive the history ring so
    /// dependency checks stay correct after eviction.
    outcomes: HashMap<WorkItemId, ItemStatus>,
    /// Most recently retired items, oldest first.
    history: VecDeque<WorkItem>,
    next_seq: u64,
    stats: QueueStats,
    events: Option<EventBus>,
}

impl WorkQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            items: HashMap::new(),
            pending: Vec::new(),
            processing: HashSet::new(),
            outcomes: HashMap::new(),
            history: VecDeque::new(),
            next_seq: 0,
            stats: QueueStats::default(),
            events: None,
        }
    }

    /// Publish lifecycle events on the given bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Add new work. Fails when the queue is full or a dependency id has
    /// never been seen by this queue.
    pub fn enqueue(&mut self, submission: Submission) -> Result<WorkItemId> {
        if self.is_full() {
            return Err(Error::QueueFull {
                max: self.config.max_size,
            });
        }
        if let Some(unknown) = submission.dependencies.iter().find(|d| !self.knows(d)) {
            return Err(Error::UnknownDependency(*unknown));
        }

        let mut item = WorkItem::from_submission(
            submission,
            self.config.max_retries,
            self.config.retry_base_delay,
            self.config.default_tokens,
        );
        item.seq = self.next_seq;
        self.next_seq += 1;

        let id = item.id;
        tracing::debug!(
            item = %id.short(),
            priority = %item.priority,
            deps = item.dependencies.len(),
            "enqueued"
        );
        self.items.insert(id, item);
        self.insert_pending(id);
        self.stats.record_enqueued();
        self.emit(QueueEvent::Enqueued { item_id: id });
        Ok(id)
    }

    /// Take the next eligible item, if a concurrency slot is free.
    pub fn dequeue(&mut self) -> Option<WorkItem> {
        self.dequeue_at(Utc::now())
    }

    pub fn dequeue_at(&mut self, now: DateTime<Utc>) -> Option<WorkItem> {
        self.promote_due_retries(now);
        if !self.has_free_slot() {
            return None;
        }

        let pos = self.pending.iter().position(|id| {
            self.items
                .get(id)
                .is_some_and(|item| self.dependencies_met(item))
        })?;
        let id = self.pending.remove(pos);

        let item = self.items.get_mut(&id)?;
        let ready_since = item.retry_at.unwrap_or(item.created_at);
        item.start(now);
        let started = item.clone();

        self.processing.insert(id);
        self.stats
            .record_started((now - ready_since).num_milliseconds());
        tracing::debug!(item = %id.short(), attempt = started.retry_count + 1, "dequeued");
        self.emit(QueueEvent::Started { item_id: id });
        Some(started)
    }

    pub fn complete(&mut self, id: WorkItemId, result: &str) -> Result<()> {
        self.complete_at(id, result, Utc::now())
    }

    pub fn complete_at(&mut self, id: WorkItemId, result: &str, now: DateTime<Utc>) -> Result<()> {
        let item = self.processing_item_mut(id, "complete")?;
        item.complete(result, now);
        let processing_ms = processing_ms(item, now);

        self.processing.remove(&id);
        self.stats.record_completed(processing_ms, now);
        self.retire(id);
        tracing::debug!(item = %id.short(), processing_ms, "completed");
        self.emit(QueueEvent::Completed { item_id: id });
        Ok(())
    }

    /// Record a failed attempt. Schedules a retry while the item has retry
    /// budget left, otherwise marks it terminally Failed.
    pub fn fail(&mut self, id: WorkItemId, error: &str) -> Result<FailureOutcome> {
        self.fail_at(id, error, Utc::now())
    }

    pub fn fail_at(
        &mut self,
        id: WorkItemId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let item = self.processing_item_mut(id, "fail")?;
        let processing_ms = processing_ms(item, now);

        if item.can_retry() {
            item.retry_count += 1;
            item.last_error = Some(error.to_string());
            let delay = chrono::Duration::from_std(item.backoff_delay())
                .unwrap_or_else(|_| chrono::Duration::zero());
            let retry_at = now + delay;
            item.status = ItemStatus::RetryScheduled;
            item.retry_at = Some(retry_at);
            let retry_count = item.retry_count;

            self.processing.remove(&id);
            self.stats.record_failed(processing_ms, false);
            tracing::info!(
                item = %id.short(),
                retry_count,
                retry_at = %retry_at,
                error,
                "retry scheduled"
            );
            self.emit(QueueEvent::RetryScheduled {
                item_id: id,
                retry_at,
            });
            Ok(FailureOutcome::RetryScheduled {
                retry_count,
                retry_at,
            })
        } else {
            item.fail(error, now);
            self.processing.remove(&id);
            self.stats.record_failed(processing_ms, true);
            self.retire(id);
            tracing::warn!(item = %id.short(), error, "failed permanently");
            self.emit(QueueEvent::Failed {
                item_id: id,
                error: error.to_string(),
            });
            Ok(FailureOutcome::Failed)
        }
    }

    /// Cancel a live item. Returns the status it had before cancellation so
    /// the caller knows whether an execution has to be stopped.
    pub fn cancel(&mut self, id: WorkItemId) -> Result<ItemStatus> {
        self.cancel_at(id, Utc::now())
    }

    pub fn cancel_at(&mut self, id: WorkItemId, now: DateTime<Utc>) -> Result<ItemStatus> {
        if !self.items.contains_key(&id) {
            return Err(self.missing(id, "cancel"));
        }
        let item = self
            .items
            .get_mut(&id)
            .ok_or(Error::WorkItemNotFound(id))?;
        let previous = item.status;
        item.cancel(now);

        self.pending.retain(|p| p != &id);
        self.processing.remove(&id);
        self.stats.record_cancelled();
        self.retire(id);
        tracing::info!(item = %id.short(), previous = %previous, "cancelled");
        self.emit(QueueEvent::Cancelled { item_id: id });
        Ok(previous)
    }

    /// Change the priority of a waiting item, keeping its arrival order
    /// among items of the new priority.
    pub fn reschedule(&mut self, id: WorkItemId, priority: Priority) -> Result<()> {
        if !self.items.contains_key(&id) {
            return Err(self.missing(id, "reschedule"));
        }
        let item = self
            .items
            .get_mut(&id)
            .ok_or(Error::WorkItemNotFound(id))?;
        let status = item.status;
        if !matches!(status, ItemStatus::Pending | ItemStatus::RetryScheduled) {
            return Err(Error::InvalidItemState {
                id,
                status,
                operation: "reschedule",
            });
        }
        item.priority = priority;

        if status == ItemStatus::Pending {
            self.pending.retain(|p| p != &id);
            self.insert_pending(id);
        }
        tracing::debug!(item = %id.short(), priority = %priority, "rescheduled");
        self.emit(QueueEvent::Rescheduled { item_id: id });
        Ok(())
    }

    /// Return a Processing item to Pending without spending a retry, e.g.
    /// when no worker could take it.
    pub fn requeue(&mut self, id: WorkItemId) -> Result<()> {
        let item = self.processing_item_mut(id, "requeue")?;
        item.status = ItemStatus::Pending;
        item.started_at = None;
        self.processing.remove(&id);
        self.insert_pending(id);
        Ok(())
    }

    /// Move every RetryScheduled item whose timer has fired back to Pending.
    pub fn promote_due_retries(&mut self, now: DateTime<Utc>) -> usize {
        let due: Vec<WorkItemId> = self
            .items
            .values()
            .filter(|item| {
                item.status == ItemStatus::RetryScheduled
                    && item.retry_at.is_some_and(|at| at <= now)
            })
            .map(|item| item.id)
            .collect();

        for id in &due {
            if let Some(item) = self.items.get_mut(id) {
                item.status = ItemStatus::Pending;
            }
            self.insert_pending(*id);
        }
        due.len()
    }

    /// Earliest pending retry timer, if any.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.items
            .values()
            .filter(|item| item.status == ItemStatus::RetryScheduled)
            .filter_map(|item| item.retry_at)
            .min()
    }

    /// Pending items that could be dequeued right now, in dequeue order.
    pub fn ready_items(&self) -> Vec<&WorkItem> {
        self.pending
            .iter()
            .filter_map(|id| self.items.get(id))
            .filter(|item| self.dependencies_met(item))
            .collect()
    }

    /// Waiting items that depend on a Failed or Cancelled item and so can
    /// never become ready.
    pub fn stalled(&self) -> Vec<WorkItemId> {
        let mut stalled: Vec<&WorkItem> = self
            .items
            .values()
            .filter(|item| item.status != ItemStatus::Processing)
            .filter(|item| {
                item.dependencies.iter().any(|dep| {
                    matches!(
                        self.outcomes.get(dep),
                        Some(ItemStatus::Failed | ItemStatus::Cancelled)
                    )
                })
            })
            .collect();
        stalled.sort_by_key(|item| item.seq);
        stalled.into_iter().map(|item| item.id).collect()
    }

    /// Look up a live or recently retired item.
    pub fn get(&self, id: &WorkItemId) -> Option<&WorkItem> {
        self.items
            .get(id)
            .or_else(|| self.history.iter().find(|item| &item.id == id))
    }

    pub fn status(&self, id: &WorkItemId) -> Option<ItemStatus> {
        self.items
            .get(id)
            .map(|item| item.status)
            .or_else(|| self.outcomes.get(id).copied())
    }

    /// Retired items, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &WorkItem> {
        self.history.iter()
    }

    pub fn processing_ids(&self) -> Vec<WorkItemId> {
        let mut ids: Vec<WorkItemId> = self.processing.iter().copied().collect();
        ids.sort();
        ids
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn processing_count(&self) -> usize {
        self.processing.len()
    }

    pub fn scheduled_retry_count(&self) -> usize {
        self.items
            .values()
            .filter(|item| item.status == ItemStatus::RetryScheduled)
            .count()
    }

    /// Number of live items (Pending, Processing, RetryScheduled).
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.config.max_size
    }

    pub fn has_free_slot(&self) -> bool {
        self.processing.len() < self.config.max_concurrent
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut items: Vec<WorkItem> = self
            .history
            .iter()
            .cloned()
            .chain(self.items.values().cloned())
            .collect();
        items.sort_by_key(|item| item.seq);
        QueueSnapshot {
            items,
            next_seq: self.next_seq,
        }
    }

    /// Rebuild a queue from a snapshot. Items that were Processing when the
    /// snapshot was taken go back to Pending: their execution died with the
    /// process that ran it.
    pub fn restore(config: QueueConfig, snapshot: QueueSnapshot) -> Self {
        let mut queue = Self::new(config);
        let mut next_seq = snapshot.next_seq;
        let mut retired: Vec<WorkItem> = Vec::new();

        for mut item in snapshot.items {
            next_seq = next_seq.max(item.seq + 1);
            if item.status.is_terminal() {
                queue.outcomes.insert(item.id, item.status);
                retired.push(item);
                continue;
            }
            if item.status == ItemStatus::Processing {
                item.status = ItemStatus::Pending;
                item.started_at = None;
            }
            queue.items.insert(item.id, item);
        }

        retired.sort_by_key(|item| item.completed_at);
        let keep_from = retired.len().saturating_sub(queue.config.completed_history);
        queue.history = retired.into_iter().skip(keep_from).collect();

        let mut pending: Vec<&WorkItem> = queue
            .items
            .values()
            .filter(|item| item.status == ItemStatus::Pending)
            .collect();
        pending.sort_by_key(|item| sort_key(item));
        queue.pending = pending.into_iter().map(|item| item.id).collect();
        queue.next_seq = next_seq;
        queue
    }

    fn knows(&self, id: &WorkItemId) -> bool {
        self.items.contains_key(id) || self.outcomes.contains_key(id)
    }

    fn dependencies_met(&self, item: &WorkItem) -> bool {
        item.dependencies
            .iter()
            .all(|dep| self.outcomes.get(dep) == Some(&ItemStatus::Completed))
    }

    fn insert_pending(&mut self, id: WorkItemId) {
        let Some(key) = self.items.get(&id).map(sort_key) else {
            return;
        };
        let items = &self.items;
        let pos = self
            .pending
            .partition_point(|other| items.get(other).map(sort_key).is_some_and(|k| k <= key));
        self.pending.insert(pos, id);
    }

    fn processing_item_mut(
        &mut self,
        id: WorkItemId,
        operation: &'static str,
    ) -> Result<&mut WorkItem> {
        if !self.items.contains_key(&id) {
            return Err(self.missing(id, operation));
        }
        let item = self
            .items
            .get_mut(&id)
            .ok_or(Error::WorkItemNotFound(id))?;
        if item.status != ItemStatus::Processing {
            return Err(Error::InvalidItemState {
                id,
                status: item.status,
                operation,
            });
        }
        Ok(item)
    }

    fn missing(&self, id: WorkItemId, operation: &'static str) -> Error {
        match self.outcomes.get(&id) {
            Some(status) => Error::InvalidItemState {
                id,
                status: *status,
                operation,
            },
            None => Error::WorkItemNotFound(id),
        }
    }

    /// Move a terminal item out of the live set into the bounded history.
    fn retire(&mut self, id: WorkItemId) {
        let Some(item) = self.items.remove(&id) else {
            return;
        };
        self.outcomes.insert(id, item.status);
        self.history.push_back(item);
        while self.history.len() > self.config.completed_history {
            self.history.pop_front();
        }
    }

    fn emit(&self, event: QueueEvent) {
        if let Some(events) = &self.events {
            events.publish(Notification::Queue(event));
        }
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

fn sort_key(item: &WorkItem) -> (Reverse<Priority>, u64) {
    (Reverse(item.priority), item.seq)
}

fn processing_ms(item: &WorkItem, now: DateTime<Utc>) -> i64 {
    item.started_at
        .map(|started| (now - started).num_milliseconds())
        .unwrap_or(0)
}
