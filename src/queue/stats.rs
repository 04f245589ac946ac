//! Incrementally maintained queue statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters and running averages, updated on every state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub total_started: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_retries: u64,
    /// Mean time from enqueue to first start of an attempt.
    pub avg_wait_ms: f64,
    /// Mean duration of finished attempts (completed or failed).
    pub avg_processing_ms: f64,
    /// Completed items per minute since the queue was created.
    pub throughput_per_minute: f64,
    processing_samples: u64,
    since: DateTime<Utc>,
}

impl QueueStats {
    pub fn new(since: DateTime<Utc>) -> Self {
        Self {
            total_enqueued: 0,
            total_started: 0,
            total_completed: 0,
            total_failed: 0,
            total_cancelled: 0,
            total_retries: 0,
            avg_wait_ms: 0.0,
            avg_processing_ms: 0.0,
            throughput_per_minute: 0.0,
            processing_samples: 0,
            since,
        }
    }

    pub(crate) fn record_enqueued(&mut self) {
        self.total_enqueued += 1;
    }

    pub(crate) fn record_started(&mut self, wait_ms: i64) {
        self.total_started += 1;
        let n = self.total_started as f64;
        self.avg_wait_ms += (wait_ms.max(0) as f64 - self.avg_wait_ms) / n;
    }

    pub(crate) fn record_completed(&mut self, processing_ms: i64, now: DateTime<Utc>) {
        self.total_completed += 1;
        self.record_processing(processing_ms);
        self.refresh_throughput(now);
    }

    pub(crate) fn record_failed(&mut self, processing_ms: i64, terminal: bool) {
        if terminal {
            self.total_failed += 1;
        } else {
            self.total_retries += 1;
        }
        self.record_processing(processing_ms);
    }

    pub(crate) fn record_cancelled(&mut self) {
        self.total_cancelled += 1;
    }

    fn record_processing(&mut self, processing_ms: i64) {
        self.processing_samples += 1;
        let n = self.processing_samples as f64;
        self.avg_processing_ms += (processing_ms.max(0) as f64 - self.avg_processing_ms) / n;
    }

    fn refresh_throughput(&mut self, now: DateTime<Utc>) {
        // Floor at one second so the first completion does not divide by ~0.
        let elapsed_secs = (now - self.since).num_milliseconds().max(1000) as f64 / 1000.0;
        self.throughput_per_minute = self.total_completed as f64 * 60.0 / elapsed_secs;
    }
}

impl Default for QueueStats {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}
