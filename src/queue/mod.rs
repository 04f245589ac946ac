//! Work queue for one project.
//!
//! Items are released in priority order once every dependency has completed,
//! bounded by a configurable number of concurrent slots. Failed attempts are
//! retried with exponential backoff.

mod stats;
mod work_queue;

pub use stats::QueueStats;
pub use work_queue::{
    FailureOutcome, QueueConfig, QueueSnapshot, WorkQueue, DEFAULT_COMPLETED_HISTORY,
    DEFAULT_ITEM_TOKENS, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_RETRIES, DEFAULT_MAX_SIZE,
    DEFAULT_RETRY_BASE_DELAY,
};
