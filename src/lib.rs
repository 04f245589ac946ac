pub mod config;
pub mod error;
pub mod events;
pub mod log;
pub mod util;

// Scheduling engine
pub mod admission;
pub mod core;
pub mod orchestration;
pub mod queue;
pub mod state;
pub mod workflow;

pub use config::Config;
pub use core::{ItemStatus, Priority, ProjectId, Submission, WorkItem, WorkItemId};
pub use error::{Error, Result};
pub use events::{EventBus, Notification};
pub use orchestration::{Coordinator, CoordinatorConfig, ProjectPhase, ProjectReport};
