use thiserror::Error;

use crate::admission::AdmissionDecision;
use crate::core::ids::{CapabilityId, CycleId, ProjectId, QueryId, WorkerId};
use crate::core::item::{ItemStatus, WorkItemId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Executor binary not found: {0}")]
    ExecutorNotFound(String),

    #[error("Admission refused: {}", .0.reason.as_deref().unwrap_or("limit reached"))]
    AdmissionRefused(AdmissionDecision),

    #[error("Work queue is full (max: {max})")]
    QueueFull { max: usize },

    #[error("Unknown dependency: {0}")]
    UnknownDependency(WorkItemId),

    #[error("Work item not found: {0}")]
    WorkItemNotFound(WorkItemId),

    #[error("Cannot {operation} work item {id} in status {status}")]
    InvalidItemState {
        id: WorkItemId,
        status: ItemStatus,
        operation: &'static str,
    },

    #[error("Unknown assignment strategy: {0}")]
    UnknownStrategy(String),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Cycle not found: {0}")]
    CycleNotFound(CycleId),

    #[error("Query not found: {0}")]
    QueryNotFound(QueryId),

    #[error("Query already resolved: {0}")]
    QueryAlreadyResolved(QueryId),

    #[error("Capability not found: {0}")]
    CapabilityNotFound(CapabilityId),

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Project not found: {0}")]
    ProjectNotFound(ProjectId),
}

pub type Result<T> = std::result::Result<T, Error>;
