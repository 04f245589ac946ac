//! Core domain models for the scheduling engine.
//!
//! This module contains the identifiers and the work item model shared by
//! the queue, the admission layer and the coordinator.

pub mod ids;
pub mod item;

pub use ids::{CapabilityId, CycleId, ProjectId, QueryId, WorkItemId, WorkerId};
pub use item::{ItemStatus, Priority, Submission, WorkItem};
