//! Integration test suite for conductor.
//!
//! These tests exercise the scheduling engine end to end: queue ordering,
//! admission control, the development cycle and recovery from the store.
//!
//! # Test Categories
//!
//! - `scheduling`: dependency and priority ordering, random DAG property test
//! - `admission`: token caps, rate windows, cost-aware assignment
//! - `cycles`: phase progression, retries and human queries
//! - `recovery`: restore from memory and file stores, worker liveness
//!
//! # CI Compatibility
//!
//! Executions go through a scripted executor, so no agent binary is needed.

mod fixtures;

mod admission;
mod cycles;
mod recovery;
mod scheduling;
