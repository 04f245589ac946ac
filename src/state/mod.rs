//! Persistence for per-project scheduling state.

mod store;

pub use store::{FileStore, MemoryStore, ProjectSnapshot, Store, SNAPSHOT_VERSION};
