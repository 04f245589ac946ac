//! Durable project state.
//!
//! The coordinator writes one `ProjectSnapshot` per project after every
//! transition. `MemoryStore` backs tests; `FileStore` keeps one JSON file per
//! project and replaces it atomically, leaving the previous version as a
//! `.bak` next to it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::admission::BudgetLedger;
use crate::core::ids::ProjectId;
use crate::error::Result;
use crate::queue::QueueSnapshot;
use crate::util::blocking;
use crate::workflow::{Cycle, Query};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to rebuild a project after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub version: u32,
    pub project_id: ProjectId,
    pub queue: QueueSnapshot,
    pub ledger: BudgetLedger,
    pub cycles: Vec<Cycle>,
    pub queries: Vec<Query>,
    pub saved_at: DateTime<Utc>,
}

impl ProjectSnapshot {
    pub fn empty(project_id: ProjectId, ledger: BudgetLedger, now: DateTime<Utc>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            project_id,
            queue: QueueSnapshot::default(),
            ledger,
            cycles: Vec::new(),
            queries: Vec::new(),
            saved_at: now,
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Replace the stored state of `snapshot.project_id`.
    async fn save(&self, snapshot: &ProjectSnapshot) -> Result<()>;

    /// `None` when nothing was ever saved for the project.
    async fn load(&self, project_id: &ProjectId) -> Result<Option<ProjectSnapshot>>;

    async fn projects(&self) -> Result<Vec<ProjectId>>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<ProjectId, ProjectSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.project_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, project_id: &ProjectId) -> Result<Option<ProjectSnapshot>> {
        Ok(self.snapshots.read().await.get(project_id).cloned())
    }

    async fn projects(&self) -> Result<Vec<ProjectId>> {
        let mut ids: Vec<ProjectId> = self.snapshots.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One `<project>.json` per project under `dir`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, project_id: &ProjectId) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(project_id)))
    }
}

/// Project names are caller supplied. Percent-encoding keeps them inside the
/// directory and keeps distinct names on distinct files.
fn file_stem(project_id: &ProjectId) -> String {
    urlencoding::encode(project_id.as_str()).into_owned()
}

#[async_trait]
impl Store for FileStore {
    async fn save(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        let contents = serde_json::to_string_pretty(snapshot)?;
        let dir = self.dir.clone();
        let path = self.path_for(&snapshot.project_id);
        tracing::debug!(path = %path.display(), "saving project snapshot");

        blocking(move || {
            if !dir.exists() {
                fs::create_dir_all(&dir)?;
            }
            if path.exists() {
                fs::copy(&path, path.with_extension("json.bak"))?;
            }
            let temp_path = path.with_extension("json.tmp");
            fs::write(&temp_path, &contents)?;
            fs::rename(&temp_path, &path)?;
            Ok(())
        })
        .await
    }

    async fn load(&self, project_id: &ProjectId) -> Result<Option<ProjectSnapshot>> {
        let path = self.path_for(project_id);
        blocking(move || {
            if !path.exists() {
                tracing::debug!(path = %path.display(), "no snapshot on disk");
                return Ok(None);
            }
            let contents = fs::read_to_string(&path)?;
            let snapshot: ProjectSnapshot = serde_json::from_str(&contents)?;
            Ok(Some(snapshot))
        })
        .await
    }

    async fn projects(&self) -> Result<Vec<ProjectId>> {
        let dir = self.dir.clone();
        blocking(move || {
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut ids = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    let contents = fs::read_to_string(&path)?;
                    let snapshot: ProjectSnapshot = serde_json::from_str(&contents)?;
                    ids.push(snapshot.project_id);
                }
            }
            ids.sort();
            Ok(ids)
        })
        .await
    }
}
