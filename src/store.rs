//! Status persistence
//!
//! The sequencer saves the workflow status at every terminal transition, so
//! a run's final (or parked) state survives the process. [`FileStore`]
//! keeps one YAML file per workflow id in a state directory;
//! [`MemoryStore`] backs tests and embedders that handle persistence
//! themselves.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;

use crate::engine::WorkflowStatus;
use crate::{Error, Result};

/// Persistence port for workflow statuses
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Persist a status snapshot
    async fn save(&self, status: &WorkflowStatus) -> Result<()>;

    /// Load the last saved status for an id
    async fn load(&self, id: &str) -> Result<Option<WorkflowStatus>>;

    /// All saved statuses, newest first
    async fn list(&self) -> Result<Vec<WorkflowStatus>>;
}

/// One YAML file per workflow id in a state directory
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at a directory (created lazily on save)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        // Ids are caller-supplied; keep them out of path syntax.
        if id.is_empty() || id.contains('/') || id.contains('\\') || id.contains("..") {
            return Err(Error::Store(format!("Invalid workflow id '{}'", id)));
        }
        Ok(self.dir.join(format!("{}.yaml", id)))
    }

    /// Remove saved statuses beyond the `keep` newest. Returns how many
    /// files were deleted.
    pub fn cleanup(&self, keep: usize) -> Result<usize> {
        let statuses = self.list_sync()?;
        let mut removed = 0;

        for status in statuses.into_iter().skip(keep) {
            let path = self.path_for(&status.id)?;
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        Ok(removed)
    }

    fn list_sync(&self) -> Result<Vec<WorkflowStatus>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut statuses = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "yaml").unwrap_or(false) {
                if let Ok(content) = std::fs::read_to_string(&path) {
                    if let Ok(status) = serde_yaml::from_str::<WorkflowStatus>(&content) {
                        statuses.push(status);
                    }
                }
            }
        }

        statuses.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(statuses)
    }
}

#[async_trait]
impl StatusStore for FileStore {
    async fn save(&self, status: &WorkflowStatus) -> Result<()> {
        let path = self.path_for(&status.id)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(status)
            .map_err(|e| Error::Store(format!("Failed to serialize status: {}", e)))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<WorkflowStatus>> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)?;
        let status = serde_yaml::from_str(&content)
            .map_err(|e| Error::Store(format!("Failed to parse status for '{}': {}", id, e)))?;
        Ok(Some(status))
    }

    async fn list(&self) -> Result<Vec<WorkflowStatus>> {
        self.list_sync()
    }
}

/// In-memory store for tests and embedding
#[derive(Default)]
pub struct MemoryStore {
    statuses: DashMap<String, WorkflowStatus>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn save(&self, status: &WorkflowStatus) -> Result<()> {
        self.statuses.insert(status.id.clone(), status.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<WorkflowStatus>> {
        Ok(self.statuses.get(id).map(|s| s.value().clone()))
    }

    async fn list(&self) -> Result<Vec<WorkflowStatus>> {
        let mut statuses: Vec<WorkflowStatus> =
            self.statuses.iter().map(|s| s.value().clone()).collect();
        statuses.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{PhaseDescriptor, PhaseSpec};

    fn status(id: &str) -> WorkflowStatus {
        let descriptor = PhaseDescriptor::new(
            "test",
            vec![PhaseSpec::new("plan"), PhaseSpec::new("code")],
        )
        .unwrap();
        WorkflowStatus::new(id, &descriptor)
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let mut saved = status("wf-1");
        saved.start_phase("plan");
        store.save(&saved).await.unwrap();

        let loaded = store.load("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "wf-1");
        assert_eq!(loaded.current_phase, "plan");
        assert_eq!(loaded.phase("plan").unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_file_store_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_syntax() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        assert!(store.load("../escape").await.is_err());
        assert!(store.save(&status("a/b")).await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        for i in 0i64..4 {
            let mut s = status(&format!("wf-{}", i));
            s.started_at = chrono::Utc::now() - chrono::Duration::minutes(10 - i);
            store.save(&s).await.unwrap();
        }

        let removed = store.cleanup(2).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.list().await.unwrap().len(), 2);
        assert!(store.load("wf-3").await.unwrap().is_some());
        assert!(store.load("wf-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.save(&status("wf-1")).await.unwrap();

        assert!(store.load("wf-1").await.unwrap().is_some());
        assert!(store.load("wf-2").await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
