// ABOUTME: Checkpoint persistence for job state, enabling resume after restart.
// ABOUTME: Defines the store trait plus in-memory and JSON-file backends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

/// Trait for storing and retrieving job checkpoints.
///
/// A checkpoint is the JSON form of a
/// [`JobState`](crate::lifecycle::JobState). Implement this trait to provide
/// custom storage backends (database, object store, etc.).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Save the latest checkpoint for a job, replacing any previous one.
    async fn save(&self, job_id: &str, state: &Value) -> Result<(), anyhow::Error>;

    /// Load the latest checkpoint for a job.
    /// Returns None if no checkpoint exists for the given job_id.
    async fn load(&self, job_id: &str) -> Result<Option<Value>, anyhow::Error>;

    /// Archive the final state of a job that is being cleaned up.
    async fn archive(&self, job_id: &str, state: &Value) -> Result<(), anyhow::Error>;
}

/// In-memory checkpoint store.
///
/// Useful for testing and for processes where resume across restarts is not
/// required.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Value>>,
    archived: RwLock<HashMap<String, Value>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new store wrapped in Arc for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// The archived state of a job, if it has been archived.
    pub async fn archived(&self, job_id: &str) -> Option<Value> {
        self.archived.read().await.get(job_id).cloned()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, job_id: &str, state: &Value) -> Result<(), anyhow::Error> {
        self.checkpoints
            .write()
            .await
            .insert(job_id.to_string(), state.clone());
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<Option<Value>, anyhow::Error> {
        Ok(self.checkpoints.read().await.get(job_id).cloned())
    }

    async fn archive(&self, job_id: &str, state: &Value) -> Result<(), anyhow::Error> {
        self.checkpoints.write().await.remove(job_id);
        self.archived
            .write()
            .await
            .insert(job_id.to_string(), state.clone());
        Ok(())
    }
}

const ARCHIVE_DIR: &str = "archive";

/// Checkpoint store writing one pretty-printed JSON file per job.
///
/// Live checkpoints are written to `{dir}/{job_id}.json`; archiving writes
/// `{dir}/archive/{job_id}.json` and removes the live file.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name for a job. Ids that could escape `dir` are rejected.
    fn file_name(job_id: &str) -> Result<String, anyhow::Error> {
        if job_id.is_empty()
            || job_id.starts_with('.')
            || job_id.contains(['/', '\\', '\0'])
        {
            anyhow::bail!("invalid job id for a checkpoint file: {:?}", job_id);
        }
        Ok(format!("{}.json", job_id))
    }

    fn live_path(&self, job_id: &str) -> Result<PathBuf, anyhow::Error> {
        Ok(self.dir.join(Self::file_name(job_id)?))
    }

    fn archive_path(&self, job_id: &str) -> Result<PathBuf, anyhow::Error> {
        Ok(self.dir.join(ARCHIVE_DIR).join(Self::file_name(job_id)?))
    }

    async fn write_json(path: &Path, state: &Value) -> Result<(), anyhow::Error> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let contents = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(path, contents)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, job_id: &str, state: &Value) -> Result<(), anyhow::Error> {
        Self::write_json(&self.live_path(job_id)?, state).await
    }

    async fn load(&self, job_id: &str) -> Result<Option<Value>, anyhow::Error> {
        let path = self.live_path(job_id)?;
        match tokio::fs::read(&path).await {
            Ok(contents) => {
                let state = serde_json::from_slice(&contents)
                    .with_context(|| format!("parsing {}", path.display()))?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn archive(&self, job_id: &str, state: &Value) -> Result<(), anyhow::Error> {
        Self::write_json(&self.archive_path(job_id)?, state).await?;

        let live = self.live_path(job_id)?;
        if let Err(e) = tokio::fs::remove_file(&live).await {
            // Only fail if it's not a "file not found" error
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e).with_context(|| format!("removing {}", live.display()));
            }
        }
        Ok(())
    }
}
