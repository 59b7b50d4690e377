//! Persistence of the rollout state.
//!
//! Every write is a compare-and-swap against the version read at the start
//! of the tick. A conflict means another writer got in between; the tick
//! aborts and the next one starts over from fresh state.

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use clusterroll_common::{now, ClusterRollError, Result, RunId, StateBlob, Timestamp};

use crate::scheduler::TaskScheduler;

/// A value together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T, V> {
    pub value: T,
    pub version: V,
}

/// Read-modify-write access to the state blob.
#[allow(async_fn_in_trait)]
pub trait StateStore {
    /// Identifies what a `load` saw. A write succeeds only while it still
    /// matches the stored state.
    type Version: Clone + PartialEq + Debug;

    /// Read the current blob. `None` when no rollout is registered.
    async fn load(&self) -> Result<Option<Versioned<StateBlob, Self::Version>>>;

    /// Write `blob` if the stored version is still `expected`.
    /// Returns the new version.
    async fn compare_and_swap(&self, expected: &Self::Version, blob: &StateBlob)
        -> Result<Self::Version>;

    /// Write `blob` unconditionally (start of a run).
    async fn reset(&self, blob: &StateBlob) -> Result<Self::Version>;

    /// Fail with `StaleState` unless the stored version is still `expected`.
    async fn ensure_current(&self, expected: &Self::Version) -> Result<()> {
        match self.load().await? {
            Some(current) if &current.version == expected => Ok(()),
            Some(_) => Err(ClusterRollError::StaleState(
                "stored state changed since it was read".to_string(),
            )),
            None => Err(ClusterRollError::StaleState(
                "stored state disappeared since it was read".to_string(),
            )),
        }
    }
}

/// Keeps the blob in the coordinator task's description field.
///
/// The field has no version of its own, so the version is its text. The CAS
/// check re-reads the description just before writing, which narrows the
/// race window but cannot close it.
#[derive(Debug, Clone)]
pub struct TaskDescriptionStore<T> {
    scheduler: T,
    task_name: String,
}

impl<T: TaskScheduler> TaskDescriptionStore<T> {
    /// Create a store over the task `task_name`.
    pub fn new(scheduler: T, task_name: impl Into<String>) -> Self {
        Self {
            scheduler,
            task_name: task_name.into(),
        }
    }

    async fn read_description(&self) -> Result<Option<String>> {
        Ok(self
            .scheduler
            .cluster_task(&self.task_name)
            .await?
            .map(|task| task.description))
    }
}

impl<T: TaskScheduler> StateStore for TaskDescriptionStore<T> {
    type Version = String;

    async fn load(&self) -> Result<Option<Versioned<StateBlob, String>>> {
        match self.read_description().await? {
            Some(text) => Ok(Some(Versioned {
                value: StateBlob::parse(&text)?,
                version: text,
            })),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(&self, expected: &String, blob: &StateBlob) -> Result<String> {
        let current = self
            .read_description()
            .await?
            .ok_or_else(|| ClusterRollError::TaskNotFound(self.task_name.clone()))?;
        if &current != expected {
            return Err(ClusterRollError::StaleState(format!(
                "description of {} was rewritten",
                self.task_name
            )));
        }
        self.reset(blob).await
    }

    async fn reset(&self, blob: &StateBlob) -> Result<String> {
        let text = blob.to_json()?;
        self.scheduler
            .set_description(&self.task_name, &text)
            .await?;
        debug!(task = %self.task_name, state = %text, "Task description updated");
        Ok(text)
    }
}

/// On-disk envelope of the file store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u64,
    pub run_id: RunId,
    pub updated_at: Timestamp,
    pub nodes: StateBlob,
}

/// Keeps the blob in a JSON file on storage every node can reach.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Create a store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole envelope.
    pub async fn read_file(&self) -> Result<Option<StateFile>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Temp file next to the state file. Unique per write, since every node
    /// and the operator write to the same directory.
    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, RunId::new()))
    }

    /// Atomic write: synced temp file, then rename into place.
    async fn write_file(&self, file: &StateFile) -> Result<()> {
        let data = serde_json::to_vec(file)?;
        let tmp = self.temp_path();

        if let Err(e) = write_synced(&tmp, &data).await {
            warn!(path = %tmp.display(), error = %e, "Failed to write temp state file");
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(
                from = %tmp.display(),
                to = %self.path.display(),
                error = %e,
                "Failed to move state file into place"
            );
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

impl StateStore for FileStateStore {
    type Version = u64;

    async fn load(&self) -> Result<Option<Versioned<StateBlob, u64>>> {
        Ok(self.read_file().await?.map(|file| Versioned {
            value: file.nodes,
            version: file.version,
        }))
    }

    async fn compare_and_swap(&self, expected: &u64, blob: &StateBlob) -> Result<u64> {
        let current = self.read_file().await?.ok_or_else(|| {
            ClusterRollError::Configuration(format!(
                "state file {} does not exist",
                self.path.display()
            ))
        })?;
        if current.version != *expected {
            return Err(ClusterRollError::StaleState(format!(
                "expected version {}, found {}",
                expected, current.version
            )));
        }

        let next = StateFile {
            version: current.version + 1,
            run_id: current.run_id,
            updated_at: now(),
            nodes: blob.clone(),
        };
        self.write_file(&next).await?;
        Ok(next.version)
    }

    async fn reset(&self, blob: &StateBlob) -> Result<u64> {
        let version = self
            .read_file()
            .await?
            .map(|file| file.version + 1)
            .unwrap_or(1);
        let file = StateFile {
            version,
            run_id: RunId::new(),
            updated_at: now(),
            nodes: blob.clone(),
        };
        self.write_file(&file).await?;
        info!(
            path = %self.path.display(),
            run_id = %file.run_id,
            version,
            "State file initialized"
        );
        Ok(version)
    }
}
