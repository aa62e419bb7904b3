use std::io::Write;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tracing::warn;

use stepflow_core::error::{Result, StepflowError};

use super::{sort_newest_first, Checkpoint, CheckpointStorage};

/// One JSON document per checkpoint, named `<checkpoint_id>.json`.
///
/// Writes go to a temp file in the same directory which is then renamed
/// over the target, so readers only ever see complete documents.
pub struct FileCheckpointStorage {
    dir: PathBuf,
}

impl FileCheckpointStorage {
    /// Open (and create if needed) the checkpoint directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `None` for ids that would escape the directory.
    fn path_for(&self, checkpoint_id: &str) -> Option<PathBuf> {
        let safe = !checkpoint_id.is_empty()
            && checkpoint_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        safe.then(|| self.dir.join(format!("{}.json", checkpoint_id)))
    }
}

fn write_atomic(dir: &Path, target: &Path, body: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| StepflowError::Io(e.error))?;
    Ok(())
}

impl CheckpointStorage for FileCheckpointStorage {
    fn save<'a>(&'a self, checkpoint: &'a Checkpoint) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let target = self.path_for(&checkpoint.checkpoint_id).ok_or_else(|| {
                StepflowError::InvalidRunState(format!(
                    "invalid checkpoint id: {}",
                    checkpoint.checkpoint_id
                ))
            })?;
            let body = serde_json::to_vec_pretty(checkpoint)?;
            let dir = self.dir.clone();
            tokio::task::spawn_blocking(move || write_atomic(&dir, &target, &body))
                .await
                .map_err(|e| StepflowError::Io(std::io::Error::other(e)))?
        })
    }

    fn load<'a>(&'a self, checkpoint_id: &'a str) -> BoxFuture<'a, Result<Option<Checkpoint>>> {
        Box::pin(async move {
            let Some(path) = self.path_for(checkpoint_id) else {
                return Ok(None);
            };
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn list<'a>(&'a self, workflow_id: Option<&'a str>) -> BoxFuture<'a, Result<Vec<Checkpoint>>> {
        Box::pin(async move {
            let mut found = Vec::new();
            let mut entries = tokio::fs::read_dir(&self.dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let bytes = tokio::fs::read(&path).await?;
                let checkpoint: Checkpoint = match serde_json::from_slice(&bytes) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint file");
                        continue;
                    }
                };
                if workflow_id.map_or(true, |w| checkpoint.workflow_id == w) {
                    found.push(checkpoint);
                }
            }
            sort_newest_first(&mut found);
            Ok(found)
        })
    }

    fn delete<'a>(&'a self, checkpoint_id: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let Some(path) = self.path_for(checkpoint_id) else {
                return Ok(false);
            };
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }
}
