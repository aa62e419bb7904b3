//! Durable run snapshots.
//!
//! Every save mints a fresh checkpoint id, so each call produces a new,
//! independently loadable checkpoint; stores still upsert by id. A checkpoint
//! is never mutated after it is written.

mod file;
mod memory;
mod sqlite;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use stepflow_core::config::{CheckpointBackend, CheckpointConfig};
use stepflow_core::error::{Result, StepflowError};

use crate::snapshot::RunSnapshot;

pub use file::FileCheckpointStorage;
pub use memory::InMemoryCheckpointStorage;
pub use sqlite::SqliteCheckpointStorage;

/// An immutable, timestamped run snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub workflow_id: String,
    pub created_at: DateTime<Utc>,
    pub snapshot: RunSnapshot,
}

/// Backend that persists checkpoints.
///
/// `save` must commit the whole checkpoint atomically: after a crash either
/// the previous version or the new one is visible, never a mix.
pub trait CheckpointStorage: Send + Sync + 'static {
    /// Insert or replace the checkpoint with the same id.
    fn save<'a>(&'a self, checkpoint: &'a Checkpoint) -> BoxFuture<'a, Result<()>>;

    fn load<'a>(&'a self, checkpoint_id: &'a str) -> BoxFuture<'a, Result<Option<Checkpoint>>>;

    /// Checkpoints, newest first, optionally restricted to one workflow.
    fn list<'a>(&'a self, workflow_id: Option<&'a str>) -> BoxFuture<'a, Result<Vec<Checkpoint>>>;

    /// Checkpoint ids, newest first.
    fn list_ids<'a>(&'a self, workflow_id: Option<&'a str>) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            Ok(self
                .list(workflow_id)
                .await?
                .into_iter()
                .map(|c| c.checkpoint_id)
                .collect())
        })
    }

    /// Returns whether a checkpoint was removed.
    fn delete<'a>(&'a self, checkpoint_id: &'a str) -> BoxFuture<'a, Result<bool>>;
}

/// Orders newest first; ties keep the later-inserted entry first.
pub(crate) fn sort_newest_first(checkpoints: &mut [Checkpoint]) {
    checkpoints.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.checkpoint_id.cmp(&a.checkpoint_id))
    });
}

/// Front door to a [`CheckpointStorage`] backend.
#[derive(Clone)]
pub struct CheckpointManager {
    storage: Arc<dyn CheckpointStorage>,
}

impl CheckpointManager {
    pub fn new(storage: Arc<dyn CheckpointStorage>) -> Self {
        Self { storage }
    }

    /// Manager over a volatile in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCheckpointStorage::new()))
    }

    /// Persist `snapshot` under a new checkpoint id and return it.
    pub async fn save(&self, snapshot: &RunSnapshot) -> Result<String> {
        let checkpoint = Checkpoint {
            checkpoint_id: Uuid::new_v4().to_string(),
            workflow_id: snapshot.workflow_id.clone(),
            created_at: Utc::now(),
            snapshot: snapshot.clone(),
        };
        self.storage.save(&checkpoint).await?;
        info!(
            checkpoint_id = %checkpoint.checkpoint_id,
            workflow_id = %checkpoint.workflow_id,
            superstep = snapshot.superstep,
            state = %snapshot.state,
            "Checkpoint saved"
        );
        Ok(checkpoint.checkpoint_id)
    }

    pub async fn load(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        let checkpoint = self
            .storage
            .load(checkpoint_id)
            .await?
            .ok_or_else(|| StepflowError::CheckpointNotFound(checkpoint_id.to_string()))?;
        debug!(checkpoint_id, workflow_id = %checkpoint.workflow_id, "Checkpoint loaded");
        Ok(checkpoint)
    }

    /// Ids of stored checkpoints, newest first. An unknown workflow id yields
    /// an empty list.
    pub async fn list_ids(&self, workflow_id: Option<&str>) -> Result<Vec<String>> {
        self.storage.list_ids(workflow_id).await
    }

    pub async fn list(&self, workflow_id: Option<&str>) -> Result<Vec<Checkpoint>> {
        self.storage.list(workflow_id).await
    }

    pub async fn delete(&self, checkpoint_id: &str) -> Result<bool> {
        let deleted = self.storage.delete(checkpoint_id).await?;
        debug!(checkpoint_id, deleted, "Checkpoint delete");
        Ok(deleted)
    }
}

/// Open the backend selected in config.
pub fn open_storage(config: &CheckpointConfig) -> Result<Arc<dyn CheckpointStorage>> {
    let storage: Arc<dyn CheckpointStorage> = match config.backend {
        CheckpointBackend::Memory => Arc::new(InMemoryCheckpointStorage::new()),
        CheckpointBackend::File => Arc::new(FileCheckpointStorage::open(config.resolved_path())?),
        CheckpointBackend::Sqlite => {
            Arc::new(SqliteCheckpointStorage::open(&config.resolved_path())?)
        }
    };
    Ok(storage)
}
