use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};

use stepflow_core::error::{Result, StepflowError};

use super::{Checkpoint, CheckpointStorage};
use crate::snapshot::RunSnapshot;

/// Checkpoint store backed by SQLite.
///
/// Table `checkpoints(checkpoint_id PK, workflow_id, data, created_at)`, with
/// `data` holding the snapshot as JSON. Queries run on the blocking pool.
pub struct SqliteCheckpointStorage {
    conn: Arc<Mutex<Connection>>,
}

fn db_err(context: &str, e: impl std::fmt::Display) -> StepflowError {
    StepflowError::Database(format!("{}: {}", context, e))
}

impl SqliteCheckpointStorage {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn =
            Connection::open(path).map_err(|e| db_err("Failed to open checkpoint store", e))?;
        Self::init(conn)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| db_err("Failed to open checkpoint store", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS checkpoints (
                 checkpoint_id TEXT PRIMARY KEY,
                 workflow_id TEXT NOT NULL,
                 data TEXT NOT NULL,
                 created_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_checkpoints_workflow
                 ON checkpoints(workflow_id, created_at DESC);",
        )
        .map_err(|e| db_err("Failed to initialize checkpoint schema", e))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|e| db_err("Checkpoint store poisoned", e))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| db_err("Checkpoint task failed", e))?
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode(raw: (String, String, String, String)) -> Result<Checkpoint> {
    let (checkpoint_id, workflow_id, data, created_at) = raw;
    let snapshot: RunSnapshot = serde_json::from_str(&data)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| db_err("Bad created_at", e))?;
    Ok(Checkpoint {
        checkpoint_id,
        workflow_id,
        created_at,
        snapshot,
    })
}

impl CheckpointStorage for SqliteCheckpointStorage {
    fn save<'a>(&'a self, checkpoint: &'a Checkpoint) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let data = serde_json::to_string(&checkpoint.snapshot)?;
            let id = checkpoint.checkpoint_id.clone();
            let workflow_id = checkpoint.workflow_id.clone();
            let created_at = checkpoint
                .created_at
                .to_rfc3339_opts(SecondsFormat::Nanos, true);

            self.with_conn(move |conn| {
                let tx = conn
                    .transaction()
                    .map_err(|e| db_err("Failed to begin transaction", e))?;
                tx.execute(
                    "INSERT INTO checkpoints (checkpoint_id, workflow_id, data, created_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(checkpoint_id) DO UPDATE SET
                         workflow_id = excluded.workflow_id,
                         data = excluded.data,
                         created_at = excluded.created_at",
                    params![id, workflow_id, data, created_at],
                )
                .map_err(|e| db_err("Failed to save checkpoint", e))?;
                tx.commit()
                    .map_err(|e| db_err("Failed to commit checkpoint", e))
            })
            .await
        })
    }

    fn load<'a>(&'a self, checkpoint_id: &'a str) -> BoxFuture<'a, Result<Option<Checkpoint>>> {
        Box::pin(async move {
            let id = checkpoint_id.to_string();
            let raw = self
                .with_conn(move |conn| {
                    conn.query_row(
                        "SELECT checkpoint_id, workflow_id, data, created_at
                         FROM checkpoints WHERE checkpoint_id = ?1",
                        params![id],
                        read_row,
                    )
                    .optional()
                    .map_err(|e| db_err("Failed to load checkpoint", e))
                })
                .await?;
            raw.map(decode).transpose()
        })
    }

    fn list<'a>(&'a self, workflow_id: Option<&'a str>) -> BoxFuture<'a, Result<Vec<Checkpoint>>> {
        Box::pin(async move {
            let workflow_id = workflow_id.map(str::to_string);
            let rows = self
                .with_conn(move |conn| {
                    let mut stmt = conn
                        .prepare(
                            "SELECT checkpoint_id, workflow_id, data, created_at
                             FROM checkpoints
                             WHERE ?1 IS NULL OR workflow_id = ?1
                             ORDER BY created_at DESC, checkpoint_id DESC",
                        )
                        .map_err(|e| db_err("Failed to prepare query", e))?;
                    let rows = stmt
                        .query_map(params![workflow_id], read_row)
                        .map_err(|e| db_err("Failed to list checkpoints", e))?
                        .collect::<rusqlite::Result<Vec<_>>>()
                        .map_err(|e| db_err("Failed to read checkpoint row", e))?;
                    Ok(rows)
                })
                .await?;
            rows.into_iter().map(decode).collect()
        })
    }

    fn list_ids<'a>(&'a self, workflow_id: Option<&'a str>) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let workflow_id = workflow_id.map(str::to_string);
            self.with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT checkpoint_id FROM checkpoints
                         WHERE ?1 IS NULL OR workflow_id = ?1
                         ORDER BY created_at DESC, checkpoint_id DESC",
                    )
                    .map_err(|e| db_err("Failed to prepare query", e))?;
                let ids = stmt
                    .query_map(params![workflow_id], |row| row.get(0))
                    .map_err(|e| db_err("Failed to list checkpoints", e))?
                    .collect::<rusqlite::Result<Vec<String>>>()
                    .map_err(|e| db_err("Failed to read checkpoint row", e))?;
                Ok(ids)
            })
            .await
        })
    }

    fn delete<'a>(&'a self, checkpoint_id: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let id = checkpoint_id.to_string();
            self.with_conn(move |conn| {
                let deleted = conn
                    .execute(
                        "DELETE FROM checkpoints WHERE checkpoint_id = ?1",
                        params![id],
                    )
                    .map_err(|e| db_err("Failed to delete checkpoint", e))?;
                Ok(deleted > 0)
            })
            .await
        })
    }
}
