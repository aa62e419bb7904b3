use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use stepflow_core::error::Result;

use super::{sort_newest_first, Checkpoint, CheckpointStorage};

/// Volatile checkpoint store. Contents are lost when the process exits.
#[derive(Default)]
pub struct InMemoryCheckpointStorage {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStorage for InMemoryCheckpointStorage {
    fn save<'a>(&'a self, checkpoint: &'a Checkpoint) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.checkpoints
                .write()
                .await
                .insert(checkpoint.checkpoint_id.clone(), checkpoint.clone());
            Ok(())
        })
    }

    fn load<'a>(&'a self, checkpoint_id: &'a str) -> BoxFuture<'a, Result<Option<Checkpoint>>> {
        Box::pin(async move { Ok(self.checkpoints.read().await.get(checkpoint_id).cloned()) })
    }

    fn list<'a>(&'a self, workflow_id: Option<&'a str>) -> BoxFuture<'a, Result<Vec<Checkpoint>>> {
        Box::pin(async move {
            let mut found: Vec<Checkpoint> = self
                .checkpoints
                .read()
                .await
                .values()
                .filter(|c| workflow_id.map_or(true, |w| c.workflow_id == w))
                .cloned()
                .collect();
            sort_newest_first(&mut found);
            Ok(found)
        })
    }

    fn delete<'a>(&'a self, checkpoint_id: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(self.checkpoints.write().await.remove(checkpoint_id).is_some()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::RunSnapshot;
    use chrono::{Duration, Utc};
    use stepflow_core::types::Message;

    fn checkpoint(id: &str, workflow_id: &str, age_secs: i64) -> Checkpoint {
        Checkpoint {
            checkpoint_id: id.to_string(),
            workflow_id: workflow_id.to_string(),
            created_at: Utc::now() - Duration::seconds(age_secs),
            snapshot: RunSnapshot::new(workflow_id, "start", Message::text("x")),
        }
    }

    #[tokio::test]
    async fn test_upsert_by_id() {
        let store = InMemoryCheckpointStorage::new();
        let mut cp = checkpoint("c1", "wf", 0);
        store.save(&cp).await.unwrap();
        cp.snapshot.superstep = 7;
        store.save(&cp).await.unwrap();

        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].snapshot.superstep, 7);
    }

    #[tokio::test]
    async fn test_list_newest_first_and_filtered() {
        let store = InMemoryCheckpointStorage::new();
        store.save(&checkpoint("old", "wf", 30)).await.unwrap();
        store.save(&checkpoint("new", "wf", 0)).await.unwrap();
        store.save(&checkpoint("other", "wf2", 10)).await.unwrap();

        assert_eq!(store.list_ids(Some("wf")).await.unwrap(), vec!["new", "old"]);
        assert_eq!(
            store.list_ids(None).await.unwrap(),
            vec!["new", "other", "old"]
        );
        assert!(store.list_ids(Some("missing")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_and_delete() {
        let store = InMemoryCheckpointStorage::new();
        store.save(&checkpoint("c1", "wf", 0)).await.unwrap();
        assert!(store.load("c1").await.unwrap().is_some());
        assert!(store.delete("c1").await.unwrap());
        assert!(store.load("c1").await.unwrap().is_none());
        assert!(!store.delete("c1").await.unwrap());
    }
}
