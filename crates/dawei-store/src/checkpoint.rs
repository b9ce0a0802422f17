// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Checkpoints: restorable snapshots of conversation + task graph +
//! execution state, stored under `{dawei_home}/checkpoints/`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{PersistenceError, PersistenceManager, ResourceType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointData {
    pub checkpoint_id: String,
    /// The task this snapshot belongs to.
    pub task_id: String,
    pub conversation: Value,
    pub task_graph: Value,
    pub execution_state: Value,
    pub created_at: DateTime<Utc>,
}

impl CheckpointData {
    pub fn new(task_id: impl Into<String>, conversation: Value, task_graph: Value, execution_state: Value) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            conversation,
            task_graph,
            execution_state,
            created_at: Utc::now(),
        }
    }
}

pub struct CheckpointStore {
    manager: Arc<PersistenceManager>,
}

impl CheckpointStore {
    pub fn new(manager: Arc<PersistenceManager>) -> Self {
        Self { manager }
    }

    pub async fn save(&self, checkpoint: &CheckpointData) -> Result<(), PersistenceError> {
        let value = serde_json::to_value(checkpoint).map_err(|source| {
            PersistenceError::Serialization {
                resource_id: checkpoint.checkpoint_id.clone(),
                source,
            }
        })?;
        self.manager
            .save_with_retry(ResourceType::Checkpoint, &checkpoint.checkpoint_id, &value, false)
            .await?;
        Ok(())
    }

    pub async fn load(&self, checkpoint_id: &str) -> Option<CheckpointData> {
        let value = self.manager.load_resource(ResourceType::Checkpoint, checkpoint_id).await?;
        serde_json::from_value(value).ok()
    }

    /// Checkpoints for one task, newest first.
    pub async fn list_for_task(&self, task_id: &str) -> Vec<CheckpointData> {
        let mut checkpoints: Vec<CheckpointData> = self
            .manager
            .list_resources(ResourceType::Checkpoint, None)
            .await
            .into_iter()
            .filter_map(|v| serde_json::from_value::<CheckpointData>(v).ok())
            .filter(|c| c.task_id == task_id)
            .collect();
        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        checkpoints
    }

    pub async fn delete(&self, checkpoint_id: &str) -> bool {
        self.manager.delete_resource(ResourceType::Checkpoint, checkpoint_id).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &tempfile::TempDir) -> CheckpointStore {
        let manager = Arc::new(
            PersistenceManager::with_home(dir.path().join("ws"), dir.path().join("home")).unwrap(),
        );
        CheckpointStore::new(manager)
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let cp = CheckpointData::new("task-1", json!({ "id": "c" }), json!({}), json!({ "step": 2 }));
        s.save(&cp).await.unwrap();
        let loaded = s.load(&cp.checkpoint_id).await.unwrap();
        assert_eq!(loaded.task_id, "task-1");
        assert_eq!(loaded.execution_state["step"], 2);
    }

    #[tokio::test]
    async fn list_filters_by_task() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.save(&CheckpointData::new("t1", json!({}), json!({}), json!({}))).await.unwrap();
        s.save(&CheckpointData::new("t2", json!({}), json!({}), json!({}))).await.unwrap();
        let list = s.list_for_task("t1").await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].task_id, "t1");
    }

    #[tokio::test]
    async fn delete_removes_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let cp = CheckpointData::new("t", json!({}), json!({}), json!({}));
        s.save(&cp).await.unwrap();
        assert!(s.delete(&cp.checkpoint_id).await);
        assert!(s.load(&cp.checkpoint_id).await.is_none());
    }
}
