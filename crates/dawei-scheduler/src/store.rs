// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use dawei_store::{PersistenceError, PersistenceManager, ResourceType};

use crate::{ScheduledTask, TriggerStatus};

/// Persisted scheduled tasks of one workspace
/// (`.dawei/scheduled_tasks/{task_id}.json`).
pub struct ScheduledTaskStore {
    manager: Arc<PersistenceManager>,
}

impl ScheduledTaskStore {
    pub fn new(manager: Arc<PersistenceManager>) -> Self {
        Self { manager }
    }

    pub async fn save(&self, task: &ScheduledTask) -> Result<(), PersistenceError> {
        let value = serde_json::to_value(task).map_err(|source| {
            PersistenceError::Serialization { resource_id: task.task_id.clone(), source }
        })?;
        self.manager
            .save_with_retry(ResourceType::ScheduledTask, &task.task_id, &value, false)
            .await?;
        Ok(())
    }

    pub async fn load(&self, task_id: &str) -> Option<ScheduledTask> {
        let value = self.manager.load_resource(ResourceType::ScheduledTask, task_id).await?;
        match serde_json::from_value(value) {
            Ok(task) => Some(task),
            Err(e) => {
                warn!(task_id, error = %e, "undecodable scheduled task on disk");
                None
            }
        }
    }

    pub async fn list(&self) -> Vec<ScheduledTask> {
        self.manager
            .list_resources(ResourceType::ScheduledTask, None)
            .await
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect()
    }

    /// Tasks that are pending with a trigger time at or before `now`.
    pub async fn due_tasks(&self, now: DateTime<Utc>) -> Vec<ScheduledTask> {
        self.list().await.into_iter().filter(|t| t.is_due(now)).collect()
    }

    /// Cancellation removes the task from disk.
    pub async fn cancel(&self, task_id: &str) -> bool {
        self.manager.delete_resource(ResourceType::ScheduledTask, task_id).await
    }

    pub async fn pending_count(&self) -> usize {
        self.list().await.iter().filter(|t| t.status == TriggerStatus::Pending).count()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExecutionData, ScheduleType};
    use chrono::Duration as ChronoDuration;

    fn store(dir: &tempfile::TempDir) -> ScheduledTaskStore {
        let manager = Arc::new(
            PersistenceManager::with_home(dir.path().join("ws"), dir.path().join("home")).unwrap(),
        );
        ScheduledTaskStore::new(manager)
    }

    fn sample(trigger_offset_secs: i64) -> ScheduledTask {
        ScheduledTask::new(
            "ws",
            "sample",
            ScheduleType::Delay,
            Utc::now() + ChronoDuration::seconds(trigger_offset_secs),
            ExecutionData { message: "ping".into(), llm: None, mode: None },
        )
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let task = sample(60);
        s.save(&task).await.unwrap();
        let loaded = s.load(&task.task_id).await.unwrap();
        assert_eq!(loaded.description, "sample");
        assert_eq!(loaded.status, TriggerStatus::Pending);
    }

    #[tokio::test]
    async fn due_tasks_filters_by_trigger_time_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let due = sample(-5);
        let future = sample(3600);
        let mut done = sample(-5);
        done.status = TriggerStatus::Completed;
        for t in [&due, &future, &done] {
            s.save(t).await.unwrap();
        }

        let found = s.due_tasks(Utc::now()).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].task_id, due.task_id);
    }

    #[tokio::test]
    async fn cancel_deletes_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let task = sample(60);
        s.save(&task).await.unwrap();
        assert!(s.cancel(&task.task_id).await);
        assert!(s.load(&task.task_id).await.is_none());
    }
}
