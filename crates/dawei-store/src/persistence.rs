// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-resource-type JSON persistence with an atomic write protocol.
//!
//! Every resource is one JSON file under the workspace's `.dawei/` tree (or
//! the dawei home for global resources).  Writes go through tmp + fsync +
//! rename under a per-`(type, id)` lock, so readers only ever observe a
//! previously committed snapshot — never a partial write.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use dawei_config::dawei_home;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to write temp file {path}: {source}")]
    TempWrite { path: PathBuf, source: std::io::Error },

    #[error("temp file {path} failed verification after write")]
    TempVerification { path: PathBuf },

    #[error("failed to rename {from} to {to} after retries: {source}")]
    Rename { from: PathBuf, to: PathBuf, source: std::io::Error },

    #[error("serialization failed for {resource_id}: {source}")]
    Serialization { resource_id: String, source: serde_json::Error },

    #[error("save of {resource_type:?} {resource_id} exhausted {attempts} attempts: {last_error}")]
    Exhausted {
        resource_type: ResourceType,
        resource_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("io error on {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Conversation,
    TaskGraph,
    TaskNode,
    Checkpoint,
    ScheduledTask,
    WorkspaceSettings,
    WorkspaceInfo,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Conversation => "conversation",
            ResourceType::TaskGraph => "task_graph",
            ResourceType::TaskNode => "task_node",
            ResourceType::Checkpoint => "checkpoint",
            ResourceType::ScheduledTask => "scheduled_task",
            ResourceType::WorkspaceSettings => "workspace_settings",
            ResourceType::WorkspaceInfo => "workspace_info",
        }
    }
}

pub struct PersistenceManager {
    workspace_path: PathBuf,
    persistence_dir: PathBuf,
    checkpoints_dir: PathBuf,
    sessions_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Receives persistence-failure alerts (forwarded to the agent event bus
    /// by whoever owns one).
    alert_sink: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    max_retry_attempts: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl PersistenceManager {
    pub fn new(workspace_path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        Self::with_home(workspace_path, dawei_home())
    }

    /// Construct with an explicit dawei home (tests and embedded setups).
    pub fn with_home(
        workspace_path: impl Into<PathBuf>,
        home: PathBuf,
    ) -> Result<Self, PersistenceError> {
        let workspace_path = workspace_path.into();
        let persistence_dir = workspace_path.join(".dawei");
        let manager = Self {
            workspace_path,
            checkpoints_dir: home.join("checkpoints"),
            sessions_dir: home.join("sessions"),
            persistence_dir,
            locks: Mutex::new(HashMap::new()),
            alert_sink: Mutex::new(None),
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
        };
        manager.ensure_directories()?;
        Ok(manager)
    }

    fn ensure_directories(&self) -> Result<(), PersistenceError> {
        let dirs = [
            self.persistence_dir.clone(),
            self.persistence_dir.join("conversations"),
            self.persistence_dir.join("task_graphs"),
            self.persistence_dir.join("task_nodes"),
            self.persistence_dir.join("scheduled_tasks"),
            self.checkpoints_dir.clone(),
            self.sessions_dir.clone(),
        ];
        for dir in dirs {
            std::fs::create_dir_all(&dir)
                .map_err(|source| PersistenceError::Io { path: dir.clone(), source })?;
        }
        debug!(workspace = %self.workspace_path.display(), "persistence directories ready");
        Ok(())
    }

    pub fn workspace_path(&self) -> &Path {
        &self.workspace_path
    }

    fn resource_dir(&self, resource_type: ResourceType) -> PathBuf {
        match resource_type {
            ResourceType::Conversation => self.persistence_dir.join("conversations"),
            ResourceType::TaskGraph => self.persistence_dir.join("task_graphs"),
            ResourceType::TaskNode => self.persistence_dir.join("task_nodes"),
            ResourceType::ScheduledTask => self.persistence_dir.join("scheduled_tasks"),
            ResourceType::Checkpoint => self.checkpoints_dir.clone(),
            ResourceType::WorkspaceSettings | ResourceType::WorkspaceInfo => {
                self.persistence_dir.clone()
            }
        }
    }

    async fn lock_for(&self, resource_type: ResourceType, resource_id: &str) -> Arc<Mutex<()>> {
        let key = format!("{}:{resource_id}", resource_type.as_str());
        let mut locks = self.locks.lock().await;
        locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Save one resource atomically.
    ///
    /// File name is `{id}.json`, or `{yyyymmddHHMMSS}_{id}.json` when the
    /// caller asks for a timestamped name.
    pub async fn save_resource(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        data: &Value,
        use_timestamp: bool,
    ) -> Result<PathBuf, PersistenceError> {
        let lock = self.lock_for(resource_type, resource_id).await;
        let _guard = lock.lock().await;

        let dir = self.resource_dir(resource_type);
        std::fs::create_dir_all(&dir)
            .map_err(|source| PersistenceError::Io { path: dir.clone(), source })?;

        let filename = if use_timestamp {
            format!("{}_{resource_id}.json", Utc::now().format("%Y%m%d%H%M%S"))
        } else {
            format!("{resource_id}.json")
        };
        let final_path = dir.join(filename);
        let tmp_path = final_path.with_extension("tmp");

        let content = serde_json::to_string_pretty(data).map_err(|source| {
            PersistenceError::Serialization { resource_id: resource_id.to_string(), source }
        })?;

        // Write + flush + fsync before the rename; the rename is the commit
        // point.
        let write_result = (|| -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.flush()?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(source) = write_result {
            error!(path = %tmp_path.display(), error = %source, "temp file write failed");
            let _ = std::fs::remove_file(&tmp_path);
            return Err(PersistenceError::TempWrite { path: tmp_path, source });
        }

        let verified = tmp_path.metadata().map(|m| m.len() > 0).unwrap_or(false);
        if !verified {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(PersistenceError::TempVerification { path: tmp_path });
        }

        self.rename_with_retry(&tmp_path, &final_path).await?;
        debug!(
            resource_type = resource_type.as_str(),
            resource_id,
            path = %final_path.display(),
            "resource saved"
        );
        Ok(final_path)
    }

    /// Rename with up to 5 attempts (50ms exponential backoff), then a
    /// delete-then-rename fallback for platforms that hold the target open.
    async fn rename_with_retry(&self, tmp: &Path, target: &Path) -> Result<(), PersistenceError> {
        const MAX_RETRIES: u32 = 5;
        let mut delay = Duration::from_millis(50);
        let mut last_error: Option<std::io::Error> = None;

        for attempt in 0..MAX_RETRIES {
            match std::fs::rename(tmp, target) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max = MAX_RETRIES,
                        from = %tmp.display(),
                        to = %target.display(),
                        error = %e,
                        "rename failed, backing off"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }

        // Fallback: remove the target first, then move.
        if target.exists() {
            let _ = std::fs::remove_file(target);
        }
        match std::fs::rename(tmp, target) {
            Ok(()) => Ok(()),
            Err(source) => {
                let _ = std::fs::remove_file(tmp);
                Err(PersistenceError::Rename {
                    from: tmp.to_path_buf(),
                    to: target.to_path_buf(),
                    source: last_error.unwrap_or(source),
                })
            }
        }
    }

    /// Load a resource; timestamped files win over the plain name, newest
    /// first.
    pub async fn load_resource(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Option<Value> {
        let dir = self.resource_dir(resource_type);
        let suffix = format!("_{resource_id}.json");

        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&dir)
            .ok()?
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(&suffix))
                    .unwrap_or(false)
            })
            .collect();
        candidates.sort_by_key(|p| {
            p.metadata().and_then(|m| m.modified()).ok()
        });
        let path = candidates
            .pop()
            .or_else(|| {
                let plain = dir.join(format!("{resource_id}.json"));
                plain.exists().then_some(plain)
            })?;

        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                error!(path = %path.display(), error = %e, "resource read failed");
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(v) => Some(v),
            Err(e) => {
                error!(path = %path.display(), error = %e, "resource decode failed");
                None
            }
        }
    }

    /// List all resources of one type, newest `updated_at` first.
    pub async fn list_resources(
        &self,
        resource_type: ResourceType,
        limit: Option<usize>,
    ) -> Vec<Value> {
        let dir = self.resource_dir(resource_type);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };

        let mut resources: Vec<Value> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .filter_map(|p| {
                let content = std::fs::read_to_string(&p).ok()?;
                serde_json::from_str(&content).ok()
            })
            .collect();
        resources.sort_by(|a, b| {
            let a_time = a["updated_at"].as_str().unwrap_or("");
            let b_time = b["updated_at"].as_str().unwrap_or("");
            b_time.cmp(a_time)
        });
        if let Some(limit) = limit {
            resources.truncate(limit);
        }
        resources
    }

    /// Delete a resource including any timestamped variants.
    pub async fn delete_resource(&self, resource_type: ResourceType, resource_id: &str) -> bool {
        let dir = self.resource_dir(resource_type);
        let suffix = format!("_{resource_id}.json");
        let plain = format!("{resource_id}.json");
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return false;
        };
        let mut deleted = false;
        for path in entries.flatten().map(|e| e.path()) {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if name == plain || name.ends_with(&suffix) {
                match std::fs::remove_file(&path) {
                    Ok(()) => deleted = true,
                    Err(e) => error!(path = %path.display(), error = %e, "delete failed"),
                }
            }
        }
        deleted
    }

    /// Forward persistence-failure alerts to this sink (typically bridged to
    /// the agent event bus).
    pub async fn set_alert_sink(&self, sink: mpsc::UnboundedSender<Value>) {
        *self.alert_sink.lock().await = Some(sink);
    }

    /// Save with the `with_retry` contract: exponential backoff, and on
    /// exhaustion a persistence-failure alert (logged, appended to the
    /// failures JSONL, published to the sink when present).
    pub async fn save_with_retry(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        data: &Value,
        use_timestamp: bool,
    ) -> Result<PathBuf, PersistenceError> {
        let mut last_error: Option<PersistenceError> = None;
        for attempt in 0..self.max_retry_attempts {
            match self.save_resource(resource_type, resource_id, data, use_timestamp).await {
                Ok(path) => return Ok(path),
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max = self.max_retry_attempts,
                        resource_type = resource_type.as_str(),
                        resource_id,
                        error = %e,
                        "save attempt failed"
                    );
                    last_error = Some(e);
                    let delay = self
                        .retry_base_delay
                        .saturating_mul(2u32.pow(attempt))
                        .min(self.retry_max_delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let last_error = last_error.map(|e| e.to_string()).unwrap_or_default();
        self.emit_failure_alert(resource_type, resource_id, &last_error).await;
        Err(PersistenceError::Exhausted {
            resource_type,
            resource_id: resource_id.to_string(),
            attempts: self.max_retry_attempts,
            last_error,
        })
    }

    async fn emit_failure_alert(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        last_error: &str,
    ) {
        let alert = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "resource_type": resource_type.as_str(),
            "resource_id": resource_id,
            "error": last_error,
            "workspace": self.workspace_path.display().to_string(),
        });
        error!(
            resource_type = resource_type.as_str(),
            resource_id,
            error = last_error,
            "persistence failure after all retries"
        );

        let failures_dir = self.persistence_dir.join("persistence_failures");
        let file = failures_dir.join(format!("failures_{}.jsonl", Utc::now().format("%Y%m%d")));
        let appended = std::fs::create_dir_all(&failures_dir).and_then(|_| {
            let mut f = std::fs::OpenOptions::new().create(true).append(true).open(&file)?;
            writeln!(f, "{alert}")
        });
        if let Err(e) = appended {
            error!(path = %file.display(), error = %e, "failure journal append failed");
        }

        if let Some(sink) = self.alert_sink.lock().await.as_ref() {
            let _ = sink.send(alert);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(dir: &tempfile::TempDir) -> PersistenceManager {
        PersistenceManager::with_home(dir.path().join("ws"), dir.path().join("home")).unwrap()
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        let data = json!({ "id": "c1", "title": "hello", "updated_at": "2026-01-01T00:00:00Z" });
        m.save_resource(ResourceType::Conversation, "c1", &data, false).await.unwrap();
        let loaded = m.load_resource(ResourceType::Conversation, "c1").await.unwrap();
        assert_eq!(loaded, data);
    }

    #[tokio::test]
    async fn save_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        m.save_resource(ResourceType::TaskGraph, "g1", &json!({ "nodes": [] }), false)
            .await
            .unwrap();
        let graphs = dir.path().join("ws").join(".dawei").join("task_graphs");
        let leftover: Vec<_> = std::fs::read_dir(graphs)
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn timestamped_name_contains_id() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        let path = m
            .save_resource(ResourceType::Conversation, "c9", &json!({}), true)
            .await
            .unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("_c9.json"));
        assert_ne!(name, "c9.json");
    }

    #[tokio::test]
    async fn load_prefers_newest_timestamped_file() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        let conv_dir = dir.path().join("ws").join(".dawei").join("conversations");
        std::fs::write(conv_dir.join("20200101000000_c1.json"), r#"{"v":"old"}"#).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(conv_dir.join("20260101000000_c1.json"), r#"{"v":"new"}"#).unwrap();
        let loaded = m.load_resource(ResourceType::Conversation, "c1").await.unwrap();
        assert_eq!(loaded["v"], "new");
    }

    #[tokio::test]
    async fn overwrite_replaces_committed_state() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        m.save_resource(ResourceType::Conversation, "c1", &json!({ "n": 1 }), false)
            .await
            .unwrap();
        m.save_resource(ResourceType::Conversation, "c1", &json!({ "n": 2 }), false)
            .await
            .unwrap();
        let loaded = m.load_resource(ResourceType::Conversation, "c1").await.unwrap();
        assert_eq!(loaded["n"], 2);
    }

    #[tokio::test]
    async fn list_sorts_newest_updated_first() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        m.save_resource(
            ResourceType::Conversation,
            "a",
            &json!({ "id": "a", "updated_at": "2026-01-01T00:00:00Z" }),
            false,
        )
        .await
        .unwrap();
        m.save_resource(
            ResourceType::Conversation,
            "b",
            &json!({ "id": "b", "updated_at": "2026-06-01T00:00:00Z" }),
            false,
        )
        .await
        .unwrap();
        let list = m.list_resources(ResourceType::Conversation, None).await;
        assert_eq!(list[0]["id"], "b");
        assert_eq!(list[1]["id"], "a");
    }

    #[tokio::test]
    async fn delete_removes_all_variants() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        m.save_resource(ResourceType::Conversation, "c1", &json!({}), false).await.unwrap();
        m.save_resource(ResourceType::Conversation, "c1", &json!({}), true).await.unwrap();
        assert!(m.delete_resource(ResourceType::Conversation, "c1").await);
        assert!(m.load_resource(ResourceType::Conversation, "c1").await.is_none());
    }

    #[tokio::test]
    async fn checkpoints_live_under_dawei_home() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        let path = m
            .save_resource(ResourceType::Checkpoint, "cp1", &json!({ "task_id": "t" }), false)
            .await
            .unwrap();
        assert!(path.starts_with(dir.path().join("home").join("checkpoints")));
    }

    #[tokio::test]
    async fn exhausted_retries_append_failure_journal() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        // A resource id that is an existing directory forces every rename to
        // fail, driving the retry path to exhaustion.
        let conv_dir = dir.path().join("ws").join(".dawei").join("conversations");
        std::fs::create_dir_all(conv_dir.join("blocked.json")).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        m.set_alert_sink(tx).await;

        let err = m
            .save_with_retry(ResourceType::Conversation, "blocked", &json!({}), false)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Exhausted { .. }));

        let alert = rx.recv().await.unwrap();
        assert_eq!(alert["resource_id"], "blocked");

        let failures_dir = dir.path().join("ws").join(".dawei").join("persistence_failures");
        let journal: Vec<_> = std::fs::read_dir(failures_dir).unwrap().flatten().collect();
        assert_eq!(journal.len(), 1);
        let content = std::fs::read_to_string(journal[0].path()).unwrap();
        assert!(content.lines().count() >= 1);
    }
}
