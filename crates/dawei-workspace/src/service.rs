// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Global registry of workspace contexts, keyed by resolved absolute path.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::WorkspaceContext;

/// One context per workspace id, shared by every session in that workspace.
#[derive(Default)]
pub struct WorkspaceService {
    contexts: Mutex<HashMap<String, Arc<WorkspaceContext>>>,
}

impl WorkspaceService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get or create the context for a workspace path.
    ///
    /// Double-checked under the service lock: a context that was cleaned up
    /// (refs dropped to zero) is replaced by a fresh one rather than
    /// re-initialized.
    pub async fn get_context(&self, path: &Path) -> anyhow::Result<Arc<WorkspaceContext>> {
        let id = WorkspaceContext::id_from_path(path);
        let mut contexts = self.contexts.lock().await;
        if let Some(existing) = contexts.get(&id) {
            if existing.is_initialized().await {
                return Ok(Arc::clone(existing));
            }
            contexts.remove(&id);
        }
        let context = WorkspaceContext::initialize(path).await?;
        contexts.insert(id.clone(), Arc::clone(&context));
        info!(workspace = %id, "workspace context created");
        update_global_index(contexts.keys());
        Ok(context)
    }

    /// Force cleanup and removal regardless of references (workspace
    /// deletion).
    pub async fn remove_context(&self, workspace_id: &str) -> bool {
        let removed = self.contexts.lock().await.remove(workspace_id);
        match removed {
            Some(context) => {
                context.cleanup().await;
                info!(workspace = %workspace_id, "workspace context removed");
                true
            }
            None => false,
        }
    }

    pub async fn active_workspace_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.contexts.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Rewrite `{dawei_home}/workspaces.json`, the global index of known
/// workspaces.  Tmp + rename, same commit discipline as workspace resources.
fn update_global_index<'a>(ids: impl Iterator<Item = &'a String>) {
    let home = dawei_config::dawei_home();
    let mut workspaces: Vec<&String> = ids.collect();
    workspaces.sort();
    let index = serde_json::json!({
        "updated_at": chrono::Utc::now().to_rfc3339(),
        "workspaces": workspaces,
    });
    let write = || -> std::io::Result<()> {
        std::fs::create_dir_all(&home)?;
        let tmp = home.join("workspaces.json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&index).unwrap_or_default())?;
        std::fs::rename(tmp, home.join("workspaces.json"))
    };
    if let Err(e) = write() {
        warn!(error = %e, "global workspace index update failed");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
