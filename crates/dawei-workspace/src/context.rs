// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The shared per-workspace aggregate.
//!
//! One [`WorkspaceContext`] exists per resolved workspace path; every agent
//! and session in that workspace shares it.  Lifecycle is reference-counted
//! because the owned services (task-graph autosave, conversation auto-save)
//! hold background tasks that must be stopped explicitly — dropping the
//! struct is not enough.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info};

use dawei_config::{dawei_home, load_workspace_config, WorkspaceConfig};
use dawei_model::{HttpLogger, LlmManager, ProtectionStack};
use dawei_store::{ConversationStore, PersistSignal, PersistenceManager, TaskGraphAutosave};
use dawei_tools::{
    builtin::{register_builtins, register_skills_tools},
    SkillManager, ToolRegistry,
};

/// `workspace.json` metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub workspace_id: String,
    pub name: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

struct ContextState {
    ref_count: i64,
    initialized: bool,
    cleaned_up: bool,
    graph_persist_tx: Option<mpsc::UnboundedSender<PersistSignal>>,
    graph_autosave: Option<TaskGraphAutosave>,
}

pub struct WorkspaceContext {
    /// Resolved absolute path; doubles as the workspace id.
    workspace_id: String,
    workspace_path: PathBuf,
    config: WorkspaceConfig,
    persistence: Arc<PersistenceManager>,
    conversations: Arc<ConversationStore>,
    llm: Arc<LlmManager>,
    tools: Arc<RwLock<ToolRegistry>>,
    state: Mutex<ContextState>,
}

impl WorkspaceContext {
    /// Resolve a path into the canonical workspace id.
    pub fn id_from_path(path: &Path) -> String {
        path.canonicalize().unwrap_or_else(|_| path.to_path_buf()).display().to_string()
    }

    /// Create and initialize the shared resources for one workspace.
    pub async fn initialize(workspace_path: &Path) -> anyhow::Result<Arc<Self>> {
        let workspace_path =
            workspace_path.canonicalize().unwrap_or_else(|_| workspace_path.to_path_buf());
        let workspace_id = workspace_path.display().to_string();
        info!(workspace = %workspace_id, "initializing workspace context");

        let config = load_workspace_config(&workspace_path)
            .with_context(|| format!("loading config for {workspace_id}"))?;

        let persistence = Arc::new(
            PersistenceManager::new(&workspace_path)
                .with_context(|| format!("initializing persistence for {workspace_id}"))?,
        );

        let http_log = config
            .logging
            .http_traffic
            .then(|| HttpLogger::for_workspace(&workspace_path));
        let llm = Arc::new(LlmManager::new(&config, ProtectionStack::global(), http_log));

        let mut registry = ToolRegistry::new();
        register_builtins(&mut registry);
        // Skill roots in priority order: the workspace shadows the user
        // level (the directory whose `.dawei/` is the dawei home).
        let mut skill_roots = vec![workspace_path.clone()];
        if let Some(user_root) = dawei_home().parent() {
            skill_roots.push(user_root.to_path_buf());
        }
        let skills =
            Arc::new(SkillManager::new(skill_roots, Some(config.agent.mode.clone())));
        register_skills_tools(&mut registry, skills);
        registry.disable(&config.tools.disabled);
        let tools = Arc::new(RwLock::new(registry));

        let conversations =
            ConversationStore::new(Arc::clone(&persistence), config.agent.conversation_autosave_secs);
        conversations.start().await;

        let (graph_tx, graph_rx) = mpsc::unbounded_channel();
        let graph_autosave = TaskGraphAutosave::start(
            Arc::clone(&persistence),
            graph_rx,
            std::time::Duration::from_secs(1),
        );

        let context = Arc::new(Self {
            workspace_id,
            workspace_path,
            config,
            persistence,
            conversations,
            llm,
            tools,
            state: Mutex::new(ContextState {
                ref_count: 0,
                initialized: true,
                cleaned_up: false,
                graph_persist_tx: Some(graph_tx),
                graph_autosave: Some(graph_autosave),
            }),
        });
        context.touch_workspace_info().await;
        Ok(context)
    }

    /// Update (or create) `workspace.json`.
    async fn touch_workspace_info(&self) {
        let existing = self
            .persistence
            .load_resource(dawei_store::ResourceType::WorkspaceInfo, "workspace")
            .await;
        let created_at = existing
            .as_ref()
            .and_then(|v| v["created_at"].as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let info = WorkspaceInfo {
            workspace_id: self.workspace_id.clone(),
            name: self
                .workspace_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| self.workspace_id.clone()),
            path: self.workspace_id.clone(),
            created_at,
            last_accessed: Utc::now(),
        };
        if let Ok(value) = serde_json::to_value(&info) {
            if let Err(e) = self
                .persistence
                .save_resource(dawei_store::ResourceType::WorkspaceInfo, "workspace", &value, false)
                .await
            {
                error!(error = %e, "workspace.json update failed");
            }
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn workspace_path(&self) -> &Path {
        &self.workspace_path
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn persistence(&self) -> Arc<PersistenceManager> {
        Arc::clone(&self.persistence)
    }

    pub fn conversations(&self) -> Arc<ConversationStore> {
        Arc::clone(&self.conversations)
    }

    pub fn llm(&self) -> Arc<LlmManager> {
        Arc::clone(&self.llm)
    }

    pub fn tools(&self) -> Arc<RwLock<ToolRegistry>> {
        Arc::clone(&self.tools)
    }

    /// Sender for task-graph persist signals; `None` once cleaned up.
    pub async fn graph_persist_tx(&self) -> Option<mpsc::UnboundedSender<PersistSignal>> {
        self.state.lock().await.graph_persist_tx.clone()
    }

    pub async fn ref_count(&self) -> i64 {
        self.state.lock().await.ref_count
    }

    pub async fn is_initialized(&self) -> bool {
        let state = self.state.lock().await;
        state.initialized && !state.cleaned_up
    }

    /// Take a reference.  Fails once the context has been cleaned up — a new
    /// context must be created instead.
    pub async fn retain(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.cleaned_up {
            anyhow::bail!("workspace context {} already cleaned up", self.workspace_id);
        }
        state.ref_count += 1;
        debug!(workspace = %self.workspace_id, refs = state.ref_count, "context retained");
        Ok(())
    }

    /// Drop a reference; the last one triggers cleanup.
    pub async fn release(&self) {
        let cleanup = {
            let mut state = self.state.lock().await;
            state.ref_count -= 1;
            debug!(workspace = %self.workspace_id, refs = state.ref_count, "context released");
            state.ref_count <= 0 && !state.cleaned_up
        };
        if cleanup {
            self.cleanup().await;
        }
    }

    /// Stop owned services in dependency order.  Ran once; later retains are
    /// rejected.
    pub async fn cleanup(&self) {
        let (tx, autosave) = {
            let mut state = self.state.lock().await;
            if state.cleaned_up {
                return;
            }
            state.cleaned_up = true;
            (state.graph_persist_tx.take(), state.graph_autosave.take())
        };
        info!(workspace = %self.workspace_id, "cleaning up workspace context");

        // 1. Task-graph autosave: drop the sender, then drain.
        drop(tx);
        if let Some(autosave) = autosave {
            autosave.stop().await;
        }
        // 2. Conversation store (final flush inside).
        self.conversations.stop().await;
        // 3. LLM manager.
        self.llm.cleanup().await;
        // 4. Tool registry has no background state; dropping is enough.
        info!(workspace = %self.workspace_id, "workspace context cleaned up");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
