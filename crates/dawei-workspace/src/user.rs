// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-session view over a shared workspace context.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use dawei_store::Conversation;

use crate::WorkspaceContext;

/// A thin per-user-session wrapper: holds one reference on the shared
/// context plus session-local state (current conversation id, mode, UI
/// context).  The public surface delegates to the context.
pub struct UserWorkspace {
    context: Arc<WorkspaceContext>,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    current_conversation_id: Option<String>,
    current_mode: Option<String>,
    ui_context: Option<Value>,
    released: bool,
}

impl UserWorkspace {
    /// Wrap a context, taking one reference.
    pub async fn attach(context: Arc<WorkspaceContext>) -> anyhow::Result<Self> {
        context.retain().await?;
        Ok(Self { context, state: Mutex::new(SessionState::default()) })
    }

    pub fn context(&self) -> Arc<WorkspaceContext> {
        Arc::clone(&self.context)
    }

    pub async fn set_current_conversation(&self, conversation: Conversation) {
        {
            let mut state = self.state.lock().await;
            state.current_conversation_id = Some(conversation.id.clone());
        }
        self.context.conversations().set_current(conversation).await;
    }

    pub async fn current_conversation_id(&self) -> Option<String> {
        self.state.lock().await.current_conversation_id.clone()
    }

    /// Session mode override; falls back to the workspace default.
    pub async fn current_mode(&self) -> String {
        self.state
            .lock()
            .await
            .current_mode
            .clone()
            .unwrap_or_else(|| self.context.config().agent.mode.clone())
    }

    pub async fn set_mode(&self, mode: impl Into<String>) {
        self.state.lock().await.current_mode = Some(mode.into());
    }

    pub async fn set_ui_context(&self, ui_context: Option<Value>) {
        self.state.lock().await.ui_context = ui_context;
    }

    pub async fn ui_context(&self) -> Option<Value> {
        self.state.lock().await.ui_context.clone()
    }

    pub async fn save_current_conversation(&self) -> anyhow::Result<()> {
        self.context.conversations().save_now().await?;
        Ok(())
    }

    /// Stored conversations of the workspace, newest first.
    pub async fn list_conversations(&self, limit: Option<usize>) -> Vec<Value> {
        self.context
            .persistence()
            .list_resources(dawei_store::ResourceType::Conversation, limit)
            .await
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> bool {
        self.context
            .persistence()
            .delete_resource(dawei_store::ResourceType::Conversation, conversation_id)
            .await
    }

    /// Provider keys configured for this workspace.
    pub fn llm_provider_keys(&self) -> Vec<String> {
        self.context.llm().provider_keys()
    }

    /// Names in the current tool allow-set.
    pub async fn tool_names(&self) -> Vec<String> {
        self.context.tools().read().await.names()
    }

    /// Release the context reference.  Idempotent.
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        if state.released {
            return;
        }
        state.released = true;
        drop(state);
        debug!(workspace = %self.context.workspace_id(), "user workspace released");
        self.context.release().await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn context(dir: &tempfile::TempDir) -> Arc<WorkspaceContext> {
        std::env::set_var("DAWEI_HOME", std::env::temp_dir().join("dawei-test-home"));
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        WorkspaceContext::initialize(&ws).await.unwrap()
    }

    #[tokio::test]
    async fn attach_takes_a_reference() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let user = UserWorkspace::attach(Arc::clone(&ctx)).await.unwrap();
        assert_eq!(ctx.ref_count().await, 1);
        user.release().await;
        assert_eq!(ctx.ref_count().await, 0);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let user = UserWorkspace::attach(Arc::clone(&ctx)).await.unwrap();
        user.release().await;
        user.release().await;
        assert_eq!(ctx.ref_count().await, 0, "double release must not go negative");
    }

    #[tokio::test]
    async fn mode_falls_back_to_workspace_default() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir).await;
        let user = UserWorkspace::attach(ctx).await.unwrap();
        assert_eq!(user.current_mode().await, "orchestrator");
        user.set_mode("plan").await;
        assert_eq!(user.current_mode().await, "plan");
        user.release().await;
    }
}
