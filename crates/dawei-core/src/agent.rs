// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent composition root.
//!
//! On creation the agent takes a reference on the workspace context, builds
//! its own event bus and task graph, and wires the tool executor.  Each
//! `process_message` call drives one user turn through the node executor;
//! `stop` cancels the in-flight turn at its next await point.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use dawei_store::Conversation;
use dawei_tools::ToolExecutor;
use dawei_workspace::WorkspaceContext;

use crate::node_executor::{NodeExecutor, TurnEnd};
use crate::{AgentEvent, EventBus, TaskGraph, TaskNodeData, TaskStatus};

pub use crate::node_executor::NodeOutcome as AgentOutcome;

pub struct Agent {
    workspace: Arc<WorkspaceContext>,
    bus: Arc<EventBus>,
    graph: Arc<Mutex<TaskGraph>>,
    executor: NodeExecutor,
    followups: Arc<DashMap<String, oneshot::Sender<String>>>,
    mode: Mutex<String>,
    model_name: String,
    cancel: Mutex<CancellationToken>,
    shutdown: Mutex<bool>,
}

impl Agent {
    /// Build an agent against a workspace context.
    ///
    /// Takes one context reference; callers pair this with [`shutdown`]
    /// (the chat handler does so in its cleanup path).
    pub async fn create(
        workspace: Arc<WorkspaceContext>,
        mode_override: Option<String>,
        llm_override: Option<String>,
    ) -> anyhow::Result<Arc<Self>> {
        let client = workspace.llm().client(llm_override.as_deref()).await?;
        Self::create_with_client(workspace, client, mode_override).await
    }

    /// Like [`create`](Self::create) with an explicit client.  Used by
    /// embedders and tests that bring their own (scripted) model.
    pub async fn create_with_client(
        workspace: Arc<WorkspaceContext>,
        client: Arc<dyn dawei_model::LlmClient>,
        mode_override: Option<String>,
    ) -> anyhow::Result<Arc<Self>> {
        workspace.retain().await?;

        let bus = EventBus::new();
        let followups: Arc<DashMap<String, oneshot::Sender<String>>> = Arc::new(DashMap::new());

        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        let tool_executor = Arc::new(ToolExecutor::new(
            workspace.tools(),
            workspace.workspace_path(),
            tool_tx,
        ));

        let mut graph = TaskGraph::new();
        if let Some(tx) = workspace.graph_persist_tx().await {
            graph.set_persist_channel(tx);
        }
        let graph = Arc::new(Mutex::new(graph));

        let agent_config = &workspace.config().agent;
        let mode = mode_override.unwrap_or_else(|| agent_config.mode.clone());
        let model_name = client.model_name().to_string();

        let executor = NodeExecutor::new(
            client,
            tool_executor,
            workspace.tools(),
            workspace.conversations().current_handle(),
            Arc::clone(&graph),
            Arc::clone(&bus),
            tool_rx,
            Arc::clone(&followups),
            agent_config.max_tool_rounds,
            agent_config.consecutive_mistake_limit,
        );

        info!(workspace = %workspace.workspace_id(), mode = %mode, "agent created");
        Ok(Arc::new(Self {
            workspace,
            bus,
            graph,
            executor,
            followups,
            mode: Mutex::new(mode),
            model_name,
            cancel: Mutex::new(CancellationToken::new()),
            shutdown: Mutex::new(false),
        }))
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn workspace(&self) -> Arc<WorkspaceContext> {
        Arc::clone(&self.workspace)
    }

    pub async fn mode(&self) -> String {
        self.mode.lock().await.clone()
    }

    pub async fn set_mode(&self, mode: impl Into<String>) {
        *self.mode.lock().await = mode.into();
    }

    /// Drive one user message to completion.
    pub async fn process_message(&self, user_input: &str) -> anyhow::Result<AgentOutcome> {
        let started = Instant::now();
        let mode = self.mode().await;

        self.ensure_conversation(user_input, &mode).await;
        let node_id = self.ensure_task_node(user_input, &mode).await?;

        let cancel = {
            let mut slot = self.cancel.lock().await;
            *slot = CancellationToken::new();
            slot.clone()
        };

        let outcome = self.executor.run_node(&node_id, &mode, &cancel).await?;

        match outcome.end {
            TurnEnd::Completed => {
                let tasks_completed = {
                    let graph = self.graph.lock().await;
                    graph
                        .get_all()
                        .iter()
                        .filter(|n| n.status == TaskStatus::Completed)
                        .count()
                };
                self.bus
                    .emit(AgentEvent::AgentComplete {
                        result_summary: outcome.summary.clone(),
                        total_duration_ms: started.elapsed().as_millis() as u64,
                        tasks_completed,
                        tools_used: outcome.tools_used.clone(),
                    })
                    .await;
            }
            TurnEnd::Stopped => {
                self.bus
                    .emit(AgentEvent::AgentStopped {
                        stopped_at: Utc::now(),
                        result_summary: outcome.summary.clone(),
                        partial: true,
                    })
                    .await;
            }
            TurnEnd::Failed => {}
        }
        Ok(outcome)
    }

    /// Create (or reuse) the current conversation and append the user turn.
    async fn ensure_conversation(&self, user_input: &str, mode: &str) {
        let handle = self.workspace.conversations().current_handle();
        let mut slot = handle.lock().await;
        if slot.is_none() {
            let title = truncate_title(user_input);
            let conversation =
                Conversation::new(Uuid::new_v4().to_string(), title, mode, &self.model_name);
            debug!(id = %conversation.id, "conversation created");
            *slot = Some(conversation);
        }
        if let Some(conversation) = slot.as_mut() {
            conversation.push(dawei_model::Message::user(user_input));
        }
    }

    /// First message creates the root node; later messages become subtasks
    /// under it.
    async fn ensure_task_node(&self, user_input: &str, mode: &str) -> anyhow::Result<String> {
        let mut graph = self.graph.lock().await;
        let description = truncate_title(user_input);
        let node_id = match graph.root_id().map(String::from) {
            None => graph.create_root(description, mode, TaskNodeData::default())?,
            Some(root) => graph.create_subtask(&root, description, mode, TaskNodeData::default())?,
        };
        Ok(node_id)
    }

    /// Cancel the in-flight turn.  Returns a partial result summary.
    pub async fn stop(&self) -> String {
        info!("agent stop requested");
        self.cancel.lock().await.cancel();
        let handle = self.workspace.conversations().current_handle();
        let conversation = handle.lock().await;
        conversation
            .as_ref()
            .and_then(|c| c.last_assistant_text().map(String::from))
            .unwrap_or_else(|| "stopped before any output".to_string())
    }

    /// Deliver a followup answer to a suspended turn.
    pub async fn deliver_followup(&self, tool_call_id: &str, response: String) -> bool {
        match self.followups.remove(tool_call_id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn graph(&self) -> Arc<Mutex<TaskGraph>> {
        Arc::clone(&self.graph)
    }

    /// Release the workspace reference.  Idempotent.
    pub async fn shutdown(&self) {
        let mut done = self.shutdown.lock().await;
        if *done {
            return;
        }
        *done = true;
        drop(done);
        self.cancel.lock().await.cancel();
        self.workspace.release().await;
        debug!("agent shut down");
    }
}

fn truncate_title(input: &str) -> String {
    let trimmed = input.trim();
    let mut title: String = trimmed.chars().take(40).collect();
    if trimmed.chars().count() > 40 {
        title.push('…');
    }
    title
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_title_keeps_short_input() {
        assert_eq!(truncate_title("hello"), "hello");
    }

    #[test]
    fn truncate_title_caps_long_input() {
        let long = "x".repeat(100);
        let title = truncate_title(&long);
        assert_eq!(title.chars().count(), 41);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn truncate_title_handles_multibyte() {
        let input = "定时任务每天早上九点提醒我喝水并且记录到对话里然后继续处理其他事项直到完成为止";
        let title = truncate_title(input);
        assert!(title.chars().count() <= 41);
    }
}
