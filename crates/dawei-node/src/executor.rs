// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The scheduler's bridge into the agent pipeline.
//!
//! A fired task replays its message exactly the way a WebSocket turn would
//! run: resolve the workspace, build an agent (with the task's optional
//! mode/llm overrides), seed a synthetic conversation, process the message,
//! save.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use dawei_core::Agent;
use dawei_scheduler::{MessageExecutor, ScheduledTask};
use dawei_store::Conversation;
use dawei_workspace::WorkspaceService;

pub struct AgentMessageExecutor {
    workspaces: Arc<WorkspaceService>,
}

impl AgentMessageExecutor {
    pub fn new(workspaces: Arc<WorkspaceService>) -> Self {
        Self { workspaces }
    }
}

#[async_trait]
impl MessageExecutor for AgentMessageExecutor {
    async fn execute_message_task(&self, task: &ScheduledTask) -> anyhow::Result<()> {
        let message = task.execution_data.message.trim();
        if message.is_empty() {
            anyhow::bail!("message task requires a non-empty message");
        }

        let context = self.workspaces.get_context(&PathBuf::from(&task.workspace_id)).await?;
        let agent = Agent::create(
            Arc::clone(&context),
            task.execution_data.mode.clone(),
            task.execution_data.llm.clone(),
        )
        .await?;

        // Synthetic conversation: one per firing, titled with the task
        // description and the cycle index.
        let conversation_id = format!("scheduled-{}-{}", task.task_id, task.repeat_count);
        let title = format!("📅 {} (第{}次)", task.description, task.repeat_count + 1);
        let mut conversation = Conversation::new(
            conversation_id.clone(),
            title,
            agent.mode().await,
            task.execution_data.llm.clone().unwrap_or_default(),
        );
        conversation.task_type = "scheduled".to_string();
        conversation.source_task_id = Some(task.task_id.clone());
        context.conversations().set_current(conversation).await;

        info!(
            task_id = %task.task_id,
            conversation = %conversation_id,
            "replaying scheduled message through the agent pipeline"
        );
        let result = agent.process_message(message).await;

        if let Err(e) = context.conversations().save_now().await {
            warn!(error = %e, "scheduled conversation save failed");
        }
        agent.shutdown().await;

        let outcome = result?;
        if outcome.end == dawei_core::TurnEnd::Failed {
            anyhow::bail!("agent turn failed: {}", outcome.summary);
        }
        Ok(())
    }
}
