// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The chat handler: a user message becomes a task definition submitted to
//! the task manager, with the event forwarder bridging the agent's bus to
//! the session.  The conversation is saved on the way out no matter how the
//! task ended.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use dawei_core::{Agent, RetryPolicy, TaskCallbacks, TaskDefinition, TaskOutcome};
use dawei_model::RequestPriority;
use dawei_scheduler::{ScheduledTaskStore, TimerTool};

use crate::handlers::{handle_system_command, install_event_forwarder};
use crate::protocol::{ServerBody, ServerFrame, UserMessageMetadata};
use crate::state::AppState;

/// Map raw provider failures onto short user-facing strings; the full error
/// stays in `details.original_error` for diagnosis.
pub fn shape_user_error(raw: &str) -> (String, String, bool) {
    let lowered = raw.to_lowercase();
    if lowered.contains("429") || lowered.contains("rate limit") {
        (
            "RATE_LIMITED".to_string(),
            "请求过于频繁，请稍后再试 / Rate limited, please retry shortly.".to_string(),
            true,
        )
    } else if lowered.contains("insufficient") || lowered.contains("balance") || lowered.contains("quota") {
        (
            "INSUFFICIENT_BALANCE".to_string(),
            "账户余额不足，请检查套餐 / Insufficient balance or quota.".to_string(),
            false,
        )
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        (
            "LLM_TIMEOUT".to_string(),
            "模型响应超时，请重试 / The model timed out, please retry.".to_string(),
            true,
        )
    } else if lowered.contains("connection") || lowered.contains("502") || lowered.contains("503") {
        (
            "LLM_UNAVAILABLE".to_string(),
            "模型服务暂不可用 / The model service is temporarily unavailable.".to_string(),
            true,
        )
    } else {
        ("AGENT_FAILED".to_string(), "处理消息时出错 / Failed to process the message.".to_string(), false)
    }
}

/// Register the workspace's timer tool and make sure its scheduler engine is
/// running.
async fn ensure_workspace_services(state: &Arc<AppState>, context: &Arc<dawei_workspace::WorkspaceContext>) {
    let registry = context.tools();
    {
        let mut registry = registry.write().await;
        if registry.get("timer").is_none() {
            let store = Arc::new(ScheduledTaskStore::new(context.persistence()));
            registry.register(TimerTool::new(context.workspace_id(), store));
        }
    }

    let store = Arc::new(ScheduledTaskStore::new(context.persistence()));
    let executor = Arc::new(crate::executor::AgentMessageExecutor::new(Arc::clone(&state.workspaces)));
    state
        .scheduler
        .get_scheduler(
            context.workspace_id(),
            store,
            executor,
            context.config().scheduler.workers,
        )
        .await;
}

/// Handle one `user_message` frame.
pub async fn handle_user_message(
    state: Arc<AppState>,
    session_id: String,
    content: String,
    metadata: UserMessageMetadata,
    user_ui_context: Option<Value>,
    out_tx: mpsc::UnboundedSender<ServerFrame>,
) {
    if metadata.workspace_id.is_empty() {
        send_error(&out_tx, &session_id, "MISSING_WORKSPACE", "metadata.workspaceId is required", None);
        return;
    }
    let workspace_path = PathBuf::from(&metadata.workspace_id);

    let context = match state.workspaces.get_context(&workspace_path).await {
        Ok(context) => context,
        Err(e) => {
            error!(error = %e, "workspace acquisition failed");
            send_error(
                &out_tx,
                &session_id,
                "WORKSPACE_INIT_FAILED",
                "无法初始化工作区 / Failed to initialize workspace.",
                Some(json!({ "original_error": e.to_string() })),
            );
            return;
        }
    };
    ensure_workspace_services(&state, &context).await;

    // `!`-prefixed input runs in the sandbox; the agent pipeline is skipped
    // for that turn.
    if let Some(command) = content.strip_prefix('!') {
        handle_system_command(&context, &session_id, command, &out_tx).await;
        return;
    }

    // Resume an existing conversation when the client names one.
    if let Some(conversation_id) = &metadata.conversation_id {
        if let Some(existing) = context.conversations().load(conversation_id).await {
            context.conversations().set_current(existing).await;
        }
    }
    let _ = user_ui_context; // session-scoped UI context is carried per message

    let agent = match Agent::create(Arc::clone(&context), None, None).await {
        Ok(agent) => agent,
        Err(e) => {
            let (code, message, recoverable) = shape_user_error(&e.to_string());
            let frame = ServerFrame::new(
                session_id,
                ServerBody::Error {
                    code,
                    message,
                    recoverable,
                    details: Some(json!({ "original_error": e.to_string() })),
                },
            );
            let _ = out_tx.send(frame);
            return;
        }
    };

    let task_id = Uuid::new_v4().to_string();
    let forwarder_id = install_event_forwarder(&agent.bus(), &session_id, out_tx.clone()).await;
    state.track_registration(&session_id, agent.bus(), forwarder_id).await;
    state.active_agents.insert(task_id.clone(), Arc::clone(&agent));
    state.task_sessions.insert(task_id.clone(), session_id.clone());
    info!(task_id = %task_id, session_id = %session_id, "chat task created");

    let (done_tx, done_rx) = oneshot::channel::<TaskOutcome>();
    let done_tx = std::sync::Mutex::new(Some(done_tx));
    let callbacks = TaskCallbacks {
        on_completion: Some(Arc::new(move |_, outcome| {
            if let Some(tx) = done_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = tx.send(outcome.clone());
            }
        })),
        ..Default::default()
    };

    let task_agent = Arc::clone(&agent);
    let task_content = content.clone();
    let definition = TaskDefinition {
        task_id: task_id.clone(),
        name: "chat".to_string(),
        description: content.chars().take(60).collect(),
        executor: Arc::new(move |_params, _ctx| {
            let agent = Arc::clone(&task_agent);
            let content = task_content.clone();
            Box::pin(async move {
                let outcome = agent.process_message(&content).await?;
                Ok(json!({ "summary": outcome.summary }))
            })
        }),
        parameters: json!({}),
        timeout: Duration::from_secs(3600),
        retry_policy: RetryPolicy::default(),
        priority: RequestPriority::Critical,
    };
    state.task_manager.submit(definition, callbacks).await;

    // Post-task cleanup runs regardless of how the task ended: save the
    // conversation, detach the forwarder, drop the agent reference.
    let cleanup_state = Arc::clone(&state);
    let cleanup_session = session_id.clone();
    tokio::spawn(async move {
        let outcome = done_rx.await.ok();

        if let Err(e) = context.conversations().save_now().await {
            warn!(error = %e, "conversation save after task failed");
        }
        cleanup_state.active_agents.remove(&task_id);
        cleanup_state.task_sessions.remove(&task_id);
        agent.bus().remove_any_handler(forwarder_id).await;
        agent.shutdown().await;

        if let Some(outcome) = outcome {
            if !outcome.is_success {
                if let Some(raw) = outcome.error.as_deref() {
                    if raw != "cancelled" {
                        let (code, message, recoverable) = shape_user_error(raw);
                        let frame = ServerFrame::new(
                            cleanup_session.clone(),
                            ServerBody::Error {
                                code,
                                message,
                                recoverable,
                                details: Some(json!({ "original_error": raw })),
                            },
                        );
                        let _ = out_tx.send(frame);
                    }
                }
            }
        }
        info!(task_id = %task_id, "chat task cleaned up");
    });
}

/// Route a `followup_response` frame to the suspended node executor.
pub async fn handle_followup_response(
    state: Arc<AppState>,
    session_id: String,
    task_id: String,
    tool_call_id: String,
    response: String,
    out_tx: mpsc::UnboundedSender<ServerFrame>,
) {
    let Some(agent) = state.active_agents.get(&task_id).map(|a| Arc::clone(&a)) else {
        send_error(
            &out_tx,
            &session_id,
            "TASK_NOT_FOUND",
            "no active task for this followup response",
            Some(json!({ "task_id": task_id })),
        );
        return;
    };
    if !agent.deliver_followup(&tool_call_id, response).await {
        send_error(
            &out_tx,
            &session_id,
            "FOLLOWUP_NOT_PENDING",
            "the task is not waiting on this followup question",
            Some(json!({ "tool_call_id": tool_call_id })),
        );
    }
}

pub(crate) fn send_error(
    out_tx: &mpsc::UnboundedSender<ServerFrame>,
    session_id: &str,
    code: &str,
    message: &str,
    details: Option<Value>,
) {
    let frame = ServerFrame::new(
        session_id,
        ServerBody::Error {
            code: code.to_string(),
            message: message.to_string(),
            recoverable: false,
            details,
        },
    );
    let _ = out_tx.send(frame);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_errors_shape_to_retryable() {
        let (code, message, recoverable) = shape_user_error("deepseek rate limited: HTTP 429");
        assert_eq!(code, "RATE_LIMITED");
        assert!(message.contains("请求过于频繁"));
        assert!(recoverable);
    }

    #[test]
    fn balance_errors_shape_to_non_retryable() {
        let (code, _, recoverable) = shape_user_error("Insufficient Balance for this key");
        assert_eq!(code, "INSUFFICIENT_BALANCE");
        assert!(!recoverable);
    }

    #[test]
    fn unknown_errors_fall_back_to_generic() {
        let (code, message, recoverable) = shape_user_error("something odd happened");
        assert_eq!(code, "AGENT_FAILED");
        assert!(message.contains("处理消息时出错"));
        assert!(!recoverable);
    }
}
