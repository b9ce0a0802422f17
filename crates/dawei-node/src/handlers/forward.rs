// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Event forwarding: one agent event becomes exactly one WebSocket frame.
//!
//! The LLM call bracketing (`llm_api_request` / `llm_api_complete` with
//! duration) is produced by the node executor; this translation layer keeps
//! the 1:1 mapping and the per-session FIFO ordering — frames go through the
//! session's outbound queue in emission order.

use std::sync::Arc;

use tokio::sync::mpsc;

use dawei_core::{AgentEvent, EventBus, HandlerId};

use crate::protocol::{ServerBody, ServerFrame};

/// Translate one agent event into its wire counterpart.
pub fn translate(event: AgentEvent) -> ServerBody {
    match event {
        AgentEvent::TaskNodeStart { task_node_id, description } => {
            ServerBody::TaskNodeStart { task_node_id, description }
        }
        AgentEvent::TaskNodeProgress { task_node_id, progress, status, message, data } => {
            ServerBody::TaskNodeProgress { task_node_id, progress, status, message, data }
        }
        AgentEvent::TaskNodeComplete { task_node_id, result, duration_ms } => {
            ServerBody::TaskNodeComplete { task_node_id, result, duration_ms }
        }
        AgentEvent::StreamReasoning { content } => ServerBody::StreamReasoning { content },
        AgentEvent::StreamContent { content } => ServerBody::StreamContent { content },
        AgentEvent::StreamToolCall { tool_call, all_tool_calls } => {
            ServerBody::StreamToolCall { tool_call, all_tool_calls }
        }
        AgentEvent::StreamUsage { usage } => ServerBody::StreamUsage { data: usage.into() },
        AgentEvent::StreamComplete { finish_reason, content, reasoning, tool_calls, usage } => {
            ServerBody::StreamComplete {
                finish_reason,
                content,
                reasoning,
                tool_calls,
                usage: usage.map(Into::into),
            }
        }
        AgentEvent::ToolCallStart { tool_name, tool_input, tool_call_id } => {
            ServerBody::ToolCallStart { tool_name, tool_input, tool_call_id }
        }
        AgentEvent::ToolCallProgress { tool_name, message, percentage, tool_call_id } => {
            ServerBody::ToolCallProgress { tool_name, message, percentage, tool_call_id }
        }
        AgentEvent::ToolCallResult { tool_name, result, is_error, tool_call_id, .. } => {
            ServerBody::ToolCallResult { tool_name, result, is_error, tool_call_id }
        }
        AgentEvent::FollowupQuestion { question, suggestions, tool_call_id } => {
            ServerBody::FollowupQuestion { question, suggestions, tool_call_id }
        }
        AgentEvent::LlmApiRequest { provider, model, request_type } => {
            ServerBody::LlmApiRequest { provider, model, request_type }
        }
        AgentEvent::LlmApiComplete { provider, model, finish_reason, usage, duration_ms } => {
            ServerBody::LlmApiComplete {
                provider,
                model,
                finish_reason,
                usage: usage.map(Into::into),
                duration_ms,
            }
        }
        AgentEvent::AgentComplete {
            result_summary,
            total_duration_ms,
            tasks_completed,
            tools_used,
        } => ServerBody::AgentComplete {
            result_summary,
            total_duration_ms,
            tasks_completed,
            tools_used,
        },
        AgentEvent::AgentStopped { stopped_at, result_summary, partial } => {
            ServerBody::AgentStopped { stopped_at, result_summary, partial }
        }
        AgentEvent::Error { code, message, recoverable, details } => {
            ServerBody::Error { code, message, recoverable, details }
        }
        AgentEvent::PersistenceAlert { details } => ServerBody::Error {
            code: "PERSISTENCE_FAILURE".to_string(),
            message: "failed to persist workspace state".to_string(),
            recoverable: true,
            details: Some(details),
        },
        AgentEvent::PdcaCycleStart { data } => ServerBody::PdcaCycleStart { data },
        AgentEvent::PdcaStatusUpdate { data } => ServerBody::PdcaStatusUpdate { data },
        AgentEvent::PdcaPhaseAdvance { phase, data } => {
            ServerBody::PdcaPhaseAdvance { phase, data }
        }
        AgentEvent::PdcaCycleComplete { data } => ServerBody::PdcaCycleComplete { data },
    }
}

/// Subscribe the session's outbound queue to an agent's bus.  Returns the
/// handler id so the session can detach on disconnect or task completion.
pub async fn install_event_forwarder(
    bus: &Arc<EventBus>,
    session_id: &str,
    out_tx: mpsc::UnboundedSender<ServerFrame>,
) -> HandlerId {
    let session_id = session_id.to_string();
    bus.add_any_handler(move |event| {
        let out_tx = out_tx.clone();
        let session_id = session_id.clone();
        Box::pin(async move {
            // A send failure means the client is gone; the task keeps
            // running and its remaining frames are discarded.
            let _ = out_tx.send(ServerFrame::new(session_id, translate(event)));
            Ok(())
        })
    })
    .await
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
