// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wire protocol between browser clients and the server.
//!
//! JSON over WebSocket, one message per text frame.  Every frame carries the
//! `{id, type, session_id, timestamp}` envelope plus type-specific fields;
//! `type` is the serde tag on the flattened body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use dawei_model::{ToolCall, Usage};

/// Common frame envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: T,
}

pub type ClientFrame = Envelope<ClientBody>;
pub type ServerFrame = Envelope<ServerBody>;

impl ServerFrame {
    pub fn new(session_id: impl Into<String>, body: ServerBody) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            body,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserMessageMetadata {
    #[serde(rename = "workspaceId")]
    pub workspace_id: String,
    #[serde(rename = "conversationId", default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Client → server messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientBody {
    UserMessage {
        content: String,
        metadata: UserMessageMetadata,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_ui_context: Option<Value>,
    },
    FollowupResponse {
        task_id: String,
        tool_call_id: String,
        response: String,
    },
    AgentStop {
        task_id: String,
    },
}

/// Usage figures in the client-facing shape.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageData {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl From<Usage> for UsageData {
    fn from(u: Usage) -> Self {
        Self { prompt: u.prompt_tokens, completion: u.completion_tokens, total: u.total_tokens }
    }
}

/// Server → client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerBody {
    TaskNodeStart {
        task_node_id: String,
        description: String,
    },
    TaskNodeProgress {
        task_node_id: String,
        progress: f32,
        status: String,
        message: String,
        data: Value,
    },
    TaskNodeComplete {
        task_node_id: String,
        result: String,
        duration_ms: u64,
    },
    StreamReasoning {
        content: String,
    },
    StreamContent {
        content: String,
    },
    StreamToolCall {
        tool_call: ToolCall,
        all_tool_calls: Vec<ToolCall>,
    },
    StreamUsage {
        data: UsageData,
    },
    StreamComplete {
        finish_reason: String,
        content: String,
        reasoning: String,
        tool_calls: Vec<ToolCall>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<UsageData>,
    },
    ToolCallStart {
        tool_name: String,
        tool_input: Value,
        tool_call_id: String,
    },
    ToolCallProgress {
        tool_name: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        percentage: Option<f32>,
        tool_call_id: String,
    },
    ToolCallResult {
        tool_name: String,
        result: String,
        is_error: bool,
        tool_call_id: String,
    },
    FollowupQuestion {
        question: String,
        suggestions: Vec<String>,
        tool_call_id: String,
    },
    LlmApiRequest {
        provider: String,
        model: String,
        request_type: String,
    },
    LlmApiComplete {
        provider: String,
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<UsageData>,
        duration_ms: u64,
    },
    AgentComplete {
        result_summary: String,
        total_duration_ms: u64,
        tasks_completed: usize,
        tools_used: Vec<String>,
    },
    AgentStopped {
        stopped_at: DateTime<Utc>,
        result_summary: String,
        partial: bool,
    },
    Error {
        code: String,
        message: String,
        recoverable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    PdcaCycleStart {
        data: Value,
    },
    PdcaStatusUpdate {
        data: Value,
    },
    PdcaPhaseAdvance {
        phase: String,
        data: Value,
    },
    PdcaCycleComplete {
        data: Value,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
