// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-agent typed event bus.
//!
//! Handlers register against an event kind and get back an opaque id; removal
//! goes through the id, never through object identity.  `emit` awaits every
//! handler in registration order — a failing handler is logged and does not
//! cancel its siblings.  Each agent owns its own bus; a process-global bus
//! additionally receives tool-execution events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use dawei_model::{ToolCall, Usage};

/// Events flowing from the agent pipeline to its observers.
#[derive(Debug, Clone)]
pub enum AgentEvent {
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
        usage: Usage,
    },
    StreamComplete {
        finish_reason: String,
        content: String,
        reasoning: String,
        tool_calls: Vec<ToolCall>,
        usage: Option<Usage>,
    },
    ToolCallStart {
        tool_name: String,
        tool_input: Value,
        tool_call_id: String,
    },
    ToolCallProgress {
        tool_name: String,
        message: String,
        percentage: Option<f32>,
        tool_call_id: String,
    },
    ToolCallResult {
        tool_name: String,
        result: String,
        is_error: bool,
        execution_time_ms: u64,
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
        finish_reason: Option<String>,
        usage: Option<Usage>,
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
        details: Option<Value>,
    },
    PersistenceAlert {
        details: Value,
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

/// Registration key for handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskNodeStart,
    TaskNodeProgress,
    TaskNodeComplete,
    StreamReasoning,
    StreamContent,
    StreamToolCall,
    StreamUsage,
    StreamComplete,
    ToolCallStart,
    ToolCallProgress,
    ToolCallResult,
    FollowupQuestion,
    LlmApiRequest,
    LlmApiComplete,
    AgentComplete,
    AgentStopped,
    Error,
    PersistenceAlert,
    PdcaCycleStart,
    PdcaStatusUpdate,
    PdcaPhaseAdvance,
    PdcaCycleComplete,
}

impl AgentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AgentEvent::TaskNodeStart { .. } => EventKind::TaskNodeStart,
            AgentEvent::TaskNodeProgress { .. } => EventKind::TaskNodeProgress,
            AgentEvent::TaskNodeComplete { .. } => EventKind::TaskNodeComplete,
            AgentEvent::StreamReasoning { .. } => EventKind::StreamReasoning,
            AgentEvent::StreamContent { .. } => EventKind::StreamContent,
            AgentEvent::StreamToolCall { .. } => EventKind::StreamToolCall,
            AgentEvent::StreamUsage { .. } => EventKind::StreamUsage,
            AgentEvent::StreamComplete { .. } => EventKind::StreamComplete,
            AgentEvent::ToolCallStart { .. } => EventKind::ToolCallStart,
            AgentEvent::ToolCallProgress { .. } => EventKind::ToolCallProgress,
            AgentEvent::ToolCallResult { .. } => EventKind::ToolCallResult,
            AgentEvent::FollowupQuestion { .. } => EventKind::FollowupQuestion,
            AgentEvent::LlmApiRequest { .. } => EventKind::LlmApiRequest,
            AgentEvent::LlmApiComplete { .. } => EventKind::LlmApiComplete,
            AgentEvent::AgentComplete { .. } => EventKind::AgentComplete,
            AgentEvent::AgentStopped { .. } => EventKind::AgentStopped,
            AgentEvent::Error { .. } => EventKind::Error,
            AgentEvent::PersistenceAlert { .. } => EventKind::PersistenceAlert,
            AgentEvent::PdcaCycleStart { .. } => EventKind::PdcaCycleStart,
            AgentEvent::PdcaStatusUpdate { .. } => EventKind::PdcaStatusUpdate,
            AgentEvent::PdcaPhaseAdvance { .. } => EventKind::PdcaPhaseAdvance,
            AgentEvent::PdcaCycleComplete { .. } => EventKind::PdcaCycleComplete,
        }
    }
}

pub type HandlerId = u64;
type Handler = Arc<dyn Fn(AgentEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    by_kind: HashMap<EventKind, Vec<(HandlerId, Handler)>>,
    any: Vec<(HandlerId, Handler)>,
}

pub struct EventBus {
    handlers: Mutex<Handlers>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { handlers: Mutex::new(Handlers::default()), next_id: AtomicU64::new(1) })
    }

    /// Register a handler for one event kind; returns its opaque id.
    pub async fn add_handler<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(AgentEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().await.by_kind.entry(kind).or_default().push((id, Arc::new(handler)));
        id
    }

    /// Register a handler invoked for every event.  Used by the session's
    /// event forwarder, which translates the whole stream.
    pub async fn add_any_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(AgentEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().await.any.push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler by id.  Searches both the kind slot and the any-list.
    pub async fn remove_handler(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().await;
        if let Some(slot) = handlers.by_kind.get_mut(&kind) {
            let before = slot.len();
            slot.retain(|(hid, _)| *hid != id);
            if slot.len() != before {
                return true;
            }
        }
        let before = handlers.any.len();
        handlers.any.retain(|(hid, _)| *hid != id);
        handlers.any.len() != before
    }

    pub async fn remove_any_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().await;
        let before = handlers.any.len();
        handlers.any.retain(|(hid, _)| *hid != id);
        handlers.any.len() != before
    }

    /// Emit an event, awaiting each handler in registration order.
    pub async fn emit(&self, event: AgentEvent) {
        let kind = event.kind();
        let targets: Vec<(HandlerId, Handler)> = {
            let handlers = self.handlers.lock().await;
            handlers
                .by_kind
                .get(&kind)
                .into_iter()
                .flatten()
                .chain(handlers.any.iter())
                .map(|(id, h)| (*id, Arc::clone(h)))
                .collect()
        };
        for (id, handler) in targets {
            if let Err(e) = handler(event.clone()).await {
                warn!(handler_id = id, kind = ?kind, error = %e, "event handler failed");
            }
        }
    }

    pub async fn handler_count(&self) -> usize {
        let handlers = self.handlers.lock().await;
        handlers.by_kind.values().map(Vec::len).sum::<usize>() + handlers.any.len()
    }
}

/// Process-global bus; receives tool-execution events from every agent.
pub fn global_bus() -> Arc<EventBus> {
    static GLOBAL: OnceLock<Arc<EventBus>> = OnceLock::new();
    GLOBAL.get_or_init(EventBus::new).clone()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
