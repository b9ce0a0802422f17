// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

/// Events emitted around a tool execution.  The node executor forwards them
/// onto the agent event bus (and mirrors tool events to the global bus).
#[derive(Debug, Clone)]
pub enum ToolEvent {
    Start {
        tool_call_id: String,
        tool_name: String,
        tool_input: Value,
    },
    Progress {
        tool_call_id: String,
        tool_name: String,
        message: String,
        percentage: Option<f32>,
    },
    Result {
        tool_call_id: String,
        tool_name: String,
        result: String,
        is_error: bool,
        execution_time: Duration,
    },
}

/// Handed to a running tool so it can report progress without knowing about
/// the event plumbing.  Pre-bound to the invocation's id and tool name.
#[derive(Clone)]
pub struct ProgressSink {
    tool_call_id: String,
    tool_name: String,
    tx: Option<mpsc::UnboundedSender<ToolEvent>>,
}

impl ProgressSink {
    pub fn new(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        tx: mpsc::UnboundedSender<ToolEvent>,
    ) -> Self {
        Self { tool_call_id: tool_call_id.into(), tool_name: tool_name.into(), tx: Some(tx) }
    }

    /// A sink that drops everything (tests, detached executions).
    pub fn discard() -> Self {
        Self { tool_call_id: String::new(), tool_name: String::new(), tx: None }
    }

    pub fn report(&self, message: impl Into<String>, percentage: Option<f32>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ToolEvent::Progress {
                tool_call_id: self.tool_call_id.clone(),
                tool_name: self.tool_name.clone(),
                message: message.into(),
                percentage,
            });
        }
    }
}
