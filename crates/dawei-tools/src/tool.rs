// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use crate::events::ProgressSink;

/// A resolved tool invocation: parsed arguments, ready to run.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    /// Opaque id from the model, forwarded verbatim.
    pub tool_call_id: String,
    pub name: String,
    pub args: Value,
    /// Workspace the invocation runs against.
    pub workspace_path: std::path::PathBuf,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub content: String,
    /// True when the tool failed non-fatally; the message goes back to the
    /// model as an error-flagged tool result.
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { tool_call_id: tool_call_id.into(), content: content.into(), is_error: false }
    }

    pub fn err(tool_call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { tool_call_id: tool_call_id.into(), content: message.into(), is_error: true }
    }
}

/// Trait every builtin and user-defined tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object.
    fn parameters_schema(&self) -> Value;
    /// Agent modes this tool is available in.  Default: all modes.
    fn modes(&self) -> &[&str] {
        &["orchestrator", "plan", "do", "check", "act"]
    }
    /// Execute the tool.  Failures are wrapped in [`ToolOutput::err`].
    async fn execute(&self, invocation: &ToolInvocation, progress: &ProgressSink) -> ToolOutput;
}
