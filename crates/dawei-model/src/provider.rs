// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::{CompletionRequest, LlmError, Message, StreamEvent, ToolSchema};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// A streaming chat-completion client for one provider endpoint.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider family id (e.g. `"deepseek"`, `"ollama"`).
    fn name(&self) -> &str;

    /// Model identifier forwarded to the API.
    fn model_name(&self) -> &str;

    /// Send a completion request and return the typed event stream.
    ///
    /// An empty `messages` list is a [`LlmError::Validation`] before any I/O.
    async fn complete(&self, req: CompletionRequest) -> Result<EventStream, LlmError>;

    /// Probe whether the configured model emits tool calls.
    ///
    /// Issues a trivial two-turn request with a throwaway function schema; if
    /// no tool call comes back the probe retries once with
    /// `tool_choice = "required"`.  Default implementation drives `complete`.
    async fn probe_tool_call_support(&self) -> Result<bool, LlmError> {
        let schema = ToolSchema {
            name: "echo_probe".to_string(),
            description: "Echo the given text back verbatim.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
        };
        let req = CompletionRequest {
            messages: vec![
                Message::system("You are a function-calling test harness."),
                Message::user("Call echo_probe with text=\"ping\"."),
            ],
            tools: vec![schema],
            stream: true,
            temperature: Some(0.0),
            max_tokens: Some(64),
        };

        if stream_yields_tool_call(self.complete(req.clone()).await?).await? {
            return Ok(true);
        }
        // Some models only comply when forced.
        let mut forced = req;
        forced.messages.push(Message::user(
            "You MUST respond with a tool call (tool_choice=required).",
        ));
        stream_yields_tool_call(self.complete(forced).await?).await
    }
}

async fn stream_yields_tool_call(mut stream: EventStream) -> Result<bool, LlmError> {
    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::ToolCallDelta { .. } => return Ok(true),
            StreamEvent::Complete { tool_calls, .. } => return Ok(!tool_calls.is_empty()),
            _ => {}
        }
    }
    Ok(false)
}
