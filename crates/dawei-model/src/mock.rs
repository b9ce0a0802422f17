// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic mock clients for tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    ChunkMeta, CompletionRequest, EventStream, LlmClient, LlmError, Role, StreamEvent, Usage,
};

/// Echoes the last user message back as the assistant response.
#[derive(Default)]
pub struct MockClient;

#[async_trait]
impl LlmClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<EventStream, LlmError> {
        if req.messages.is_empty() {
            return Err(LlmError::Validation("messages must be a non-empty list".to_string()));
        }
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();
        let usage = Usage { prompt_tokens: 10, completion_tokens: 10, total_tokens: 20 };
        let events = vec![
            Ok(StreamEvent::Content {
                content: format!("MOCK: {reply}"),
                meta: ChunkMeta::default(),
            }),
            Ok(StreamEvent::Usage { usage, meta: ChunkMeta::default() }),
            Ok(StreamEvent::Complete {
                finish_reason: "stop".into(),
                content: format!("MOCK: {reply}"),
                reasoning: String::new(),
                tool_calls: vec![],
                usage: Some(usage),
                meta: ChunkMeta::default(),
            }),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted client.  Each `complete` call pops the next event script
/// from the front of the queue, letting tests specify exact sequences —
/// including fragmented tool calls — without network access.
pub struct ScriptedClient {
    scripts: Arc<Mutex<Vec<Vec<StreamEvent>>>>,
    /// The last request seen, for assertions on what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedClient {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Client that always streams one text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let text: String = reply.into();
        Self::new(vec![text_script(&text)])
    }

    /// Client that emits a tool call first, then a text reply on the next
    /// call (the classic tool round-trip).
    pub fn tool_then_text(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        let call = crate::ToolCall::new(call_id, tool_name, args_json);
        Self::new(vec![
            vec![
                StreamEvent::ToolCallDelta {
                    tool_call: call.clone(),
                    all_tool_calls: vec![call.clone()],
                    meta: ChunkMeta::default(),
                },
                StreamEvent::Complete {
                    finish_reason: "tool_calls".into(),
                    content: String::new(),
                    reasoning: String::new(),
                    tool_calls: vec![call],
                    usage: None,
                    meta: ChunkMeta::default(),
                },
            ],
            text_script(&final_text.into()),
        ])
    }
}

/// The event script for a plain streamed text reply.
pub fn text_script(text: &str) -> Vec<StreamEvent> {
    let usage = Usage { prompt_tokens: 5, completion_tokens: 5, total_tokens: 10 };
    vec![
        StreamEvent::Content { content: text.to_string(), meta: ChunkMeta::default() },
        StreamEvent::Usage { usage, meta: ChunkMeta::default() },
        StreamEvent::Complete {
            finish_reason: "stop".into(),
            content: text.to_string(),
            reasoning: String::new(),
            tool_calls: vec![],
            usage: Some(usage),
            meta: ChunkMeta::default(),
        },
    ]
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<EventStream, LlmError> {
        if req.messages.is_empty() {
            return Err(LlmError::Validation("messages must be a non-empty list".to_string()));
        }
        *self.last_request.lock().unwrap_or_else(|e| e.into_inner()) = Some(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
            if scripts.is_empty() {
                text_script("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;
    use futures::StreamExt;

    fn req() -> CompletionRequest {
        CompletionRequest { messages: vec![Message::user("hi")], stream: true, ..Default::default() }
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let c = MockClient;
        let mut stream = c.complete(req()).await.unwrap();
        match stream.next().await.unwrap().unwrap() {
            StreamEvent::Content { content, .. } => assert!(content.contains("MOCK: hi")),
            other => panic!("unexpected first event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn scripted_tool_then_text() {
        let c = ScriptedClient::tool_then_text("c1", "get_time", "{}", "It is noon.");
        let mut events = Vec::new();
        let mut s = c.complete(req()).await.unwrap();
        while let Some(e) = s.next().await {
            events.push(e.unwrap());
        }
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Complete { tool_calls, .. }) if tool_calls.len() == 1
        ));

        let mut s2 = c.complete(req()).await.unwrap();
        let mut saw_text = false;
        while let Some(e) = s2.next().await {
            if let StreamEvent::Content { content, .. } = e.unwrap() {
                saw_text = content == "It is noon.";
            }
        }
        assert!(saw_text);
    }

    #[tokio::test]
    async fn scripted_fallback_when_exhausted() {
        let c = ScriptedClient::new(vec![]);
        let mut s = c.complete(req()).await.unwrap();
        match s.next().await.unwrap().unwrap() {
            StreamEvent::Content { content, .. } => assert!(content.contains("no more scripts")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
