// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::LlmError;

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// A single content block in a multi-part message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { url: String },
    Audio { url: String },
    Video { url: String },
    File {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl ContentBlock {
    /// OpenAI wire form of this block.
    ///
    /// Text and image use the standard `chat/completions` shapes; the other
    /// modalities keep the tagged internal form (providers that support them
    /// accept it verbatim).
    fn to_wire(&self) -> Value {
        match self {
            ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
            ContentBlock::Image { url } => {
                json!({ "type": "image_url", "image_url": { "url": url } })
            }
            ContentBlock::Audio { url } => json!({ "type": "audio", "url": url }),
            ContentBlock::Video { url } => json!({ "type": "video", "url": url }),
            ContentBlock::File { url, name } => {
                let mut v = json!({ "type": "file", "url": url });
                if let Some(n) = name {
                    v["name"] = json!(n);
                }
                v
            }
        }
    }

    fn from_wire(v: &Value) -> Result<Self, LlmError> {
        let kind = v["type"].as_str().unwrap_or_default();
        let take_url = |field: &str| -> Result<String, LlmError> {
            v[field]
                .as_str()
                .map(String::from)
                .ok_or_else(|| LlmError::Validation(format!("content block missing `{field}`")))
        };
        match kind {
            "text" => Ok(ContentBlock::Text {
                text: v["text"].as_str().unwrap_or_default().to_string(),
            }),
            "image_url" => {
                let url = v["image_url"]["url"]
                    .as_str()
                    .ok_or_else(|| {
                        LlmError::Validation("image_url block missing url".to_string())
                    })?
                    .to_string();
                Ok(ContentBlock::Image { url })
            }
            "audio" => Ok(ContentBlock::Audio { url: take_url("url")? }),
            "video" => Ok(ContentBlock::Video { url: take_url("url")? }),
            "file" => Ok(ContentBlock::File {
                url: take_url("url")?,
                name: v["name"].as_str().map(String::from),
            }),
            other => Err(LlmError::Validation(format!("unknown content block type `{other}`"))),
        }
    }
}

/// The content of a message: a plain string (most messages) or a list of
/// typed blocks for multimodal turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Flatten `[{type: text, text: "..."}]` to a plain string.
    ///
    /// Applied before serialization so single-text conversations stay
    /// readable on disk.
    pub fn flattened(self) -> Self {
        match self {
            MessageContent::Blocks(blocks) if blocks.len() == 1 => match &blocks[0] {
                ContentBlock::Text { text } => MessageContent::Text(text.clone()),
                _ => MessageContent::Blocks(blocks),
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object.  A byte-accurate accumulation of
    /// streamed fragments; only required to parse at dispatch time.
    pub arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_call_id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            tool_call_id: id.into(),
            kind: function_kind(),
            function: FunctionCall { name: name.into(), arguments: arguments.into() },
        }
    }

    fn to_wire(&self) -> Value {
        json!({
            "id": self.tool_call_id,
            "type": self.kind,
            "function": { "name": self.function.name, "arguments": self.function.arguments },
        })
    }

    fn from_wire(v: &Value) -> Result<Self, LlmError> {
        let id = v["id"]
            .as_str()
            .ok_or_else(|| LlmError::Validation("tool call missing id".to_string()))?;
        Ok(Self {
            tool_call_id: id.to_string(),
            kind: v["type"].as_str().unwrap_or("function").to_string(),
            function: FunctionCall {
                name: v["function"]["name"].as_str().unwrap_or_default().to_string(),
                arguments: v["function"]["arguments"].as_str().unwrap_or_default().to_string(),
            },
        })
    }
}

/// A single message in a conversation.  Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Message {
    fn base(role: Role, content: MessageContent) -> Self {
        Self {
            role,
            content,
            tool_call_id: None,
            tool_calls: None,
            timestamp: Utc::now(),
            id: Some(uuid::Uuid::new_v4().to_string()),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::base(Role::System, MessageContent::Text(text.into()))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::base(Role::User, MessageContent::Text(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::base(Role::Assistant, MessageContent::Text(text.into()))
    }

    /// Assistant message carrying tool calls (content may be empty).
    pub fn assistant_with_tool_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut m = Self::base(Role::Assistant, MessageContent::Text(text.into()));
        m.tool_calls = Some(calls);
        m
    }

    /// Tool-role message carrying one tool result.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut m = Self::base(Role::Tool, MessageContent::Text(content.into()));
        m.tool_call_id = Some(tool_call_id.into());
        m
    }

    /// Return the plain text of this message when it is single-text.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Blocks(blocks) if blocks.len() == 1 => match &blocks[0] {
                ContentBlock::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// Serialize into the canonical OpenAI-compatible dictionary form.
    pub fn to_wire(&self) -> Value {
        let content: Value = match &self.content {
            MessageContent::Text(t) => json!(t),
            MessageContent::Blocks(blocks) => {
                Value::Array(blocks.iter().map(ContentBlock::to_wire).collect())
            }
        };
        let mut v = json!({
            "role": self.role.as_str(),
            "content": content,
            "timestamp": self.timestamp.to_rfc3339(),
        });
        if let Some(id) = &self.id {
            v["id"] = json!(id);
        }
        if let Some(tc_id) = &self.tool_call_id {
            v["tool_call_id"] = json!(tc_id);
        }
        if let Some(calls) = &self.tool_calls {
            v["tool_calls"] = Value::Array(calls.iter().map(ToolCall::to_wire).collect());
        }
        v
    }

    /// Wire form sent to provider APIs.
    ///
    /// Same shape as [`to_wire`](Self::to_wire) minus the bookkeeping fields
    /// (`timestamp`, `id`) that providers do not know about.
    pub fn to_api_wire(&self) -> Value {
        let mut v = self.to_wire();
        if let Some(obj) = v.as_object_mut() {
            obj.remove("timestamp");
            obj.remove("id");
        }
        v
    }

    /// Parse the canonical dictionary form back into a [`Message`].
    ///
    /// Identity with [`to_wire`](Self::to_wire) on well-formed inputs.
    pub fn from_wire(v: &Value) -> Result<Self, LlmError> {
        let role = v["role"]
            .as_str()
            .and_then(Role::from_str)
            .ok_or_else(|| LlmError::Validation("message missing role".to_string()))?;
        let content = match &v["content"] {
            Value::String(s) => MessageContent::Text(s.clone()),
            Value::Array(items) => MessageContent::Blocks(
                items.iter().map(ContentBlock::from_wire).collect::<Result<_, _>>()?,
            ),
            Value::Null => MessageContent::Text(String::new()),
            other => {
                return Err(LlmError::Validation(format!(
                    "message content must be string or array, got {other}"
                )))
            }
        };
        let tool_calls = match &v["tool_calls"] {
            Value::Array(items) => {
                Some(items.iter().map(ToolCall::from_wire).collect::<Result<Vec<_>, _>>()?)
            }
            _ => None,
        };
        let timestamp = v["timestamp"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Ok(Self {
            role,
            content,
            tool_call_id: v["tool_call_id"].as_str().map(String::from),
            tool_calls,
            timestamp,
            id: v["id"].as_str().map(String::from),
        })
    }
}

/// A tool schema given to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

/// Request sent to an LLM client.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

// ─── Stream events ────────────────────────────────────────────────────────────

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Parse an OpenAI-style `usage` object.
    pub fn from_openai(v: &Value) -> Self {
        let prompt = v["prompt_tokens"].as_u64().unwrap_or(0);
        let completion = v["completion_tokens"].as_u64().unwrap_or(0);
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: v["total_tokens"].as_u64().unwrap_or(prompt + completion),
        }
    }
}

/// Provider fields carried on stream events when present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ChunkMeta {
    pub fn from_chunk(v: &Value) -> Self {
        Self {
            id: v["id"].as_str().map(String::from),
            created: v["created"].as_i64(),
            model: v["model"].as_str().map(String::from),
        }
    }
}

/// One typed event in a model response stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A chain-of-thought delta.
    Reasoning { content: String, meta: ChunkMeta },
    /// An assistant-content delta.
    Content { content: String, meta: ChunkMeta },
    /// A tool-call fragment arrived; `tool_call` carries the arguments
    /// accumulated so far for its index, `all_tool_calls` a snapshot of every
    /// indexed call.
    ToolCallDelta { tool_call: ToolCall, all_tool_calls: Vec<ToolCall>, meta: ChunkMeta },
    /// Usage statistics (emitted on first appearance).
    Usage { usage: Usage, meta: ChunkMeta },
    /// The stream finished.
    Complete {
        finish_reason: String,
        content: String,
        reasoning: String,
        tool_calls: Vec<ToolCall>,
        usage: Option<Usage>,
        meta: ChunkMeta,
    },
    /// A stream-level error.
    Error { message: String, details: Option<Value> },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn tool_result_carries_call_id() {
        let m = Message::tool_result("call-1", "output");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(m.as_text(), Some("output"));
    }

    #[test]
    fn wire_round_trip_is_identity_for_text_message() {
        let m = Message::user("ping");
        let wire = m.to_wire();
        let back = Message::from_wire(&wire).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.to_wire(), wire);
    }

    #[test]
    fn wire_round_trip_preserves_tool_calls() {
        let m = Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("call_1", "get_time", "{}")],
        );
        let wire = m.to_wire();
        assert_eq!(wire["tool_calls"][0]["id"], "call_1");
        assert_eq!(wire["tool_calls"][0]["type"], "function");
        let back = Message::from_wire(&wire).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn wire_round_trip_preserves_content_blocks() {
        let mut m = Message::user("");
        m.content = MessageContent::Blocks(vec![
            ContentBlock::Text { text: "look:".into() },
            ContentBlock::Image { url: "data:image/png;base64,AAAA".into() },
        ]);
        let wire = m.to_wire();
        assert_eq!(wire["content"][1]["type"], "image_url");
        let back = Message::from_wire(&wire).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn from_wire_rejects_missing_role() {
        let v = serde_json::json!({ "content": "hi" });
        assert!(matches!(Message::from_wire(&v), Err(LlmError::Validation(_))));
    }

    #[test]
    fn from_wire_tolerates_null_content() {
        let v = serde_json::json!({ "role": "assistant", "content": null });
        let m = Message::from_wire(&v).unwrap();
        assert_eq!(m.as_text(), Some(""));
    }

    #[test]
    fn single_text_block_flattens_to_string() {
        let c = MessageContent::Blocks(vec![ContentBlock::Text { text: "plain".into() }])
            .flattened();
        assert_eq!(c, MessageContent::Text("plain".into()));
    }

    #[test]
    fn multi_block_content_does_not_flatten() {
        let blocks = vec![
            ContentBlock::Text { text: "a".into() },
            ContentBlock::Text { text: "b".into() },
        ];
        let c = MessageContent::Blocks(blocks.clone()).flattened();
        assert_eq!(c, MessageContent::Blocks(blocks));
    }

    #[test]
    fn usage_from_openai_computes_missing_total() {
        let v = serde_json::json!({ "prompt_tokens": 3, "completion_tokens": 2 });
        let u = Usage::from_openai(&v);
        assert_eq!(u.total_tokens, 5);
    }

    #[test]
    fn chunk_meta_reads_provider_fields() {
        let v = serde_json::json!({ "id": "chatcmpl-1", "created": 1700000000, "model": "m1" });
        let meta = ChunkMeta::from_chunk(&v);
        assert_eq!(meta.id.as_deref(), Some("chatcmpl-1"));
        assert_eq!(meta.created, Some(1700000000));
        assert_eq!(meta.model.as_deref(), Some("m1"));
    }

    #[test]
    fn serde_round_trip_through_internal_form() {
        let m = Message::assistant("reply");
        let s = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&s).unwrap();
        assert_eq!(back, m);
    }
}
