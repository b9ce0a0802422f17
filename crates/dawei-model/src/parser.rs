// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-request stream parsers.
//!
//! One parser instance lives for exactly one streaming request and converts
//! decoded provider chunks into typed [`StreamEvent`]s.  The critical
//! property is byte-accurate reassembly of tool-call arguments that arrive
//! fragmented across chunks: each index keeps its own buffer, and the final
//! `Complete` event always carries the full accumulated string.
//!
//! Two wire dialects are covered: the OpenAI-compatible SSE chunk shape and
//! the Ollama NDJSON line shape.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::{ChunkMeta, FunctionCall, StreamEvent, ToolCall, Usage};

#[derive(Debug, Default, Clone)]
struct ToolCallBuffer {
    id: String,
    kind: String,
    name: String,
    arguments: String,
}

impl ToolCallBuffer {
    fn to_tool_call(&self) -> ToolCall {
        ToolCall {
            tool_call_id: self.id.clone(),
            kind: if self.kind.is_empty() { "function".into() } else { self.kind.clone() },
            function: FunctionCall { name: self.name.clone(), arguments: self.arguments.clone() },
        }
    }
}

/// Parser for the OpenAI-compatible `chat/completions` SSE chunk stream.
#[derive(Debug, Default)]
pub struct StreamParser {
    reasoning: String,
    content: String,
    buffers: BTreeMap<u64, ToolCallBuffer>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    last_meta: ChunkMeta,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Vec<ToolCall> {
        self.buffers.values().map(ToolCallBuffer::to_tool_call).collect()
    }

    /// Parse one decoded chunk into zero or more events.
    pub fn parse_chunk(&mut self, chunk: &Value) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let meta = ChunkMeta::from_chunk(chunk);
        if meta != ChunkMeta::default() {
            self.last_meta = meta.clone();
        }

        // Usage may arrive on a dedicated chunk or ride along with a delta.
        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            let usage = Usage::from_openai(usage);
            self.usage = Some(usage);
            events.push(StreamEvent::Usage { usage, meta: meta.clone() });
        }

        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            return events;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
            self.finish_reason = Some(reason.to_string());
        }
        let delta = &choice["delta"];

        // Reasoning deltas.  Whitespace-only fragments are dropped outright.
        // While no regular content has arrived, the reasoning text is also
        // mirrored into the content stream: some models (GLM family) put all
        // visible text into `reasoning_content` and would otherwise render an
        // empty assistant bubble.
        if let Some(reasoning) = delta.get("reasoning_content").and_then(|c| c.as_str()) {
            if !reasoning.trim().is_empty() {
                self.reasoning.push_str(reasoning);
                events.push(StreamEvent::Reasoning {
                    content: reasoning.to_string(),
                    meta: meta.clone(),
                });
                if self.content.is_empty() {
                    self.content.push_str(reasoning);
                    events.push(StreamEvent::Content {
                        content: reasoning.to_string(),
                        meta: meta.clone(),
                    });
                }
            } else if !reasoning.is_empty() {
                debug!(delta = ?reasoning, "filtered whitespace-only reasoning delta");
            }
        }

        if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
            if !content.trim().is_empty() {
                self.content.push_str(content);
                events.push(StreamEvent::Content {
                    content: content.to_string(),
                    meta: meta.clone(),
                });
            } else if !content.is_empty() {
                debug!(delta = ?content, "filtered whitespace-only content delta");
            }
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0);
                let buffer = self.buffers.entry(index).or_default();
                if let Some(id) = tc["id"].as_str().filter(|s| !s.is_empty()) {
                    buffer.id = id.to_string();
                }
                if let Some(kind) = tc["type"].as_str().filter(|s| !s.is_empty()) {
                    buffer.kind = kind.to_string();
                }
                if let Some(name) = tc["function"]["name"].as_str().filter(|s| !s.is_empty()) {
                    buffer.name = name.to_string();
                }
                if let Some(fragment) = tc["function"]["arguments"].as_str() {
                    buffer.arguments.push_str(fragment);
                }
                let current = buffer.to_tool_call();
                events.push(StreamEvent::ToolCallDelta {
                    tool_call: current,
                    all_tool_calls: self.snapshot(),
                    meta: meta.clone(),
                });
            }
        }

        events
    }

    /// Produce the terminal `Complete` event.
    ///
    /// Tool-call arguments come from the per-index buffers (the accumulated
    /// byte string), never from any per-call field of the final chunk.  When
    /// the content stream stayed empty but reasoning text exists, the
    /// reasoning is copied into content.
    pub fn complete(&mut self, last_chunk: Option<&Value>) -> StreamEvent {
        let finish_reason = last_chunk
            .and_then(|c| c["choices"][0]["finish_reason"].as_str())
            .map(String::from)
            .or_else(|| self.finish_reason.clone())
            .unwrap_or_else(|| "stop".to_string());

        let content = if self.content.trim().is_empty() && !self.reasoning.trim().is_empty() {
            debug!(
                reasoning_len = self.reasoning.len(),
                "content empty at completion, copying reasoning into content"
            );
            self.reasoning.clone()
        } else {
            self.content.clone()
        };

        StreamEvent::Complete {
            finish_reason,
            content,
            reasoning: self.reasoning.clone(),
            tool_calls: self.snapshot(),
            usage: self.usage,
            meta: self.last_meta.clone(),
        }
    }
}

/// Parser for the Ollama NDJSON line protocol.
///
/// Each line is one JSON object.  Text arrives in `message.content`
/// (`api/chat`) or `response` (`api/generate`); `done: true` terminates the
/// stream and carries `prompt_eval_count` / `eval_count` usage.
#[derive(Debug, Default)]
pub struct OllamaStreamParser {
    content: String,
    buffers: BTreeMap<u64, ToolCallBuffer>,
    usage: Option<Usage>,
    done: bool,
    last_meta: ChunkMeta,
}

impl OllamaStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn snapshot(&self) -> Vec<ToolCall> {
        self.buffers.values().map(ToolCallBuffer::to_tool_call).collect()
    }

    /// Parse one decoded NDJSON object into zero or more events.
    pub fn parse_chunk(&mut self, chunk: &Value) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let meta = ChunkMeta {
            id: None,
            created: None,
            model: chunk["model"].as_str().map(String::from),
        };
        if meta.model.is_some() {
            self.last_meta = meta.clone();
        }

        let text = chunk["message"]["content"]
            .as_str()
            .or_else(|| chunk["response"].as_str())
            .unwrap_or_default();
        if !text.trim().is_empty() {
            self.content.push_str(text);
            events.push(StreamEvent::Content { content: text.to_string(), meta: meta.clone() });
        }

        if let Some(tool_calls) = chunk["message"]["tool_calls"].as_array() {
            for (i, tc) in tool_calls.iter().enumerate() {
                let index = tc["index"].as_u64().unwrap_or(i as u64);
                let buffer = self.buffers.entry(index).or_default();
                if buffer.id.is_empty() {
                    buffer.id = tc["id"]
                        .as_str()
                        .map(String::from)
                        .unwrap_or_else(|| format!("ollama_call_{index}"));
                }
                if let Some(name) = tc["function"]["name"].as_str().filter(|s| !s.is_empty()) {
                    buffer.name = name.to_string();
                }
                // Ollama sends arguments as a JSON object, not a string.
                match &tc["function"]["arguments"] {
                    Value::String(s) => buffer.arguments.push_str(s),
                    Value::Null => {}
                    other => buffer.arguments.push_str(&other.to_string()),
                }
                let current = buffer.to_tool_call();
                events.push(StreamEvent::ToolCallDelta {
                    tool_call: current,
                    all_tool_calls: self.snapshot(),
                    meta: meta.clone(),
                });
            }
        }

        if chunk["done"].as_bool() == Some(true) {
            self.done = true;
            let prompt = chunk["prompt_eval_count"].as_u64().unwrap_or(0);
            let completion = chunk["eval_count"].as_u64().unwrap_or(0);
            let usage = Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
            };
            self.usage = Some(usage);
            events.push(StreamEvent::Usage { usage, meta: meta.clone() });
            events.push(self.complete(chunk));
        }

        events
    }

    /// Terminal event for a stream that closed without a `done: true` line.
    pub fn finalize(&self) -> StreamEvent {
        self.complete(&Value::Null)
    }

    fn complete(&self, last_chunk: &Value) -> StreamEvent {
        let finish_reason = last_chunk["done_reason"]
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| "stop".to_string());
        StreamEvent::Complete {
            finish_reason,
            content: self.content.clone(),
            reasoning: String::new(),
            tool_calls: self.snapshot(),
            usage: self.usage,
            meta: self.last_meta.clone(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
