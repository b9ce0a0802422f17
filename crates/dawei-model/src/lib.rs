// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! LLM transport layer: typed messages and stream events, the shared
//! protection stack (adaptive rate limiter, priority request queue,
//! per-provider circuit breakers, monitoring counters) and the streaming
//! HTTP clients that sit behind it.

mod breaker;
mod error;
mod http_log;
mod limiter;
mod manager;
mod metrics;
pub mod mock;
mod ollama;
mod openai_compat;
mod parser;
mod protection;
mod provider;
mod queue;
mod types;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error::LlmError;
pub use http_log::HttpLogger;
pub use limiter::{AdaptiveRateLimiter, RateLimitConfig, RateLimitStrategy};
pub use manager::LlmManager;
pub use metrics::{counter_value, increment_counter};
pub use ollama::OllamaClient;
pub use openai_compat::{AuthStyle, OpenAiCompatClient};
pub use parser::{OllamaStreamParser, StreamParser};
pub use protection::ProtectionStack;
pub use provider::{EventStream, LlmClient};
pub use queue::{RequestPriority, RequestQueue, RequestQueueConfig};
pub use types::{
    ChunkMeta, CompletionRequest, ContentBlock, FunctionCall, Message, MessageContent, Role,
    StreamEvent, ToolCall, ToolSchema, Usage,
};
