// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Ollama client.
//!
//! Differs from the OpenAI-compatible dialect in three ways: the endpoint is
//! `api/chat`, the stream is NDJSON (one JSON object per line, no SSE
//! framing), and generation limits ride in `options.num_predict`.  Local
//! servers take no auth header.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use dawei_config::LlmProviderConfig;

use crate::{
    increment_counter, CompletionRequest, EventStream, HttpLogger, LlmClient, LlmError,
    OllamaStreamParser, ProtectionStack,
};

pub struct OllamaClient {
    model: String,
    chat_url: String,
    temperature: f32,
    max_tokens: Option<u32>,
    client: reqwest::Client,
    stack: Arc<ProtectionStack>,
    http_log: Option<HttpLogger>,
}

impl OllamaClient {
    pub fn from_config(
        cfg: &LlmProviderConfig,
        stack: Arc<ProtectionStack>,
        http_log: Option<HttpLogger>,
    ) -> Result<Self, LlmError> {
        let base = cfg
            .base_url
            .as_deref()
            .unwrap_or("http://localhost:11434")
            .trim_end_matches('/')
            .to_string();
        if !base.starts_with("http") {
            return Err(LlmError::Configuration(format!(
                "ollama base_url must be an HTTP(S) URL, got `{base}`"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.unwrap_or(180)))
            .build()
            .map_err(|e| LlmError::Configuration(format!("http client build failed: {e}")))?;
        Ok(Self {
            model: cfg.model.clone(),
            chat_url: format!("{base}/api/chat"),
            temperature: cfg.temperature.unwrap_or(0.7),
            max_tokens: cfg.max_tokens,
            client,
            stack,
            http_log,
        })
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(|m| m.to_api_wire()).collect();
        let mut options = json!({ "temperature": req.temperature.unwrap_or(self.temperature) });
        if let Some(max) = req.max_tokens.or(self.max_tokens) {
            options["num_predict"] = json!(max);
        }
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            "options": options,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<EventStream, LlmError> {
        if req.messages.is_empty() {
            return Err(LlmError::Validation("messages must be a non-empty list".to_string()));
        }

        let body = self.build_body(&req);
        debug!(model = %self.model, message_count = req.messages.len(), "sending ollama request");

        let response_log = self
            .http_log
            .as_ref()
            .map(|l| l.log_request(&self.chat_url, "ollama", &self.model, &body))
            .unwrap_or_else(crate::http_log::ResponseLog::disabled);

        let breaker = self.stack.breaker_for("ollama").await;
        let response = breaker
            .call(None, || {
                let body = body.clone();
                let response_log = response_log.clone();
                async move {
                    let (admitted, _) = self
                        .stack
                        .limiter()
                        .acquire(1, Some(Duration::from_secs(30)))
                        .await;
                    if !admitted {
                        self.stack.limiter().record_failure(false).await;
                        return Err(LlmError::QueueTimeout);
                    }

                    let resp = match self.client.post(&self.chat_url).json(&body).send().await {
                        Ok(r) => r,
                        Err(e) => {
                            let err = LlmError::from_transport("ollama", &e);
                            self.stack.limiter().record_failure(false).await;
                            return Err(err);
                        }
                    };
                    let status = resp.status();
                    response_log.set_status(status.as_u16());
                    if !status.is_success() {
                        let text = resp.text().await.unwrap_or_default();
                        response_log.set_error(text.clone());
                        let err = LlmError::from_status("ollama", status.as_u16(), text);
                        self.stack.limiter().record_failure(err.is_rate_limit()).await;
                        increment_counter(
                            "llm.http_requests",
                            &[("provider", "ollama"), ("status", "error")],
                        );
                        return Err(err);
                    }
                    Ok(resp)
                }
            })
            .await?;

        self.stack.limiter().record_success().await;
        increment_counter("llm.http_requests", &[("provider", "ollama"), ("status", "success")]);

        let active_guard = self.stack.track_request();
        let mut byte_stream = response.bytes_stream();

        let stream = async_stream::stream! {
            let _active = active_guard;
            let response_log = response_log;
            let mut parser = OllamaStreamParser::new();
            let mut buf = String::new();

            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let err = LlmError::from_transport("ollama", &e);
                        response_log.set_error(err.to_string());
                        yield Err(err);
                        return;
                    }
                };
                let text = String::from_utf8_lossy(&bytes);
                response_log.push_chunk(&text);
                buf.push_str(&text);

                while let Some(nl) = buf.find('\n') {
                    let line = buf[..nl].trim_end_matches('\r').trim().to_string();
                    buf.drain(..=nl);
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&line) {
                        Ok(v) => {
                            for event in parser.parse_chunk(&v) {
                                yield Ok(event);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "undecodable NDJSON line from ollama");
                        }
                    }
                }
                if parser.is_done() {
                    return;
                }
            }

            if !parser.is_done() {
                yield Ok(parser.finalize());
            }
        };

        Ok(Box::pin(stream))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;

    fn client() -> OllamaClient {
        let cfg: LlmProviderConfig = serde_json::from_value(json!({
            "provider": "ollama",
            "model": "llama3.1",
        }))
        .unwrap();
        OllamaClient::from_config(&cfg, ProtectionStack::global(), None).unwrap()
    }

    #[tokio::test]
    async fn chat_url_uses_api_chat_endpoint() {
        let c = client();
        assert_eq!(c.chat_url, "http://localhost:11434/api/chat");
    }

    #[tokio::test]
    async fn max_tokens_maps_to_num_predict() {
        let c = client();
        let req = CompletionRequest {
            messages: vec![Message::user("hi")],
            max_tokens: Some(128),
            ..Default::default()
        };
        let body = c.build_body(&req);
        assert_eq!(body["options"]["num_predict"], json!(128));
        assert!(body.get("max_tokens").is_none());
    }

    #[tokio::test]
    async fn empty_messages_is_validation_error() {
        let c = client();
        let err = match c.complete(CompletionRequest::default()).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, LlmError::Validation(_)));
    }
}
