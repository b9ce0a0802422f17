// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared client for OpenAI-compatible chat completion APIs.
//!
//! Roughly ten provider families speak the same `/chat/completions` SSE
//! wire format; each configures this client with its own base URL, auth
//! style and headers.  Every request passes through the protection stack:
//! rate-limiter admission, the provider's circuit breaker, and the
//! active-request gauge.
//!
//! # Auth styles
//! - `Bearer` — `Authorization: Bearer <key>` (most providers)
//! - `ApiKeyHeader` — `api-key: <key>` (Azure-style gateways)
//! - `None` — local servers (LM Studio, vLLM)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use dawei_config::LlmProviderConfig;

use crate::{
    increment_counter, CompletionRequest, EventStream, HttpLogger, LlmClient, LlmError,
    ProtectionStack, StreamParser,
};

/// How the API key is attached to requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    ApiKeyHeader,
    None,
}

pub struct OpenAiCompatClient {
    provider: String,
    model: String,
    api_key: Option<String>,
    chat_url: String,
    temperature: f32,
    max_tokens: Option<u32>,
    extra_headers: Vec<(String, String)>,
    extra_body: Value,
    auth_style: AuthStyle,
    client: reqwest::Client,
    stack: Arc<ProtectionStack>,
    http_log: Option<HttpLogger>,
}

/// Default API base for a provider family, used when the config omits
/// `base_url`.
fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "moonshot" => Some("https://api.moonshot.cn/v1"),
        "zhipu" => Some("https://open.bigmodel.cn/api/paas/v4"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        "qwen" => Some("https://dashscope.aliyuncs.com/compatible-mode/v1"),
        "gemini" => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
        "lmstudio" => Some("http://localhost:1234/v1"),
        _ => None,
    }
}

impl OpenAiCompatClient {
    /// Build a client from a named provider config entry.
    ///
    /// `http_log` enables `.dawei/http` traffic capture when the workspace
    /// wants it.
    pub fn from_config(
        provider: &str,
        cfg: &LlmProviderConfig,
        stack: Arc<ProtectionStack>,
        http_log: Option<HttpLogger>,
    ) -> Result<Self, LlmError> {
        let base = cfg
            .base_url
            .as_deref()
            .or_else(|| default_base_url(provider))
            .ok_or_else(|| {
                LlmError::Configuration(format!("provider `{provider}` has no base_url"))
            })?
            .trim_end_matches('/')
            .to_string();
        if !base.starts_with("http") {
            return Err(LlmError::Configuration(format!(
                "provider `{provider}` base_url must be an HTTP(S) URL, got `{base}`"
            )));
        }

        let api_key = cfg
            .api_key
            .clone()
            .or_else(|| cfg.api_key_env.as_ref().and_then(|var| std::env::var(var).ok()));
        let auth_style = match provider {
            "lmstudio" => AuthStyle::None,
            _ if api_key.is_some() => AuthStyle::Bearer,
            _ => AuthStyle::None,
        };

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.unwrap_or(180)));
        if let Some(proxy) = &cfg.proxy {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy)
                    .map_err(|e| LlmError::Configuration(format!("invalid proxy url: {e}")))?,
            );
        }
        let client = builder
            .build()
            .map_err(|e| LlmError::Configuration(format!("http client build failed: {e}")))?;

        Ok(Self {
            provider: provider.to_string(),
            model: cfg.model.clone(),
            api_key,
            chat_url: format!("{base}/chat/completions"),
            temperature: cfg.temperature.unwrap_or(0.7),
            max_tokens: cfg.max_tokens,
            extra_headers: cfg.extra_headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            extra_body: cfg.extra_body.clone(),
            auth_style,
            client,
            stack,
            http_log,
        })
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(|m| m.to_api_wire()).collect();
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

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            "temperature": req.temperature.unwrap_or(self.temperature),
            "stream_options": { "include_usage": true },
        });
        if let Some(max) = req.max_tokens.or(self.max_tokens) {
            body["max_tokens"] = json!(max);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
            // Sequential dispatch downstream relies on the provider not
            // fanning calls out across one turn.
            body["parallel_tool_calls"] = json!(false);
        }
        // User-supplied keys override anything computed above.
        if let Some(map) = self.extra_body.as_object() {
            for (k, v) in map {
                body[k] = v.clone();
            }
        }
        body
    }

    fn apply_auth(&self, mut req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, LlmError> {
        match self.auth_style {
            AuthStyle::Bearer => {
                let key = self.api_key.as_deref().ok_or_else(|| {
                    LlmError::Configuration(
                        "API key not set; provide api_key or api_key_env in config".to_string(),
                    )
                })?;
                req = req.bearer_auth(key);
            }
            AuthStyle::ApiKeyHeader => {
                let key = self.api_key.as_deref().ok_or_else(|| {
                    LlmError::Configuration(
                        "API key not set; provide api_key or api_key_env in config".to_string(),
                    )
                })?;
                req = req.header("api-key", key);
            }
            AuthStyle::None => {}
        }
        for (name, value) in &self.extra_headers {
            req = req.header(name.as_str(), value.as_str());
        }
        Ok(req)
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.provider
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<EventStream, LlmError> {
        if req.messages.is_empty() {
            return Err(LlmError::Validation("messages must be a non-empty list".to_string()));
        }

        let body = self.build_body(&req);
        debug!(
            provider = %self.provider,
            model = %self.model,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            "sending completion request"
        );

        let response_log = self
            .http_log
            .as_ref()
            .map(|l| l.log_request(&self.chat_url, &self.provider, &self.model, &body))
            .unwrap_or_else(crate::http_log::ResponseLog::disabled);

        let breaker = self.stack.breaker_for(&self.provider).await;
        let provider = self.provider.clone();

        let response = breaker
            .call(None, || {
                let body = body.clone();
                let provider = provider.clone();
                let response_log = response_log.clone();
                async move {
                    // Admission first: a rejected acquire never reaches the
                    // network.
                    let (admitted, _) = self
                        .stack
                        .limiter()
                        .acquire(1, Some(Duration::from_secs(30)))
                        .await;
                    if !admitted {
                        self.stack.limiter().record_failure(false).await;
                        return Err(LlmError::QueueTimeout);
                    }

                    let http_req = self.apply_auth(self.client.post(&self.chat_url))?.json(&body);
                    let resp = match http_req.send().await {
                        Ok(r) => r,
                        Err(e) => {
                            let err = LlmError::from_transport(&provider, &e);
                            self.stack.limiter().record_failure(false).await;
                            return Err(err);
                        }
                    };

                    let status = resp.status();
                    response_log.set_status(status.as_u16());
                    if !status.is_success() {
                        let text = resp.text().await.unwrap_or_default();
                        response_log.set_error(text.clone());
                        let err = LlmError::from_status(&provider, status.as_u16(), text);
                        self.stack.limiter().record_failure(err.is_rate_limit()).await;
                        increment_counter(
                            "llm.http_requests",
                            &[("provider", &provider), ("status", "error")],
                        );
                        return Err(err);
                    }
                    Ok(resp)
                }
            })
            .await?;

        self.stack.limiter().record_success().await;
        increment_counter("llm.http_requests", &[("provider", &self.provider), ("status", "success")]);

        let active_guard = self.stack.track_request();
        let provider = self.provider.clone();
        let mut byte_stream = response.bytes_stream();

        let stream = async_stream::stream! {
            // Guards live inside the stream so the gauge drops and the
            // response log flushes even when the consumer abandons us.
            let _active = active_guard;
            let response_log = response_log;
            let mut parser = StreamParser::new();
            let mut buf = String::new();
            let mut finished = false;

            'network: while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let err = LlmError::from_transport(&provider, &e);
                        response_log.set_error(err.to_string());
                        yield Err(err);
                        return;
                    }
                };
                let text = String::from_utf8_lossy(&bytes);
                response_log.push_chunk(&text);
                buf.push_str(&text);

                // SSE events can be split across TCP packets: only complete
                // `\n`-terminated lines are parsed, the tail stays buffered.
                while let Some(nl) = buf.find('\n') {
                    let line = buf[..nl].trim_end_matches('\r').to_string();
                    buf.drain(..=nl);
                    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                        continue;
                    };
                    if data.is_empty() {
                        continue;
                    }
                    if data == "[DONE]" {
                        finished = true;
                        yield Ok(parser.complete(None));
                        break 'network;
                    }
                    match serde_json::from_str::<Value>(data) {
                        Ok(v) => {
                            for event in parser.parse_chunk(&v) {
                                yield Ok(event);
                            }
                        }
                        Err(e) => {
                            warn!(provider = %provider, error = %e, "undecodable SSE data line");
                        }
                    }
                }
            }

            // Stream closed without the [DONE] sentinel — still deliver the
            // accumulated completion so downstream state machines terminate.
            if !finished {
                yield Ok(parser.complete(None));
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

    fn provider_config(base_url: &str) -> LlmProviderConfig {
        serde_json::from_value(json!({
            "provider": "deepseek",
            "model": "deepseek-chat",
            "base_url": base_url,
            "api_key": "sk-test",
        }))
        .unwrap()
    }

    fn client() -> OpenAiCompatClient {
        OpenAiCompatClient::from_config(
            "deepseek",
            &provider_config("http://localhost:9999/v1"),
            ProtectionStack::global(),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn chat_url_appends_path() {
        let c = client();
        assert_eq!(c.chat_url, "http://localhost:9999/v1/chat/completions");
    }

    #[tokio::test]
    async fn trailing_slash_in_base_url_is_stripped() {
        let c = OpenAiCompatClient::from_config(
            "deepseek",
            &provider_config("http://localhost:1234/v1/"),
            ProtectionStack::global(),
            None,
        )
        .unwrap();
        assert_eq!(c.chat_url, "http://localhost:1234/v1/chat/completions");
    }

    #[tokio::test]
    async fn known_provider_gets_default_base_url() {
        let cfg: LlmProviderConfig = serde_json::from_value(json!({
            "provider": "groq", "model": "m", "api_key": "k",
        }))
        .unwrap();
        let c = OpenAiCompatClient::from_config("groq", &cfg, ProtectionStack::global(), None)
            .unwrap();
        assert!(c.chat_url.starts_with("https://api.groq.com/openai/v1"));
    }

    #[tokio::test]
    async fn unknown_provider_without_base_url_is_config_error() {
        let cfg: LlmProviderConfig =
            serde_json::from_value(json!({ "provider": "custom", "model": "m" })).unwrap();
        let err = match OpenAiCompatClient::from_config("custom", &cfg, ProtectionStack::global(), None) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, LlmError::Configuration(_)));
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

    #[tokio::test]
    async fn body_contains_stream_options_and_tools() {
        let c = client();
        let req = CompletionRequest {
            messages: vec![Message::user("hi")],
            tools: vec![crate::ToolSchema {
                name: "get_time".into(),
                description: "Current time".into(),
                parameters: json!({ "type": "object", "properties": {} }),
            }],
            stream: true,
            temperature: None,
            max_tokens: None,
        };
        let body = c.build_body(&req);
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["stream_options"]["include_usage"], json!(true));
        assert_eq!(body["tools"][0]["function"]["name"], "get_time");
        assert_eq!(body["parallel_tool_calls"], json!(false));
    }

    #[tokio::test]
    async fn body_omits_tools_when_empty() {
        let c = client();
        let req = CompletionRequest {
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        let body = c.build_body(&req);
        assert!(body.get("tools").is_none());
        assert!(body.get("parallel_tool_calls").is_none());
    }

    #[tokio::test]
    async fn extra_body_overrides_computed_keys() {
        let mut cfg = provider_config("http://localhost:9999/v1");
        cfg.extra_body = json!({ "temperature": 0.1, "reasoning_format": "deepseek" });
        let c = OpenAiCompatClient::from_config(
            "deepseek",
            &cfg,
            ProtectionStack::global(),
            None,
        )
        .unwrap();
        let req = CompletionRequest { messages: vec![Message::user("x")], ..Default::default() };
        let body = c.build_body(&req);
        assert_eq!(body["temperature"], json!(0.1));
        assert_eq!(body["reasoning_format"], "deepseek");
    }

    #[tokio::test]
    async fn api_wire_messages_have_no_bookkeeping_fields() {
        let c = client();
        let req = CompletionRequest { messages: vec![Message::user("x")], ..Default::default() };
        let body = c.build_body(&req);
        assert!(body["messages"][0].get("timestamp").is_none());
        assert!(body["messages"][0].get("id").is_none());
        assert_eq!(body["messages"][0]["role"], "user");
    }
}
