// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Client factory and registry for one workspace.
//!
//! Resolves `<provider-key>` / `<provider-key>/<model>` references from the
//! workspace config into cached [`LlmClient`] instances.  All clients built
//! here share the same protection stack.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use dawei_config::{LlmProviderConfig, WorkspaceConfig};

use crate::{HttpLogger, LlmClient, LlmError, OllamaClient, OpenAiCompatClient, ProtectionStack};

pub struct LlmManager {
    providers: HashMap<String, LlmProviderConfig>,
    default_model: Option<String>,
    stack: Arc<ProtectionStack>,
    http_log: Option<HttpLogger>,
    clients: Mutex<HashMap<String, Arc<dyn LlmClient>>>,
}

impl LlmManager {
    pub fn new(
        config: &WorkspaceConfig,
        stack: Arc<ProtectionStack>,
        http_log: Option<HttpLogger>,
    ) -> Self {
        Self {
            providers: config.providers.clone(),
            default_model: config.agent.llm_model.clone(),
            stack,
            http_log,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a model reference into a client.
    ///
    /// `reference` is `<provider-key>` or `<provider-key>/<model>`; `None`
    /// falls back to the workspace default.
    pub async fn client(&self, reference: Option<&str>) -> Result<Arc<dyn LlmClient>, LlmError> {
        let reference = reference
            .map(String::from)
            .or_else(|| self.default_model.clone())
            .ok_or_else(|| {
                LlmError::Configuration(
                    "no model requested and no default llm_model configured".to_string(),
                )
            })?;

        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(&reference) {
            return Ok(Arc::clone(existing));
        }

        let (key, model_override) = match reference.split_once('/') {
            Some((key, model)) => (key, Some(model)),
            None => (reference.as_str(), None),
        };
        let mut cfg = self
            .providers
            .get(key)
            .cloned()
            .ok_or_else(|| {
                LlmError::Configuration(format!("unknown provider key `{key}` in model reference"))
            })?;
        if let Some(model) = model_override {
            cfg.model = model.to_string();
        }

        let client: Arc<dyn LlmClient> = match cfg.provider.as_str() {
            "ollama" => Arc::new(OllamaClient::from_config(
                &cfg,
                Arc::clone(&self.stack),
                self.http_log.clone(),
            )?),
            "mock" => Arc::new(crate::mock::MockClient::default()),
            provider => Arc::new(OpenAiCompatClient::from_config(
                provider,
                &cfg,
                Arc::clone(&self.stack),
                self.http_log.clone(),
            )?),
        };
        info!(reference = %reference, provider = %cfg.provider, model = %cfg.model, "llm client built");
        clients.insert(reference, Arc::clone(&client));
        Ok(client)
    }

    /// Provider keys configured for this workspace.
    pub fn provider_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.providers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop all cached clients (part of workspace teardown).
    pub async fn cleanup(&self) {
        self.clients.lock().await.clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> LlmManager {
        let config: WorkspaceConfig = serde_json::from_value(json!({
            "agent": { "llm_model": "dev" },
            "providers": {
                "dev": { "provider": "mock", "model": "mock-model" },
                "local": { "provider": "ollama", "model": "llama3.1" },
            }
        }))
        .unwrap();
        LlmManager::new(&config, ProtectionStack::global(), None)
    }

    #[tokio::test]
    async fn default_reference_resolves() {
        let m = manager();
        let c = m.client(None).await.unwrap();
        assert_eq!(c.name(), "mock");
    }

    #[tokio::test]
    async fn explicit_reference_resolves() {
        let m = manager();
        let c = m.client(Some("local")).await.unwrap();
        assert_eq!(c.name(), "ollama");
        assert_eq!(c.model_name(), "llama3.1");
    }

    #[tokio::test]
    async fn slash_reference_overrides_model() {
        let m = manager();
        let c = m.client(Some("local/qwen2.5")).await.unwrap();
        assert_eq!(c.model_name(), "qwen2.5");
    }

    #[tokio::test]
    async fn unknown_key_is_configuration_error() {
        let m = manager();
        let err = match m.client(Some("nope")).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, LlmError::Configuration(_)));
    }

    #[tokio::test]
    async fn clients_are_cached_per_reference() {
        let m = manager();
        let a = m.client(Some("dev")).await.unwrap();
        let b = m.client(Some("dev")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
