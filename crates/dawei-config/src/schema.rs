// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_autosave_secs() -> u64 {
    30
}

fn default_mode() -> String {
    "orchestrator".to_string()
}

fn default_max_tool_rounds() -> u32 {
    25
}

fn default_mistake_limit() -> u32 {
    3
}

fn default_scheduler_workers() -> usize {
    3
}

/// Top-level workspace configuration.
///
/// Two files feed this structure: `settings.json` (user-level defaults,
/// inherited by every workspace) and `config.json` (workspace-explicit).
/// `config.json` overrides `settings.json` field-wise; the loader performs
/// the merge before deserializing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Named LLM provider configurations.  Referenced by key from
    /// `agent.llm_model` as `<key>` or `<key>/<model>`.
    #[serde(default)]
    pub providers: HashMap<String, LlmProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Default agent mode for new conversations.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Default model reference (`<provider-key>` or `<provider-key>/<model>`).
    #[serde(default)]
    pub llm_model: Option<String>,
    /// Hard cap on model→tool rounds within one user turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Consecutive failed tool rounds allowed within one turn before the
    /// turn is aborted.  Reset by any successful tool round.
    #[serde(default = "default_mistake_limit")]
    pub consecutive_mistake_limit: u32,
    /// Conversation auto-save interval in seconds (floor 5).
    #[serde(default = "default_autosave_secs")]
    pub conversation_autosave_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            llm_model: None,
            max_tool_rounds: default_max_tool_rounds(),
            consecutive_mistake_limit: default_mistake_limit(),
            conversation_autosave_secs: default_autosave_secs(),
        }
    }
}

/// One named LLM endpoint speaking an OpenAI-compatible (or Ollama) wire
/// format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    /// Provider family: "openai" | "deepseek" | "moonshot" | "zhipu" |
    /// "openrouter" | "groq" | "qwen" | "gemini" | "lmstudio" | "ollama" |
    /// "mock"
    pub provider: String,
    /// Model identifier forwarded to the API.
    pub model: String,
    /// Base URL ending before `/chat/completions` (or the Ollama root).
    pub base_url: Option<String>,
    /// Explicit API key; prefer `api_key_env` in version-controlled files.
    pub api_key: Option<String>,
    /// Environment variable holding the API key (read at client build time).
    pub api_key_env: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Outbound proxy URL; falls back to `http_proxy`/`https_proxy` env.
    pub proxy: Option<String>,
    /// Additional headers sent on every request.
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    /// Extra key-value pairs merged verbatim into the request body.
    #[serde(default)]
    pub extra_body: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Tool names removed from the allow-set regardless of mode.
    #[serde(default)]
    pub disabled: Vec<String>,
    /// Binaries the system-command sandbox may execute.
    #[serde(default = "ToolsConfig::default_command_allowlist")]
    pub command_allowlist: Vec<String>,
}

impl ToolsConfig {
    fn default_command_allowlist() -> Vec<String> {
        ["ls", "cat", "head", "tail", "wc", "grep", "find", "date", "pwd", "echo", "git"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            disabled: Vec::new(),
            command_allowlist: Self::default_command_allowlist(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Keep at most this many checkpoints per task.
    #[serde(default)]
    pub max_per_task: Option<usize>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { enabled: true, max_per_task: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Write `.dawei/http/*_request.json` / `*_response.json` pairs.
    #[serde(default = "default_true")]
    pub http_traffic: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { http_traffic: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_workers")]
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { workers: default_scheduler_workers() }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_orchestrator_mode() {
        let c = WorkspaceConfig::default();
        assert_eq!(c.agent.mode, "orchestrator");
    }

    #[test]
    fn default_mistake_limit_is_three() {
        let c = AgentConfig::default();
        assert_eq!(c.consecutive_mistake_limit, 3);
    }

    #[test]
    fn provider_config_round_trips() {
        let json = serde_json::json!({
            "provider": "deepseek",
            "model": "deepseek-chat",
            "base_url": "https://api.deepseek.com/v1",
            "api_key_env": "DEEPSEEK_API_KEY",
        });
        let p: LlmProviderConfig = serde_json::from_value(json).unwrap();
        assert_eq!(p.provider, "deepseek");
        assert!(p.extra_headers.is_empty());
        assert!(p.extra_body.is_null());
    }

    #[test]
    fn empty_object_deserializes_with_defaults() {
        let c: WorkspaceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(c.agent.max_tool_rounds, 25);
        assert!(c.logging.http_traffic);
        assert_eq!(c.scheduler.workers, 3);
    }

    #[test]
    fn command_allowlist_has_safe_defaults() {
        let t = ToolsConfig::default();
        assert!(t.command_allowlist.iter().any(|c| c == "ls"));
        assert!(!t.command_allowlist.iter().any(|c| c == "rm"));
    }
}
