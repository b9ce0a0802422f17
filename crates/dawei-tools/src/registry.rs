// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dawei_model::ToolSchema;

use crate::Tool;

/// Central registry of the tools available to a workspace.
///
/// The allow-set handed to the model is the registered tools minus the
/// config-disabled names, filtered by agent mode.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    disabled: HashSet<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new(), disabled: HashSet::new() }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Remove names from the allow-set without unregistering them.
    pub fn disable(&mut self, names: &[String]) {
        self.disabled.extend(names.iter().cloned());
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if self.disabled.contains(name) {
            return None;
        }
        self.tools.get(name).cloned()
    }

    /// Schemas for the allow-set of `mode`, sorted by name.
    pub fn schemas_for_mode(&self, mode: &str) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .filter(|t| !self.disabled.contains(t.name()))
            .filter(|t| t.modes().contains(&mode))
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .keys()
            .filter(|n| !self.disabled.contains(*n))
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProgressSink, ToolInvocation, ToolOutput};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct EchoTool {
        name: &'static str,
        modes: &'static [&'static str],
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn modes(&self) -> &[&str] {
            self.modes
        }
        async fn execute(&self, inv: &ToolInvocation, _progress: &ProgressSink) -> ToolOutput {
            ToolOutput::ok(&inv.tool_call_id, format!("echo:{}", inv.args))
        }
    }

    fn all_modes() -> &'static [&'static str] {
        &["orchestrator", "plan", "do", "check", "act"]
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo", modes: all_modes() });
        assert!(reg.get("echo").is_some());
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn disabled_tool_is_hidden() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo", modes: all_modes() });
        reg.disable(&["echo".to_string()]);
        assert!(reg.get("echo").is_none());
        assert!(reg.names().is_empty());
    }

    #[test]
    fn schemas_filter_by_mode() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "everywhere", modes: all_modes() });
        reg.register(EchoTool { name: "plan_only", modes: &["plan"] });
        let orchestrator: Vec<String> =
            reg.schemas_for_mode("orchestrator").into_iter().map(|s| s.name).collect();
        assert_eq!(orchestrator, vec!["everywhere"]);
        let plan: Vec<String> = reg.schemas_for_mode("plan").into_iter().map(|s| s.name).collect();
        assert_eq!(plan, vec!["everywhere", "plan_only"]);
    }

    #[test]
    fn duplicate_registration_overwrites() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "t", modes: all_modes() });
        reg.register(EchoTool { name: "t", modes: all_modes() });
        assert_eq!(reg.names().len(), 1);
    }
}
