// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The skills surface: list / search / get tools over a [`SkillManager`].
//!
//! Skills stay out of the prompt until asked for — listing returns only
//! names and descriptions, `get_skill` pulls one skill's full instructions
//! into context.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::skills::SkillManager;
use crate::{ProgressSink, Tool, ToolInvocation, ToolOutput, ToolRegistry};

/// Register the skills tools against one workspace's manager.
pub fn register_skills_tools(registry: &mut ToolRegistry, manager: Arc<SkillManager>) {
    registry.register(ListSkillsTool { manager: Arc::clone(&manager) });
    registry.register(SearchSkillsTool { manager: Arc::clone(&manager) });
    registry.register(GetSkillTool { manager });
}

pub struct ListSkillsTool {
    manager: Arc<SkillManager>,
}

#[async_trait]
impl Tool for ListSkillsTool {
    fn name(&self) -> &str {
        "list_skills"
    }

    fn description(&self) -> &str {
        "List all available skills with their names, descriptions and scope. \
         Use this to see what specialized capabilities exist before picking \
         one with get_skill."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, invocation: &ToolInvocation, _progress: &ProgressSink) -> ToolOutput {
        ToolOutput::ok(&invocation.tool_call_id, self.manager.summary())
    }
}

pub struct SearchSkillsTool {
    manager: Arc<SkillManager>,
}

#[async_trait]
impl Tool for SearchSkillsTool {
    fn name(&self) -> &str {
        "search_skills"
    }

    fn description(&self) -> &str {
        "Search the available skills for ones matching a task description. \
         Returns matching skills ranked by relevance; follow up with \
         get_skill to load the winner's instructions."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Task description to match against skill descriptions"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, invocation: &ToolInvocation, _progress: &ProgressSink) -> ToolOutput {
        let query = invocation.args["query"].as_str().unwrap_or_default();
        let matches = self.manager.find_matching(query);
        if matches.is_empty() {
            return ToolOutput::ok(
                &invocation.tool_call_id,
                format!("No skills found matching query: {query}"),
            );
        }
        let mut lines = vec![
            format!("# Matching Skills for: {query}"),
            format!("Found {} relevant skill(s)", matches.len()),
            String::new(),
        ];
        for (i, skill) in matches.iter().enumerate() {
            lines.push(format!(
                "{}. **{}** ({}): {}",
                i + 1,
                skill.name,
                skill.scope.as_str(),
                skill.description
            ));
        }
        ToolOutput::ok(&invocation.tool_call_id, lines.join("\n"))
    }
}

pub struct GetSkillTool {
    manager: Arc<SkillManager>,
}

#[async_trait]
impl Tool for GetSkillTool {
    fn name(&self) -> &str {
        "get_skill"
    }

    fn description(&self) -> &str {
        "Load the complete instructions of one skill by name. Use after \
         list_skills or search_skills identified the right skill; follow the \
         loaded workflow for the task."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "skill_name": {
                    "type": "string",
                    "description": "Name of the skill to load"
                }
            },
            "required": ["skill_name"]
        })
    }

    async fn execute(&self, invocation: &ToolInvocation, _progress: &ProgressSink) -> ToolOutput {
        let name = invocation.args["skill_name"].as_str().unwrap_or_default();
        let Some(mut content) = self.manager.skill_content(name) else {
            return ToolOutput::err(
                &invocation.tool_call_id,
                format!("Skill '{name}' not found. Use list_skills to see available skills."),
            );
        };
        // Companion files ride along as a listing so the model knows what
        // else the skill ships.
        let resources = self.manager.skill_resources(name);
        if !resources.is_empty() {
            content.push_str("\n\n## Skill resources\n");
            for path in resources {
                content.push_str(&format!("- {}\n", path.display()));
            }
        }
        ToolOutput::ok(&invocation.tool_call_id, content)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_skill(root: &Path, name: &str, description: &str, body: &str) {
        let skill_dir = root.join(".dawei").join("skills").join(name);
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(
            skill_dir.join("SKILL.md"),
            format!("---\nname: {name}\ndescription: {description}\n---\n\n{body}"),
        )
        .unwrap();
    }

    fn invocation(name: &str, args: Value) -> ToolInvocation {
        ToolInvocation {
            tool_call_id: "c1".into(),
            name: name.into(),
            args,
            workspace_path: "/tmp".into(),
        }
    }

    fn manager(dir: &tempfile::TempDir) -> Arc<SkillManager> {
        Arc::new(SkillManager::new(vec![dir.path().to_path_buf()], None))
    }

    #[tokio::test]
    async fn list_skills_returns_summary() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "pdf", "Work with PDF files", "# PDF");
        let tool = ListSkillsTool { manager: manager(&dir) };
        let out = tool.execute(&invocation("list_skills", json!({})), &ProgressSink::discard()).await;
        assert!(!out.is_error);
        assert!(out.content.contains("**pdf**"));
        assert!(out.content.contains("Work with PDF files"));
    }

    #[tokio::test]
    async fn search_skills_ranks_matches() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "pdf", "extract tables from pdf documents", "");
        write_skill(dir.path(), "email", "send email messages", "");
        let tool = SearchSkillsTool { manager: manager(&dir) };
        let out = tool
            .execute(&invocation("search_skills", json!({ "query": "pdf tables" })), &ProgressSink::discard())
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("**pdf**"));
        assert!(!out.content.contains("**email**"));
    }

    #[tokio::test]
    async fn get_skill_loads_body_and_lists_resources() {
        let dir = tempfile::tempdir().unwrap();
        write_skill(dir.path(), "pdf", "pdf things", "## Steps\n1. open the file");
        let skill_dir = dir.path().join(".dawei").join("skills").join("pdf");
        std::fs::write(skill_dir.join("template.tex"), "x").unwrap();

        let tool = GetSkillTool { manager: manager(&dir) };
        let out = tool
            .execute(&invocation("get_skill", json!({ "skill_name": "pdf" })), &ProgressSink::discard())
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("## Steps"));
        assert!(out.content.contains("template.tex"));
    }

    #[tokio::test]
    async fn get_unknown_skill_is_error_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = GetSkillTool { manager: manager(&dir) };
        let out = tool
            .execute(&invocation("get_skill", json!({ "skill_name": "nope" })), &ProgressSink::discard())
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("list_skills"));
    }
}
