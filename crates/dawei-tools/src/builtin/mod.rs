// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Builtin tools that are always registered.

mod completion;
mod followup;
mod skills;
mod time;

pub use completion::AttemptCompletionTool;
pub use followup::AskFollowupQuestionTool;
pub use skills::{register_skills_tools, GetSkillTool, ListSkillsTool, SearchSkillsTool};
pub use time::GetTimeTool;

use crate::ToolRegistry;

/// Register the always-available builtins.  The skills tools are registered
/// separately (see [`register_skills_tools`]) because they need the
/// workspace's skill manager.
pub fn register_builtins(registry: &mut ToolRegistry) {
    registry.register(AskFollowupQuestionTool);
    registry.register(AttemptCompletionTool);
    registry.register(GetTimeTool);
}
