// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{ProgressSink, Tool, ToolInvocation, ToolOutput};

/// Lets the model ask the user a clarifying question mid-turn.
///
/// The schema is what matters here: invocations of this tool are intercepted
/// by the node executor, which publishes a followup-question event and
/// suspends the turn until the session delivers the user's reply.  The
/// `execute` body only runs if something dispatches the call directly, which
/// is a wiring bug.
pub struct AskFollowupQuestionTool;

pub const ASK_FOLLOWUP_TOOL: &str = "ask_followup_question";

#[async_trait]
impl Tool for AskFollowupQuestionTool {
    fn name(&self) -> &str {
        ASK_FOLLOWUP_TOOL
    }

    fn description(&self) -> &str {
        "Ask the user a clarifying question and wait for the answer. Use when \
         the request is ambiguous or a decision needs user input. Provide 2-4 \
         suggested answers when possible."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to ask the user"
                },
                "suggestions": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Suggested answers the user can pick from"
                }
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, invocation: &ToolInvocation, _progress: &ProgressSink) -> ToolOutput {
        ToolOutput::err(
            &invocation.tool_call_id,
            "ask_followup_question must be routed through the session, not executed directly",
        )
    }
}
