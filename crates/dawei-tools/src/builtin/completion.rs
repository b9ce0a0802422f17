// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{ProgressSink, Tool, ToolInvocation, ToolOutput};

/// Signals that the model considers the task finished.
///
/// The node executor treats an invocation of this tool as the turn's
/// explicit completion: the result text becomes the final summary and the
/// loop ends without another model call.
pub struct AttemptCompletionTool;

pub const ATTEMPT_COMPLETION_TOOL: &str = "attempt_completion";

#[async_trait]
impl Tool for AttemptCompletionTool {
    fn name(&self) -> &str {
        ATTEMPT_COMPLETION_TOOL
    }

    fn description(&self) -> &str {
        "Present the final result of the task to the user. Call this once the \
         task is complete; do not continue working afterwards."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "result": {
                    "type": "string",
                    "description": "The final result description"
                }
            },
            "required": ["result"]
        })
    }

    async fn execute(&self, invocation: &ToolInvocation, _progress: &ProgressSink) -> ToolOutput {
        let result = invocation.args["result"].as_str().unwrap_or_default();
        ToolOutput::ok(&invocation.tool_call_id, result)
    }
}
