// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::{ProgressSink, Tool, ToolInvocation, ToolOutput};

/// Returns the current UTC time.
pub struct GetTimeTool;

#[async_trait]
impl Tool for GetTimeTool {
    fn name(&self) -> &str {
        "get_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time in UTC (RFC 3339)."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, invocation: &ToolInvocation, _progress: &ProgressSink) -> ToolOutput {
        ToolOutput::ok(
            &invocation.tool_call_id,
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
