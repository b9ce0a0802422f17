// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Dispatches one tool call: resolve, parse, coerce, validate, run, report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use dawei_model::ToolCall;

use crate::{
    coerce_string_objects, validate_args, ProgressSink, ToolEvent, ToolInvocation, ToolOutput,
    ToolRegistry,
};

pub struct ToolExecutor {
    registry: Arc<RwLock<ToolRegistry>>,
    workspace_path: PathBuf,
    events: mpsc::UnboundedSender<ToolEvent>,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<RwLock<ToolRegistry>>,
        workspace_path: impl Into<PathBuf>,
        events: mpsc::UnboundedSender<ToolEvent>,
    ) -> Self {
        Self { registry, workspace_path: workspace_path.into(), events }
    }

    pub fn registry(&self) -> Arc<RwLock<ToolRegistry>> {
        Arc::clone(&self.registry)
    }

    /// Execute one tool call from the model.
    ///
    /// Every failure mode — unknown tool, malformed JSON, schema violation,
    /// tool error — comes back as an error-flagged [`ToolOutput`] that is
    /// appended to the conversation for the model to read.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let call_id = &call.tool_call_id;
        let name = &call.function.name;

        let Some(tool) = self.registry.read().await.get(name) else {
            warn!(tool = %name, "unknown tool requested");
            return self.finish_without_start(ToolOutput::err(
                call_id,
                format!("unknown tool: {name}"),
            ), name);
        };

        // The accumulated argument string only has to parse here, at
        // dispatch time.  An empty accumulation means "no arguments".
        let raw = call.function.arguments.trim();
        let args: Value = if raw.is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(raw) {
                Ok(v) => v,
                Err(e) => {
                    return self.finish_without_start(
                        ToolOutput::err(
                            call_id,
                            format!("tool arguments are not valid JSON: {e}"),
                        ),
                        name,
                    );
                }
            }
        };

        let schema = tool.parameters_schema();
        let args = coerce_string_objects(&schema, &args);
        if let Err(validation) = validate_args(&schema, &args) {
            // Re-raised verbatim so the model can self-correct.
            return self.finish_without_start(ToolOutput::err(call_id, validation), name);
        }

        let _ = self.events.send(ToolEvent::Start {
            tool_call_id: call_id.clone(),
            tool_name: name.clone(),
            tool_input: args.clone(),
        });

        let invocation = ToolInvocation {
            tool_call_id: call_id.clone(),
            name: name.clone(),
            args,
            workspace_path: self.workspace_path.clone(),
        };
        let progress = ProgressSink::new(call_id.clone(), name.clone(), self.events.clone());

        let started = Instant::now();
        let output = tool.execute(&invocation, &progress).await;
        let elapsed = started.elapsed();
        debug!(
            tool = %name,
            is_error = output.is_error,
            elapsed_ms = elapsed.as_millis() as u64,
            "tool execution finished"
        );

        let _ = self.events.send(ToolEvent::Result {
            tool_call_id: call_id.clone(),
            tool_name: name.clone(),
            result: output.content.clone(),
            is_error: output.is_error,
            execution_time: elapsed,
        });
        output
    }

    /// Emit only the Result event for failures that never reach execution.
    fn finish_without_start(&self, output: ToolOutput, name: &str) -> ToolOutput {
        let _ = self.events.send(ToolEvent::Result {
            tool_call_id: output.tool_call_id.clone(),
            tool_name: name.to_string(),
            result: output.content.clone(),
            is_error: output.is_error,
            execution_time: std::time::Duration::ZERO,
        });
        output
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
