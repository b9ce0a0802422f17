// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The `timer` tool: lets the model set, list and cancel scheduled tasks.
//!
//! A set task is persisted immediately; the workspace's scheduler engine
//! picks it up on its next check and replays the message through the agent
//! pipeline at trigger time.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tracing::info;

use dawei_tools::{ProgressSink, Tool, ToolInvocation, ToolOutput};

use crate::task::next_cron_fire;
use crate::{ExecutionData, ScheduleType, ScheduledTask, ScheduledTaskStore, TriggerStatus};

pub struct TimerTool {
    workspace_id: String,
    store: Arc<ScheduledTaskStore>,
}

impl TimerTool {
    pub fn new(workspace_id: impl Into<String>, store: Arc<ScheduledTaskStore>) -> Self {
        Self { workspace_id: workspace_id.into(), store }
    }

    async fn handle_set(&self, call_id: &str, set: &Value) -> ToolOutput {
        let description = set["description"].as_str().unwrap_or("scheduled task").to_string();
        let message = match set["message"].as_str() {
            Some(m) if !m.trim().is_empty() => m.to_string(),
            // A timer without an explicit message replays its description.
            _ => description.clone(),
        };

        let now = Utc::now();
        let (schedule_type, trigger_time, repeat_interval, cron_expression) =
            if let Some(expr) = set["cron"].as_str() {
                // Invalid cron expressions are rejected at set time.
                match next_cron_fire(expr, now) {
                    Ok(first) => (ScheduleType::Cron, first, None, Some(expr.to_string())),
                    Err(e) => return ToolOutput::err(call_id, e.to_string()),
                }
            } else if let Some(interval) = set["interval_seconds"].as_i64() {
                if interval <= 0 {
                    return ToolOutput::err(call_id, "interval_seconds must be positive");
                }
                (
                    ScheduleType::Recurring,
                    now + ChronoDuration::seconds(interval),
                    Some(interval),
                    None,
                )
            } else if let Some(at) = set["at_time"].as_str() {
                match DateTime::parse_from_rfc3339(at) {
                    Ok(t) => (ScheduleType::AtTime, t.with_timezone(&Utc), None, None),
                    Err(e) => {
                        return ToolOutput::err(
                            call_id,
                            format!("at_time must be RFC 3339: {e}"),
                        )
                    }
                }
            } else if let Some(delay) = set["delay_seconds"].as_i64() {
                if delay < 0 {
                    return ToolOutput::err(call_id, "delay_seconds must not be negative");
                }
                (ScheduleType::Delay, now + ChronoDuration::seconds(delay), None, None)
            } else {
                return ToolOutput::err(
                    call_id,
                    "set requires one of delay_seconds, at_time, interval_seconds or cron",
                );
            };

        let mut task = ScheduledTask::new(
            &self.workspace_id,
            description,
            schedule_type,
            trigger_time,
            ExecutionData {
                message,
                llm: set["llm"].as_str().map(String::from),
                mode: set["mode"].as_str().map(String::from),
            },
        );
        task.repeat_interval = repeat_interval;
        task.cron_expression = cron_expression;
        task.max_repeats = set["max_repeats"].as_u64().map(|v| v as u32);
        task.max_retries = set["max_retries"].as_u64().map(|v| v as u32);

        if let Err(e) = self.store.save(&task).await {
            return ToolOutput::err(call_id, format!("failed to persist scheduled task: {e}"));
        }
        info!(task_id = %task.task_id, trigger = %task.trigger_time, "scheduled task set");
        ToolOutput::ok(
            call_id,
            json!({
                "task_id": task.task_id,
                "description": task.description,
                "schedule_type": task.schedule_type,
                "trigger_time": task.trigger_time.to_rfc3339(),
            })
            .to_string(),
        )
    }

    async fn handle_list(&self, call_id: &str) -> ToolOutput {
        let tasks: Vec<Value> = self
            .store
            .list()
            .await
            .into_iter()
            .map(|t| {
                json!({
                    "task_id": t.task_id,
                    "description": t.description,
                    "schedule_type": t.schedule_type,
                    "status": t.status,
                    "trigger_time": t.trigger_time.to_rfc3339(),
                    "repeat_count": t.repeat_count,
                })
            })
            .collect();
        ToolOutput::ok(call_id, json!({ "tasks": tasks }).to_string())
    }

    async fn handle_cancel(&self, call_id: &str, cancel: &Value) -> ToolOutput {
        let Some(task_id) = cancel["task_id"].as_str() else {
            return ToolOutput::err(call_id, "cancel requires task_id");
        };
        match self.store.load(task_id).await {
            Some(task) if task.status == TriggerStatus::Pending => {
                self.store.cancel(task_id).await;
                ToolOutput::ok(call_id, format!("cancelled scheduled task {task_id}"))
            }
            Some(task) => ToolOutput::err(
                call_id,
                format!("task {task_id} is not pending (status: {:?})", task.status),
            ),
            None => ToolOutput::err(call_id, format!("no scheduled task {task_id}")),
        }
    }
}

#[async_trait]
impl Tool for TimerTool {
    fn name(&self) -> &str {
        "timer"
    }

    fn description(&self) -> &str {
        "Schedule a message to be processed later: once after a delay or at a \
         time, on a repeating interval, or on a cron expression (5-field, \
         minute resolution). Also lists and cancels scheduled tasks."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["set", "list", "cancel"],
                    "description": "What to do"
                },
                "set": {
                    "type": "object",
                    "description": "For action=set: the schedule definition",
                    "properties": {
                        "description": { "type": "string" },
                        "message": { "type": "string", "description": "Message replayed through the agent at trigger time" },
                        "delay_seconds": { "type": "integer" },
                        "at_time": { "type": "string", "description": "RFC 3339 timestamp" },
                        "interval_seconds": { "type": "integer" },
                        "cron": { "type": "string", "description": "5-field cron: m h dom mon dow" },
                        "max_repeats": { "type": "integer" },
                        "max_retries": { "type": "integer" },
                        "llm": { "type": "string" },
                        "mode": { "type": "string" }
                    }
                },
                "cancel": {
                    "type": "object",
                    "properties": { "task_id": { "type": "string" } }
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, invocation: &ToolInvocation, _progress: &ProgressSink) -> ToolOutput {
        let call_id = &invocation.tool_call_id;
        match invocation.args["action"].as_str() {
            Some("set") => self.handle_set(call_id, &invocation.args["set"]).await,
            Some("list") => self.handle_list(call_id).await,
            Some("cancel") => self.handle_cancel(call_id, &invocation.args["cancel"]).await,
            other => ToolOutput::err(call_id, format!("unknown timer action: {other:?}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
