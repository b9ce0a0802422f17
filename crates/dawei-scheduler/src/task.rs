// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The scheduled-task data model.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Fire once after a delay.
    Delay,
    /// Fire once at an absolute time.
    AtTime,
    /// Fire on a fixed interval.
    Recurring,
    /// Fire on a 5-field POSIX cron expression.
    Cron,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Pending,
    Triggered,
    Completed,
    Failed,
    Cancelled,
}

/// What a trigger executes.  Only message replay exists today: the message
/// is driven through the same agent pipeline as a WebSocket turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionData {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub workspace_id: String,
    pub description: String,
    pub schedule_type: ScheduleType,
    pub trigger_time: DateTime<Utc>,

    /// Seconds between firings for recurring tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_repeats: Option<u32>,
    #[serde(default)]
    pub repeat_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,

    pub execution_type: String,
    pub execution_data: ExecutionData,

    pub status: TriggerStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Seconds between retries; exponential backoff when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl ScheduledTask {
    pub fn new(
        workspace_id: impl Into<String>,
        description: impl Into<String>,
        schedule_type: ScheduleType,
        trigger_time: DateTime<Utc>,
        execution_data: ExecutionData,
    ) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            description: description.into(),
            schedule_type,
            trigger_time,
            repeat_interval: None,
            max_repeats: None,
            repeat_count: 0,
            cron_expression: None,
            execution_type: "message".to_string(),
            execution_data,
            status: TriggerStatus::Pending,
            created_at: Utc::now(),
            triggered_at: None,
            last_error: None,
            max_retries: None,
            retry_interval: None,
            retry_count: 0,
            tags: Vec::new(),
            metadata: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TriggerStatus::Pending && now >= self.trigger_time
    }

    /// Whether a successful firing schedules another one.
    ///
    /// Interval-driven schedules need a positive `repeat_interval`; cron
    /// schedules repeat by definition.  Either way `max_repeats` bounds the
    /// count when set.
    pub fn should_repeat(&self) -> bool {
        let under_cap = self.max_repeats.map(|max| self.repeat_count < max).unwrap_or(true);
        match self.schedule_type {
            ScheduleType::Cron => under_cap,
            _ => self.repeat_interval.map(|i| i > 0).unwrap_or(false) && under_cap,
        }
    }

    /// Advance to the next firing after a successful run.
    ///
    /// Interval schedules re-arm at `now + repeat_interval`; cron schedules
    /// at the next matching instant.  An invalid cron expression is an error
    /// the engine converts into a failed task.
    pub fn schedule_next(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        match self.schedule_type {
            ScheduleType::Cron => {
                let expr = self
                    .cron_expression
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("cron task without cron_expression"))?;
                self.trigger_time = next_cron_fire(expr, now)?;
            }
            _ => {
                let interval = self.repeat_interval.unwrap_or(0);
                self.trigger_time = now + ChronoDuration::seconds(interval);
            }
        }
        self.repeat_count += 1;
        self.status = TriggerStatus::Pending;
        Ok(())
    }
}

/// Next fire instant for a 5-field POSIX cron expression, strictly after
/// `now`.
///
/// The underlying schedule parser wants a seconds field; a `0` is prepended
/// so `*/5 * * * *` fires at exact minute boundaries.
pub fn next_cron_fire(expression: &str, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    let fields = expression.split_whitespace().count();
    if fields != 5 {
        anyhow::bail!(
            "invalid cron expression `{expression}`: expected 5 fields (m h dom mon dow), got {fields}"
        );
    }
    let schedule = cron::Schedule::from_str(&format!("0 {expression}"))
        .map_err(|e| anyhow::anyhow!("invalid cron expression `{expression}`: {e}"))?;
    schedule
        .after(&now)
        .next()
        .ok_or_else(|| anyhow::anyhow!("cron expression `{expression}` has no future fire time"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
