// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed async task manager.
//!
//! Task definitions run through the shared priority request queue under a
//! per-task timeout.  Each attempt drives the callback sequence
//! `state_changed → progress* → (error?) → completion` with exactly one
//! completion per task.  Retries use exponential backoff and only fire for
//! the retryable transport error class.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dawei_model::{LlmError, ProtectionStack, RequestPriority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Retrying => "retrying",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub is_success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Execution context handed to a task's executor.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: String,
    cancel: CancellationToken,
    progress_tx: mpsc::UnboundedSender<u8>,
}

impl TaskContext {
    /// Report progress in percent (clamped to 0..=100).
    pub fn report_progress(&self, percent: u8) {
        let _ = self.progress_tx.send(percent.min(100));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

pub type TaskExecutorFn =
    Arc<dyn Fn(Value, TaskContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

pub struct TaskDefinition {
    pub task_id: String,
    pub name: String,
    pub description: String,
    pub executor: TaskExecutorFn,
    pub parameters: Value,
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub priority: RequestPriority,
}

/// Callbacks observed during a task's lifetime.  Any of them may be absent.
#[derive(Clone, Default)]
pub struct TaskCallbacks {
    pub on_state_changed: Option<Arc<dyn Fn(&str, TaskState) + Send + Sync>>,
    pub on_progress: Option<Arc<dyn Fn(&str, u8) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
    pub on_completion: Option<Arc<dyn Fn(&str, &TaskOutcome) + Send + Sync>>,
}

impl TaskCallbacks {
    fn state(&self, task_id: &str, state: TaskState) {
        if let Some(cb) = &self.on_state_changed {
            cb(task_id, state);
        }
    }
    fn error(&self, task_id: &str, error: &str) {
        if let Some(cb) = &self.on_error {
            cb(task_id, error);
        }
    }
    fn completion(&self, task_id: &str, outcome: &TaskOutcome) {
        if let Some(cb) = &self.on_completion {
            cb(task_id, outcome);
        }
    }
}

struct RunningTask {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

pub struct TaskManager {
    stack: Arc<ProtectionStack>,
    running: Arc<DashMap<String, RunningTask>>,
}

impl TaskManager {
    pub fn new(stack: Arc<ProtectionStack>) -> Arc<Self> {
        Arc::new(Self { stack, running: Arc::new(DashMap::new()) })
    }

    /// Submit a task; returns once it is queued.  Progress and completion
    /// flow through the callbacks.
    pub async fn submit(&self, definition: TaskDefinition, callbacks: TaskCallbacks) -> String {
        let task_id = definition.task_id.clone();
        let cancel = CancellationToken::new();
        let stack = Arc::clone(&self.stack);
        let running = Arc::clone(&self.running);

        callbacks.state(&task_id, TaskState::Queued);
        debug!(task_id = %task_id, name = %definition.name, "task submitted");

        // The worker waits on a start gate so the running-map entry is in
        // place before the first instruction runs; otherwise an immediate
        // executor could finish (and try to deregister) before registration.
        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
        let worker_cancel = cancel.clone();
        let worker_id = task_id.clone();
        let handle = tokio::spawn(async move {
            let _ = go_rx.await;
            let outcome = run_attempts(&stack, &definition, &callbacks, &worker_cancel).await;
            callbacks.completion(&worker_id, &outcome);
            running.remove(&worker_id);
        });

        self.running.insert(task_id.clone(), RunningTask { cancel, handle });
        let _ = go_tx.send(());
        task_id
    }

    /// Cancel a running task and await its worker.  Returns false when the
    /// task is unknown (already finished).
    pub async fn cancel(&self, task_id: &str) -> bool {
        let Some((_, task)) = self.running.remove(task_id) else {
            return false;
        };
        info!(task_id, "cancelling task");
        task.cancel.cancel();
        let _ = task.handle.await;
        true
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.running.contains_key(task_id)
    }
}

async fn run_attempts(
    stack: &Arc<ProtectionStack>,
    definition: &TaskDefinition,
    callbacks: &TaskCallbacks,
    cancel: &CancellationToken,
) -> TaskOutcome {
    let task_id = &definition.task_id;
    let policy = &definition.retry_policy;
    let mut last_error = String::new();

    for attempt in 0..policy.max_attempts.max(1) {
        if cancel.is_cancelled() {
            callbacks.state(task_id, TaskState::Cancelled);
            return TaskOutcome {
                is_success: false,
                result: None,
                error: Some("cancelled".to_string()),
            };
        }
        callbacks.state(task_id, if attempt == 0 { TaskState::Running } else { TaskState::Retrying });

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let context = TaskContext {
            task_id: task_id.clone(),
            cancel: cancel.clone(),
            progress_tx,
        };

        // Drain progress reports concurrently with the attempt.
        let progress_cb = callbacks.on_progress.clone();
        let progress_id = task_id.clone();
        let pump = tokio::spawn(async move {
            while let Some(percent) = progress_rx.recv().await {
                if let Some(cb) = &progress_cb {
                    cb(&progress_id, percent);
                }
            }
        });

        let executor = Arc::clone(&definition.executor);
        let parameters = definition.parameters.clone();
        let timeout = definition.timeout;
        let attempt_cancel = cancel.clone();

        let submitted = stack
            .queue()
            .submit(definition.priority, Some(timeout), async move {
                tokio::select! {
                    _ = attempt_cancel.cancelled() => Err(anyhow::anyhow!("cancelled")),
                    result = executor(parameters, context) => result,
                }
            })
            .await;
        let _ = pump.await;

        let error = match submitted {
            Ok(Ok(result)) => {
                callbacks.state(task_id, TaskState::Completed);
                return TaskOutcome { is_success: true, result: Some(result), error: None };
            }
            Ok(Err(e)) => e,
            Err(queue_err) => anyhow::Error::new(queue_err),
        };

        if cancel.is_cancelled() {
            callbacks.state(task_id, TaskState::Cancelled);
            return TaskOutcome {
                is_success: false,
                result: None,
                error: Some("cancelled".to_string()),
            };
        }

        last_error = error.to_string();
        let retryable = error
            .downcast_ref::<LlmError>()
            .map(LlmError::is_retryable)
            .unwrap_or(false);
        let attempts_left = attempt + 1 < policy.max_attempts;

        if retryable && attempts_left {
            let delay = policy
                .base_delay
                .saturating_mul(2u32.pow(attempt))
                .min(policy.max_delay);
            warn!(
                task_id,
                attempt = attempt + 1,
                max_attempts = policy.max_attempts,
                delay_secs = delay.as_secs_f64(),
                error = %last_error,
                "task attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        callbacks.error(task_id, &last_error);
        callbacks.state(task_id, TaskState::Failed);
        return TaskOutcome { is_success: false, result: None, error: Some(last_error) };
    }

    callbacks.error(task_id, &last_error);
    callbacks.state(task_id, TaskState::Failed);
    TaskOutcome { is_success: false, result: None, error: Some(last_error) }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
