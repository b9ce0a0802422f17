// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The per-workspace scheduler engine and its global manager.
//!
//! A 1-second check loop queues due tasks; a small worker pool executes them
//! through the normal agent pipeline.  The per-task execution lock is the
//! only thing preventing duplicate execution when the check loop re-queues a
//! task that is still running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::{ScheduledTask, ScheduledTaskStore, TriggerStatus};

/// Executes the message payload of a fired task through the agent pipeline.
/// Implemented by the server layer, which owns workspace + agent assembly.
#[async_trait]
pub trait MessageExecutor: Send + Sync {
    async fn execute_message_task(&self, task: &ScheduledTask) -> anyhow::Result<()>;
}

/// Per-task-id async locks with a non-blocking acquire.
#[derive(Default)]
pub struct ExecutionLock {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ExecutionLock {
    /// Try to take the lock for `task_id` within 100ms.  `None` means the
    /// task is already being executed by another worker.
    pub async fn try_acquire(&self, task_id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Opportunistic cleanup so long-lived workspaces do not grow the
            // map without bound.
            if locks.len() > 100 {
                locks.retain(|_, l| l.try_lock().is_err());
            }
            locks.entry(task_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        tokio::time::timeout(Duration::from_millis(100), lock.lock_owned()).await.ok()
    }
}

pub struct SchedulerEngine {
    workspace_id: String,
    store: Arc<ScheduledTaskStore>,
    executor: Arc<dyn MessageExecutor>,
    execution_lock: Arc<ExecutionLock>,
    running: Arc<AtomicBool>,
    check_interval: Duration,
    max_concurrent: usize,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SchedulerEngine {
    pub fn new(
        workspace_id: impl Into<String>,
        store: Arc<ScheduledTaskStore>,
        executor: Arc<dyn MessageExecutor>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            store,
            executor,
            execution_lock: Arc::new(ExecutionLock::default()),
            running: Arc::new(AtomicBool::new(false)),
            check_interval: Duration::from_secs(1),
            max_concurrent: max_concurrent.max(1),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(workspace = %self.workspace_id, "scheduler already running");
            return;
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<ScheduledTask>();
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let mut handles = self.handles.lock().await;

        // Check loop: every second, every due task goes onto the queue.
        {
            let store = Arc::clone(&self.store);
            let running = Arc::clone(&self.running);
            let interval = self.check_interval;
            let workspace = self.workspace_id.clone();
            handles.push(tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    for task in store.due_tasks(Utc::now()).await {
                        debug!(workspace = %workspace, task_id = %task.task_id, "task due");
                        if queue_tx.send(task).is_err() {
                            return;
                        }
                    }
                    tokio::time::sleep(interval).await;
                }
            }));
        }

        for worker in 0..self.max_concurrent {
            let queue_rx = Arc::clone(&queue_rx);
            let store = Arc::clone(&self.store);
            let executor = Arc::clone(&self.executor);
            let lock = Arc::clone(&self.execution_lock);
            let running = Arc::clone(&self.running);
            let workspace = self.workspace_id.clone();
            handles.push(tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    let task = {
                        let mut rx = queue_rx.lock().await;
                        match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                            Ok(Some(task)) => task,
                            Ok(None) => return,
                            Err(_) => continue,
                        }
                    };
                    // The only duplicate-execution guard: the check loop may
                    // queue a task again while a worker still runs it.
                    let Some(guard) = lock.try_acquire(&task.task_id).await else {
                        debug!(
                            worker,
                            task_id = %task.task_id,
                            "task already being executed, skipping"
                        );
                        continue;
                    };
                    execute_task(&store, executor.as_ref(), task).await;
                    drop(guard);
                }
                debug!(workspace = %workspace, worker, "scheduler worker stopped");
            }));
        }
        info!(workspace = %self.workspace_id, workers = self.max_concurrent, "scheduler started");
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut handles = self.handles.lock().await;
        for handle in handles.iter() {
            handle.abort();
        }
        handles.clear();
        info!(workspace = %self.workspace_id, "scheduler stopped");
    }

    pub fn store(&self) -> Arc<ScheduledTaskStore> {
        Arc::clone(&self.store)
    }
}

/// One firing: mark triggered, run (with timeout + retries), then repeat or
/// complete.
async fn execute_task(
    store: &ScheduledTaskStore,
    executor: &dyn MessageExecutor,
    mut task: ScheduledTask,
) {
    task.status = TriggerStatus::Triggered;
    task.triggered_at = Some(Utc::now());
    if let Err(e) = store.save(&task).await {
        error!(task_id = %task.task_id, error = %e, "trigger persist failed");
    }
    info!(
        task_id = %task.task_id,
        description = %task.description,
        schedule = ?task.schedule_type,
        "executing scheduled task"
    );

    let timeout = task
        .metadata
        .as_ref()
        .and_then(|m| m.get("timeout"))
        .and_then(|v| v.as_u64())
        .unwrap_or(3600);
    let max_retries = task.max_retries.unwrap_or(0);

    let mut result = Ok(());
    for attempt in 0..=max_retries {
        result = match tokio::time::timeout(
            Duration::from_secs(timeout),
            executor.execute_message_task(&task),
        )
        .await
        {
            Ok(Ok(())) => {
                task.retry_count = 0;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(anyhow::anyhow!("execution timed out after {timeout}s")),
        };
        match &result {
            Ok(()) => break,
            Err(e) if attempt < max_retries => {
                task.retry_count = attempt + 1;
                let delay = task
                    .retry_interval
                    .unwrap_or_else(|| 2u64.pow(attempt).min(300));
                warn!(
                    task_id = %task.task_id,
                    attempt = attempt + 1,
                    max_attempts = max_retries + 1,
                    delay_secs = delay,
                    error = %e,
                    "scheduled task failed, retrying"
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
            Err(_) => {}
        }
    }

    match result {
        Ok(()) => {
            if task.should_repeat() {
                match task.schedule_next(Utc::now()) {
                    Ok(()) => {
                        info!(
                            task_id = %task.task_id,
                            next = %task.trigger_time,
                            repeat_count = task.repeat_count,
                            "task rescheduled"
                        );
                    }
                    Err(e) => {
                        // An invalid cron expression surfaces here.
                        error!(task_id = %task.task_id, error = %e, "reschedule failed");
                        task.status = TriggerStatus::Failed;
                        task.last_error = Some(e.to_string());
                    }
                }
            } else {
                task.status = TriggerStatus::Completed;
                info!(task_id = %task.task_id, "task completed");
            }
        }
        Err(e) => {
            error!(task_id = %task.task_id, error = %e, "task failed after all attempts");
            task.status = TriggerStatus::Failed;
            task.last_error = Some(e.to_string());
        }
    }
    if let Err(e) = store.save(&task).await {
        error!(task_id = %task.task_id, error = %e, "final persist failed");
    }
}

/// Global manager: one engine per workspace.
#[derive(Default)]
pub struct SchedulerManager {
    engines: Mutex<HashMap<String, Arc<SchedulerEngine>>>,
}

impl SchedulerManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get or create (and start) the engine for a workspace.
    pub async fn get_scheduler(
        &self,
        workspace_id: &str,
        store: Arc<ScheduledTaskStore>,
        executor: Arc<dyn MessageExecutor>,
        max_concurrent: usize,
    ) -> Arc<SchedulerEngine> {
        let mut engines = self.engines.lock().await;
        if let Some(engine) = engines.get(workspace_id) {
            return Arc::clone(engine);
        }
        let engine =
            Arc::new(SchedulerEngine::new(workspace_id, store, executor, max_concurrent));
        engine.start().await;
        engines.insert(workspace_id.to_string(), Arc::clone(&engine));
        info!(workspace = %workspace_id, "scheduler engine created");
        engine
    }

    pub async fn remove_workspace(&self, workspace_id: &str) {
        if let Some(engine) = self.engines.lock().await.remove(workspace_id) {
            engine.stop().await;
        }
    }

    pub async fn shutdown(&self) {
        let engines: Vec<_> = self.engines.lock().await.drain().collect();
        for (_, engine) in engines {
            engine.stop().await;
        }
        info!("scheduler manager shut down");
    }

    pub async fn active_workspaces(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.engines.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
