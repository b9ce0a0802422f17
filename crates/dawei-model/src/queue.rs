// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded priority request queue.
//!
//! Submissions carry a priority and are dispatched by a worker loop under a
//! concurrency semaphore.  Ties within a priority class are broken strictly
//! by arrival order.  Each submission resolves through a oneshot; a
//! per-request timeout aborts the running job.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{AbortHandle, BoxFuture};
use tokio::sync::{oneshot, Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::LlmError;

/// Request priority; lower value dispatches first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestPriority {
    /// User-interactive requests.
    Critical = 0,
    /// Realtime tasks.
    High = 1,
    /// Batch work.
    Normal = 2,
    /// Background work.
    Low = 3,
}

#[derive(Debug, Clone)]
pub struct RequestQueueConfig {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub default_timeout: Duration,
}

impl Default for RequestQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_queue_size: 1000,
            default_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default)]
pub struct RequestQueueStats {
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_failed_to_deliver: u64,
    pub total_timeout: u64,
    pub current_queue_size: usize,
    pub current_running: usize,
}

struct QueuedJob {
    priority: u8,
    seq: u64,
    job: BoxFuture<'static, ()>,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // BinaryHeap is a max-heap; invert so the smallest (priority, seq) pair
    // pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

struct QueueShared {
    config: RequestQueueConfig,
    heap: Mutex<BinaryHeap<QueuedJob>>,
    notify: Notify,
    semaphore: Arc<Semaphore>,
    running: AtomicBool,
    seq: AtomicU64,
    total_submitted: AtomicU64,
    total_completed: AtomicU64,
    total_failed_to_deliver: AtomicU64,
    total_timeout: AtomicU64,
}

pub struct RequestQueue {
    shared: Arc<QueueShared>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RequestQueue {
    pub fn new(config: RequestQueueConfig) -> Self {
        info!(
            max_concurrent = config.max_concurrent,
            max_queue_size = config.max_queue_size,
            "request queue initialized"
        );
        let shared = Arc::new(QueueShared {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            running: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            total_submitted: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
            total_failed_to_deliver: AtomicU64::new(0),
            total_timeout: AtomicU64::new(0),
        });
        Self { shared, worker: Mutex::new(None) }
    }

    /// Start the dispatch loop.  Idempotent.
    pub fn start(&self) {
        if self.shared.running.swap(true, AtomicOrdering::SeqCst) {
            warn!("request queue already running");
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            debug!("queue worker started");
            loop {
                if !shared.running.load(AtomicOrdering::SeqCst) {
                    break;
                }
                // Hold a concurrency slot BEFORE popping: whatever is the
                // highest-priority entry at dispatch time is what runs next.
                // Popping first would freeze the choice while waiting for a
                // slot and let later high-priority submissions be overtaken.
                let permit = match Arc::clone(&shared.semaphore).acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let entry = loop {
                    if !shared.running.load(AtomicOrdering::SeqCst) {
                        break None;
                    }
                    let next = {
                        let mut heap = shared.heap.lock().unwrap_or_else(|e| e.into_inner());
                        heap.pop()
                    };
                    match next {
                        Some(entry) => break Some(entry),
                        None => {
                            // Wait for a submission, re-checking the running
                            // flag so stop() cannot leave the worker parked.
                            let _ = tokio::time::timeout(
                                Duration::from_millis(200),
                                shared.notify.notified(),
                            )
                            .await;
                        }
                    }
                };
                let Some(entry) = entry else {
                    drop(permit);
                    break;
                };
                tokio::spawn(async move {
                    entry.job.await;
                    drop(permit);
                });
            }
            debug!("queue worker stopped");
        });
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Submit a job with the given priority.
    ///
    /// Resolves with the job's output, or with `QueueFull` / `QueueStopped` /
    /// `QueueTimeout`.  On timeout the in-flight job is aborted.
    pub async fn submit<T, Fut>(
        &self,
        priority: RequestPriority,
        timeout: Option<Duration>,
        fut: Fut,
    ) -> Result<T, LlmError>
    where
        Fut: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (handle, seq) = self.try_enqueue(priority, fut)?;
        let timeout = timeout.unwrap_or(self.shared.config.default_timeout);
        self.await_result(handle, seq, timeout).await
    }

    fn try_enqueue<T, Fut>(
        &self,
        priority: RequestPriority,
        fut: Fut,
    ) -> Result<(PendingResult<T>, u64), LlmError>
    where
        Fut: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.shared.running.load(AtomicOrdering::SeqCst) {
            return Err(LlmError::QueueStopped);
        }

        let (tx, rx) = oneshot::channel::<T>();
        let (abortable, abort) = futures::future::abortable(fut);
        let job: BoxFuture<'static, ()> = Box::pin(async move {
            if let Ok(value) = abortable.await {
                // The receiver may have timed out and gone away; dropping the
                // value here is correct, the submitter already gave up.
                let _ = tx.send(value);
            }
        });

        let seq = self.shared.seq.fetch_add(1, AtomicOrdering::SeqCst);
        {
            let mut heap = self.shared.heap.lock().unwrap_or_else(|e| e.into_inner());
            if heap.len() >= self.shared.config.max_queue_size {
                warn!(max = self.shared.config.max_queue_size, "queue full, rejecting request");
                return Err(LlmError::QueueFull);
            }
            heap.push(QueuedJob { priority: priority as u8, seq, job });
        }
        self.shared.total_submitted.fetch_add(1, AtomicOrdering::Relaxed);
        self.shared.notify.notify_one();
        debug!(seq, ?priority, "request queued");
        Ok((PendingResult { rx, abort }, seq))
    }

    async fn await_result<T>(
        &self,
        pending: PendingResult<T>,
        seq: u64,
        timeout: Duration,
    ) -> Result<T, LlmError> {
        match tokio::time::timeout(timeout, pending.rx).await {
            Ok(Ok(value)) => {
                self.shared.total_completed.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(value)
            }
            Ok(Err(_)) => {
                // Sender dropped without a value: the job was aborted by stop.
                self.shared.total_failed_to_deliver.fetch_add(1, AtomicOrdering::Relaxed);
                Err(LlmError::QueueStopped)
            }
            Err(_) => {
                warn!(seq, "queued request timed out, aborting job");
                pending.abort.abort();
                self.shared.total_timeout.fetch_add(1, AtomicOrdering::Relaxed);
                Err(LlmError::QueueTimeout)
            }
        }
    }

    /// Deny new submissions, optionally wait for in-flight work (bounded),
    /// then stop the dispatcher.
    pub async fn stop(&self, wait_for_completion: bool, timeout: Duration) {
        if !self.shared.running.swap(false, AtomicOrdering::SeqCst) {
            return;
        }
        self.shared.notify.notify_waiters();

        if wait_for_completion {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let queued = self.shared.heap.lock().unwrap_or_else(|e| e.into_inner()).len();
                let running = self.shared.config.max_concurrent
                    - self.shared.semaphore.available_permits();
                if queued == 0 && running == 0 {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(queued, running, "request queue stop timed out");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        if let Some(handle) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        // Drop whatever never got dispatched; their submitters observe
        // QueueStopped through the closed oneshot.
        self.shared.heap.lock().unwrap_or_else(|e| e.into_inner()).clear();
        info!("request queue stopped");
    }

    pub fn stats(&self) -> RequestQueueStats {
        RequestQueueStats {
            total_submitted: self.shared.total_submitted.load(AtomicOrdering::Relaxed),
            total_completed: self.shared.total_completed.load(AtomicOrdering::Relaxed),
            total_failed_to_deliver: self
                .shared
                .total_failed_to_deliver
                .load(AtomicOrdering::Relaxed),
            total_timeout: self.shared.total_timeout.load(AtomicOrdering::Relaxed),
            current_queue_size: self.shared.heap.lock().unwrap_or_else(|e| e.into_inner()).len(),
            current_running: self.shared.config.max_concurrent
                - self.shared.semaphore.available_permits(),
        }
    }
}

struct PendingResult<T> {
    rx: oneshot::Receiver<T>,
    abort: AbortHandle,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn queue(max_concurrent: usize) -> RequestQueue {
        let q = RequestQueue::new(RequestQueueConfig {
            max_concurrent,
            max_queue_size: 8,
            default_timeout: Duration::from_secs(5),
        });
        q.start();
        q
    }

    #[tokio::test]
    async fn submit_resolves_with_job_output() {
        let q = queue(2);
        let out = q.submit(RequestPriority::Normal, None, async { 41 + 1 }).await;
        assert_eq!(out.unwrap(), 42);
    }

    #[tokio::test]
    async fn submit_before_start_is_rejected() {
        let q = RequestQueue::new(RequestQueueConfig::default());
        let out = q.submit(RequestPriority::Normal, None, async { 1 }).await;
        assert!(matches!(out, Err(LlmError::QueueStopped)));
    }

    #[tokio::test]
    async fn priority_orders_dispatch() {
        // One worker slot, blocked by a gate job, so the three submissions
        // behind it sit in the heap together and pop by priority.
        let q = Arc::new(queue(1));
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        let gate = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                q.submit(RequestPriority::Critical, None, async move {
                    let _ = gate_rx.await;
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut handles = Vec::new();
        for (priority, tag) in [
            (RequestPriority::Low, "low"),
            (RequestPriority::Critical, "critical"),
            (RequestPriority::Normal, "normal"),
        ] {
            let q = Arc::clone(&q);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                q.submit(priority, None, async move {
                    order.lock().unwrap().push(tag);
                })
                .await
            }));
            // Deterministic arrival order.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let _ = gate_tx.send(());
        for h in handles {
            h.await.unwrap().unwrap();
        }
        gate.await.unwrap().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["critical", "normal", "low"]);
    }

    #[tokio::test]
    async fn equal_priority_dispatches_fifo() {
        let q = Arc::new(queue(1));
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let order = Arc::new(Mutex::new(Vec::<u32>::new()));

        let gate = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                q.submit(RequestPriority::Critical, None, async move {
                    let _ = gate_rx.await;
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut handles = Vec::new();
        for i in 0..4u32 {
            let q = Arc::clone(&q);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                q.submit(RequestPriority::Normal, None, async move {
                    order.lock().unwrap().push(i);
                })
                .await
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let _ = gate_tx.send(());
        for h in handles {
            h.await.unwrap().unwrap();
        }
        gate.await.unwrap().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn overflow_is_rejected() {
        let q = Arc::new(RequestQueue::new(RequestQueueConfig {
            max_concurrent: 1,
            max_queue_size: 2,
            default_timeout: Duration::from_secs(5),
        }));
        q.start();

        // Block the single worker slot.
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let gate = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                q.submit(RequestPriority::Normal, None, async move {
                    let _ = gate_rx.await;
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Fill the queue.
        let mut fillers = Vec::new();
        for _ in 0..2 {
            let q = Arc::clone(&q);
            fillers.push(tokio::spawn(async move {
                q.submit(RequestPriority::Normal, None, async {}).await
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let out = q.submit(RequestPriority::Normal, None, async {}).await;
        assert!(matches!(out, Err(LlmError::QueueFull)));

        let _ = gate_tx.send(());
        gate.await.unwrap().unwrap();
        for f in fillers {
            f.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn timeout_aborts_the_job() {
        let q = queue(1);
        let progressed = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&progressed);
        let out = q
            .submit(RequestPriority::Normal, Some(Duration::from_millis(50)), async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                p.store(1, AtomicOrdering::SeqCst);
            })
            .await;
        assert!(matches!(out, Err(LlmError::QueueTimeout)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(progressed.load(AtomicOrdering::SeqCst), 0, "aborted job never resumed");
    }

    #[tokio::test]
    async fn concurrency_is_capped() {
        let q = Arc::new(queue(2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let q = Arc::clone(&q);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                q.submit(RequestPriority::Normal, None, async move {
                    let now = active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    peak.fetch_max(now, AtomicOrdering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    active.fetch_sub(1, AtomicOrdering::SeqCst);
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(AtomicOrdering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn stop_denies_new_submissions() {
        let q = queue(1);
        q.stop(true, Duration::from_secs(1)).await;
        let out = q.submit(RequestPriority::Normal, None, async { 1 }).await;
        assert!(matches!(out, Err(LlmError::QueueStopped)));
    }

    #[tokio::test]
    async fn stats_track_submissions() {
        let q = queue(2);
        q.submit(RequestPriority::Normal, None, async {}).await.unwrap();
        q.submit(RequestPriority::High, None, async {}).await.unwrap();
        let stats = q.stats();
        assert_eq!(stats.total_submitted, 2);
        assert_eq!(stats.total_completed, 2);
        assert_eq!(stats.total_timeout, 0);
    }
}
