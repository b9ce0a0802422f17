// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Debounced task-graph autosave.
//!
//! The task graph emits a persist signal on every structural or status
//! mutation; bursts within the debounce window (1s) coalesce into one write
//! per graph id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{PersistenceManager, ResourceType};

/// One persist-needed signal: the full snapshot of a graph.
#[derive(Debug, Clone)]
pub struct PersistSignal {
    pub graph_id: String,
    pub data: Value,
}

pub struct TaskGraphAutosave {
    handle: tokio::task::JoinHandle<()>,
}

impl TaskGraphAutosave {
    /// Consume signals from `rx`, writing each graph at most once per
    /// `debounce` window.  Exits (after a final flush) when every sender is
    /// dropped.
    pub fn start(
        manager: Arc<PersistenceManager>,
        mut rx: mpsc::UnboundedReceiver<PersistSignal>,
        debounce: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut pending: HashMap<String, (Value, Instant)> = HashMap::new();
            loop {
                let next_deadline = pending.values().map(|(_, t)| *t).min();
                tokio::select! {
                    signal = rx.recv() => match signal {
                        Some(s) => {
                            // A newer snapshot resets the window for its id.
                            pending.insert(s.graph_id, (s.data, Instant::now() + debounce));
                        }
                        None => break,
                    },
                    _ = async {
                        match next_deadline {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        let now = Instant::now();
                        let due: Vec<String> = pending
                            .iter()
                            .filter(|(_, (_, t))| *t <= now)
                            .map(|(k, _)| k.clone())
                            .collect();
                        for id in due {
                            if let Some((data, _)) = pending.remove(&id) {
                                flush(&manager, &id, &data).await;
                            }
                        }
                    }
                }
            }
            for (id, (data, _)) in pending {
                flush(&manager, &id, &data).await;
            }
            debug!("task graph autosave drained");
        });
        Self { handle }
    }

    /// Wait for the worker to drain.  Callers drop their senders first; the
    /// worker is aborted if it does not finish within the grace period.
    pub async fn stop(self) {
        let mut handle = self.handle;
        if tokio::time::timeout(Duration::from_secs(5), &mut handle).await.is_err() {
            warn!("task graph autosave did not drain in time");
            handle.abort();
        }
    }
}

async fn flush(manager: &PersistenceManager, graph_id: &str, data: &Value) {
    if let Err(e) = manager.save_with_retry(ResourceType::TaskGraph, graph_id, data, false).await {
        warn!(graph_id, error = %e, "task graph flush failed");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(dir: &tempfile::TempDir) -> Arc<PersistenceManager> {
        Arc::new(
            PersistenceManager::with_home(dir.path().join("ws"), dir.path().join("home")).unwrap(),
        )
    }

    #[tokio::test]
    async fn burst_of_signals_coalesces_to_final_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        let (tx, rx) = mpsc::unbounded_channel();
        let autosave = TaskGraphAutosave::start(Arc::clone(&m), rx, Duration::from_millis(100));

        for i in 0..10 {
            tx.send(PersistSignal { graph_id: "g1".into(), data: json!({ "rev": i }) }).unwrap();
        }
        drop(tx);
        autosave.stop().await;

        let saved = m.load_resource(ResourceType::TaskGraph, "g1").await.unwrap();
        assert_eq!(saved["rev"], 9, "only the final snapshot of the burst lands");
    }

    #[tokio::test]
    async fn debounce_window_writes_after_quiet_period() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        let (tx, rx) = mpsc::unbounded_channel();
        let _autosave = TaskGraphAutosave::start(Arc::clone(&m), rx, Duration::from_millis(50));

        tx.send(PersistSignal { graph_id: "g2".into(), data: json!({ "rev": 1 }) }).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let saved = m.load_resource(ResourceType::TaskGraph, "g2").await;
        assert!(saved.is_some(), "write happens without closing the channel");
    }

    #[tokio::test]
    async fn independent_graph_ids_both_flush() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        let (tx, rx) = mpsc::unbounded_channel();
        let autosave = TaskGraphAutosave::start(Arc::clone(&m), rx, Duration::from_millis(30));

        tx.send(PersistSignal { graph_id: "a".into(), data: json!({ "g": "a" }) }).unwrap();
        tx.send(PersistSignal { graph_id: "b".into(), data: json!({ "g": "b" }) }).unwrap();
        drop(tx);
        autosave.stop().await;

        assert!(m.load_resource(ResourceType::TaskGraph, "a").await.is_some());
        assert!(m.load_resource(ResourceType::TaskGraph, "b").await.is_some());
    }
}
