// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The task forest: one root per graph, parent→children edges only, O(1) id
//! lookup.  Every structural or status mutation emits a persist signal that
//! the store debounces into an atomic write.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use dawei_store::PersistSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Transitions only move forward; cancelled is reachable from any
    /// non-terminal state; terminal states are immutable.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Running)
            | (TaskStatus::Pending, TaskStatus::Completed)
            | (TaskStatus::Pending, TaskStatus::Failed)
            | (TaskStatus::Running, TaskStatus::Completed)
            | (TaskStatus::Running, TaskStatus::Failed) => true,
            (_, TaskStatus::Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskNodeData {
    pub priority: i32,
    pub extra: Value,
}

#[derive(Debug, Clone)]
pub struct TaskNode {
    pub task_node_id: String,
    pub parent_id: Option<String>,
    pub child_ids: Vec<String>,
    pub description: String,
    pub mode: String,
    pub status: TaskStatus,
    pub data: TaskNodeData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskNode {
    fn new(parent_id: Option<String>, description: String, mode: String, data: TaskNodeData) -> Self {
        let now = Utc::now();
        Self {
            task_node_id: Uuid::new_v4().to_string(),
            parent_id,
            child_ids: Vec::new(),
            description,
            mode,
            status: TaskStatus::Pending,
            data,
            created_at: now,
            updated_at: now,
        }
    }

    fn to_value(&self) -> Value {
        json!({
            "task_node_id": self.task_node_id,
            "parent_id": self.parent_id,
            "child_ids": self.child_ids,
            "description": self.description,
            "mode": self.mode,
            "status": self.status.as_str(),
            "data": { "priority": self.data.priority, "extra": self.data.extra },
            "created_at": self.created_at.to_rfc3339(),
            "updated_at": self.updated_at.to_rfc3339(),
        })
    }

    fn from_value(v: &Value) -> Option<Self> {
        let parse_time = |field: &str| {
            v[field]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now)
        };
        Some(Self {
            task_node_id: v["task_node_id"].as_str()?.to_string(),
            parent_id: v["parent_id"].as_str().map(String::from),
            child_ids: v["child_ids"]
                .as_array()
                .map(|a| a.iter().filter_map(|c| c.as_str().map(String::from)).collect())
                .unwrap_or_default(),
            description: v["description"].as_str().unwrap_or_default().to_string(),
            mode: v["mode"].as_str().unwrap_or_default().to_string(),
            status: v["status"].as_str().and_then(TaskStatus::from_str)?,
            data: TaskNodeData {
                priority: v["data"]["priority"].as_i64().unwrap_or(0) as i32,
                extra: v["data"]["extra"].clone(),
            },
            created_at: parse_time("created_at"),
            updated_at: parse_time("updated_at"),
        })
    }
}

#[derive(Debug)]
pub enum TaskGraphError {
    RootAlreadyExists,
    NodeNotFound(String),
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

impl std::fmt::Display for TaskGraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskGraphError::RootAlreadyExists => write!(f, "task graph already has a root"),
            TaskGraphError::NodeNotFound(id) => write!(f, "task node not found: {id}"),
            TaskGraphError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition {} -> {}", from.as_str(), to.as_str())
            }
        }
    }
}

impl std::error::Error for TaskGraphError {}

pub struct TaskGraph {
    graph_id: String,
    nodes: HashMap<String, TaskNode>,
    root_id: Option<String>,
    persist_tx: Option<mpsc::UnboundedSender<PersistSignal>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph_id: Uuid::new_v4().to_string(),
            nodes: HashMap::new(),
            root_id: None,
            persist_tx: None,
        }
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    /// Wire the persist-needed signal to the store's debouncer.
    pub fn set_persist_channel(&mut self, tx: mpsc::UnboundedSender<PersistSignal>) {
        self.persist_tx = Some(tx);
    }

    fn signal_persist(&self) {
        if let Some(tx) = &self.persist_tx {
            let _ = tx.send(PersistSignal { graph_id: self.graph_id.clone(), data: self.snapshot() });
        }
    }

    pub fn create_root(
        &mut self,
        description: impl Into<String>,
        mode: impl Into<String>,
        data: TaskNodeData,
    ) -> Result<String, TaskGraphError> {
        if self.root_id.is_some() {
            return Err(TaskGraphError::RootAlreadyExists);
        }
        let node = TaskNode::new(None, description.into(), mode.into(), data);
        let id = node.task_node_id.clone();
        self.graph_id = id.clone();
        self.root_id = Some(id.clone());
        self.nodes.insert(id.clone(), node);
        self.signal_persist();
        Ok(id)
    }

    pub fn create_subtask(
        &mut self,
        parent_id: &str,
        description: impl Into<String>,
        mode: impl Into<String>,
        data: TaskNodeData,
    ) -> Result<String, TaskGraphError> {
        if !self.nodes.contains_key(parent_id) {
            return Err(TaskGraphError::NodeNotFound(parent_id.to_string()));
        }
        let node = TaskNode::new(Some(parent_id.to_string()), description.into(), mode.into(), data);
        let id = node.task_node_id.clone();
        self.nodes.insert(id.clone(), node);
        if let Some(parent) = self.nodes.get_mut(parent_id) {
            parent.child_ids.push(id.clone());
            parent.updated_at = Utc::now();
        }
        self.signal_persist();
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn get_all(&self) -> Vec<&TaskNode> {
        let mut nodes: Vec<&TaskNode> = self.nodes.values().collect();
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        nodes
    }

    pub fn get_root(&self) -> Option<&TaskNode> {
        self.root_id.as_deref().and_then(|id| self.nodes.get(id))
    }

    pub fn root_id(&self) -> Option<&str> {
        self.root_id.as_deref()
    }

    pub fn update_status(&mut self, id: &str, status: TaskStatus) -> Result<(), TaskGraphError> {
        let node =
            self.nodes.get_mut(id).ok_or_else(|| TaskGraphError::NodeNotFound(id.to_string()))?;
        if !node.status.can_transition_to(status) {
            return Err(TaskGraphError::InvalidTransition { from: node.status, to: status });
        }
        node.status = status;
        node.updated_at = Utc::now();
        self.signal_persist();
        Ok(())
    }

    /// Delete a node and its whole subtree.
    pub fn delete(&mut self, id: &str) -> Result<usize, TaskGraphError> {
        if !self.nodes.contains_key(id) {
            return Err(TaskGraphError::NodeNotFound(id.to_string()));
        }
        let mut to_remove = vec![id.to_string()];
        let mut removed = 0usize;
        while let Some(current) = to_remove.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                removed += 1;
                to_remove.extend(node.child_ids);
            }
        }
        // Detach from the parent's child list.
        for node in self.nodes.values_mut() {
            node.child_ids.retain(|c| c != id);
        }
        if self.root_id.as_deref() == Some(id) {
            self.root_id = None;
        }
        self.signal_persist();
        Ok(removed)
    }

    pub fn snapshot(&self) -> Value {
        let nodes: Vec<Value> = self.get_all().iter().map(|n| n.to_value()).collect();
        json!({
            "graph_id": self.graph_id,
            "root_id": self.root_id,
            "nodes": nodes,
            "updated_at": Utc::now().to_rfc3339(),
        })
    }

    pub fn from_value(v: &Value) -> Option<Self> {
        let nodes: HashMap<String, TaskNode> = v["nodes"]
            .as_array()?
            .iter()
            .filter_map(TaskNode::from_value)
            .map(|n| (n.task_node_id.clone(), n))
            .collect();
        Some(Self {
            graph_id: v["graph_id"].as_str()?.to_string(),
            root_id: v["root_id"].as_str().map(String::from),
            nodes,
            persist_tx: None,
        })
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_root() -> (TaskGraph, String) {
        let mut g = TaskGraph::new();
        let root = g.create_root("root task", "orchestrator", TaskNodeData::default()).unwrap();
        (g, root)
    }

    #[test]
    fn exactly_one_root() {
        let (mut g, _root) = graph_with_root();
        assert!(matches!(
            g.create_root("another", "m", TaskNodeData::default()),
            Err(TaskGraphError::RootAlreadyExists)
        ));
    }

    #[test]
    fn subtasks_link_both_directions() {
        let (mut g, root) = graph_with_root();
        let child = g.create_subtask(&root, "child", "do", TaskNodeData::default()).unwrap();
        assert_eq!(g.get(&child).unwrap().parent_id.as_deref(), Some(root.as_str()));
        assert_eq!(g.get(&root).unwrap().child_ids, vec![child]);
    }

    #[test]
    fn status_transitions_are_monotonic() {
        let (mut g, root) = graph_with_root();
        g.update_status(&root, TaskStatus::Running).unwrap();
        g.update_status(&root, TaskStatus::Completed).unwrap();
        let err = g.update_status(&root, TaskStatus::Running).unwrap_err();
        assert!(matches!(err, TaskGraphError::InvalidTransition { .. }));
    }

    #[test]
    fn cancelled_reachable_from_any_non_terminal() {
        let (mut g, root) = graph_with_root();
        let child = g.create_subtask(&root, "c", "do", TaskNodeData::default()).unwrap();
        g.update_status(&root, TaskStatus::Running).unwrap();
        g.update_status(&root, TaskStatus::Cancelled).unwrap();
        g.update_status(&child, TaskStatus::Cancelled).unwrap();
        // Terminal is immutable, including re-cancelling.
        assert!(g.update_status(&child, TaskStatus::Cancelled).is_err());
    }

    #[test]
    fn delete_cascades_to_descendants() {
        let (mut g, root) = graph_with_root();
        let child = g.create_subtask(&root, "c", "do", TaskNodeData::default()).unwrap();
        let grandchild = g.create_subtask(&child, "gc", "do", TaskNodeData::default()).unwrap();
        let removed = g.delete(&child).unwrap();
        assert_eq!(removed, 2);
        assert!(g.get(&child).is_none());
        assert!(g.get(&grandchild).is_none());
        assert!(g.get(&root).unwrap().child_ids.is_empty());
    }

    #[test]
    fn snapshot_round_trips_structurally() {
        let (mut g, root) = graph_with_root();
        let child = g.create_subtask(&root, "child", "do", TaskNodeData::default()).unwrap();
        g.update_status(&child, TaskStatus::Running).unwrap();

        let snapshot = g.snapshot();
        let restored = TaskGraph::from_value(&snapshot).unwrap();
        assert_eq!(restored.graph_id(), g.graph_id());
        assert_eq!(restored.root_id(), g.root_id());
        assert_eq!(restored.get_all().len(), 2);
        assert_eq!(restored.get(&child).unwrap().status, TaskStatus::Running);
        assert_eq!(restored.get(&root).unwrap().child_ids, vec![child]);
    }

    #[tokio::test]
    async fn mutations_emit_persist_signals() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut g = TaskGraph::new();
        g.set_persist_channel(tx);
        let root = g.create_root("r", "m", TaskNodeData::default()).unwrap();
        g.update_status(&root, TaskStatus::Running).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.graph_id, g.graph_id());
        let second = rx.recv().await.unwrap();
        assert_eq!(second.data["nodes"][0]["status"], "running");
    }
}
