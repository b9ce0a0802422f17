// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent core: event bus, task graph, async task manager, the node
//! executor that drives one agent turn, and the agent composition root.

mod agent;
mod events;
mod node_executor;
mod task_graph;
mod task_manager;
#[cfg(test)]
mod tests;

pub use agent::{Agent, AgentOutcome};
pub use events::{global_bus, AgentEvent, EventBus, EventKind, HandlerId};
pub use node_executor::{NodeExecutor, NodeOutcome, TurnEnd};
pub use task_graph::{TaskGraph, TaskNode, TaskNodeData, TaskStatus};
pub use task_manager::{
    RetryPolicy, TaskCallbacks, TaskContext, TaskDefinition, TaskManager, TaskOutcome, TaskState,
};
