// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Workspace persistence: atomic JSON resource storage, the conversation
//! store with its auto-save loop, debounced task-graph snapshots, and
//! checkpoints.

mod checkpoint;
mod conversation;
mod graph_persist;
mod persistence;

pub use checkpoint::{CheckpointData, CheckpointStore};
pub use conversation::{Conversation, ConversationStore};
pub use graph_persist::{PersistSignal, TaskGraphAutosave};
pub use persistence::{PersistenceError, PersistenceManager, ResourceType};
