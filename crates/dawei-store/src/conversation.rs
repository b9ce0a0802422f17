// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-memory conversations and their write-through store.
//!
//! The in-memory [`Conversation`] is the source of truth during a session;
//! the store's auto-save loop flushes it to disk whenever new messages have
//! accumulated.  Appends are serialized by the single node executor driving
//! the conversation — the store itself is not a concurrency point.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use dawei_model::{Message, MessageContent, Role};

use crate::{PersistenceError, PersistenceManager, ResourceType};

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub agent_mode: String,
    pub llm_model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub message_count: usize,
    /// `"chat"` for user sessions, `"scheduled"` for timer replays.
    pub task_type: String,
    /// The scheduled task that spawned this conversation, when any.
    pub source_task_id: Option<String>,
}

impl Conversation {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        agent_mode: impl Into<String>,
        llm_model: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            agent_mode: agent_mode.into(),
            llm_model: llm_model.into(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            message_count: 0,
            task_type: "chat".to_string(),
            source_task_id: None,
        }
    }

    /// Append a message.  Append-only: existing entries are never touched.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.message_count = self.messages.len();
        self.updated_at = Utc::now();
    }

    /// Serialize to the on-disk dictionary form.
    ///
    /// Single-entry text-block content is flattened to a plain string before
    /// writing.
    pub fn to_value(&self) -> Value {
        let messages: Vec<Value> = self
            .messages
            .iter()
            .map(|m| {
                let mut m = m.clone();
                m.content = m.content.flattened();
                m.to_wire()
            })
            .collect();
        json!({
            "id": self.id,
            "title": self.title,
            "agent_mode": self.agent_mode,
            "llm_model": self.llm_model,
            "created_at": self.created_at.to_rfc3339(),
            "updated_at": self.updated_at.to_rfc3339(),
            "messages": messages,
            "message_count": self.message_count,
            "task_type": self.task_type,
            "source_task_id": self.source_task_id,
        })
    }

    pub fn from_value(v: &Value) -> Option<Self> {
        let messages: Vec<Message> = v["messages"]
            .as_array()?
            .iter()
            .filter_map(|m| Message::from_wire(m).ok())
            .collect();
        let parse_time = |field: &str| {
            v[field]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now)
        };
        Some(Self {
            id: v["id"].as_str()?.to_string(),
            title: v["title"].as_str().unwrap_or_default().to_string(),
            agent_mode: v["agent_mode"].as_str().unwrap_or_default().to_string(),
            llm_model: v["llm_model"].as_str().unwrap_or_default().to_string(),
            created_at: parse_time("created_at"),
            updated_at: parse_time("updated_at"),
            message_count: messages.len(),
            messages,
            task_type: v["task_type"].as_str().unwrap_or("chat").to_string(),
            source_task_id: v["source_task_id"].as_str().map(String::from),
        })
    }

    /// Detect the repeated-tool-call loop: the last three assistant tool
    /// calls name the same tool with byte-identical arguments.
    pub fn has_repeated_tool_call(&self) -> bool {
        let mut recent: Vec<(&str, &str)> = Vec::new();
        'outer: for message in self.messages.iter().rev() {
            if message.role != Role::Assistant {
                continue;
            }
            let Some(calls) = &message.tool_calls else { continue };
            for call in calls {
                recent.push((call.function.name.as_str(), call.function.arguments.as_str()));
                if recent.len() >= 3 {
                    break 'outer;
                }
            }
        }
        if recent.len() < 3 {
            return false;
        }
        recent[0] == recent[1] && recent[1] == recent[2]
    }

    /// Text of the last assistant message, when any.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .and_then(|m| match &m.content {
                MessageContent::Text(t) if !t.is_empty() => Some(t.as_str()),
                _ => None,
            })
    }
}

/// Write-through store for the current conversation of one session.
pub struct ConversationStore {
    manager: Arc<PersistenceManager>,
    current: Arc<Mutex<Option<Conversation>>>,
    last_saved_count: Mutex<usize>,
    autosave_interval: Duration,
    autosave: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConversationStore {
    /// `autosave_secs` is floored at 5 seconds.
    pub fn new(manager: Arc<PersistenceManager>, autosave_secs: u64) -> Arc<Self> {
        Arc::new(Self {
            manager,
            current: Arc::new(Mutex::new(None)),
            last_saved_count: Mutex::new(0),
            autosave_interval: Duration::from_secs(autosave_secs.max(5)),
            autosave: Mutex::new(None),
        })
    }

    /// Handle to the current conversation slot; the node executor locks this
    /// to append messages.
    pub fn current_handle(&self) -> Arc<Mutex<Option<Conversation>>> {
        Arc::clone(&self.current)
    }

    pub async fn set_current(&self, conversation: Conversation) {
        // Lock order matches save_if_dirty: current before counter.
        let mut slot = self.current.lock().await;
        *self.last_saved_count.lock().await = 0;
        *slot = Some(conversation);
    }

    pub async fn take_current(&self) -> Option<Conversation> {
        self.current.lock().await.take()
    }

    /// Start the auto-save loop.  Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.autosave.lock().await;
        if slot.is_some() {
            return;
        }
        let store = Arc::clone(self);
        let interval = self.autosave_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = store.save_if_dirty().await {
                    warn!(error = %e, "conversation autosave failed");
                }
            }
        }));
        debug!(interval_secs = interval.as_secs(), "conversation autosave started");
    }

    /// Save when messages accumulated since the last flush.  Idempotent when
    /// nothing changed.
    pub async fn save_if_dirty(&self) -> Result<bool, PersistenceError> {
        let snapshot = {
            let current = self.current.lock().await;
            let Some(conversation) = current.as_ref() else { return Ok(false) };
            let mut last_saved = self.last_saved_count.lock().await;
            if conversation.message_count <= *last_saved {
                return Ok(false);
            }
            *last_saved = conversation.message_count;
            conversation.clone()
        };
        self.manager
            .save_with_retry(ResourceType::Conversation, &snapshot.id, &snapshot.to_value(), false)
            .await?;
        debug!(id = %snapshot.id, messages = snapshot.message_count, "conversation saved");
        Ok(true)
    }

    /// Unconditional flush of the current conversation.
    pub async fn save_now(&self) -> Result<(), PersistenceError> {
        let snapshot = {
            let current = self.current.lock().await;
            let Some(conversation) = current.as_ref() else { return Ok(()) };
            let mut last_saved = self.last_saved_count.lock().await;
            *last_saved = conversation.message_count;
            conversation.clone()
        };
        self.manager
            .save_with_retry(ResourceType::Conversation, &snapshot.id, &snapshot.to_value(), false)
            .await?;
        Ok(())
    }

    pub async fn load(&self, conversation_id: &str) -> Option<Conversation> {
        let value = self.manager.load_resource(ResourceType::Conversation, conversation_id).await?;
        Conversation::from_value(&value)
    }

    /// Stop the auto-save loop, flushing once more on the way out.
    pub async fn stop(&self) {
        if let Some(handle) = self.autosave.lock().await.take() {
            handle.abort();
        }
        if let Err(e) = self.save_if_dirty().await {
            warn!(error = %e, "final conversation flush failed");
        }
        info!("conversation store stopped");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use dawei_model::ToolCall;

    fn store(dir: &tempfile::TempDir) -> Arc<ConversationStore> {
        let manager = Arc::new(
            PersistenceManager::with_home(dir.path().join("ws"), dir.path().join("home")).unwrap(),
        );
        ConversationStore::new(manager, 5)
    }

    fn assistant_call(name: &str, args: &str) -> Message {
        Message::assistant_with_tool_calls("", vec![ToolCall::new("id", name, args)])
    }

    #[test]
    fn push_updates_count_and_timestamp() {
        let mut c = Conversation::new("c1", "t", "orchestrator", "mock");
        let before = c.updated_at;
        c.push(Message::user("hi"));
        assert_eq!(c.message_count, 1);
        assert!(c.updated_at >= before);
    }

    #[test]
    fn value_round_trip_preserves_messages() {
        let mut c = Conversation::new("c1", "title", "orchestrator", "mock");
        c.push(Message::user("hello"));
        c.push(Message::assistant("world"));
        let v = c.to_value();
        let back = Conversation::from_value(&v).unwrap();
        assert_eq!(back.id, "c1");
        assert_eq!(back.messages.len(), 2);
        assert_eq!(back.messages[0].as_text(), Some("hello"));
        assert_eq!(back.message_count, 2);
    }

    #[test]
    fn repeated_tool_call_detected_after_three_identical() {
        let mut c = Conversation::new("c1", "t", "m", "l");
        for _ in 0..3 {
            c.push(assistant_call("search", r#"{"q":"x"}"#));
        }
        assert!(c.has_repeated_tool_call());
    }

    #[test]
    fn different_arguments_do_not_trigger_guard() {
        let mut c = Conversation::new("c1", "t", "m", "l");
        c.push(assistant_call("search", r#"{"q":"x"}"#));
        c.push(assistant_call("search", r#"{"q":"y"}"#));
        c.push(assistant_call("search", r#"{"q":"x"}"#));
        assert!(!c.has_repeated_tool_call());
    }

    #[test]
    fn fewer_than_three_calls_never_trigger_guard() {
        let mut c = Conversation::new("c1", "t", "m", "l");
        c.push(assistant_call("search", r#"{"q":"x"}"#));
        c.push(assistant_call("search", r#"{"q":"x"}"#));
        assert!(!c.has_repeated_tool_call());
    }

    #[tokio::test]
    async fn save_if_dirty_flushes_once_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let mut c = Conversation::new("c1", "t", "m", "l");
        c.push(Message::user("hi"));
        s.set_current(c).await;

        assert!(s.save_if_dirty().await.unwrap(), "first flush saves");
        assert!(!s.save_if_dirty().await.unwrap(), "second flush is a no-op");

        {
            let handle = s.current_handle();
            let mut slot = handle.lock().await;
            slot.as_mut().unwrap().push(Message::assistant("yo"));
        }
        assert!(s.save_if_dirty().await.unwrap(), "new message re-dirties");
    }

    #[tokio::test]
    async fn saved_conversation_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let mut c = Conversation::new("c1", "t", "m", "l");
        c.push(Message::user("hi"));
        s.set_current(c).await;
        s.save_now().await.unwrap();

        let loaded = s.load("c1").await.unwrap();
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn single_text_block_content_is_flattened_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let mut c = Conversation::new("c1", "t", "m", "l");
        let mut msg = Message::user("");
        msg.content = dawei_model::MessageContent::Blocks(vec![
            dawei_model::ContentBlock::Text { text: "flat me".into() },
        ]);
        c.push(msg);
        s.set_current(c).await;
        s.save_now().await.unwrap();

        let value = s
            .manager
            .load_resource(ResourceType::Conversation, "c1")
            .await
            .unwrap();
        assert_eq!(value["messages"][0]["content"], "flat me");
    }
}
