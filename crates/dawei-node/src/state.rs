// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use dawei_core::{Agent, EventBus, HandlerId, TaskManager};
use dawei_model::ProtectionStack;
use dawei_scheduler::SchedulerManager;
use dawei_workspace::WorkspaceService;

/// A handler registration to detach when a session disconnects.
pub struct Registration {
    pub bus: Arc<EventBus>,
    pub handler_id: HandlerId,
}

/// Shared server state.
pub struct AppState {
    pub workspaces: Arc<WorkspaceService>,
    pub task_manager: Arc<TaskManager>,
    pub scheduler: Arc<SchedulerManager>,
    /// Agents currently driving a task, keyed by task id.
    pub active_agents: Arc<DashMap<String, Arc<Agent>>>,
    /// task id → owning session id.
    pub task_sessions: Arc<DashMap<String, String>>,
    /// Per-session handler registrations, detached on disconnect.
    pub registrations: Arc<DashMap<String, Mutex<Vec<Registration>>>>,
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            workspaces: WorkspaceService::new(),
            task_manager: TaskManager::new(ProtectionStack::global()),
            scheduler: SchedulerManager::new(),
            active_agents: Arc::new(DashMap::new()),
            task_sessions: Arc::new(DashMap::new()),
            registrations: Arc::new(DashMap::new()),
        })
    }

    /// Track a handler registration for session-scoped cleanup.
    pub async fn track_registration(&self, session_id: &str, bus: Arc<EventBus>, handler_id: HandlerId) {
        self.registrations
            .entry(session_id.to_string())
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .await
            .push(Registration { bus, handler_id });
    }

    /// Detach every handler registered by a session.
    pub async fn detach_session(&self, session_id: &str) {
        if let Some((_, registrations)) = self.registrations.remove(session_id) {
            let registrations = registrations.into_inner();
            for registration in registrations {
                registration.bus.remove_any_handler(registration.handler_id).await;
            }
        }
        self.task_sessions.retain(|_, owner| owner != session_id);
    }
}
