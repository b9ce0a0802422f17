// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent lifecycle: the stop request.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::protocol::{ServerBody, ServerFrame};
use crate::state::AppState;

/// Handle an `agent_stop` frame.
///
/// A missing agent is not an error: the task finished (or was cleaned up)
/// before the stop arrived, so the client gets a completion-style
/// confirmation with `partial = false`.  For a live agent, `stop()` cancels
/// the in-flight turn; the resulting `agent_stopped{partial: true}` frame
/// flows through the installed event forwarder.
pub async fn handle_agent_stop(
    state: Arc<AppState>,
    session_id: String,
    task_id: String,
    out_tx: mpsc::UnboundedSender<ServerFrame>,
) {
    info!(task_id = %task_id, "stop requested");

    let Some(agent) = state.active_agents.get(&task_id).map(|a| Arc::clone(&a)) else {
        warn!(task_id = %task_id, "stop for unknown task, confirming as already completed");
        let frame = ServerFrame::new(
            session_id,
            ServerBody::AgentStopped {
                stopped_at: Utc::now(),
                result_summary: "任务已经结束或完成 / The task already finished.".to_string(),
                partial: false,
            },
        );
        let _ = out_tx.send(frame);
        return;
    };

    let summary = agent.stop().await;
    info!(task_id = %task_id, summary_len = summary.len(), "agent stop delivered");
    // The cancelled turn emits AgentStopped{partial: true} on the agent bus;
    // the forwarder owns the wire frame.  Cleanup (conversation save, agent
    // shutdown) runs in the chat handler's completion path.
}
