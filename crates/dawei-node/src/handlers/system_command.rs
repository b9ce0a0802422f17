// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! System command handling for `!`-prefixed input.
//!
//! The command runs in the sandbox, its result is logged into the
//! conversation as a structured assistant message, and the frontend gets the
//! output as a normal streamed turn.  The agent pipeline is skipped.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use dawei_model::Message;
use dawei_store::Conversation;
use dawei_workspace::WorkspaceContext;

use crate::protocol::{ServerBody, ServerFrame};
use crate::sandbox::Sandbox;

pub async fn handle_system_command(
    context: &Arc<WorkspaceContext>,
    session_id: &str,
    command: &str,
    out_tx: &mpsc::UnboundedSender<ServerFrame>,
) {
    let command = command.trim();
    if command.is_empty() {
        crate::handlers::chat::send_error(out_tx, session_id, "EMPTY_COMMAND", "empty system command", None);
        return;
    }
    info!(command, "system command received");

    let sandbox = Sandbox::new(context.config().tools.command_allowlist.clone());
    let result = match sandbox.execute(command, context.workspace_path()).await {
        Ok(result) => result,
        Err(e) => {
            error!(command, error = %e, "sandbox rejected command");
            crate::handlers::chat::send_error(
                out_tx,
                session_id,
                "SANDBOX_EXECUTION_ERROR",
                &e.to_string(),
                Some(json!({ "command": command })),
            );
            return;
        }
    };

    let mut body = format!("$ {}\n", result.command);
    if !result.stdout.is_empty() {
        body.push_str(&result.stdout);
    }
    if !result.stderr.is_empty() {
        body.push_str("\n[stderr]\n");
        body.push_str(&result.stderr);
    }
    body.push_str(&format!(
        "\n[exit code {} in {:.2}s]",
        result.exit_code,
        result.execution_time.as_secs_f64()
    ));

    // Log the exchange into the conversation as a structured assistant
    // message so it is part of the session history.
    {
        let handle = context.conversations().current_handle();
        let mut slot = handle.lock().await;
        let conversation = slot.get_or_insert_with(|| {
            Conversation::new(
                Uuid::new_v4().to_string(),
                format!("!{command}"),
                &context.config().agent.mode,
                "system-command",
            )
        });
        conversation.push(Message::user(format!("!{command}")));
        conversation.push(Message::assistant(body.clone()));
    }
    if let Err(e) = context.conversations().save_now().await {
        error!(error = %e, "conversation save after system command failed");
    }

    let _ = out_tx.send(ServerFrame::new(
        session_id,
        ServerBody::StreamContent { content: body.clone() },
    ));
    let _ = out_tx.send(ServerFrame::new(
        session_id,
        ServerBody::StreamComplete {
            finish_reason: if result.exit_code == 0 { "stop" } else { "error" }.to_string(),
            content: body,
            reasoning: String::new(),
            tool_calls: vec![],
            usage: None,
        },
    ));
}
