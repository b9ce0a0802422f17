// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-client WebSocket session.
//!
//! One session per connected browser.  Inbound frames dispatch to the
//! handlers; outbound frames flow through an unbounded queue so every event
//! handler's frames are sent in generation order (FIFO per session).  On
//! disconnect the session's handler registrations are detached — running
//! agents continue, their remaining events are discarded.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::handlers::{handle_agent_stop, handle_followup_response, handle_user_message};
use crate::protocol::{ClientBody, ClientFrame, ServerBody, ServerFrame};
use crate::state::AppState;

pub async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4().to_string();
    info!(session_id = %session_id, "websocket session connected");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();

    loop {
        tokio::select! {
            // Incoming frame from the browser.
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => {
                                dispatch(&state, &session_id, frame, &out_tx).await;
                            }
                            Err(e) => {
                                warn!(session_id = %session_id, error = %e, "invalid client frame");
                                let frame = ServerFrame::new(
                                    session_id.clone(),
                                    ServerBody::Error {
                                        code: "INVALID_MESSAGE".to_string(),
                                        message: format!("invalid JSON frame: {e}"),
                                        recoverable: true,
                                        details: None,
                                    },
                                );
                                let _ = out_tx.send(frame);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(session_id = %session_id, error = %e, "websocket recv error");
                        break;
                    }
                }
            }
            // Outgoing frame; the queue preserves emission order.
            outgoing = out_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        match serde_json::to_string(&frame) {
                            Ok(json) => {
                                if socket.send(Message::Text(json)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "frame serialization failed"),
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Detach this session's event handlers; running agents keep going and
    // their completions are discarded unless explicitly stopped.
    state.detach_session(&session_id).await;
    info!(session_id = %session_id, "websocket session disconnected");
}

async fn dispatch(
    state: &Arc<AppState>,
    session_id: &str,
    frame: ClientFrame,
    out_tx: &mpsc::UnboundedSender<ServerFrame>,
) {
    match frame.body {
        ClientBody::UserMessage { content, metadata, user_ui_context } => {
            // Chat turns run detached so the session loop stays responsive
            // to stop and followup frames.
            let state = Arc::clone(state);
            let session_id = session_id.to_string();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                handle_user_message(state, session_id, content, metadata, user_ui_context, out_tx)
                    .await;
            });
        }
        ClientBody::FollowupResponse { task_id, tool_call_id, response } => {
            handle_followup_response(
                Arc::clone(state),
                session_id.to_string(),
                task_id,
                tool_call_id,
                response,
                out_tx.clone(),
            )
            .await;
        }
        ClientBody::AgentStop { task_id } => {
            handle_agent_stop(
                Arc::clone(state),
                session_id.to_string(),
                task_id,
                out_tx.clone(),
            )
            .await;
        }
    }
}
