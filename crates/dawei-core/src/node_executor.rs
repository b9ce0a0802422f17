// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Runs one agent turn: model call → streamed events → sequential tool
//! dispatch → repeat, until a completion without tool calls (or a stop, a
//! guard, or the step cap) ends the turn.
//!
//! Tool calls are dispatched strictly sequentially.  Parallel dispatch would
//! make the duplicate-call window (last three assistant tool calls)
//! meaningless, so it stays off.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dawei_model::{
    CompletionRequest, LlmClient, Message, StreamEvent, ToolCall, Usage,
};
use dawei_store::Conversation;
use dawei_tools::{ToolEvent, ToolExecutor, ToolRegistry};

use crate::{AgentEvent, EventBus, TaskGraph, TaskStatus};

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEnd {
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub end: TurnEnd,
    pub summary: String,
    pub tools_used: Vec<String>,
}

/// The turn-level result of one model stream.
struct StreamOutcome {
    content: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
    finish_reason: String,
    usage: Option<Usage>,
    cancelled: bool,
}

pub struct NodeExecutor {
    client: Arc<dyn LlmClient>,
    tool_executor: Arc<ToolExecutor>,
    registry: Arc<RwLock<ToolRegistry>>,
    conversation: Arc<Mutex<Option<Conversation>>>,
    graph: Arc<Mutex<TaskGraph>>,
    bus: Arc<EventBus>,
    global_bus: Arc<EventBus>,
    tool_events: Mutex<mpsc::UnboundedReceiver<ToolEvent>>,
    followups: Arc<DashMap<String, oneshot::Sender<String>>>,
    max_tool_rounds: u32,
    consecutive_mistake_limit: u32,
}

impl NodeExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn LlmClient>,
        tool_executor: Arc<ToolExecutor>,
        registry: Arc<RwLock<ToolRegistry>>,
        conversation: Arc<Mutex<Option<Conversation>>>,
        graph: Arc<Mutex<TaskGraph>>,
        bus: Arc<EventBus>,
        tool_events: mpsc::UnboundedReceiver<ToolEvent>,
        followups: Arc<DashMap<String, oneshot::Sender<String>>>,
        max_tool_rounds: u32,
        consecutive_mistake_limit: u32,
    ) -> Self {
        Self {
            client,
            tool_executor,
            registry,
            conversation,
            graph,
            bus,
            global_bus: crate::global_bus(),
            tool_events: Mutex::new(tool_events),
            followups,
            max_tool_rounds,
            consecutive_mistake_limit,
        }
    }

    /// Drive `node_id` to a terminal state.
    pub async fn run_node(
        &self,
        node_id: &str,
        mode: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<NodeOutcome> {
        let started = Instant::now();
        let description = {
            let mut graph = self.graph.lock().await;
            graph.update_status(node_id, TaskStatus::Running)?;
            graph.get(node_id).map(|n| n.description.clone()).unwrap_or_default()
        };
        self.bus
            .emit(AgentEvent::TaskNodeStart {
                task_node_id: node_id.to_string(),
                description,
            })
            .await;

        let mut rounds = 0u32;
        let mut mistakes = 0u32;
        let mut tools_used: Vec<String> = Vec::new();
        let mut summary = String::new();
        let mut tool_event_rx = self.tool_events.lock().await;

        let end = loop {
            if cancel.is_cancelled() {
                break TurnEnd::Stopped;
            }
            rounds += 1;
            if rounds > self.max_tool_rounds {
                self.emit_error("STEP_CAP_EXCEEDED", "maximum tool rounds reached", false).await;
                self.emit_synthetic_complete("error").await;
                break TurnEnd::Failed;
            }
            if rounds > 1 {
                self.bus
                    .emit(AgentEvent::TaskNodeProgress {
                        task_node_id: node_id.to_string(),
                        progress: (rounds - 1) as f32 / self.max_tool_rounds as f32 * 100.0,
                        status: TaskStatus::Running.as_str().to_string(),
                        message: format!("tool round {}", rounds - 1),
                        data: serde_json::json!({ "round": rounds - 1 }),
                    })
                    .await;
            }

            let outcome = match self.stream_one_turn(mode, cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.emit_error("LLM_REQUEST_FAILED", &e.to_string(), true).await;
                    self.emit_synthetic_complete("error").await;
                    break TurnEnd::Failed;
                }
            };
            if outcome.cancelled {
                if !outcome.content.is_empty() {
                    self.push_message(Message::assistant(&outcome.content)).await;
                    summary = outcome.content.clone();
                }
                break TurnEnd::Stopped;
            }

            if outcome.tool_calls.is_empty() {
                // Plain completion: finalize the assistant message and stop.
                if !outcome.content.is_empty() {
                    self.push_message(Message::assistant(&outcome.content)).await;
                    summary = outcome.content.clone();
                }
                break TurnEnd::Completed;
            }

            // Tool round: the assistant message carries the calls, results
            // follow as tool-role messages.
            self.push_message(Message::assistant_with_tool_calls(
                &outcome.content,
                outcome.tool_calls.clone(),
            ))
            .await;
            if !outcome.content.is_empty() {
                summary = outcome.content.clone();
            }

            if self.conversation_has_repeated_call().await {
                self.emit_error(
                    "DUPLICATE_TOOL_CALL",
                    "the same tool was called with identical arguments three times in a row",
                    false,
                )
                .await;
                self.emit_synthetic_complete("error").await;
                break TurnEnd::Failed;
            }

            let mut round_had_success = false;
            let mut round_had_error = false;
            let mut completed_via_tool: Option<String> = None;

            for call in &outcome.tool_calls {
                if cancel.is_cancelled() {
                    break;
                }
                tools_used.push(call.function.name.clone());

                if call.function.name == "ask_followup_question" {
                    match self.handle_followup(call, cancel).await {
                        Some(reply) => {
                            self.push_message(Message::tool_result(&call.tool_call_id, &reply))
                                .await;
                            round_had_success = true;
                        }
                        None => break,
                    }
                    continue;
                }

                let output =
                    self.dispatch_tool_call(call, &mut tool_event_rx).await;
                self.push_message(Message::tool_result(&call.tool_call_id, &output.content))
                    .await;
                if output.is_error {
                    round_had_error = true;
                } else {
                    round_had_success = true;
                }

                if call.function.name == "attempt_completion" && !output.is_error {
                    completed_via_tool = Some(output.content.clone());
                    break;
                }
            }

            if cancel.is_cancelled() {
                break TurnEnd::Stopped;
            }
            if let Some(result) = completed_via_tool {
                summary = result;
                break TurnEnd::Completed;
            }

            if round_had_error && !round_had_success {
                mistakes += 1;
                if mistakes >= self.consecutive_mistake_limit {
                    self.emit_error(
                        "CONSECUTIVE_MISTAKES",
                        "too many consecutive failed tool rounds",
                        false,
                    )
                    .await;
                    self.emit_synthetic_complete("error").await;
                    break TurnEnd::Failed;
                }
            } else if round_had_success {
                mistakes = 0;
            }
        };

        drop(tool_event_rx);
        self.finalize_node(node_id, end, &summary, started).await;
        tools_used.dedup();
        Ok(NodeOutcome { end, summary, tools_used })
    }

    /// One model call: stream events to the bus, return the terminal state.
    async fn stream_one_turn(
        &self,
        mode: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StreamOutcome> {
        let messages = {
            let conversation = self.conversation.lock().await;
            conversation
                .as_ref()
                .map(|c| c.messages.clone())
                .ok_or_else(|| anyhow::anyhow!("no current conversation"))?
        };
        let tools = self.registry.read().await.schemas_for_mode(mode);

        self.bus
            .emit(AgentEvent::LlmApiRequest {
                provider: self.client.name().to_string(),
                model: self.client.model_name().to_string(),
                request_type: "chat_stream".to_string(),
            })
            .await;
        let call_started = Instant::now();

        let request = CompletionRequest {
            messages,
            tools,
            stream: true,
            temperature: None,
            max_tokens: None,
        };
        let mut stream = self.client.complete(request).await?;

        let mut outcome = StreamOutcome {
            content: String::new(),
            reasoning: String::new(),
            tool_calls: Vec::new(),
            finish_reason: "stop".to_string(),
            usage: None,
            cancelled: false,
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Stop requested mid-stream: what has been accumulated is
                    // the partial result; the turn terminates with "stop".
                    outcome.cancelled = true;
                    self.bus
                        .emit(AgentEvent::StreamComplete {
                            finish_reason: "stop".to_string(),
                            content: outcome.content.clone(),
                            reasoning: outcome.reasoning.clone(),
                            tool_calls: vec![],
                            usage: outcome.usage,
                        })
                        .await;
                    break;
                }
                event = stream.next() => event,
            };
            let Some(event) = event else { break };
            match event {
                Ok(StreamEvent::Reasoning { content, .. }) => {
                    outcome.reasoning.push_str(&content);
                    self.bus.emit(AgentEvent::StreamReasoning { content }).await;
                }
                Ok(StreamEvent::Content { content, .. }) => {
                    outcome.content.push_str(&content);
                    self.bus.emit(AgentEvent::StreamContent { content }).await;
                }
                Ok(StreamEvent::ToolCallDelta { tool_call, all_tool_calls, .. }) => {
                    self.bus
                        .emit(AgentEvent::StreamToolCall { tool_call, all_tool_calls })
                        .await;
                }
                Ok(StreamEvent::Usage { usage, .. }) => {
                    outcome.usage = Some(usage);
                    self.bus.emit(AgentEvent::StreamUsage { usage }).await;
                }
                Ok(StreamEvent::Complete {
                    finish_reason,
                    content,
                    reasoning,
                    tool_calls,
                    usage,
                    ..
                }) => {
                    // The complete event is authoritative for the turn.
                    outcome.content = content.clone();
                    outcome.reasoning = reasoning.clone();
                    outcome.tool_calls = tool_calls.clone();
                    outcome.finish_reason = finish_reason.clone();
                    outcome.usage = usage.or(outcome.usage);
                    self.bus
                        .emit(AgentEvent::StreamComplete {
                            finish_reason,
                            content,
                            reasoning,
                            tool_calls,
                            usage: outcome.usage,
                        })
                        .await;
                }
                Ok(StreamEvent::Error { message, details }) => {
                    self.bus
                        .emit(AgentEvent::Error {
                            code: "STREAM_ERROR".to_string(),
                            message,
                            recoverable: true,
                            details,
                        })
                        .await;
                }
                Err(e) => {
                    return Err(e.into());
                }
            }
        }

        self.bus
            .emit(AgentEvent::LlmApiComplete {
                provider: self.client.name().to_string(),
                model: self.client.model_name().to_string(),
                finish_reason: Some(outcome.finish_reason.clone()),
                usage: outcome.usage,
                duration_ms: call_started.elapsed().as_millis() as u64,
            })
            .await;
        Ok(outcome)
    }

    /// Dispatch one call through the executor while forwarding its events in
    /// order.  The select keeps start/progress events flowing while the tool
    /// runs.
    async fn dispatch_tool_call(
        &self,
        call: &ToolCall,
        tool_event_rx: &mut mpsc::UnboundedReceiver<ToolEvent>,
    ) -> dawei_tools::ToolOutput {
        let mut execution = Box::pin(self.tool_executor.execute(call));
        let mut rx_open = true;
        let output = loop {
            tokio::select! {
                biased;
                event = tool_event_rx.recv(), if rx_open => {
                    match event {
                        Some(event) => self.forward_tool_event(event).await,
                        None => rx_open = false,
                    }
                }
                output = &mut execution => break output,
            }
        };
        // Drain whatever the execution left behind (its Result event at
        // minimum).
        while let Ok(event) = tool_event_rx.try_recv() {
            self.forward_tool_event(event).await;
        }
        output
    }

    async fn forward_tool_event(&self, event: ToolEvent) {
        let agent_event = match event {
            ToolEvent::Start { tool_call_id, tool_name, tool_input } => AgentEvent::ToolCallStart {
                tool_name,
                tool_input,
                tool_call_id,
            },
            ToolEvent::Progress { tool_call_id, tool_name, message, percentage } => {
                AgentEvent::ToolCallProgress { tool_name, message, percentage, tool_call_id }
            }
            ToolEvent::Result { tool_call_id, tool_name, result, is_error, execution_time } => {
                AgentEvent::ToolCallResult {
                    tool_name,
                    result,
                    is_error,
                    execution_time_ms: execution_time.as_millis() as u64,
                    tool_call_id,
                }
            }
        };
        self.bus.emit(agent_event.clone()).await;
        // Tool execution events also land on the process-global bus.
        self.global_bus.emit(agent_event).await;
    }

    /// Publish the followup question and suspend until the session delivers
    /// the reply (or the turn is stopped).
    async fn handle_followup(&self, call: &ToolCall, cancel: &CancellationToken) -> Option<String> {
        let args: Value =
            serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
        let question = args["question"].as_str().unwrap_or("").to_string();
        let suggestions: Vec<String> = args["suggestions"]
            .as_array()
            .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
            .unwrap_or_default();

        let (tx, rx) = oneshot::channel();
        self.followups.insert(call.tool_call_id.clone(), tx);
        self.bus
            .emit(AgentEvent::FollowupQuestion {
                question,
                suggestions,
                tool_call_id: call.tool_call_id.clone(),
            })
            .await;
        debug!(tool_call_id = %call.tool_call_id, "turn suspended on followup question");

        let reply = tokio::select! {
            _ = cancel.cancelled() => None,
            reply = rx => reply.ok(),
        };
        self.followups.remove(&call.tool_call_id);
        reply
    }

    async fn conversation_has_repeated_call(&self) -> bool {
        let conversation = self.conversation.lock().await;
        conversation.as_ref().map(|c| c.has_repeated_tool_call()).unwrap_or(false)
    }

    async fn push_message(&self, message: Message) {
        let mut conversation = self.conversation.lock().await;
        if let Some(conversation) = conversation.as_mut() {
            conversation.push(message);
        }
    }

    async fn emit_error(&self, code: &str, message: &str, recoverable: bool) {
        warn!(code, message, "turn error");
        self.bus
            .emit(AgentEvent::Error {
                code: code.to_string(),
                message: message.to_string(),
                recoverable,
                details: None,
            })
            .await;
    }

    /// The terminal stream event for turns that end outside a model stream.
    async fn emit_synthetic_complete(&self, finish_reason: &str) {
        self.bus
            .emit(AgentEvent::StreamComplete {
                finish_reason: finish_reason.to_string(),
                content: String::new(),
                reasoning: String::new(),
                tool_calls: vec![],
                usage: None,
            })
            .await;
    }

    async fn finalize_node(
        &self,
        node_id: &str,
        end: TurnEnd,
        summary: &str,
        started: Instant,
    ) {
        let status = match end {
            TurnEnd::Completed => TaskStatus::Completed,
            TurnEnd::Stopped => TaskStatus::Cancelled,
            TurnEnd::Failed => TaskStatus::Failed,
        };
        {
            let mut graph = self.graph.lock().await;
            if let Err(e) = graph.update_status(node_id, status) {
                warn!(node_id, error = %e, "node status finalization failed");
            }
        }
        if end == TurnEnd::Completed {
            self.bus
                .emit(AgentEvent::TaskNodeComplete {
                    task_node_id: node_id.to_string(),
                    result: summary.to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                })
                .await;
        }
        info!(node_id, end = ?end, "node finished");
    }
}
