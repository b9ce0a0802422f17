// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent-loop integration tests against scripted model clients.

use std::sync::{Arc, Mutex as StdMutex};

use dawei_model::mock::{text_script, ScriptedClient};
use dawei_model::{ChunkMeta, LlmClient, StreamEvent, ToolCall};
use dawei_workspace::WorkspaceContext;

use crate::{Agent, AgentEvent, EventKind, TurnEnd};

async fn workspace(dir: &tempfile::TempDir) -> Arc<WorkspaceContext> {
    std::env::set_var("DAWEI_HOME", std::env::temp_dir().join("dawei-test-home"));
    let ws = dir.path().join("ws");
    std::fs::create_dir_all(&ws).unwrap();
    WorkspaceContext::initialize(&ws).await.unwrap()
}

/// Record the kind of every event emitted on the agent bus.
async fn record_events(agent: &Agent) -> Arc<StdMutex<Vec<EventKind>>> {
    let log = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    agent
        .bus()
        .add_any_handler(move |event| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().unwrap().push(event.kind());
                Ok(())
            })
        })
        .await;
    log
}

fn tool_call_script(call: &ToolCall) -> Vec<StreamEvent> {
    vec![
        StreamEvent::ToolCallDelta {
            tool_call: call.clone(),
            all_tool_calls: vec![call.clone()],
            meta: ChunkMeta::default(),
        },
        StreamEvent::Complete {
            finish_reason: "tool_calls".into(),
            content: String::new(),
            reasoning: String::new(),
            tool_calls: vec![call.clone()],
            usage: None,
            meta: ChunkMeta::default(),
        },
    ]
}

#[tokio::test]
async fn single_turn_emits_contractual_event_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(&dir).await;
    let client = Arc::new(ScriptedClient::always_text("Hi there"));
    let agent = Agent::create_with_client(ws, client, None).await.unwrap();
    let log = record_events(&agent).await;

    let outcome = agent.process_message("Hi").await.unwrap();
    assert_eq!(outcome.end, TurnEnd::Completed);
    assert_eq!(outcome.summary, "Hi there");

    let kinds = log.lock().unwrap().clone();
    let expected = [
        EventKind::TaskNodeStart,
        EventKind::LlmApiRequest,
        EventKind::StreamContent,
        EventKind::StreamUsage,
        EventKind::StreamComplete,
        EventKind::LlmApiComplete,
        EventKind::TaskNodeComplete,
        EventKind::AgentComplete,
    ];
    assert_eq!(kinds, expected, "contractual order violated: {kinds:?}");
    agent.shutdown().await;
}

#[tokio::test]
async fn tool_call_turn_round_trips_through_executor() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(&dir).await;
    let client = Arc::new(ScriptedClient::tool_then_text(
        "call_1",
        "get_time",
        "{}",
        "It's early 2026 UTC.",
    ));
    let agent = Agent::create_with_client(ws.clone(), client, None).await.unwrap();

    let events = Arc::new(StdMutex::new(Vec::<AgentEvent>::new()));
    {
        let sink = Arc::clone(&events);
        agent
            .bus()
            .add_any_handler(move |event| {
                let sink = Arc::clone(&sink);
                Box::pin(async move {
                    sink.lock().unwrap().push(event);
                    Ok(())
                })
            })
            .await;
    }

    let outcome = agent.process_message("what time is it?").await.unwrap();
    assert_eq!(outcome.end, TurnEnd::Completed);
    assert_eq!(outcome.summary, "It's early 2026 UTC.");
    assert_eq!(outcome.tools_used, vec!["get_time".to_string()]);

    let events = events.lock().unwrap();
    let start = events.iter().find_map(|e| match e {
        AgentEvent::ToolCallStart { tool_name, tool_call_id, .. } => {
            Some((tool_name.clone(), tool_call_id.clone()))
        }
        _ => None,
    });
    assert_eq!(start, Some(("get_time".to_string(), "call_1".to_string())));
    let result_ok = events.iter().any(|e| {
        matches!(e, AgentEvent::ToolCallResult { is_error: false, tool_name, .. } if tool_name == "get_time")
    });
    assert!(result_ok, "tool result event missing");

    // The conversation holds the full round trip: user, assistant+call,
    // tool result, final assistant.
    let handle = ws.conversations().current_handle();
    let conversation = handle.lock().await;
    let conversation = conversation.as_ref().unwrap();
    assert_eq!(conversation.messages.len(), 4);
    assert!(conversation.messages[1].tool_calls.is_some());
    assert_eq!(conversation.messages[2].tool_call_id.as_deref(), Some("call_1"));
    drop(conversation);
    agent.shutdown().await;
}

#[tokio::test]
async fn duplicate_tool_call_guard_aborts_without_further_llm_calls() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(&dir).await;

    let call = ToolCall::new("c", "get_time", "{}");
    // Three identical tool-call turns, plus a text script that must never be
    // consumed.
    let client: Arc<dyn LlmClient> = Arc::new(ScriptedClient::new(vec![
        tool_call_script(&call),
        tool_call_script(&call),
        tool_call_script(&call),
        text_script("UNREACHED"),
    ]));
    let agent = Agent::create_with_client(ws, Arc::clone(&client), None).await.unwrap();

    let errors = Arc::new(StdMutex::new(Vec::<String>::new()));
    {
        let sink = Arc::clone(&errors);
        agent
            .bus()
            .add_handler(EventKind::Error, move |event| {
                let sink = Arc::clone(&sink);
                Box::pin(async move {
                    if let AgentEvent::Error { code, .. } = event {
                        sink.lock().unwrap().push(code);
                    }
                    Ok(())
                })
            })
            .await;
    }

    let outcome = agent.process_message("loop forever").await.unwrap();
    assert_eq!(outcome.end, TurnEnd::Failed);
    assert!(errors.lock().unwrap().contains(&"DUPLICATE_TOOL_CALL".to_string()));
    agent.shutdown().await;
}

#[tokio::test]
async fn attempt_completion_ends_the_turn_with_its_result() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(&dir).await;
    let call = ToolCall::new("c1", "attempt_completion", r#"{"result":"all done"}"#);
    let client = Arc::new(ScriptedClient::new(vec![
        tool_call_script(&call),
        text_script("UNREACHED"),
    ]));
    let agent = Agent::create_with_client(ws, client, None).await.unwrap();

    let outcome = agent.process_message("finish it").await.unwrap();
    assert_eq!(outcome.end, TurnEnd::Completed);
    assert_eq!(outcome.summary, "all done");
    agent.shutdown().await;
}

#[tokio::test]
async fn followup_question_suspends_until_answer_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(&dir).await;
    let call = ToolCall::new(
        "fq1",
        "ask_followup_question",
        r#"{"question":"Which color?","suggestions":["red","blue"]}"#,
    );
    let client = Arc::new(ScriptedClient::new(vec![
        tool_call_script(&call),
        text_script("Blue it is."),
    ]));
    let agent = Agent::create_with_client(ws.clone(), client, None).await.unwrap();

    // Answer the followup as soon as the question event appears.
    let answering_agent = Arc::clone(&agent);
    agent
        .bus()
        .add_handler(EventKind::FollowupQuestion, move |event| {
            let agent = Arc::clone(&answering_agent);
            Box::pin(async move {
                if let AgentEvent::FollowupQuestion { tool_call_id, suggestions, question } = event
                {
                    assert_eq!(question, "Which color?");
                    assert_eq!(suggestions, vec!["red".to_string(), "blue".to_string()]);
                    // Deliver from a separate task; the turn is suspended
                    // inside this emit otherwise.
                    tokio::spawn(async move {
                        agent.deliver_followup(&tool_call_id, "blue".to_string()).await;
                    });
                }
                Ok(())
            })
        })
        .await;

    let outcome = agent.process_message("pick a color").await.unwrap();
    assert_eq!(outcome.end, TurnEnd::Completed);
    assert_eq!(outcome.summary, "Blue it is.");

    // The user's reply became the tool result for the followup call.
    let handle = ws.conversations().current_handle();
    let conversation = handle.lock().await;
    let reply = conversation
        .as_ref()
        .unwrap()
        .messages
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("fq1"))
        .and_then(|m| m.as_text().map(String::from));
    assert_eq!(reply.as_deref(), Some("blue"));
    drop(conversation);
    agent.shutdown().await;
}

#[tokio::test]
async fn skill_tools_are_discovered_and_loadable_by_the_model() {
    let dir = tempfile::tempdir().unwrap();
    // Seed a workspace skill before the context scans for tools.
    let skill_dir = dir.path().join("ws").join(".dawei").join("skills").join("release");
    std::fs::create_dir_all(&skill_dir).unwrap();
    std::fs::write(
        skill_dir.join("SKILL.md"),
        "---\nname: release\ndescription: Cut a release\n---\n\n## Checklist\n- tag\n",
    )
    .unwrap();
    let ws = workspace(&dir).await;

    let call = ToolCall::new("s1", "get_skill", r#"{"skill_name":"release"}"#);
    let client = Arc::new(ScriptedClient::new(vec![
        tool_call_script(&call),
        text_script("Loaded the release skill."),
    ]));
    let dyn_client: Arc<dyn LlmClient> = Arc::clone(&client) as Arc<dyn LlmClient>;
    let agent = Agent::create_with_client(ws.clone(), dyn_client, None).await.unwrap();

    let outcome = agent.process_message("how do we cut a release?").await.unwrap();
    assert_eq!(outcome.end, TurnEnd::Completed);
    assert_eq!(outcome.tools_used, vec!["get_skill".to_string()]);

    // The allow-set sent to the model advertised the skills tools.
    let request = client.last_request.lock().unwrap().clone().unwrap();
    let tool_names: Vec<&str> = request.tools.iter().map(|t| t.name.as_str()).collect();
    assert!(tool_names.contains(&"list_skills"));
    assert!(tool_names.contains(&"search_skills"));
    assert!(tool_names.contains(&"get_skill"));

    // The tool result delivered the skill's full instruction body.
    let handle = ws.conversations().current_handle();
    let conversation = handle.lock().await;
    let body = conversation
        .as_ref()
        .unwrap()
        .messages
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("s1"))
        .and_then(|m| m.as_text().map(String::from))
        .expect("tool result message");
    assert!(body.contains("## Checklist"));
    drop(conversation);
    agent.shutdown().await;
}

#[tokio::test]
async fn stop_before_processing_cancels_the_turn() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(&dir).await;
    let client = Arc::new(ScriptedClient::always_text("never seen"));
    let agent = Agent::create_with_client(ws, client, None).await.unwrap();

    // Stopping with no in-flight turn still yields a usable summary.
    let summary = agent.stop().await;
    assert!(summary.contains("stopped before any output"));
    agent.shutdown().await;
}

#[tokio::test]
async fn consecutive_failed_tool_rounds_abort_the_turn() {
    let dir = tempfile::tempdir().unwrap();
    let ws = workspace(&dir).await;
    // Unknown tool → every round is a failed round.  Vary the arguments so
    // the duplicate guard does not fire first.
    let scripts: Vec<_> = (0..4)
        .map(|i| {
            tool_call_script(&ToolCall::new(
                format!("c{i}"),
                "no_such_tool",
                format!(r#"{{"round":{i}}}"#),
            ))
        })
        .collect();
    let client = Arc::new(ScriptedClient::new(scripts));
    let agent = Agent::create_with_client(ws, client, None).await.unwrap();

    let errors = Arc::new(StdMutex::new(Vec::<String>::new()));
    {
        let sink = Arc::clone(&errors);
        agent
            .bus()
            .add_handler(EventKind::Error, move |event| {
                let sink = Arc::clone(&sink);
                Box::pin(async move {
                    if let AgentEvent::Error { code, .. } = event {
                        sink.lock().unwrap().push(code);
                    }
                    Ok(())
                })
            })
            .await;
    }

    let outcome = agent.process_message("try the unknown tool").await.unwrap();
    assert_eq!(outcome.end, TurnEnd::Failed);
    assert!(errors.lock().unwrap().contains(&"CONSECUTIVE_MISTAKES".to_string()));
    agent.shutdown().await;
}
