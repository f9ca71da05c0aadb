// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end loop tests against scripted backends.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use runa_config::{Config, GpuPreference};
use runa_engine::mock::{ScriptedBackend, StallingBackend};
use runa_engine::InferEvent;

use crate::events::{Event, FinishStatus};
use crate::session::{Session, SessionConfig};

fn script_text(text: &str) -> Vec<InferEvent> {
    vec![
        InferEvent::Token(text.to_string()),
        InferEvent::Done {
            prefix_tokens: 16,
            hit_token_cap: false,
        },
    ]
}

fn tool_call_response(tool: &str, params: serde_json::Value) -> Vec<InferEvent> {
    let body = serde_json::json!({"tool": tool, "params": params});
    script_text(&format!("```json\n{body}\n```"))
}

async fn session_with(
    scripts: Vec<Vec<InferEvent>>,
    root: PathBuf,
) -> (Arc<Session>, Arc<ScriptedBackend>) {
    let backend = Arc::new(ScriptedBackend::new(scripts));
    let session = Arc::new(Session::new(
        SessionConfig {
            config: Config::default(),
            project_root: root,
        },
        Arc::clone(&backend) as _,
    ));
    session
        .load_model(
            &PathBuf::from("/models/Qwen3-0.6B-Q4_K_M.gguf"),
            GpuPreference::Cpu,
        )
        .await
        .unwrap();
    (session, backend)
}

async fn drive(session: &Arc<Session>, msg: &str) -> Vec<Event> {
    let mut rx = session.send_message(msg).unwrap();
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn finish_of(events: &[Event]) -> (&str, FinishStatus) {
    for e in events.iter().rev() {
        if let Event::Finish {
            full_response,
            status,
        } = e
        {
            return (full_response, *status);
        }
    }
    panic!("no Finish event in {events:?}");
}

// ── Scenario: greeting ────────────────────────────────────────────────────────

#[tokio::test]
async fn greeting_answers_without_tools() {
    let dir = tempfile::tempdir().unwrap();
    let (session, _backend) = session_with(
        vec![script_text("Hello! How can I help you today?")],
        dir.path().to_path_buf(),
    )
    .await;

    let events = drive(&session, "Hi").await;
    let (response, status) = finish_of(&events);
    assert_eq!(status, FinishStatus::Complete);
    assert!(!response.is_empty());
    assert!(response.len() < 200);
    // No tool ever executed.
    assert!(!events.iter().any(|e| matches!(e, Event::ToolExecuting { .. })));
    // Single iteration.
    let iterations = events
        .iter()
        .filter(|e| matches!(e, Event::IterationProgress { .. }))
        .count();
    assert_eq!(iterations, 1);
}

// ── Scenario: create a file ───────────────────────────────────────────────────

#[tokio::test]
async fn file_creation_executes_exactly_one_write() {
    let dir = tempfile::tempdir().unwrap();
    let (session, _backend) = session_with(
        vec![
            tool_call_response(
                "write_file",
                serde_json::json!({"file_path": "hello.txt", "content": "Hello, world!"}),
            ),
            script_text("Created hello.txt with the requested content."),
        ],
        dir.path().to_path_buf(),
    )
    .await;

    let events = drive(&session, "Create a file hello.txt with 'Hello, world!'").await;
    let (_, status) = finish_of(&events);
    assert_eq!(status, FinishStatus::Complete);

    let writes = events
        .iter()
        .filter(|e| matches!(e, Event::ToolExecuting { name, .. } if name == "write_file"))
        .count();
    assert_eq!(writes, 1);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("hello.txt")).unwrap(),
        "Hello, world!"
    );
}

// ── Scenario: path traversal is refused ───────────────────────────────────────

#[tokio::test]
async fn traversal_read_is_denied_and_loop_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let (session, _backend) = session_with(
        vec![
            tool_call_response(
                "read_file",
                serde_json::json!({"file_path": "../../etc/passwd"}),
            ),
            script_text("That path is outside the project, so I cannot read it."),
        ],
        dir.path().to_path_buf(),
    )
    .await;

    let events = drive(&session, "Read the file ../../etc/passwd please").await;
    let (_, status) = finish_of(&events);
    assert_eq!(status, FinishStatus::Complete);

    // The tool ran and was denied; no file content leaked.
    let denied = events.iter().any(|e| {
        matches!(e, Event::ToolResult { name, success, .. }
            if name == "read_file" && !success)
    });
    assert!(denied, "read_file must fail with a denial: {events:?}");
}

// ── Scenario: refusal rollback with temperature restore ───────────────────────

#[tokio::test]
async fn refusal_rolls_back_and_retries_with_lower_temperature() {
    let dir = tempfile::tempdir().unwrap();
    let (session, backend) = session_with(
        vec![
            script_text("I cannot help with that request."),
            script_text("Sure — here is a summary of the module layout."),
        ],
        dir.path().to_path_buf(),
    )
    .await;

    let events = drive(&session, "summarize the module layout of this repo").await;
    let (response, status) = finish_of(&events);
    assert_eq!(status, FinishStatus::Complete);
    assert!(response.contains("module layout"), "{response}");

    // The retry ran with the temperature lowered by 0.2 from Qwen3's 0.6.
    let retry_temp = backend
        .last_request
        .lock()
        .unwrap()
        .as_ref()
        .unwrap()
        .sampling
        .temperature;
    assert!((retry_temp - 0.4).abs() < 1e-5, "retry temp {retry_temp}");
}

#[tokio::test]
async fn temperature_is_restored_on_the_next_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let (session, backend) = session_with(
        vec![
            // Iteration 1: refusal → rollback → clean retry with a tool call.
            script_text("I cannot do that."),
            tool_call_response("list_directory", serde_json::json!({"path": "."})),
            // Iteration 2: final answer.
            script_text("The directory is empty."),
        ],
        dir.path().to_path_buf(),
    )
    .await;

    let events = drive(&session, "list the project directory contents").await;
    let (_, status) = finish_of(&events);
    assert_eq!(status, FinishStatus::Complete);

    // The last request (iteration 2) must be back at the profile default —
    // the rollback reduction must not leak forward.
    let final_temp = backend
        .last_request
        .lock()
        .unwrap()
        .as_ref()
        .unwrap()
        .sampling
        .temperature;
    assert!((final_temp - 0.6).abs() < 1e-5, "final temp {final_temp}");
}

// ── Scenario: cancel mid-turn ─────────────────────────────────────────────────

#[tokio::test]
async fn cancel_during_stalled_generation_finishes_within_a_second() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(StallingBackend);
    let session = Arc::new(Session::new(
        SessionConfig {
            config: Config::default(),
            project_root: dir.path().to_path_buf(),
        },
        backend as _,
    ));
    session
        .load_model(&PathBuf::from("/models/Qwen3-0.6B.gguf"), GpuPreference::Cpu)
        .await
        .unwrap();

    let mut rx = session.send_message("do something slow").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled_at = std::time::Instant::now();
    session.cancel();

    let mut finish: Option<FinishStatus> = None;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(2), rx.recv()).await
    {
        match event {
            Event::Finish { status, .. } => {
                finish = Some(status);
                break;
            }
            Event::Token(_) if finish.is_some() => {
                panic!("token after Finish");
            }
            _ => {}
        }
    }
    assert_eq!(finish, Some(FinishStatus::Cancelled));
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(1),
        "cancel must resolve within one second"
    );
}

// ── Busy gate ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_submissions_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(StallingBackend);
    let session = Arc::new(Session::new(
        SessionConfig {
            config: Config::default(),
            project_root: dir.path().to_path_buf(),
        },
        backend as _,
    ));
    session
        .load_model(&PathBuf::from("/models/Qwen3-0.6B.gguf"), GpuPreference::Cpu)
        .await
        .unwrap();

    let _rx = session.send_message("first").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = session.send_message("second");
    assert!(matches!(second, Err(crate::error::SessionError::Busy)));
    session.cancel();
}

// ── Chat gate: fabricated function array ─────────────────────────────────────

#[tokio::test]
async fn chat_task_fabricated_array_yields_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let (session, _backend) = session_with(
        vec![script_text(r#"[{"name": "greet_user", "arguments": {}}]"#)],
        dir.path().to_path_buf(),
    )
    .await;

    let events = drive(&session, "Hi").await;
    let (response, status) = finish_of(&events);
    assert_eq!(status, FinishStatus::Complete);
    assert!(response.is_empty(), "fabricated array must produce no output");
    assert!(!events.iter().any(|e| matches!(e, Event::ToolExecuting { .. })));
}

// ── Iteration cap ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn iteration_cap_triggers_wrapup_turn() {
    let dir = tempfile::tempdir().unwrap();
    // Every response calls a tool with fresh params so neither the breaker
    // nor stuck detection fires before the cap.
    let mut scripts: Vec<Vec<InferEvent>> = (0..10)
        .map(|i| {
            tool_call_response(
                "list_directory",
                serde_json::json!({"path": format!("{i}")}),
            )
        })
        .collect();
    scripts.push(script_text("Ran out of budget; here is where things stand."));

    let mut config = Config::default();
    config.agent.max_iterations = 3;
    let backend = Arc::new(ScriptedBackend::new(scripts));
    let session = Arc::new(Session::new(
        SessionConfig {
            config,
            project_root: dir.path().to_path_buf(),
        },
        Arc::clone(&backend) as _,
    ));
    session
        .load_model(&PathBuf::from("/models/Qwen3-0.6B.gguf"), GpuPreference::Cpu)
        .await
        .unwrap();

    let events = drive(&session, "explore every directory in this project").await;
    let (_, status) = finish_of(&events);
    assert_eq!(status, FinishStatus::IterationCap);
}

// ── Stuck detection ───────────────────────────────────────────────────────────

#[tokio::test]
async fn repeating_identical_calls_terminates_as_stuck() {
    let dir = tempfile::tempdir().unwrap();
    let same_call = || {
        tool_call_response(
            "list_directory",
            serde_json::json!({"path": "."}),
        )
    };
    let mut scripts: Vec<Vec<InferEvent>> = (0..10).map(|_| same_call()).collect();
    scripts.push(script_text("wrap-up summary"));
    scripts.push(script_text("wrap-up summary"));

    let (session, _backend) = session_with(scripts, dir.path().to_path_buf()).await;
    let events = drive(&session, "list the files in the project root").await;
    let (_, status) = finish_of(&events);
    assert_eq!(status, FinishStatus::Stuck);
}
