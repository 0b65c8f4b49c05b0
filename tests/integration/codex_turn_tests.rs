//! Codex turns against a scripted stand-in for `codex exec --json`.

#![cfg(unix)]

use std::time::Duration;

use serde_json::json;
use serial_test::serial;

use agent_sidecar::orchestrator::codex::CodexOrchestrator;
use agent_sidecar::orchestrator::{SessionStatus, TurnOptions};

use super::test_helpers::{joined_deltas, FakeAgent, HostHarness, CODEX_TURN};

fn orchestrator(host: &HostHarness, agent: &FakeAgent) -> CodexOrchestrator {
    CodexOrchestrator::new(host.bridge.clone(), agent.codex_settings())
}

#[tokio::test]
#[serial]
async fn turn_streams_reconciled_text_and_tool_counts() {
    let agent = FakeAgent::new("codex", CODEX_TURN);
    let mut host = HostHarness::new();
    let codex = orchestrator(&host, &agent);

    codex
        .start_turn("s1", "list the files", &TurnOptions::default())
        .await
        .expect("turn starts");
    let events = host.until_final().await;

    let deltas: Vec<&str> = events
        .iter()
        .filter_map(|e| e["textDelta"].as_str())
        .collect();
    assert_eq!(deltas, vec!["Hel", "lo", "Hi"]);

    let rewritten: Vec<&str> = events.iter().filter_map(|e| e["text"].as_str()).collect();
    assert_eq!(rewritten, vec!["Hi"], "only the rewrite carries full text");

    let last = events.last().expect("final event");
    assert_eq!(last["agentType"], "codex");
    assert_eq!(last["threadId"], "thread-1");
    assert_eq!(last["toolSummary"], json!({ "command_execution": 1 }));

    let prompts = agent.wait_for_log("prompts.log", 1).await;
    assert_eq!(prompts[0], "list the files");
}

#[tokio::test]
#[serial]
async fn second_turn_resumes_recorded_thread() {
    let agent = FakeAgent::new("codex", CODEX_TURN);
    let mut host = HostHarness::new();
    let codex = orchestrator(&host, &agent);

    codex
        .start_turn("s1", "first", &TurnOptions::default())
        .await
        .expect("first turn");
    host.until_final().await;

    codex
        .start_turn("s1", "second", &TurnOptions::default())
        .await
        .expect("second turn");
    let events = host.until_final().await;
    assert_eq!(joined_deltas(&events), "HelloHi");

    let args = agent.wait_for_log("args.log", 2).await;
    assert!(!args[0].contains("resume"), "first turn: {}", args[0]);
    assert!(
        args[1].contains("resume thread-1"),
        "second turn: {}",
        args[1]
    );
    assert_eq!(codex.info("s1").await.resume_id.as_deref(), Some("thread-1"));
}

#[tokio::test]
#[serial]
async fn reset_starts_a_new_thread() {
    let agent = FakeAgent::new("codex", CODEX_TURN);
    let mut host = HostHarness::new();
    let codex = orchestrator(&host, &agent);

    codex
        .start_turn("s1", "first", &TurnOptions::default())
        .await
        .expect("first turn");
    host.until_final().await;

    let options = TurnOptions {
        reset: true,
        ..TurnOptions::default()
    };
    codex
        .start_turn("s1", "again", &options)
        .await
        .expect("reset turn");
    host.until_final().await;

    let args = agent.wait_for_log("args.log", 2).await;
    assert!(!args[1].contains("resume"), "reset turn: {}", args[1]);
}

#[tokio::test]
#[serial]
async fn host_resume_id_is_used_for_a_fresh_session() {
    let agent = FakeAgent::new("codex", CODEX_TURN);
    let mut host = HostHarness::new();
    let codex = orchestrator(&host, &agent);

    let options = TurnOptions {
        resume: Some("thread-from-host".into()),
        ..TurnOptions::default()
    };
    codex
        .start_turn("s1", "pick up", &options)
        .await
        .expect("turn starts");
    host.until_final().await;

    let args = agent.wait_for_log("args.log", 1).await;
    assert!(args[0].contains("resume thread-from-host"), "{}", args[0]);
}

#[tokio::test]
#[serial]
async fn cancel_aborts_once_and_forgets_the_session() {
    let agent = FakeAgent::new(
        "codex",
        r#"
cat > /dev/null
echo '{"type":"thread.started","thread_id":"thread-slow"}'
exec sleep 30
"#,
    );
    let mut host = HostHarness::new();
    let codex = orchestrator(&host, &agent);

    codex
        .start_turn("s1", "take your time", &TurnOptions::default())
        .await
        .expect("turn starts");
    let started = host.next_notification("message").await;
    assert_eq!(started["threadId"], "thread-slow");

    assert!(codex.cancel("s1").await);
    let error = host.next_notification("queryError").await;
    assert_eq!(error["id"], "s1");
    assert_eq!(error["agentType"], "codex");
    assert_eq!(error["data"]["aborted"], true);

    host.assert_quiet("queryError", Duration::from_millis(300))
        .await;
    assert!(!codex.info("s1").await.exists);
    assert!(!codex.cancel("s1").await, "nothing left to cancel");
}

/// Logs its lifetime and hangs on the prompt `hang`; any other prompt
/// completes a turn.
const CODEX_LIFECYCLE: &str = r#"
echo "start $$" >> "$LOG/life.log"
trap 'kill $! 2>/dev/null; sleep 0.2; echo "end $$" >> "$LOG/life.log"; exit 143' TERM
prompt=$(cat)
echo '{"type":"thread.started","thread_id":"thread-1"}'
if [ "$prompt" = "hang" ]; then
  sleep 30 >/dev/null 2>&1 &
  wait
else
  echo '{"type":"item.completed","item":{"id":"item_0","type":"agent_message","text":"done"}}'
  echo '{"type":"turn.completed","usage":{"input_tokens":1,"output_tokens":1}}'
fi
"#;

/// A new prompt replaces a running turn: the old process has exited before
/// the new one starts, and the replaced turn ends without an error.
#[tokio::test]
#[serial]
async fn new_prompt_replaces_running_turn_after_it_exits() {
    let agent = FakeAgent::new("codex", CODEX_LIFECYCLE);
    let mut host = HostHarness::new();
    let codex = orchestrator(&host, &agent);

    codex
        .start_turn("s1", "hang", &TurnOptions::default())
        .await
        .expect("first turn");
    let started = host.next_notification("message").await;
    assert_eq!(started["threadId"], "thread-1");

    codex
        .start_turn("s1", "again", &TurnOptions::default())
        .await
        .expect("replacement turn");

    let mut events = Vec::new();
    loop {
        let msg = host.next().await;
        assert_ne!(msg["method"], "queryError", "replaced turn reported: {msg}");
        if msg["method"] == "message" {
            let done = msg["params"]["isFinal"] == true;
            events.push(msg["params"].clone());
            if done {
                break;
            }
        }
    }
    assert_eq!(joined_deltas(&events), "done");

    let life = agent.wait_for_log("life.log", 3).await;
    let events: Vec<&str> = life
        .iter()
        .map(|line| line.split_whitespace().next().unwrap_or_default())
        .collect();
    assert_eq!(events, vec!["start", "end", "start"], "{life:?}");
    assert_eq!(life[0].replace("start", "end"), life[1], "first process ended first");

    let args = agent.wait_for_log("args.log", 2).await;
    assert!(args[1].contains("resume thread-1"), "{}", args[1]);
    host.assert_quiet("queryError", Duration::from_millis(300))
        .await;
}

#[tokio::test]
#[serial]
async fn cancel_after_completion_emits_nothing() {
    let agent = FakeAgent::new("codex", CODEX_TURN);
    let mut host = HostHarness::new();
    let codex = orchestrator(&host, &agent);

    codex
        .start_turn("s1", "quick", &TurnOptions::default())
        .await
        .expect("turn starts");
    host.until_final().await;

    // The task clears its handle once the process has exited.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while codex.info("s1").await.live {
        assert!(tokio::time::Instant::now() < deadline, "turn never settled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(!codex.cancel("s1").await);
    host.assert_quiet("queryError", Duration::from_millis(300))
        .await;
    assert_eq!(codex.info("s1").await.status, Some(SessionStatus::Idle));
}

#[tokio::test]
#[serial]
async fn failed_turn_reports_backend_error() {
    let agent = FakeAgent::new(
        "codex",
        r#"
cat > /dev/null
echo '{"type":"thread.started","thread_id":"thread-2"}'
echo '{"type":"turn.failed","error":{"message":"rate limited"}}'
"#,
    );
    let mut host = HostHarness::new();
    let codex = orchestrator(&host, &agent);

    codex
        .start_turn("s1", "hello", &TurnOptions::default())
        .await
        .expect("turn starts");
    host.until_final().await;

    let error = host.next_notification("queryError").await;
    assert_eq!(error["agentType"], "codex");
    assert!(
        error["error"].as_str().expect("error text").contains("rate limited"),
        "{error}"
    );
    assert!(error.get("data").is_none());
}

#[tokio::test]
#[serial]
async fn exit_without_terminal_event_is_an_error() {
    let agent = FakeAgent::new(
        "codex",
        r#"
cat > /dev/null
echo "model overloaded" >&2
exit 3
"#,
    );
    let mut host = HostHarness::new();
    let codex = orchestrator(&host, &agent);

    codex
        .start_turn("s1", "hello", &TurnOptions::default())
        .await
        .expect("turn starts");

    let error = host.next_notification("queryError").await;
    let text = error["error"].as_str().expect("error text");
    assert!(
        text.contains("codex exited") && text.contains("without finishing the turn"),
        "{text}"
    );
}

#[tokio::test]
async fn missing_binary_fails_to_start() {
    let host = HostHarness::new();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut settings = FakeAgent::new("codex", "exit 0").codex_settings();
    settings.binary = dir.path().join("no-such-codex");
    let codex = CodexOrchestrator::new(host.bridge.clone(), settings);

    let result = codex
        .start_turn("s1", "hello", &TurnOptions::default())
        .await;
    assert!(result.is_err());
    assert!(!codex.info("s1").await.live);
}

#[tokio::test]
async fn unknown_permission_mode_is_rejected() {
    let host = HostHarness::new();
    let agent = FakeAgent::new("codex", CODEX_TURN);
    let codex = orchestrator(&host, &agent);

    let options = TurnOptions {
        permission_mode: Some("yolo".into()),
        ..TurnOptions::default()
    };
    let result = codex.start_turn("s1", "hello", &options).await;
    assert!(result.is_err());
    assert!(agent.log("args.log").is_empty(), "nothing was spawned");
}
