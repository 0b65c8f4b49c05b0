//! Unit tests for the host-facing bridge.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use agent_sidecar::orchestrator::bridge::{FrontendBridge, SurveyOutcome, SurveyQuestion};
use agent_sidecar::orchestrator::{AgentKind, ErrorEvent, MessageEvent};
use agent_sidecar::rpc::Peer;
use agent_sidecar::AppError;

fn bridge() -> (FrontendBridge, mpsc::UnboundedReceiver<String>) {
    let (peer, rx) = Peer::channel(Duration::from_secs(5));
    (FrontendBridge::new(peer, Duration::from_secs(5)), rx)
}

/// Answer the next outbound call with `reply(params)` and return the request.
fn answer_next(
    peer: Peer,
    mut rx: mpsc::UnboundedReceiver<String>,
    reply: fn(&Value) -> Value,
) -> JoinHandle<Value> {
    tokio::spawn(async move {
        let line = rx.recv().await.expect("outbound call");
        let request: Value = serde_json::from_str(&line).expect("json");
        let response = json!({"id": request["id"], "result": reply(&request["params"])});
        peer.on_line(&response.to_string()).await;
        request
    })
}

fn questions(n: usize) -> Vec<SurveyQuestion> {
    (0..n)
        .map(|i| SurveyQuestion {
            question: format!("Q{i}?"),
            options: vec!["yes".into(), "no".into()],
        })
        .collect()
}

// ── Notifications ───────────────────────────────────────────────────────────

#[tokio::test]
async fn message_event_is_sent_as_notification() {
    let (bridge, mut rx) = bridge();
    let mut event = MessageEvent::new("s1", AgentKind::Codex, json!({"type": "turn.started"}));
    event.text_delta = Some("Hi".into());
    bridge.emit_message(&event);

    let line: Value = serde_json::from_str(&rx.recv().await.expect("line")).expect("json");
    assert_eq!(line["method"], json!("message"));
    assert!(line.get("id").is_none());
    let params = &line["params"];
    assert_eq!(params["id"], json!("s1"));
    assert_eq!(params["type"], json!("message"));
    assert_eq!(params["agentType"], json!("codex"));
    assert_eq!(params["textDelta"], json!("Hi"));
    assert_eq!(params["isFinal"], json!(false));
    assert!(params.get("text").is_none());
    assert!(params.get("threadId").is_none());
}

#[tokio::test]
async fn abort_is_sent_as_query_error() {
    let (bridge, mut rx) = bridge();
    let event = ErrorEvent::aborted("s1", AgentKind::Claude);
    assert!(event.is_abort());
    bridge.emit_error(&event);

    let line: Value = serde_json::from_str(&rx.recv().await.expect("line")).expect("json");
    assert_eq!(line["method"], json!("queryError"));
    assert_eq!(
        line["params"],
        json!({
            "id": "s1",
            "type": "error",
            "agentType": "claude",
            "error": "aborted by user",
            "data": {"aborted": true}
        })
    );
}

#[tokio::test]
async fn backend_error_has_no_abort_marker() {
    let event = ErrorEvent::new("s1", AgentKind::Codex, &AppError::Backend("exit 2".into()));
    assert!(!event.is_abort());
    assert_eq!(event.error, "backend: exit 2");
    assert!(event.data.is_none());
}

#[tokio::test]
async fn plan_mode_notification_names_session() {
    let (bridge, mut rx) = bridge();
    bridge.notify_plan_mode("s9");
    let line: Value = serde_json::from_str(&rx.recv().await.expect("line")).expect("json");
    assert_eq!(line["method"], json!("enterPlanModeNotification"));
    assert_eq!(line["params"], json!({"sessionId": "s9"}));
}

// ── Plan approval ───────────────────────────────────────────────────────────

#[tokio::test]
async fn plan_approval_returns_host_decision() {
    let (bridge, rx) = bridge();
    let host = answer_next(bridge.peer().clone(), rx, |_| json!({"approved": true}));

    let approved = bridge
        .request_plan_approval("s1", &json!({"plan": "refactor"}))
        .await
        .expect("approval call");
    assert!(approved);

    let request = host.await.expect("host task");
    assert_eq!(request["method"], json!("exitPlanMode"));
    assert_eq!(
        request["params"],
        json!({"sessionId": "s1", "toolInput": {"plan": "refactor"}})
    );
}

#[tokio::test]
async fn plan_approval_defaults_to_rejected() {
    let (bridge, rx) = bridge();
    let _host = answer_next(bridge.peer().clone(), rx, |_| json!({}));
    let approved = bridge
        .request_plan_approval("s1", &Value::Null)
        .await
        .expect("approval call");
    assert!(!approved);
}

#[tokio::test]
async fn unanswered_plan_approval_times_out() {
    let (peer, _rx) = Peer::channel(Duration::from_secs(5));
    let bridge = FrontendBridge::new(peer, Duration::from_millis(30));
    let err = bridge
        .request_plan_approval("s1", &Value::Null)
        .await
        .expect_err("no answer");
    assert!(matches!(err, AppError::Timeout(_)));
}

// ── Surveys ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn survey_returns_one_answer_per_question() {
    let (bridge, rx) = bridge();
    let host = answer_next(bridge.peer().clone(), rx, |_| json!({"answers": ["yes", "no"]}));

    let outcome = bridge
        .ask_user_questions("s1", &questions(2))
        .await
        .expect("survey");
    assert_eq!(
        outcome,
        SurveyOutcome::Answered(vec!["yes".into(), "no".into()])
    );

    let request = host.await.expect("host task");
    assert_eq!(request["method"], json!("askUserQuestion"));
    assert_eq!(request["params"]["questions"][1]["question"], json!("Q1?"));
}

#[tokio::test]
async fn cancelled_sentinel_means_dismissed() {
    let (bridge, rx) = bridge();
    let _host = answer_next(bridge.peer().clone(), rx, |_| json!({"answers": ["__cancelled__"]}));
    let outcome = bridge
        .ask_user_questions("s1", &questions(3))
        .await
        .expect("survey");
    assert_eq!(outcome, SurveyOutcome::Cancelled);
}

#[tokio::test]
async fn answer_count_mismatch_is_an_error() {
    let (bridge, rx) = bridge();
    let _host = answer_next(bridge.peer().clone(), rx, |_| json!({"answers": ["only one"]}));
    let err = bridge
        .ask_user_questions("s1", &questions(2))
        .await
        .expect_err("mismatch");
    assert!(matches!(err, AppError::Rpc(_)));
}

#[tokio::test]
async fn survey_size_is_bounded() {
    let (bridge, mut rx) = bridge();
    assert!(matches!(
        bridge.ask_user_questions("s1", &[]).await,
        Err(AppError::InvalidParams(_))
    ));
    assert!(matches!(
        bridge.ask_user_questions("s1", &questions(5)).await,
        Err(AppError::InvalidParams(_))
    ));
    assert!(rx.try_recv().is_err(), "nothing is sent for an invalid survey");
}

// ── Diffs ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn diff_request_passes_file_and_stat() {
    let (bridge, rx) = bridge();
    let host = answer_next(bridge.peer().clone(), rx, |_| json!({"diff": "+added"}));

    let diff = bridge
        .workspace_diff("s1", Some("src/lib.rs"), true)
        .await
        .expect("diff");
    assert_eq!(diff, "+added");

    let request = host.await.expect("host task");
    assert_eq!(request["method"], json!("getDiff"));
    assert_eq!(
        request["params"],
        json!({"sessionId": "s1", "file": "src/lib.rs", "stat": true})
    );
}
