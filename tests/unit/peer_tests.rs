//! Unit tests for call correlation and inbound dispatch on [`Peer`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};

use agent_sidecar::rpc::Peer;
use agent_sidecar::{AppError, Result};

const LONG: Duration = Duration::from_secs(5);

async fn next_line(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("outbound line in time")
        .expect("outbound channel open");
    serde_json::from_str(&line).expect("outbound line is json")
}

async fn echo(params: Option<Value>) -> Result<Value> {
    Ok(params
        .and_then(|p| p.get("text").cloned())
        .unwrap_or(Value::Null))
}

async fn fail(_params: Option<Value>) -> Result<Value> {
    Err(AppError::Backend("handler exploded".into()))
}

// ── Scenario: echo ──────────────────────────────────────────────────────────

/// `("echo", {"text":"hi"})` goes out as id 1, the far side answers
/// `{"id":1,"result":"hi"}`, and the call resolves with `"hi"`.
#[tokio::test]
async fn echo_call_round_trips_between_two_peers() {
    let (caller, mut caller_rx) = Peer::channel(LONG);
    let (callee, mut callee_rx) = Peer::channel(LONG);
    callee.register_method("echo", echo).await;

    let call = tokio::spawn({
        let caller = caller.clone();
        async move { caller.call("echo", Some(json!({"text": "hi"}))).await }
    });

    let request = next_line(&mut caller_rx).await;
    assert_eq!(request["id"], json!(1));
    assert_eq!(request["method"], json!("echo"));
    callee.on_line(&request.to_string()).await;

    let response = next_line(&mut callee_rx).await;
    assert_eq!(response["id"], json!(1));
    assert_eq!(response["result"], json!("hi"));
    caller.on_line(&response.to_string()).await;

    let result = call.await.expect("task").expect("call succeeds");
    assert_eq!(result, json!("hi"));
    assert_eq!(caller.pending_count().await, 0);
}

// ── Scenario: log ───────────────────────────────────────────────────────────

/// A notification runs its handler and produces no response.
#[tokio::test]
async fn notification_runs_handler_without_response() {
    let (peer, mut rx) = Peer::channel(LONG);
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    peer.register_method("log", move |params| {
        let seen_tx = seen_tx.clone();
        async move {
            let _ = seen_tx.send(params.unwrap_or(Value::Null));
            Ok::<_, AppError>(Value::Null)
        }
    })
    .await;

    peer.on_line(r#"{"jsonrpc":"2.0","method":"log","params":{"msg":"x"}}"#)
        .await;

    let seen = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .expect("handler ran")
        .expect("handler channel open");
    assert_eq!(seen, json!({"msg": "x"}));
    tokio::task::yield_now().await;
    assert!(rx.try_recv().is_err(), "notifications are never answered");
}

#[tokio::test]
async fn outbound_notification_has_no_id() {
    let (peer, mut rx) = Peer::channel(LONG);
    peer.notify("log", Some(json!({"msg": "x"})));
    let line = next_line(&mut rx).await;
    assert_eq!(line, json!({"jsonrpc": "2.0", "method": "log", "params": {"msg": "x"}}));
    assert_eq!(peer.pending_count().await, 0);
}

// ── Correlation ─────────────────────────────────────────────────────────────

/// Responses delivered out of order still reach the matching callers.
#[tokio::test]
async fn concurrent_calls_resolve_by_matching_id() {
    let (peer, mut rx) = Peer::channel(LONG);

    let first = tokio::spawn({
        let peer = peer.clone();
        async move { peer.call("a", None).await }
    });
    let first_id = next_line(&mut rx).await["id"].clone();
    let second = tokio::spawn({
        let peer = peer.clone();
        async move { peer.call("b", None).await }
    });
    let second_id = next_line(&mut rx).await["id"].clone();
    assert_ne!(first_id, second_id);

    peer.on_line(&json!({"id": second_id, "result": "second"}).to_string())
        .await;
    peer.on_line(&json!({"id": first_id, "result": "first"}).to_string())
        .await;

    assert_eq!(first.await.unwrap().unwrap(), json!("first"));
    assert_eq!(second.await.unwrap().unwrap(), json!("second"));
}

/// A response whose id is a string form of the numeric call id correlates.
#[tokio::test]
async fn string_id_response_matches_numeric_call() {
    let (peer, mut rx) = Peer::channel(LONG);
    let call = tokio::spawn({
        let peer = peer.clone();
        async move { peer.call("a", None).await }
    });
    let id = next_line(&mut rx).await["id"].as_i64().expect("numeric id");

    peer.on_line(&json!({"id": id.to_string(), "result": true}).to_string())
        .await;
    assert_eq!(call.await.unwrap().unwrap(), json!(true));
}

#[tokio::test]
async fn error_response_surfaces_as_remote_error() {
    let (peer, mut rx) = Peer::channel(LONG);
    let call = tokio::spawn({
        let peer = peer.clone();
        async move { peer.call("a", None).await }
    });
    let id = next_line(&mut rx).await["id"].clone();
    peer.on_line(&json!({"id": id, "error": {"code": -32000, "message": "nope"}}).to_string())
        .await;

    let err = call.await.unwrap().expect_err("remote error");
    assert_eq!(
        err,
        AppError::Remote {
            code: -32000,
            message: "nope".into()
        }
    );
}

#[tokio::test]
async fn method_not_found_response_names_the_method() {
    let (peer, mut rx) = Peer::channel(LONG);
    let call = tokio::spawn({
        let peer = peer.clone();
        async move { peer.call("teleport", None).await }
    });
    let id = next_line(&mut rx).await["id"].clone();
    peer.on_line(
        &json!({"id": id, "error": {"code": -32601, "message": "method not found: teleport"}})
            .to_string(),
    )
    .await;

    let err = call.await.unwrap().expect_err("routing failure");
    assert_eq!(err, AppError::MethodNotFound("teleport".into()));
}

// ── Timeouts ────────────────────────────────────────────────────────────────

/// A call without a response times out, its entry is removed, and the late
/// response is ignored.
#[tokio::test]
async fn timed_out_call_removes_pending_entry() {
    let (peer, mut rx) = Peer::channel(Duration::from_millis(50));

    let err = peer.call("slow", None).await.expect_err("must time out");
    assert!(matches!(err, AppError::Timeout(ref msg) if msg.contains("slow")));
    assert_eq!(peer.pending_count().await, 0);

    let id = next_line(&mut rx).await["id"].clone();
    peer.on_line(&json!({"id": id, "result": "late"}).to_string())
        .await;
    assert_eq!(peer.pending_count().await, 0);
    assert!(rx.try_recv().is_err(), "a late response is not answered");
}

#[tokio::test]
async fn explicit_timeout_overrides_default() {
    let (peer, _rx) = Peer::channel(LONG);
    let started = std::time::Instant::now();
    let err = peer
        .call_with_timeout("slow", None, Duration::from_millis(30))
        .await
        .expect_err("must time out");
    assert!(matches!(err, AppError::Timeout(_)));
    assert!(started.elapsed() < LONG);
}

// ── Inbound dispatch ────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_method_yields_method_not_found() {
    let (peer, mut rx) = Peer::channel(LONG);
    peer.on_line(r#"{"id":9,"method":"nope"}"#).await;

    let response = next_line(&mut rx).await;
    assert_eq!(response["id"], json!(9));
    assert_eq!(response["error"]["code"], json!(-32601));
}

#[tokio::test]
async fn failing_handler_yields_handler_error() {
    let (peer, mut rx) = Peer::channel(LONG);
    peer.register_method("boom", fail).await;
    peer.on_line(r#"{"id":"q","method":"boom"}"#).await;

    let response = next_line(&mut rx).await;
    assert_eq!(response["id"], json!("q"));
    assert_eq!(response["error"]["code"], json!(-32000));
    assert_eq!(response["error"]["message"], json!("backend: handler exploded"));
}

/// Every element of a batch is dispatched even when one is malformed.
#[tokio::test]
async fn batch_dispatches_every_valid_element() {
    let (peer, mut rx) = Peer::channel(LONG);
    peer.register_method("echo", echo).await;

    peer.on_line(
        r#"[{"id":1,"method":"echo","params":{"text":"a"}},42,{"id":2,"method":"nope"},{"id":3,"method":"echo","params":{"text":"c"}}]"#,
    )
    .await;

    let mut by_id = std::collections::BTreeMap::new();
    for _ in 0..3 {
        let response = next_line(&mut rx).await;
        by_id.insert(response["id"].as_i64().expect("numeric id"), response);
    }
    assert_eq!(by_id[&1]["result"], json!("a"));
    assert_eq!(by_id[&2]["error"]["code"], json!(-32601));
    assert_eq!(by_id[&3]["result"], json!("c"));
    tokio::task::yield_now().await;
    assert!(rx.try_recv().is_err());
}

/// A handler that is still running does not hold up the response to an
/// outbound call arriving after it.
#[tokio::test]
async fn slow_handler_does_not_block_responses() {
    let (peer, mut rx) = Peer::channel(LONG);
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let release_rx = Arc::new(Mutex::new(Some(release_rx)));
    peer.register_method("slow", move |_params| {
        let release_rx = Arc::clone(&release_rx);
        async move {
            if let Some(rx) = release_rx.lock().await.take() {
                let _ = rx.await;
            }
            Ok::<_, AppError>(json!("done"))
        }
    })
    .await;

    let call = tokio::spawn({
        let peer = peer.clone();
        async move { peer.call("ping", None).await }
    });
    let id = next_line(&mut rx).await["id"].clone();

    peer.on_line(r#"{"id":"h1","method":"slow"}"#).await;
    peer.on_line(&json!({"id": id, "result": "pong"}).to_string())
        .await;

    let pong = tokio::time::timeout(Duration::from_millis(500), call)
        .await
        .expect("response not held up by the slow handler")
        .expect("task");
    assert_eq!(pong, Ok(json!("pong")));

    let _ = release_tx.send(());
    let slow = next_line(&mut rx).await;
    assert_eq!(slow["id"], json!("h1"));
    assert_eq!(slow["result"], json!("done"));
}

#[tokio::test]
async fn malformed_line_does_not_disturb_the_peer() {
    let (peer, mut rx) = Peer::channel(LONG);
    peer.register_method("echo", echo).await;

    peer.on_line("{not json").await;
    peer.on_line("   ").await;
    peer.on_line(r#"{"id":1,"method":"echo","params":{"text":"ok"}}"#)
        .await;

    assert_eq!(next_line(&mut rx).await["result"], json!("ok"));
}

#[tokio::test]
async fn later_registration_replaces_earlier() {
    let (peer, mut rx) = Peer::channel(LONG);
    peer.register_method("m", fail).await;
    peer.register_method("m", echo).await;

    peer.on_line(r#"{"id":1,"method":"m","params":{"text":"second"}}"#)
        .await;
    assert_eq!(next_line(&mut rx).await["result"], json!("second"));
}

// ── Shutdown ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_fails_pending_and_future_calls() {
    let (peer, mut rx) = Peer::channel(LONG);
    let call = tokio::spawn({
        let peer = peer.clone();
        async move { peer.call("a", None).await }
    });
    let _ = next_line(&mut rx).await;

    peer.shutdown().await;
    peer.shutdown().await;

    assert_eq!(call.await.unwrap(), Err(AppError::PeerStopped));
    assert_eq!(peer.call("b", None).await, Err(AppError::PeerStopped));
    assert!(peer.is_stopped());
}
