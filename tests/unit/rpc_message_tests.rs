//! Unit tests for wire message classification and rendering.

use serde_json::json;

use agent_sidecar::rpc::message::{HANDLER_FAILED, METHOD_NOT_FOUND};
use agent_sidecar::rpc::{Message, RequestId, RpcError};
use agent_sidecar::AppError;

// ── Classification ──────────────────────────────────────────────────────────

#[test]
fn method_and_id_classify_as_call() {
    let msg = Message::classify(json!({"id": 1, "method": "echo", "params": {"text": "hi"}}))
        .expect("valid call");
    assert_eq!(
        msg,
        Message::Call {
            id: RequestId::Number(1),
            method: "echo".into(),
            params: Some(json!({"text": "hi"})),
        }
    );
}

#[test]
fn method_without_id_classifies_as_notification() {
    let msg = Message::classify(json!({"method": "log", "params": {"msg": "x"}})).expect("valid");
    assert!(matches!(msg, Message::Notification { ref method, .. } if method == "log"));
}

/// A `null` id is treated the same as an absent one.
#[test]
fn null_id_counts_as_absent() {
    let msg = Message::classify(json!({"id": null, "method": "log"})).expect("valid");
    assert!(matches!(msg, Message::Notification { .. }));
}

#[test]
fn null_params_are_dropped() {
    let msg = Message::classify(json!({"id": "a", "method": "m", "params": null})).expect("valid");
    assert!(matches!(msg, Message::Call { params: None, .. }));
}

#[test]
fn id_without_method_classifies_as_response() {
    let msg = Message::classify(json!({"id": "abc", "result": 5})).expect("valid");
    assert_eq!(
        msg,
        Message::Response {
            id: RequestId::String("abc".into()),
            outcome: Ok(json!(5)),
        }
    );
}

#[test]
fn response_without_result_resolves_to_null() {
    let msg = Message::classify(json!({"id": 3})).expect("valid");
    assert_eq!(
        msg,
        Message::Response {
            id: RequestId::Number(3),
            outcome: Ok(serde_json::Value::Null),
        }
    );
}

#[test]
fn error_object_is_parsed() {
    let msg = Message::classify(json!({
        "id": 2,
        "error": {"code": -32601, "message": "method not found: nope"}
    }))
    .expect("valid");
    let Message::Response { outcome, .. } = msg else {
        panic!("expected response");
    };
    let err = outcome.expect_err("error outcome");
    assert_eq!(err.code, METHOD_NOT_FOUND);
    assert_eq!(err.message, "method not found: nope");
}

/// Peers that answer with a bare string error still produce a usable error.
#[test]
fn non_object_error_falls_back_to_handler_failed() {
    let msg = Message::classify(json!({"id": 2, "error": "boom"})).expect("valid");
    let Message::Response { outcome, .. } = msg else {
        panic!("expected response");
    };
    let err = outcome.expect_err("error outcome");
    assert_eq!(err.code, HANDLER_FAILED);
    assert_eq!(err.message, "\"boom\"");
}

#[test]
fn neither_method_nor_id_is_rejected() {
    let err = Message::classify(json!({"params": {}})).expect_err("must reject");
    assert!(matches!(err, AppError::Rpc(_)));
}

#[test]
fn non_object_is_rejected() {
    assert!(Message::classify(json!(42)).is_err());
    assert!(Message::classify(json!("call")).is_err());
}

#[test]
fn non_string_method_is_rejected() {
    assert!(Message::classify(json!({"id": 1, "method": 7})).is_err());
}

#[test]
fn fractional_or_boolean_ids_are_rejected() {
    assert!(Message::classify(json!({"id": 1.5, "result": 1})).is_err());
    assert!(Message::classify(json!({"id": true, "result": 1})).is_err());
}

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Numeric and string forms of the same id correlate.
#[test]
fn numeric_and_string_ids_share_a_key() {
    assert_eq!(RequestId::from(7).key(), RequestId::from("7").key());
    assert_ne!(RequestId::from(7).key(), RequestId::from("07").key());
}

// ── Rendering ───────────────────────────────────────────────────────────────

#[test]
fn rendered_messages_carry_protocol_version() {
    let value = Message::Notification {
        method: "log".into(),
        params: None,
    }
    .to_value();
    assert_eq!(value, json!({"jsonrpc": "2.0", "method": "log"}));
}

#[test]
fn success_response_renders_result() {
    let line = Message::Response {
        id: RequestId::Number(1),
        outcome: Ok(json!("hi")),
    }
    .to_line();
    let value: serde_json::Value = serde_json::from_str(&line).expect("json line");
    assert_eq!(value, json!({"jsonrpc": "2.0", "id": 1, "result": "hi"}));
    assert!(!line.contains('\n'));
}

#[test]
fn error_response_renders_error_object() {
    let value = Message::Response {
        id: RequestId::String("x".into()),
        outcome: Err(RpcError::method_not_found("nope")),
    }
    .to_value();
    assert_eq!(value["error"]["code"], json!(-32601));
    assert_eq!(value["error"]["message"], json!("method not found: nope"));
    assert!(value["error"].get("data").is_none());
    assert!(value.get("result").is_none());
}

#[test]
fn handler_failure_carries_error_text() {
    let err = RpcError::handler_failed(&AppError::Backend("spawn failed".into()));
    assert_eq!(err.code, HANDLER_FAILED);
    assert_eq!(err.message, "backend: spawn failed");
}

#[test]
fn rpc_error_converts_to_remote() {
    let err: AppError = RpcError::method_not_found("x").into();
    assert_eq!(
        err,
        AppError::Remote {
            code: METHOD_NOT_FOUND,
            message: "method not found: x".into(),
        }
    );
}
