//! Unit tests for `AppError` rendering and conversions.

use agent_sidecar::AppError;

#[test]
fn display_uses_lowercase_category_prefix() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Io("broken pipe".into()), "io: broken pipe"),
        (AppError::Rpc("bad frame".into()), "rpc: bad frame"),
        (AppError::Timeout("slow".into()), "timeout: slow"),
        (AppError::PeerStopped, "peer stopped"),
        (AppError::MethodNotFound("x".into()), "method not found: x"),
        (
            AppError::Remote {
                code: -32601,
                message: "nope".into(),
            },
            "remote error -32601: nope",
        ),
        (AppError::Backend("exit 1".into()), "backend: exit 1"),
        (AppError::Aborted, "aborted by user"),
        (AppError::NotFound("s1".into()), "not found: s1"),
        (AppError::InvalidParams("id".into()), "invalid params: id"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn only_aborted_is_an_abort() {
    assert!(AppError::Aborted.is_abort());
    assert!(!AppError::Backend("aborted".into()).is_abort());
    assert!(!AppError::PeerStopped.is_abort());
}

#[test]
fn io_error_converts_to_io() {
    let err: AppError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
    assert_eq!(err, AppError::Io("pipe".into()));
}

#[test]
fn json_error_converts_to_rpc() {
    let json_err = serde_json::from_str::<serde_json::Value>("{").expect_err("invalid");
    let err: AppError = json_err.into();
    assert!(matches!(err, AppError::Rpc(ref msg) if msg.starts_with("malformed json")));
}
