//! Wire message envelope.
//!
//! A decoded JSON object is classified by which of `method` and `id` it
//! carries:
//!
//! | `method` | `id` | Classified as              |
//! |----------|------|----------------------------|
//! | yes      | yes  | [`Message::Call`]          |
//! | yes      | no   | [`Message::Notification`]  |
//! | no       | yes  | [`Message::Response`]      |
//! | no       | no   | rejected                   |
//!
//! A `null` id counts as absent.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{AppError, Result};

/// Error code for a call naming an unregistered method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Error code for a call whose handler failed.
pub const HANDLER_FAILED: i64 = -32000;

/// Protocol version tag written on every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Call identifier: a string or an integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer identifier, as issued by this crate's peer.
    Number(i64),
    /// String identifier, as some remote peers issue.
    String(String),
}

impl RequestId {
    /// Canonical correlation key.
    ///
    /// Numeric ids render in decimal so that `7` and `"7"` correlate.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::String(s) => s.clone(),
        }
    }

    fn from_value(value: &Value) -> Result<Option<Self>> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(Self::String(s.clone()))),
            Value::Number(n) => n
                .as_i64()
                .map(|n| Some(Self::Number(n)))
                .ok_or_else(|| AppError::Rpc(format!("unsupported numeric id: {n}"))),
            other => Err(AppError::Rpc(format!("unsupported id type: {other}"))),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::String(s) => Value::from(s.as_str()),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Error for an unregistered method.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("method not found: {method}"),
            data: None,
        }
    }

    /// Error for a handler that returned a failure.
    #[must_use]
    pub fn handler_failed(err: &AppError) -> Self {
        Self {
            code: HANDLER_FAILED,
            message: err.to_string(),
            data: None,
        }
    }
}

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        Self::Remote {
            code: err.code,
            message: err.message,
        }
    }
}

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A call expecting exactly one response.
    Call {
        /// Correlation identifier.
        id: RequestId,
        /// Target method.
        method: String,
        /// Optional parameters.
        params: Option<Value>,
    },
    /// A one-way message; never answered.
    Notification {
        /// Target method.
        method: String,
        /// Optional parameters.
        params: Option<Value>,
    },
    /// The answer to an earlier call.
    Response {
        /// Identifier of the call being answered.
        id: RequestId,
        /// Result value or error object.
        outcome: std::result::Result<Value, RpcError>,
    },
}

impl Message {
    /// Classify one JSON value as a wire message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` when the value is not an object, when
    /// `method` is not a string, when `id` has an unsupported type, or when
    /// the object carries neither `method` nor `id`.
    pub fn classify(value: Value) -> Result<Self> {
        let Value::Object(mut object) = value else {
            return Err(AppError::Rpc("message is not a json object".into()));
        };

        let method = match object.remove("method") {
            None | Some(Value::Null) => None,
            Some(Value::String(method)) => Some(method),
            Some(other) => {
                return Err(AppError::Rpc(format!("method must be a string, got {other}")));
            }
        };
        let id = match object.get("id") {
            Some(raw) => RequestId::from_value(raw)?,
            None => None,
        };
        let params = object.remove("params").filter(|p| !p.is_null());

        match (method, id) {
            (Some(method), Some(id)) => Ok(Self::Call { id, method, params }),
            (Some(method), None) => Ok(Self::Notification { method, params }),
            (None, Some(id)) => Ok(Self::Response {
                id,
                outcome: response_outcome(&mut object),
            }),
            (None, None) => Err(AppError::Rpc(
                "message has neither method nor id".into(),
            )),
        }
    }

    /// Render the message as a JSON object, tagged with the protocol version.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match self {
            Self::Call { id, method, params } => {
                object.insert("id".into(), id.to_value());
                object.insert("method".into(), Value::from(method.as_str()));
                if let Some(params) = params {
                    object.insert("params".into(), params.clone());
                }
            }
            Self::Notification { method, params } => {
                object.insert("method".into(), Value::from(method.as_str()));
                if let Some(params) = params {
                    object.insert("params".into(), params.clone());
                }
            }
            Self::Response { id, outcome } => {
                object.insert("id".into(), id.to_value());
                match outcome {
                    Ok(result) => {
                        object.insert("result".into(), result.clone());
                    }
                    Err(error) => {
                        object.insert("error".into(), json!(error));
                    }
                }
            }
        }
        Value::Object(object)
    }

    /// Render the message as a single line without the trailing newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        self.to_value().to_string()
    }
}

fn response_outcome(object: &mut Map<String, Value>) -> std::result::Result<Value, RpcError> {
    match object.remove("error") {
        None | Some(Value::Null) => Ok(object.remove("result").unwrap_or(Value::Null)),
        Some(raw) => Err(serde_json::from_value::<RpcError>(raw.clone()).unwrap_or_else(|_| {
            RpcError {
                code: HANDLER_FAILED,
                message: raw.to_string(),
                data: None,
            }
        })),
    }
}
