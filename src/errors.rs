//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system, socket, or child-process I/O failure.
    Io(String),
    /// Wire-level protocol failure (framing, malformed message, bad envelope).
    Rpc(String),
    /// An outbound call did not receive a response within its bound.
    Timeout(String),
    /// The transport peer has been shut down; no further calls are possible.
    PeerStopped,
    /// The remote side has no handler for the requested method.
    MethodNotFound(String),
    /// The remote side answered a call with an error response.
    Remote {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable error message.
        message: String,
    },
    /// Agent backend failure (spawn, protocol, or turn failure).
    Backend(String),
    /// The in-flight turn was cancelled by the user.
    Aborted,
    /// Requested entity does not exist.
    NotFound(String),
    /// Request parameters failed validation.
    InvalidParams(String),
}

impl AppError {
    /// Whether this error represents a user-initiated abort.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Rpc(msg) => write!(f, "rpc: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::PeerStopped => write!(f, "peer stopped"),
            Self::MethodNotFound(method) => write!(f, "method not found: {method}"),
            Self::Remote { code, message } => write!(f, "remote error {code}: {message}"),
            Self::Backend(msg) => write!(f, "backend: {msg}"),
            Self::Aborted => write!(f, "aborted by user"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidParams(msg) => write!(f, "invalid params: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Rpc(format!("malformed json: {err}"))
    }
}
