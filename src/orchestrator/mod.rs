//! Agent session orchestration.
//!
//! Two orchestrators map different backend execution models onto one
//! session lifecycle:
//!
//! - [`claude::ClaudeOrchestrator`]: one live, push-fed process per session.
//! - [`codex::CodexOrchestrator`]: one process per turn, resumed by thread id.
//!
//! Both report progress through the [`bridge::FrontendBridge`] as uniform
//! [`MessageEvent`] and [`ErrorEvent`] notifications.

pub mod bridge;
pub mod claude;
pub mod codex;
pub mod delta;
pub mod inbox;
pub mod registry;
pub mod tools;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AppError, Result};

/// Boxed future returned by [`Orchestrator`] methods.
pub type OrchestratorFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Backend kind named by `agentType` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Push-based, live conversation.
    Claude,
    /// Turn-based, resumable thread.
    Codex,
}

impl AgentKind {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }
}

impl Display for AgentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-query options supplied by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TurnOptions {
    /// Working directory for the agent process.
    pub cwd: Option<PathBuf>,
    /// Model override.
    pub model: Option<String>,
    /// Permission mode (`default`, `acceptEdits`, `plan`, `bypassPermissions`).
    pub permission_mode: Option<String>,
    /// Resumable identity to start from when no live state exists.
    pub resume: Option<String>,
    /// Raw `KEY=VALUE` lines entered by the user.
    pub claude_env_vars: Option<String>,
    /// Pre-parsed environment supplied by the host.
    pub conductor_env: BTreeMap<String, String>,
    /// Extra directories the agent may access, in order.
    pub additional_directories: Vec<PathBuf>,
    /// API key or OAuth token for the backend.
    pub auth_token: Option<String>,
    /// Host-side turn identifier, logged only.
    pub turn_id: Option<Value>,
    /// Force a fresh execution even when settings are unchanged.
    pub reset: bool,
}

impl TurnOptions {
    /// Model, ignoring blank values.
    #[must_use]
    pub fn model(&self) -> Option<&str> {
        non_blank(self.model.as_deref())
    }

    /// Permission mode, ignoring blank values.
    #[must_use]
    pub fn permission_mode(&self) -> Option<&str> {
        non_blank(self.permission_mode.as_deref())
    }

    /// Resume id, ignoring blank values.
    #[must_use]
    pub fn resume(&self) -> Option<&str> {
        non_blank(self.resume.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Parameters of the host's `query` method.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    /// Session identifier.
    pub id: String,
    /// Target backend.
    pub agent_type: AgentKind,
    /// User prompt text.
    pub prompt: String,
    /// Execution options.
    #[serde(default)]
    pub options: TurnOptions,
}

/// Settings whose change forces a new execution.
///
/// Model and permission mode are deliberately absent: they are applied to a
/// live session in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsFingerprint {
    /// Environment override text, raw lines followed by sorted host entries.
    pub env: String,
    /// Extra directories, order preserved.
    pub additional_directories: Vec<PathBuf>,
    /// Credential token.
    pub credential: Option<String>,
}

impl SettingsFingerprint {
    /// Fingerprint the restart-relevant parts of `options`.
    #[must_use]
    pub fn from_options(options: &TurnOptions) -> Self {
        let mut env = options
            .claude_env_vars
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_owned();
        for (key, value) in &options.conductor_env {
            env.push('\n');
            env.push_str(key);
            env.push('=');
            env.push_str(value);
        }
        Self {
            env,
            additional_directories: options.additional_directories.clone(),
            credential: non_blank(options.auth_token.as_deref()).map(str::to_owned),
        }
    }
}

/// Coarse session state reported by `sessionInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No turn in flight.
    Idle,
    /// Live Claude process is producing output.
    Streaming,
    /// Codex turn in flight.
    Running,
    /// Live Claude process has been stopped.
    Terminated,
    /// Codex turn was cancelled.
    Aborted,
}

/// Snapshot of one session for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Whether the orchestrator holds an entry for the session.
    pub exists: bool,
    /// Whether a live execution handle is present.
    pub live: bool,
    /// Coarse state.
    pub status: Option<SessionStatus>,
    /// Claude session id or Codex thread id.
    pub resume_id: Option<String>,
    /// Last permission mode applied.
    pub permission_mode: Option<String>,
    /// Time of the last backend event or host request.
    pub last_activity: Option<DateTime<Utc>>,
}

impl SessionInfo {
    /// Snapshot for an unknown session.
    #[must_use]
    pub fn missing() -> Self {
        Self {
            exists: false,
            live: false,
            status: None,
            resume_id: None,
            permission_mode: None,
            last_activity: None,
        }
    }
}

/// Uniform streaming event, sent as the `message` notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    /// Session identifier.
    pub id: String,
    /// Always `"message"`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Originating backend.
    pub agent_type: AgentKind,
    /// Raw backend event.
    pub data: Value,
    /// New assistant text since the previous event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_delta: Option<String>,
    /// Full text, present only when the backend rewrote earlier text and
    /// the host must replace what it accumulated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Whether this event ends the turn.
    pub is_final: bool,
    /// Per-turn tool invocation counts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_summary: Option<Value>,
    /// Codex thread id, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Claude session id, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
}

impl MessageEvent {
    /// Event carrying only the raw backend data.
    #[must_use]
    pub fn new(id: &str, agent_type: AgentKind, data: Value) -> Self {
        Self {
            id: id.to_owned(),
            kind: "message",
            agent_type,
            data,
            text_delta: None,
            text: None,
            is_final: false,
            tool_summary: None,
            thread_id: None,
            agent_session_id: None,
        }
    }
}

/// Session error, sent as the `queryError` notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    /// Session identifier.
    pub id: String,
    /// Always `"error"`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Originating backend.
    pub agent_type: AgentKind,
    /// Human-readable error text.
    pub error: String,
    /// Structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorEvent {
    /// Error event for `err`.
    #[must_use]
    pub fn new(id: &str, agent_type: AgentKind, error: &AppError) -> Self {
        let data = error
            .is_abort()
            .then(|| serde_json::json!({ "aborted": true }));
        Self {
            id: id.to_owned(),
            kind: "error",
            agent_type,
            error: error.to_string(),
            data,
        }
    }

    /// The single event emitted when the user cancels a turn.
    #[must_use]
    pub fn aborted(id: &str, agent_type: AgentKind) -> Self {
        Self::new(id, agent_type, &AppError::Aborted)
    }

    /// Whether this event reports a user abort.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        self.data
            .as_ref()
            .and_then(|d| d.get("aborted"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Uniform session lifecycle over one agent backend.
pub trait Orchestrator: Send + Sync {
    /// Backend this orchestrator drives.
    fn kind(&self) -> AgentKind;

    /// Start or continue a turn for `session_id`.
    ///
    /// Returns once the prompt is accepted for delivery; output arrives
    /// later as events.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Backend` if the agent process cannot be started.
    fn run_turn(
        &self,
        session_id: &str,
        prompt: &str,
        options: TurnOptions,
    ) -> OrchestratorFuture<'_, ()>;

    /// Stop whatever is in flight for `session_id`.
    ///
    /// Emits exactly one abort error event when something was in flight,
    /// nothing otherwise. Returns whether anything was cancelled.
    ///
    /// # Errors
    ///
    /// Cancellation is best-effort; failures to signal the backend are
    /// logged rather than returned.
    fn cancel_turn(&self, session_id: &str) -> OrchestratorFuture<'_, bool>;

    /// Apply a permission mode to a live session. Returns whether it was
    /// applied.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParams` for an unknown mode.
    fn update_permission_mode(&self, session_id: &str, mode: &str)
        -> OrchestratorFuture<'_, bool>;

    /// Snapshot of `session_id`.
    ///
    /// # Errors
    ///
    /// Infallible for the built-in orchestrators.
    fn session_info(&self, session_id: &str) -> OrchestratorFuture<'_, SessionInfo>;

    /// Terminate every live execution.
    ///
    /// # Errors
    ///
    /// Infallible for the built-in orchestrators; termination failures are
    /// logged per session.
    fn shutdown(&self) -> OrchestratorFuture<'_, ()>;
}

/// Reject modes the backends do not understand.
///
/// # Errors
///
/// Returns `AppError::InvalidParams` naming the mode.
pub fn validate_permission_mode(mode: &str) -> Result<()> {
    if crate::config::PERMISSION_MODES.contains(&mode) {
        Ok(())
    } else {
        Err(AppError::InvalidParams(format!(
            "unknown permission mode '{mode}'"
        )))
    }
}
