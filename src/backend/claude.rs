//! Claude CLI stream-json protocol.
//!
//! The CLI runs with `--input-format stream-json --output-format
//! stream-json`. We write user frames and control requests to its stdin;
//! it writes events (and its own control requests) to stdout.
//!
//! | Inbound `type`     | Variant                        |
//! |--------------------|--------------------------------|
//! | `system`           | [`ClaudeEvent::System`]        |
//! | `assistant`        | [`ClaudeEvent::Assistant`]     |
//! | `user`             | [`ClaudeEvent::User`]          |
//! | `result`           | [`ClaudeEvent::Result`]        |
//! | `control_request`  | [`ClaudeEvent::ControlRequest`]|
//! | `control_response` | [`ClaudeEvent::ControlResponse`]|
//! | *(any other)*      | [`ClaudeEvent::Other`]         |

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{json, Value};

use super::spawner::SpawnSpec;

/// Tool whose use must be approved by the user.
pub const PLAN_EXIT_TOOL: &str = "ExitPlanMode";

/// Tool whose completion means the agent entered plan mode.
pub const PLAN_ENTER_TOOL: &str = "EnterPlanMode";

/// Callback id registered for the post-tool-use plan-mode hook.
pub const PLAN_MODE_HOOK_ID: &str = "plan_mode_entered";

/// Name of the in-process MCP server.
pub const MCP_SERVER_NAME: &str = "sidecar";

/// Built-in tools replaced by in-process equivalents.
pub const DISALLOWED_TOOLS: &[&str] = &["AskUserQuestion"];

/// Message returned to the model when the user rejects a plan.
pub const PLAN_REJECTED_MESSAGE: &str =
    "The user did not approve the plan. Stop and wait for further guidance before making changes.";

/// Launch parameters for one Claude process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaudeLaunch {
    /// CLI executable.
    pub binary: PathBuf,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Model override.
    pub model: Option<String>,
    /// Initial permission mode.
    pub permission_mode: String,
    /// Claude session id to resume.
    pub resume: Option<String>,
    /// Extra accessible directories.
    pub additional_directories: Vec<PathBuf>,
    /// Arguments appended verbatim.
    pub extra_args: Vec<String>,
    /// Environment overrides.
    pub env: Vec<(String, String)>,
}

impl ClaudeLaunch {
    /// Command-line arguments for the CLI.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
            "--permission-prompt-tool",
            "stdio",
            "--permission-mode",
        ]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();
        args.push(self.permission_mode.clone());

        if let Some(model) = self.model.as_deref().filter(|m| !m.is_empty()) {
            args.push("--model".into());
            args.push(model.to_owned());
        }
        if let Some(id) = self.resume.as_deref().filter(|id| !id.is_empty()) {
            args.push("--resume".into());
            args.push(id.to_owned());
        }
        for dir in &self.additional_directories {
            args.push("--add-dir".into());
            args.push(dir.display().to_string());
        }
        args.push("--mcp-config".into());
        args.push(mcp_config().to_string());
        args.push("--disallowedTools".into());
        args.push(DISALLOWED_TOOLS.join(","));
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Process spawn description.
    #[must_use]
    pub fn spawn_spec(&self) -> SpawnSpec {
        SpawnSpec {
            program: self.binary.clone(),
            args: self.args(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
        }
    }
}

/// MCP configuration declaring the in-process server.
#[must_use]
pub fn mcp_config() -> Value {
    json!({
        "mcpServers": {
            MCP_SERVER_NAME: { "type": "sdk", "name": MCP_SERVER_NAME }
        }
    })
}

// ── Inbound events ────────────────────────────────────────────────────────────

/// One event line written by the CLI.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeEvent {
    /// Session metadata; `init` carries the session id.
    System {
        /// Event subtype (e.g. `init`).
        #[serde(default)]
        subtype: Option<String>,
        /// Claude session id.
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Assistant message with content blocks.
    Assistant {
        /// Message body.
        message: AssistantMessage,
        /// Claude session id.
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Tool results echoed back as user content.
    User {
        /// Claude session id.
        #[serde(default)]
        session_id: Option<String>,
    },
    /// End of a turn.
    Result {
        /// Outcome subtype (e.g. `success`, `error_max_turns`).
        #[serde(default)]
        subtype: Option<String>,
        /// Whether the turn failed.
        #[serde(default)]
        is_error: bool,
        /// Final assistant text or error description.
        #[serde(default)]
        result: Option<String>,
        /// Claude session id.
        #[serde(default)]
        session_id: Option<String>,
    },
    /// The CLI asks us something and waits for a `control_response`.
    ControlRequest {
        /// Correlation id to echo in the response.
        request_id: String,
        /// What is being asked.
        request: ControlRequest,
    },
    /// Answer to a control request we sent.
    ControlResponse {
        /// Response body.
        #[serde(default)]
        response: Value,
    },
    /// Any event type not listed above.
    #[serde(other)]
    Other,
}

impl ClaudeEvent {
    /// Session id carried by the event, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::System { session_id, .. }
            | Self::Assistant { session_id, .. }
            | Self::User { session_id }
            | Self::Result { session_id, .. } => session_id.as_deref(),
            Self::ControlRequest { .. } | Self::ControlResponse { .. } | Self::Other => None,
        }
    }
}

/// Assistant message body.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AssistantMessage {
    /// Content blocks in order.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

impl AssistantMessage {
    /// Concatenated text of every `text` block.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect()
    }
}

/// One content block; only text matters for delta reconciliation.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain assistant text.
    Text {
        /// Block text.
        text: String,
    },
    /// Thinking, tool use, and anything else.
    #[serde(other)]
    Other,
}

/// Control request issued by the CLI.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Permission check before a tool runs.
    CanUseTool {
        /// Tool name.
        tool_name: String,
        /// Tool input, echoed back on allow.
        #[serde(default)]
        input: Value,
    },
    /// A registered hook fired.
    HookCallback {
        /// Id given at `initialize`.
        callback_id: String,
    },
    /// JSON-RPC message for an in-process MCP server.
    McpMessage {
        /// Target server.
        server_name: String,
        /// JSON-RPC payload.
        message: Value,
    },
    /// Any subtype not listed above.
    #[serde(other)]
    Unsupported,
}

// ── Outbound frames ───────────────────────────────────────────────────────────

/// Answer to a `can_use_tool` request.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    /// Let the tool run with `updated_input`.
    Allow {
        /// Input the tool runs with.
        updated_input: Value,
    },
    /// Refuse the tool.
    Deny {
        /// Explanation shown to the model.
        message: String,
        /// Whether to stop the turn.
        interrupt: bool,
    },
}

impl PermissionDecision {
    /// Wire form.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Allow { updated_input } => {
                json!({ "behavior": "allow", "updatedInput": updated_input })
            }
            Self::Deny { message, interrupt } => {
                json!({ "behavior": "deny", "message": message, "interrupt": interrupt })
            }
        }
    }
}

/// User prompt frame.
#[must_use]
pub fn user_frame(text: &str) -> Value {
    json!({
        "type": "user",
        "message": { "role": "user", "content": text }
    })
}

/// Wrap `request` in an outbound control request envelope.
#[must_use]
pub fn control_request(request_id: &str, request: Value) -> Value {
    json!({ "type": "control_request", "request_id": request_id, "request": request })
}

/// Successful answer to an inbound control request.
#[must_use]
pub fn control_success(request_id: &str, response: Value) -> Value {
    json!({
        "type": "control_response",
        "response": { "subtype": "success", "request_id": request_id, "response": response }
    })
}

/// Failed answer to an inbound control request.
#[must_use]
pub fn control_error(request_id: &str, error: &str) -> Value {
    json!({
        "type": "control_response",
        "response": { "subtype": "error", "request_id": request_id, "error": error }
    })
}

/// `initialize` request registering the plan-mode hook.
#[must_use]
pub fn initialize_request() -> Value {
    json!({
        "subtype": "initialize",
        "hooks": {
            "PostToolUse": [
                { "matcher": PLAN_ENTER_TOOL, "hookCallbackIds": [PLAN_MODE_HOOK_ID] }
            ]
        }
    })
}

/// `interrupt` request.
#[must_use]
pub fn interrupt_request() -> Value {
    json!({ "subtype": "interrupt" })
}

/// `set_permission_mode` request.
#[must_use]
pub fn set_permission_mode_request(mode: &str) -> Value {
    json!({ "subtype": "set_permission_mode", "mode": mode })
}

/// `set_model` request.
#[must_use]
pub fn set_model_request(model: &str) -> Value {
    json!({ "subtype": "set_model", "model": model })
}

/// Response body for a hook callback that lets the agent continue.
#[must_use]
pub fn hook_continue() -> Value {
    json!({ "continue": true })
}
