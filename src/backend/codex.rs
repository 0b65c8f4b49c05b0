//! Codex CLI `exec --json` protocol.
//!
//! Each turn is one `codex exec --json` process. The prompt is read from
//! stdin (`-` positional) and events arrive on stdout, one JSON object per
//! line, tagged by `type`.

use std::path::PathBuf;

use serde::Deserialize;

use super::spawner::SpawnSpec;

/// Launch parameters for one Codex turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodexLaunch {
    /// CLI executable.
    pub binary: PathBuf,
    /// Working directory, also passed as `--cd`.
    pub cwd: Option<PathBuf>,
    /// Model override.
    pub model: Option<String>,
    /// Permission mode, mapped onto sandbox flags.
    pub permission_mode: Option<String>,
    /// Thread to resume.
    pub thread_id: Option<String>,
    /// Extra writable directories.
    pub additional_directories: Vec<PathBuf>,
    /// Arguments inserted after `exec --json`.
    pub extra_args: Vec<String>,
    /// Environment overrides.
    pub env: Vec<(String, String)>,
}

impl CodexLaunch {
    /// Command-line arguments for the CLI.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "exec".into(),
            "--json".into(),
            "--skip-git-repo-check".into(),
        ];
        args.extend(self.extra_args.iter().cloned());

        if let Some(model) = self.model.as_deref().filter(|m| !m.is_empty()) {
            args.push("--model".into());
            args.push(model.to_owned());
        }
        args.extend(sandbox_args(self.permission_mode.as_deref()));
        if let Some(cwd) = &self.cwd {
            args.push("--cd".into());
            args.push(cwd.display().to_string());
        }
        for dir in &self.additional_directories {
            args.push("--add-dir".into());
            args.push(dir.display().to_string());
        }
        if let Some(thread) = self.thread_id.as_deref().filter(|t| !t.is_empty()) {
            args.push("resume".into());
            args.push(thread.to_owned());
        }
        args.push("-".into());
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

/// Sandbox flags for a permission mode.
#[must_use]
pub fn sandbox_args(permission_mode: Option<&str>) -> Vec<String> {
    match permission_mode {
        Some("plan") => vec!["--sandbox".into(), "read-only".into()],
        Some("bypassPermissions") => vec!["--dangerously-bypass-approvals-and-sandbox".into()],
        _ => vec!["--sandbox".into(), "workspace-write".into()],
    }
}

/// One event line written by `codex exec --json`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum CodexEvent {
    /// A thread was created or resumed.
    #[serde(rename = "thread.started")]
    ThreadStarted {
        /// Thread id for later `resume`.
        thread_id: String,
    },
    /// The turn began.
    #[serde(rename = "turn.started")]
    TurnStarted {},
    /// The turn finished normally.
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        /// Token usage, passed through untouched.
        #[serde(default)]
        usage: Option<serde_json::Value>,
    },
    /// The turn failed.
    #[serde(rename = "turn.failed")]
    TurnFailed {
        /// Failure detail.
        #[serde(default)]
        error: CodexErrorDetail,
    },
    /// An item appeared.
    #[serde(rename = "item.started")]
    ItemStarted {
        /// The item.
        item: CodexItem,
    },
    /// An item changed.
    #[serde(rename = "item.updated")]
    ItemUpdated {
        /// The item.
        item: CodexItem,
    },
    /// An item finished.
    #[serde(rename = "item.completed")]
    ItemCompleted {
        /// The item.
        item: CodexItem,
    },
    /// Fatal stream error.
    #[serde(rename = "error")]
    Error {
        /// Error text.
        #[serde(default)]
        message: String,
    },
    /// Any event type not listed above.
    #[serde(other)]
    Other,
}

impl CodexEvent {
    /// Whether the event ends the turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TurnCompleted { .. } | Self::TurnFailed { .. } | Self::Error { .. }
        )
    }

    /// Failure text for events that report one.
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        match self {
            Self::TurnFailed { error } => Some(error.message.as_str()),
            Self::Error { message } => Some(message.as_str()),
            _ => None,
        }
    }

    /// Item carried by the event, if any.
    #[must_use]
    pub fn item(&self) -> Option<&CodexItem> {
        match self {
            Self::ItemStarted { item } | Self::ItemUpdated { item } | Self::ItemCompleted { item } => {
                Some(item)
            }
            _ => None,
        }
    }
}

/// Error payload of `turn.failed`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct CodexErrorDetail {
    /// Error text.
    #[serde(default)]
    pub message: String,
}

/// A thread item.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CodexItem {
    /// Item id, stable across started/updated/completed.
    pub id: String,
    /// Item kind.
    #[serde(rename = "type")]
    pub kind: ItemKind,
    /// Text for messages and reasoning.
    #[serde(default)]
    pub text: Option<String>,
}

/// Kinds of thread item.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Assistant text.
    AgentMessage,
    /// Reasoning summary.
    Reasoning,
    /// Shell command.
    CommandExecution,
    /// File edit.
    FileChange,
    /// MCP tool invocation.
    McpToolCall,
    /// Web search.
    WebSearch,
    /// Plan checklist.
    TodoList,
    /// Non-fatal error item.
    Error,
    /// Any kind not listed above.
    #[serde(other)]
    Other,
}

impl ItemKind {
    /// Key under which tool invocations of this kind are counted.
    #[must_use]
    pub fn tool_label(self) -> Option<&'static str> {
        match self {
            Self::CommandExecution => Some("command_execution"),
            Self::FileChange => Some("file_change"),
            Self::McpToolCall => Some("mcp_tool_call"),
            Self::WebSearch => Some("web_search"),
            Self::AgentMessage | Self::Reasoning | Self::TodoList | Self::Error | Self::Other => None,
        }
    }
}
