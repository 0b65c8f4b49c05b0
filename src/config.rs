//! Global configuration parsing, validation, and binary overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::{AppError, Result};

/// Environment variable overriding the `claude` executable path.
pub const CLAUDE_PATH_ENV: &str = "AGENT_SIDECAR_CLAUDE_PATH";

/// Environment variable overriding the `codex` executable path.
pub const CODEX_PATH_ENV: &str = "AGENT_SIDECAR_CODEX_PATH";

/// Permission modes understood by the agent backends.
pub const PERMISSION_MODES: &[&str] = &["default", "acceptEdits", "plan", "bypassPermissions"];

/// Settings for the push-based Claude backend.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClaudeConfig {
    /// Executable name or path of the Claude CLI.
    #[serde(default = "default_claude_binary")]
    pub binary: PathBuf,
    /// Permission mode used when a query does not name one.
    #[serde(default = "default_permission_mode")]
    pub default_permission_mode: String,
    /// Extra arguments appended after the stream-json flags.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            binary: default_claude_binary(),
            default_permission_mode: default_permission_mode(),
            extra_args: Vec::new(),
        }
    }
}

/// Settings for the turn-based Codex backend.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CodexConfig {
    /// Executable name or path of the Codex CLI.
    #[serde(default = "default_codex_binary")]
    pub binary: PathBuf,
    /// Extra arguments inserted after `exec --json`.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            binary: default_codex_binary(),
            extra_args: Vec::new(),
        }
    }
}

fn default_claude_binary() -> PathBuf {
    PathBuf::from("claude")
}

fn default_codex_binary() -> PathBuf {
    PathBuf::from("codex")
}

fn default_permission_mode() -> String {
    "default".into()
}

fn default_call_timeout() -> u64 {
    30
}

fn default_frontend_timeout() -> u64 {
    120
}

fn default_terminate_grace() -> u64 {
    5
}

/// Global configuration parsed from `sidecar.toml`.
///
/// Every field has a default, so an empty document (or no file at all)
/// yields a usable configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Bound for outbound peer calls that do not wait on a human.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,
    /// Bound for approval and survey calls answered by a person.
    #[serde(default = "default_frontend_timeout")]
    pub frontend_timeout_seconds: u64,
    /// Grace period between SIGTERM and a forced kill of an agent process.
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace_seconds: u64,
    /// Local socket path; a unique temporary path is chosen when absent.
    #[serde(default)]
    pub socket_name: Option<String>,
    /// Claude backend settings.
    #[serde(default)]
    pub claude: ClaudeConfig,
    /// Codex backend settings.
    #[serde(default)]
    pub codex: CodexConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            call_timeout_seconds: default_call_timeout(),
            frontend_timeout_seconds: default_frontend_timeout(),
            terminate_grace_seconds: default_terminate_grace(),
            socket_name: None,
            claude: ClaudeConfig::default(),
            codex: CodexConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace backend binaries with the paths named by
    /// [`CLAUDE_PATH_ENV`] and [`CODEX_PATH_ENV`], when set.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if an override does not point at a file.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(path) = binary_override(CLAUDE_PATH_ENV)? {
            info!(path = %path.display(), "claude binary overridden from environment");
            self.claude.binary = path;
        }
        if let Some(path) = binary_override(CODEX_PATH_ENV)? {
            info!(path = %path.display(), "codex binary overridden from environment");
            self.codex.binary = path;
        }
        Ok(())
    }

    /// Timeout applied to ordinary outbound calls.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    /// Timeout applied to calls that wait on a human answer.
    #[must_use]
    pub fn frontend_timeout(&self) -> Duration {
        Duration::from_secs(self.frontend_timeout_seconds)
    }

    /// Grace period before a terminated agent is force-killed.
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.call_timeout_seconds == 0 {
            return Err(AppError::Config(
                "call_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.frontend_timeout_seconds == 0 {
            return Err(AppError::Config(
                "frontend_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.claude.binary.as_os_str().is_empty() || self.codex.binary.as_os_str().is_empty() {
            return Err(AppError::Config("agent binary must not be empty".into()));
        }
        if !PERMISSION_MODES.contains(&self.claude.default_permission_mode.as_str()) {
            return Err(AppError::Config(format!(
                "unknown default_permission_mode '{}'",
                self.claude.default_permission_mode
            )));
        }
        if matches!(&self.socket_name, Some(name) if name.trim().is_empty()) {
            return Err(AppError::Config("socket_name must not be blank".into()));
        }
        Ok(())
    }
}

fn binary_override(var: &str) -> Result<Option<PathBuf>> {
    let Ok(raw) = env::var(var) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let path = PathBuf::from(trimmed);
    if !path.is_file() {
        return Err(AppError::Config(format!(
            "{var} points at '{}', which is not a file",
            path.display()
        )));
    }
    Ok(Some(path))
}
