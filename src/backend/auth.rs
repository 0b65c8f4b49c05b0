//! Credential discovery for `authStatus`.

use std::env;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::orchestrator::AgentKind;

/// Where a backend's credential was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthSource {
    /// An API key or token variable in the sidecar environment.
    Environment,
    /// The CLI's own credential file under the home directory.
    CredentialsFile,
}

/// Result of a credential check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    /// Whether any credential was found.
    pub authenticated: bool,
    /// Where it was found.
    pub source: Option<AuthSource>,
}

fn env_vars(kind: AgentKind) -> &'static [&'static str] {
    match kind {
        AgentKind::Claude => &["ANTHROPIC_API_KEY", "CLAUDE_CODE_OAUTH_TOKEN"],
        AgentKind::Codex => &["OPENAI_API_KEY", "CODEX_API_KEY"],
    }
}

fn credential_file(kind: AgentKind, home: &Path) -> PathBuf {
    match kind {
        AgentKind::Claude => home.join(".claude").join(".credentials.json"),
        AgentKind::Codex => home.join(".codex").join("auth.json"),
    }
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

/// Check the environment, then the credential file under `home`.
#[must_use]
pub fn auth_status_in(kind: AgentKind, home: Option<&Path>) -> AuthStatus {
    let from_env = env_vars(kind)
        .iter()
        .any(|var| env::var(var).is_ok_and(|value| !value.trim().is_empty()));
    if from_env {
        return AuthStatus {
            authenticated: true,
            source: Some(AuthSource::Environment),
        };
    }
    if home.is_some_and(|home| credential_file(kind, home).is_file()) {
        return AuthStatus {
            authenticated: true,
            source: Some(AuthSource::CredentialsFile),
        };
    }
    AuthStatus {
        authenticated: false,
        source: None,
    }
}

/// Check credentials for `kind` using the process home directory.
#[must_use]
pub fn auth_status(kind: AgentKind) -> AuthStatus {
    auth_status_in(kind, home_dir().as_deref())
}
