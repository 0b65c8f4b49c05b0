//! Environment assembly for agent processes.

use crate::orchestrator::{AgentKind, TurnOptions};

/// Claude API keys carry this prefix; anything else is an OAuth token.
const ANTHROPIC_API_KEY_PREFIX: &str = "sk-ant-api";

/// Parse user-entered `KEY=VALUE` lines.
///
/// Blank lines and lines without `=` are skipped, an `export ` prefix is
/// dropped, keys and values are trimmed, and one pair of matching single
/// or double quotes around the value is removed.
#[must_use]
pub fn parse_env_vars(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return None;
            }
            let without_export = trimmed.strip_prefix("export ").unwrap_or(trimmed);
            let (key, value) = without_export.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_owned(), unquote(value.trim()).to_owned()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Environment variable that carries `token` for `kind`.
#[must_use]
pub fn credential_var(kind: AgentKind, token: &str) -> &'static str {
    match kind {
        AgentKind::Claude if token.starts_with(ANTHROPIC_API_KEY_PREFIX) => "ANTHROPIC_API_KEY",
        AgentKind::Claude => "CLAUDE_CODE_OAUTH_TOKEN",
        AgentKind::Codex => "OPENAI_API_KEY",
    }
}

/// Variables layered over the inherited environment, in precedence order:
/// user lines, then host-supplied entries, then the credential.
#[must_use]
pub fn agent_env(kind: AgentKind, options: &TurnOptions) -> Vec<(String, String)> {
    let mut env = options
        .claude_env_vars
        .as_deref()
        .map(parse_env_vars)
        .unwrap_or_default();
    env.extend(
        options
            .conductor_env
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    if let Some(token) = options
        .auth_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        env.push((credential_var(kind, token).to_owned(), token.to_owned()));
    }
    env
}
