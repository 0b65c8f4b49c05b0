//! Agent process spawning and termination.
//!
//! Spawns backend CLIs with:
//! - `kill_on_drop(true)` so an abandoned handle never leaks a process.
//! - piped stdio; stdout carries NDJSON events, stderr is forwarded to
//!   tracing and its last line kept for error reports.
//! - the inherited environment plus per-session overrides.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{AppError, Result};

/// Everything needed to launch one agent process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnSpec {
    /// Executable name or path.
    pub program: PathBuf,
    /// Command-line arguments.
    pub args: Vec<String>,
    /// Working directory; inherited when `None`.
    pub cwd: Option<PathBuf>,
    /// Variables set on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

/// Last stderr line written by an agent process.
#[derive(Debug, Clone, Default)]
pub struct StderrTail(Arc<Mutex<Option<String>>>);

impl StderrTail {
    /// Most recent non-empty stderr line, if any.
    pub async fn last_line(&self) -> Option<String> {
        self.0.lock().await.clone()
    }
}

/// A running agent process with its stdio detached.
#[derive(Debug)]
pub struct AgentProcess {
    /// Child handle; dropping it kills the process.
    pub child: Child,
    /// Agent stdin, if still open.
    pub stdin: Option<ChildStdin>,
    /// Agent stdout (NDJSON events).
    pub stdout: ChildStdout,
    /// Last stderr line.
    pub stderr: StderrTail,
}

/// Spawn the process described by `spec` for `session_id`.
///
/// # Errors
///
/// - `AppError::Backend("failed to spawn …")` on OS spawn failure.
/// - `AppError::Backend("failed to capture …")` if a pipe is missing.
pub fn spawn_agent(spec: &SpawnSpec, session_id: &str) -> Result<AgentProcess> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Backend(format!(
            "failed to spawn {}: {err}",
            spec.program.display()
        ))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Backend("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Backend("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Backend("failed to capture agent stderr".into()))?;

    info!(
        session_id,
        program = %spec.program.display(),
        pid = child.id(),
        "agent process spawned"
    );

    let tail = StderrTail::default();
    tokio::spawn(forward_stderr(session_id.to_owned(), stderr, tail.clone()));

    Ok(AgentProcess {
        child,
        stdin: Some(stdin),
        stdout,
        stderr: tail,
    })
}

async fn forward_stderr(session_id: String, stderr: ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end().to_owned();
                if line.is_empty() {
                    continue;
                }
                debug!(session_id, line = %line, "agent stderr");
                *tail.0.lock().await = Some(line);
            }
            Ok(None) => break,
            Err(err) => {
                debug!(session_id, %err, "agent stderr read failed");
                break;
            }
        }
    }
}

/// Stop `child`: ask it to exit, then force-kill after `grace`.
///
/// On Unix the request is SIGTERM; elsewhere the process is killed
/// immediately.
pub async fn terminate(child: &mut Child, grace: Duration, session_id: &str) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(session_id, ?status, "agent process already exited");
        return;
    }

    if !request_exit(child, session_id) {
        force_kill(child, session_id).await;
        return;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => info!(session_id, ?status, "agent process exited gracefully"),
        Ok(Err(err)) => warn!(session_id, %err, "error waiting for agent process"),
        Err(_) => {
            warn!(
                session_id,
                "agent process did not exit within grace period, forcing kill"
            );
            force_kill(child, session_id).await;
        }
    }
}

async fn force_kill(child: &mut Child, session_id: &str) {
    if let Err(err) = child.kill().await {
        warn!(session_id, %err, "failed to force-kill agent process");
    }
}

#[cfg(unix)]
fn request_exit(child: &Child, session_id: &str) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            warn!(session_id, %err, "failed to send SIGTERM to agent process");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_exit(_child: &Child, _session_id: &str) -> bool {
    false
}
