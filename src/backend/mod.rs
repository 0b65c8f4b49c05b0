//! Agent backend adapters.
//!
//! Everything that knows a concrete CLI lives here: argument building,
//! event and control-frame shapes, process spawning, and credential
//! discovery. The orchestrators only see typed events.

pub mod auth;
pub mod claude;
pub mod codex;
pub mod env;
pub mod spawner;

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::{AppError, Result};

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `<binary> --version` and return its first output line.
///
/// # Errors
///
/// - `AppError::Backend` if the binary cannot be run or exits non-zero.
/// - `AppError::Timeout` if it does not finish within ten seconds.
pub async fn read_version(binary: &Path) -> Result<String> {
    let mut cmd = Command::new(binary);
    cmd.arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(VERSION_TIMEOUT, cmd.output())
        .await
        .map_err(|_| {
            AppError::Timeout(format!("{} --version did not finish", binary.display()))
        })?
        .map_err(|err| AppError::Backend(format!("failed to run {}: {err}", binary.display())))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Backend(format!(
            "{} --version failed ({}): {}",
            binary.display(),
            output.status,
            stderr.trim()
        )));
    }

    let version = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_owned();
    debug!(binary = %binary.display(), version = %version, "agent version read");
    Ok(version)
}
