//! Host connection setup.
//!
//! The host reaches the sidecar either over stdin/stdout or over a local
//! socket (Unix domain socket, named pipe on Windows). In socket mode the
//! bound path is announced on stdout as `SOCKET_PATH=<path>` and the first
//! connection is served until EOF.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use interprocess::local_socket::{tokio::prelude::*, GenericFilePath, ListenerOptions};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::orchestrator::bridge::FrontendBridge;
use crate::rpc::io::{run_reader, run_writer};
use crate::rpc::Peer;
use crate::server::{register_methods, Sidecar};
use crate::{AppError, Result};

/// How long buffered outbound lines may take to flush after the host hangs up.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Serve one host connection until EOF or cancellation.
///
/// Agent processes started on behalf of the connection are stopped before
/// this returns.
///
/// # Errors
///
/// Returns `AppError::Io` if reading from or writing to the host fails.
pub async fn serve_connection<R, W>(
    reader: R,
    writer: W,
    config: Arc<GlobalConfig>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (peer, outbound) = Peer::channel(config.call_timeout());
    let bridge = FrontendBridge::new(peer.clone(), config.frontend_timeout());
    let sidecar = Arc::new(Sidecar::new(bridge, Arc::clone(&config)));
    register_methods(&peer, &sidecar).await;

    let writer_cancel = cancel.child_token();
    let mut writer_task = tokio::spawn(
        run_writer(writer, outbound, writer_cancel.clone()).instrument(info_span!("rpc_writer")),
    );

    info!("host connection ready");
    let outcome = run_reader(reader, peer, cancel).await;

    sidecar.shutdown().await;
    drop(sidecar);

    let written = match tokio::time::timeout(WRITER_DRAIN, &mut writer_task).await {
        Ok(joined) => joined,
        Err(_) => {
            debug!("outbound queue still open, stopping writer");
            writer_cancel.cancel();
            writer_task.await
        }
    };
    match written {
        Ok(Err(err)) => warn!(error = %err, "rpc writer failed"),
        Err(err) => warn!(%err, "rpc writer task panicked"),
        Ok(Ok(())) => {}
    }

    info!("host connection closed");
    outcome
}

/// Serve the host over the process's stdin and stdout.
///
/// # Errors
///
/// See [`serve_connection`].
pub async fn serve_stdio(config: Arc<GlobalConfig>, cancel: CancellationToken) -> Result<()> {
    info!("serving host over stdio");
    serve_connection(tokio::io::stdin(), tokio::io::stdout(), config, cancel).await
}

/// Path of the local socket for `name`.
///
/// Absolute paths are used as given, bare names are placed in the temporary
/// directory, and no name yields a unique temporary path. On Windows every
/// name maps into the named-pipe namespace.
#[must_use]
pub fn socket_path(name: Option<&str>) -> PathBuf {
    let name = name.map(str::trim).filter(|n| !n.is_empty());
    if cfg!(windows) {
        let name = name.map_or_else(|| format!("agent-sidecar-{}", Uuid::new_v4()), str::to_owned);
        return PathBuf::from(format!(r"\\.\pipe\{name}"));
    }
    match name {
        Some(name) if Path::new(name).is_absolute() => PathBuf::from(name),
        Some(name) => std::env::temp_dir().join(name),
        None => std::env::temp_dir().join(format!("agent-sidecar-{}.sock", Uuid::new_v4())),
    }
}

/// Bind a local socket, announce it on stdout, and serve the first
/// connection.
///
/// # Errors
///
/// - `AppError::Io` if the socket cannot be bound or accepted on.
/// - Whatever [`serve_connection`] returns.
pub async fn serve_socket(config: Arc<GlobalConfig>, cancel: CancellationToken) -> Result<()> {
    let path = socket_path(config.socket_name.as_deref());
    let name = path
        .clone()
        .to_fs_name::<GenericFilePath>()
        .map_err(|err| AppError::Io(format!("invalid socket path '{}': {err}", path.display())))?;
    let listener = ListenerOptions::new()
        .name(name)
        .create_tokio()
        .map_err(|err| AppError::Io(format!("failed to bind '{}': {err}", path.display())))?;

    announce(&path).await?;
    info!(path = %path.display(), "local socket listening");

    let outcome = async {
        let stream = tokio::select! {
            () = cancel.cancelled() => {
                info!("shutdown before a host connected");
                return Ok(());
            }
            accepted = listener.accept() => accepted
                .map_err(|err| AppError::Io(format!("accept failed: {err}")))?,
        };
        info!("host connected");
        let (reader, writer) = stream.split();
        serve_connection(reader, writer, config, cancel).await
    }
    .instrument(info_span!("socket", path = %path.display()))
    .await;

    drop(listener);
    if !cfg!(windows) {
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(%err, path = %path.display(), "failed to remove socket file");
            }
        }
    }
    outcome
}

async fn announce(path: &Path) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let line = format!("SOCKET_PATH={}\n", path.display());
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}
