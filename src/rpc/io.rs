//! Reader and writer tasks binding a [`Peer`] to an async byte stream.

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::RpcCodec;
use super::peer::Peer;
use crate::{AppError, Result};

/// Reader task: decode lines from `reader` and feed them to `peer`.
///
/// Oversized lines are logged and skipped. On EOF, an I/O error, or
/// cancellation the peer is shut down, failing every pending call.
///
/// # Errors
///
/// Returns `Ok(())` on EOF or cancellation and the I/O error otherwise.
pub async fn run_reader<R>(reader: R, peer: Peer, cancel: CancellationToken) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(reader, RpcCodec::new());

    let outcome = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("rpc reader: cancellation received, stopping");
                break Ok(());
            }

            item = framed.next() => match item {
                None => {
                    debug!("rpc reader: EOF detected");
                    break Ok(());
                }
                Some(Err(AppError::Rpc(ref msg))) => {
                    warn!(error = msg.as_str(), "rpc reader: framing error, skipping");
                }
                Some(Err(err)) => {
                    warn!(error = %err, "rpc reader: IO error, stopping");
                    break Err(err);
                }
                Some(Ok(line)) => peer.on_line(&line).await,
            },
        }
    };

    let pending = peer.pending_count().await;
    debug!(pending, "rpc reader: shutting down peer");
    peer.shutdown().await;
    outcome
}

/// Writer task: write each outbound line from `lines` followed by `\n`.
///
/// Exits when `cancel` fires or every sender is dropped.
///
/// # Errors
///
/// Returns `AppError::Io` if a write to `writer` fails.
pub async fn run_writer<W>(
    mut writer: W,
    mut lines: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("rpc writer: cancellation received, stopping");
                break;
            }

            line = lines.recv() => {
                let Some(line) = line else {
                    debug!("rpc writer: outbound channel closed, stopping");
                    break;
                };

                let mut bytes = line.into_bytes();
                bytes.push(b'\n');

                writer.write_all(&bytes).await.map_err(|e| {
                    warn!(error = %e, "rpc writer: write failed");
                    AppError::Io(format!("write failed: {e}"))
                })?;
                writer
                    .flush()
                    .await
                    .map_err(|e| AppError::Io(format!("flush failed: {e}")))?;
            }
        }
    }

    Ok(())
}
