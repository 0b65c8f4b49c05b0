//! Transport peer: call correlation and inbound dispatch.
//!
//! The peer never touches the byte stream directly. Outbound lines go to an
//! unbounded channel drained by [`run_writer`](super::io::run_writer), and
//! inbound lines are pushed in through [`Peer::on_line`] by
//! [`run_reader`](super::io::run_reader).
//!
//! Responses are matched inline on the reader. Inbound calls and
//! notifications run on their own tasks, so a slow handler never holds up
//! a response or another request. A handler's synchronous prologue (the
//! closure body before its returned future) still runs on the reader in
//! arrival order; handlers that need ordering claim their place there.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, warn, Instrument, Span};

use super::message::{Message, RequestId, RpcError, METHOD_NOT_FOUND};
use crate::{AppError, Result};

/// Default bound for an outbound call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Registered inbound method handler.
pub type MethodHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

type PendingCalls = HashMap<String, oneshot::Sender<Result<Value>>>;

/// One end of a JSON-RPC connection. Cheap to clone.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    methods: RwLock<HashMap<String, MethodHandler>>,
    pending: Mutex<PendingCalls>,
    next_id: AtomicI64,
    outbound: mpsc::UnboundedSender<String>,
    call_timeout: Duration,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("call_timeout", &self.inner.call_timeout)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl Peer {
    /// Create a peer writing outbound lines into `outbound`.
    #[must_use]
    pub fn new(outbound: mpsc::UnboundedSender<String>, call_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                methods: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
                outbound,
                call_timeout,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Create a peer together with the receiving end of its outbound channel.
    #[must_use]
    pub fn channel(call_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, call_timeout), rx)
    }

    /// Register `handler` for `method`. A later registration for the same
    /// name replaces the earlier one.
    pub async fn register_method<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(move |params| handler(params).boxed());
        let replaced = self
            .inner
            .methods
            .write()
            .await
            .insert(method.to_owned(), handler)
            .is_some();
        if replaced {
            debug!(method, "rpc: replaced existing method handler");
        }
    }

    /// Send a one-way notification. Write failures are logged.
    pub fn notify(&self, method: &str, params: Option<Value>) {
        self.send(&Message::Notification {
            method: method.to_owned(),
            params,
        });
    }

    /// Issue a call bounded by the peer's default timeout.
    ///
    /// # Errors
    ///
    /// See [`Peer::call_with_timeout`].
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.call_with_timeout(method, params, self.inner.call_timeout)
            .await
    }

    /// Issue a call and wait up to `timeout` for the matching response.
    ///
    /// # Errors
    ///
    /// - `AppError::PeerStopped` if the peer is, or becomes, shut down.
    /// - `AppError::Timeout` if no response arrives in time; the pending
    ///   entry is removed and a late response is ignored.
    /// - `AppError::MethodNotFound` if the far side has no such method.
    /// - `AppError::Remote` if the response carries any other error object.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if self.is_stopped() {
            return Err(AppError::PeerStopped);
        }

        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let key = id.key();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(key.clone(), tx);

        // Shutdown may have drained the table between the check and insert.
        if self.is_stopped() {
            self.inner.pending.lock().await.remove(&key);
            return Err(AppError::PeerStopped);
        }

        let line = Message::Call {
            id,
            method: method.to_owned(),
            params,
        }
        .to_line();
        if self.inner.outbound.send(line).is_err() {
            self.inner.pending.lock().await.remove(&key);
            return Err(AppError::PeerStopped);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Err(AppError::Remote {
                code: METHOD_NOT_FOUND,
                ..
            }))) => Err(AppError::MethodNotFound(method.to_owned())),
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AppError::PeerStopped),
            Err(_elapsed) => {
                self.inner.pending.lock().await.remove(&key);
                warn!(method, id = %key, ?timeout, "rpc: call timed out");
                Err(AppError::Timeout(format!(
                    "call '{method}' got no response within {timeout:?}"
                )))
            }
        }
    }

    /// Feed one raw line from the stream.
    ///
    /// Malformed content is logged and dropped. An array is a batch: every
    /// element is dispatched in order and a bad element does not stop the
    /// rest.
    pub async fn on_line(&self, raw: &str) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "rpc: dropping malformed line");
                return;
            }
        };

        match value {
            Value::Array(items) => {
                if items.is_empty() {
                    warn!("rpc: dropping empty batch");
                }
                for item in items {
                    self.dispatch(item).await;
                }
            }
            other => self.dispatch(other).await,
        }
    }

    /// Fail every pending call with `PeerStopped`, refuse new calls, and
    /// drop the registered handlers. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Handlers usually capture a clone of this peer.
        self.inner.methods.write().await.clear();
        let drained: Vec<_> = self.inner.pending.lock().await.drain().collect();
        debug!(pending = drained.len(), "rpc: peer shutting down");
        for (_, tx) in drained {
            let _ = tx.send(Err(AppError::PeerStopped));
        }
    }

    /// Whether [`Peer::shutdown`] has run.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Number of outbound calls still awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    async fn dispatch(&self, value: Value) {
        let message = match Message::classify(value) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "rpc: ignoring unclassifiable message");
                return;
            }
        };

        match message {
            Message::Call { id, method, params } => {
                let Some(handler) = self.handler(&method).await else {
                    warn!(method, "rpc: call for unknown method");
                    self.send(&Message::Response {
                        id,
                        outcome: Err(RpcError::method_not_found(&method)),
                    });
                    return;
                };
                let work = handler(params);
                let peer = self.clone();
                tokio::spawn(
                    async move {
                        let outcome = work.await.map_err(|err| {
                            warn!(method, error = %err, "rpc: call handler failed");
                            RpcError::handler_failed(&err)
                        });
                        peer.send(&Message::Response { id, outcome });
                    }
                    .instrument(Span::current()),
                );
            }
            Message::Notification { method, params } => {
                let Some(handler) = self.handler(&method).await else {
                    warn!(method, "rpc: notification for unknown method");
                    return;
                };
                let work = handler(params);
                tokio::spawn(
                    async move {
                        if let Err(err) = work.await {
                            warn!(method, error = %err, "rpc: notification handler failed");
                        }
                    }
                    .instrument(Span::current()),
                );
            }
            Message::Response { id, outcome } => {
                let key = id.key();
                let entry = self.inner.pending.lock().await.remove(&key);
                match entry {
                    Some(tx) => {
                        if tx.send(outcome.map_err(AppError::from)).is_err() {
                            debug!(id = %key, "rpc: caller went away before response");
                        }
                    }
                    None => warn!(id = %key, "rpc: response for unknown or expired call"),
                }
            }
        }
    }

    async fn handler(&self, method: &str) -> Option<MethodHandler> {
        self.inner.methods.read().await.get(method).cloned()
    }

    fn send(&self, message: &Message) {
        if self.inner.outbound.send(message.to_line()).is_err() {
            warn!("rpc: outbound channel closed, dropping message");
        }
    }
}
