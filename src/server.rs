//! Host-facing method table.
//!
//! Registers the sidecar's methods on a [`Peer`] and routes each request to
//! the orchestrator named by its `agentType`. Every result echoes
//! `agentType` so the host can correlate replies across backends.
//!
//! The peer runs every request on its own task. Requests naming the same
//! session go through that session's lane and run one at a time, in the
//! order they arrived; different sessions never wait on each other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug_span, info, info_span, warn, Instrument};

use crate::backend::auth::auth_status;
use crate::backend::read_version;
use crate::config::GlobalConfig;
use crate::orchestrator::bridge::FrontendBridge;
use crate::orchestrator::claude::{ClaudeOrchestrator, ClaudeSettings};
use crate::orchestrator::codex::{CodexOrchestrator, CodexSettings};
use crate::orchestrator::{AgentKind, ErrorEvent, Orchestrator, QueryParams};
use crate::rpc::Peer;
use crate::{AppError, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionParams {
    id: String,
    agent_type: AgentKind,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionModeParams {
    id: String,
    agent_type: AgentKind,
    permission_mode: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentParams {
    agent_type: AgentKind,
}

type LaneJob = BoxFuture<'static, ()>;

/// Serial work queues, one per session.
#[derive(Default)]
struct SessionLanes {
    lanes: std::sync::Mutex<HashMap<String, mpsc::UnboundedSender<LaneJob>>>,
}

impl SessionLanes {
    /// Queue `work` behind earlier work for `key`, or run it unqueued when
    /// there is no key. The place in the queue is taken by this call, not by
    /// the first poll of the returned future.
    fn run<F>(&self, key: Option<String>, work: F) -> BoxFuture<'static, Result<Value>>
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        let Some(key) = key else {
            return work.boxed();
        };

        let (tx, rx) = oneshot::channel();
        let job: LaneJob = async move {
            let _ = tx.send(work.await);
        }
        .boxed();
        {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            let lane = lanes
                .entry(key)
                .and_modify(|lane| {
                    if lane.is_closed() {
                        *lane = spawn_lane();
                    }
                })
                .or_insert_with(spawn_lane);
            let _ = lane.send(job);
        }

        async move {
            rx.await
                .unwrap_or_else(|_| Err(AppError::Backend("session request was dropped".into())))
        }
        .boxed()
    }
}

fn spawn_lane() -> mpsc::UnboundedSender<LaneJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<LaneJob>();
    tokio::spawn(
        async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        }
        .instrument(debug_span!("session_lane")),
    );
    tx
}

/// Lane key for a request naming a session: `"<agentType>/<id>"`.
fn lane_key(params: Option<&Value>) -> Option<String> {
    let params = params?;
    let agent = params.get("agentType")?.as_str()?;
    let id = params.get("id")?.as_str()?;
    Some(format!("{agent}/{id}"))
}

/// Both orchestrators plus the settings needed to answer introspection.
pub struct Sidecar {
    claude: ClaudeOrchestrator,
    codex: CodexOrchestrator,
    bridge: FrontendBridge,
    config: Arc<GlobalConfig>,
    lanes: SessionLanes,
}

impl Sidecar {
    /// Build orchestrators reporting through `bridge`.
    #[must_use]
    pub fn new(bridge: FrontendBridge, config: Arc<GlobalConfig>) -> Self {
        Self {
            claude: ClaudeOrchestrator::new(bridge.clone(), ClaudeSettings::from_config(&config)),
            codex: CodexOrchestrator::new(bridge.clone(), CodexSettings::from_config(&config)),
            bridge,
            config,
            lanes: SessionLanes::default(),
        }
    }

    /// Orchestrator for `kind`.
    #[must_use]
    pub fn orchestrator(&self, kind: AgentKind) -> &dyn Orchestrator {
        match kind {
            AgentKind::Claude => &self.claude,
            AgentKind::Codex => &self.codex,
        }
    }

    /// Handle `query`. A failed start is also reported as a session error
    /// event so streaming consumers see it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParams` for malformed params and whatever
    /// the orchestrator returns for a failed start.
    pub async fn query(&self, params: Option<Value>) -> Result<Value> {
        let QueryParams {
            id,
            agent_type,
            prompt,
            options,
        } = parse_params(params)?;
        let span = info_span!("query", session_id = %id, agent_type = %agent_type);
        async {
            info!(turn_id = ?options.turn_id, "query received");
            if let Err(err) = self
                .orchestrator(agent_type)
                .run_turn(&id, &prompt, options)
                .await
            {
                warn!(error = %err, "query failed to start");
                self.bridge
                    .emit_error(&ErrorEvent::new(&id, agent_type, &err));
                return Err(err);
            }
            Ok(json!({ "agentType": agent_type, "accepted": true }))
        }
        .instrument(span)
        .await
    }

    /// Handle `cancel`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParams` for malformed params.
    pub async fn cancel(&self, params: Option<Value>) -> Result<Value> {
        let SessionParams { id, agent_type } = parse_params(params)?;
        let cancelled = self.orchestrator(agent_type).cancel_turn(&id).await?;
        info!(session_id = %id, %agent_type, cancelled, "cancel handled");
        Ok(json!({ "agentType": agent_type, "cancelled": cancelled }))
    }

    /// Handle `updatePermissionMode`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParams` for malformed params or an unknown
    /// mode.
    pub async fn update_permission_mode(&self, params: Option<Value>) -> Result<Value> {
        let PermissionModeParams {
            id,
            agent_type,
            permission_mode,
        } = parse_params(params)?;
        let applied = self
            .orchestrator(agent_type)
            .update_permission_mode(&id, &permission_mode)
            .await?;
        info!(session_id = %id, %agent_type, mode = %permission_mode, applied, "permission mode update");
        Ok(json!({ "agentType": agent_type, "applied": applied }))
    }

    /// Handle `agentInfo`: binary path and `--version` output.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParams` for malformed params and the
    /// `read_version` failure if the binary cannot be run.
    pub async fn agent_info(&self, params: Option<Value>) -> Result<Value> {
        let AgentParams { agent_type } = parse_params(params)?;
        let binary = match agent_type {
            AgentKind::Claude => &self.config.claude.binary,
            AgentKind::Codex => &self.config.codex.binary,
        };
        let version = read_version(binary).await?;
        Ok(json!({
            "agentType": agent_type,
            "binary": binary.display().to_string(),
            "version": version,
        }))
    }

    /// Handle `authStatus`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParams` for malformed params.
    pub fn auth_status(&self, params: Option<Value>) -> Result<Value> {
        let AgentParams { agent_type } = parse_params(params)?;
        let status = auth_status(agent_type);
        Ok(json!({
            "agentType": agent_type,
            "authenticated": status.authenticated,
            "source": status.source,
        }))
    }

    /// Handle `sessionInfo`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParams` for malformed params.
    pub async fn session_info(&self, params: Option<Value>) -> Result<Value> {
        let SessionParams { id, agent_type } = parse_params(params)?;
        let info = self.orchestrator(agent_type).session_info(&id).await?;
        let mut value = serde_json::to_value(info)?;
        if let Value::Object(map) = &mut value {
            map.insert("agentType".into(), json!(agent_type));
        }
        Ok(value)
    }

    /// Stop every live execution on both backends.
    pub async fn shutdown(&self) {
        for kind in [AgentKind::Claude, AgentKind::Codex] {
            if let Err(err) = self.orchestrator(kind).shutdown().await {
                warn!(agent_type = %kind, error = %err, "orchestrator shutdown failed");
            }
        }
    }
}

/// Wrap a session-scoped handler so it runs in its session's lane.
fn in_lane<F, Fut>(
    sidecar: &Arc<Sidecar>,
    handler: F,
) -> impl Fn(Option<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static
where
    F: Fn(Arc<Sidecar>, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    let sidecar = Arc::clone(sidecar);
    move |params| {
        let key = lane_key(params.as_ref());
        sidecar
            .lanes
            .run(key, handler(Arc::clone(&sidecar), params))
    }
}

/// Register every sidecar method on `peer`.
pub async fn register_methods(peer: &Peer, sidecar: &Arc<Sidecar>) {
    peer.register_method(
        "query",
        in_lane(sidecar, |s, params| async move { s.query(params).await }),
    )
    .await;
    peer.register_method(
        "cancel",
        in_lane(sidecar, |s, params| async move { s.cancel(params).await }),
    )
    .await;
    peer.register_method(
        "updatePermissionMode",
        in_lane(sidecar, |s, params| async move {
            s.update_permission_mode(params).await
        }),
    )
    .await;
    peer.register_method(
        "sessionInfo",
        in_lane(sidecar, |s, params| async move { s.session_info(params).await }),
    )
    .await;

    let s = Arc::clone(sidecar);
    peer.register_method("agentInfo", move |params| {
        let s = Arc::clone(&s);
        async move { s.agent_info(params).await }
    })
    .await;

    let s = Arc::clone(sidecar);
    peer.register_method("authStatus", move |params| {
        let s = Arc::clone(&s);
        async move { s.auth_status(params) }
    })
    .await;
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let params = params.ok_or_else(|| AppError::InvalidParams("missing params".into()))?;
    serde_json::from_value(params).map_err(|err| AppError::InvalidParams(err.to_string()))
}
