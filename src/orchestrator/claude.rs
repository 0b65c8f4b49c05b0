//! Push-based orchestrator for the Claude CLI.
//!
//! Each session owns at most one live `claude` process. Prompts are pushed
//! into its [`Inbox`] and a writer task feeds them to stdin as user frames;
//! a reader task turns stdout events into [`MessageEvent`]s. The process
//! stays up between turns and is only replaced when restart-relevant
//! settings change or a reset is requested.
//!
//! State machine: `Idle → Streaming → {Idle, Terminated}`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::bridge::FrontendBridge;
use super::delta::TextBuffer;
use super::inbox::Inbox;
use super::registry::{SessionHandle, SessionRegistry};
use super::tools::{McpReply, McpTunnel, SidecarTools};
use super::{
    validate_permission_mode, AgentKind, ErrorEvent, MessageEvent, Orchestrator,
    OrchestratorFuture, SessionInfo, SessionStatus, SettingsFingerprint, TurnOptions,
};
use crate::backend::claude::{
    control_error, control_request, control_success, hook_continue, initialize_request,
    interrupt_request, set_model_request, set_permission_mode_request, user_frame, ClaudeEvent,
    ClaudeLaunch, ControlRequest, PermissionDecision, MCP_SERVER_NAME, PLAN_EXIT_TOOL,
    PLAN_MODE_HOOK_ID, PLAN_REJECTED_MESSAGE,
};
use crate::backend::env::agent_env;
use crate::backend::spawner::{spawn_agent, terminate, AgentProcess, StderrTail};
use crate::config::GlobalConfig;
use crate::rpc::codec::RpcCodec;
use crate::{AppError, Result};

/// Launch settings shared by every Claude session.
#[derive(Debug, Clone)]
pub struct ClaudeSettings {
    /// CLI executable.
    pub binary: PathBuf,
    /// Mode used when a query names none.
    pub default_permission_mode: String,
    /// Arguments appended to every launch.
    pub extra_args: Vec<String>,
    /// SIGTERM-to-kill grace period.
    pub terminate_grace: Duration,
}

impl ClaudeSettings {
    /// Settings from the global configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            binary: config.claude.binary.clone(),
            default_permission_mode: config.claude.default_permission_mode.clone(),
            extra_args: config.claude.extra_args.clone(),
            terminate_grace: config.terminate_grace(),
        }
    }
}

/// Handle to one running `claude` process.
struct LiveProcess {
    generation: u64,
    inbox: Inbox,
    control: mpsc::UnboundedSender<Value>,
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
}

impl LiveProcess {
    /// Queue an outbound control request. Returns `false` if the writer is gone.
    fn send_control(&self, request: Value) -> bool {
        let request_id = Uuid::new_v4().to_string();
        self.control
            .send(control_request(&request_id, request))
            .is_ok()
    }

    /// Close the inbox, stop the tasks, and wait for the process to go away.
    async fn terminate(self) {
        self.inbox.close().await;
        self.cancel.cancel();
        if let Err(err) = self.monitor.await {
            warn!(%err, "claude monitor task failed");
        }
    }
}

struct ClaudeSession {
    fingerprint: Option<SettingsFingerprint>,
    live: Option<LiveProcess>,
    buffer: TextBuffer,
    agent_session_id: Option<String>,
    permission_mode: String,
    model: Option<String>,
    status: SessionStatus,
    /// Prompts delivered to the live process whose `result` has not arrived.
    open_turns: u32,
    last_activity: Option<DateTime<Utc>>,
    generation: u64,
}

impl ClaudeSession {
    fn new(permission_mode: &str) -> Self {
        Self {
            fingerprint: None,
            live: None,
            buffer: TextBuffer::default(),
            agent_session_id: None,
            permission_mode: permission_mode.to_owned(),
            model: None,
            status: SessionStatus::Idle,
            open_turns: 0,
            last_activity: None,
            generation: 0,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.live
            .as_ref()
            .is_some_and(|live| live.generation == generation)
    }

    fn touch(&mut self) {
        self.last_activity = Some(Utc::now());
    }

    /// Forget turn state tied to the process that just went away.
    fn clear_turns(&mut self) {
        self.open_turns = 0;
        self.buffer.clear();
    }
}

/// What the tasks of one live process share.
#[derive(Clone)]
struct SessionContext {
    session_id: String,
    generation: u64,
    handle: SessionHandle<ClaudeSession>,
    bridge: FrontendBridge,
    control: mpsc::UnboundedSender<Value>,
    stderr: StderrTail,
}

/// Orchestrator for live Claude sessions.
pub struct ClaudeOrchestrator {
    registry: SessionRegistry<ClaudeSession>,
    bridge: FrontendBridge,
    settings: ClaudeSettings,
}

impl ClaudeOrchestrator {
    /// Create an orchestrator reporting through `bridge`.
    #[must_use]
    pub fn new(bridge: FrontendBridge, settings: ClaudeSettings) -> Self {
        Self {
            registry: SessionRegistry::new(),
            bridge,
            settings,
        }
    }

    /// Deliver `prompt`, restarting the process first when required.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidParams` for an unknown permission mode.
    /// - `AppError::Backend` if the process cannot be started or its inbox
    ///   is already closed.
    pub async fn start_turn(
        &self,
        session_id: &str,
        prompt: &str,
        options: &TurnOptions,
    ) -> Result<()> {
        let mode = options
            .permission_mode()
            .unwrap_or(self.settings.default_permission_mode.as_str())
            .to_owned();
        validate_permission_mode(&mode)?;

        let handle = self
            .registry
            .get_or_insert_with(session_id, || {
                ClaudeSession::new(&self.settings.default_permission_mode)
            })
            .await;
        let mut session = handle.lock().await;
        session.touch();

        let fingerprint = SettingsFingerprint::from_options(options);
        let restart_reason = if session.live.is_none() {
            Some("no live process")
        } else if options.reset {
            Some("reset requested")
        } else if session.fingerprint.as_ref() != Some(&fingerprint) {
            Some("settings changed")
        } else {
            None
        };

        if let Some(reason) = restart_reason {
            if let Some(previous) = session.live.take() {
                info!(session_id, reason, "restarting claude process");
                previous.terminate().await;
            }
            let resume = options
                .resume()
                .map(str::to_owned)
                .or_else(|| session.agent_session_id.clone());

            session.generation += 1;
            session.clear_turns();
            let generation = session.generation;
            let live = match self.launch(session_id, &handle, options, &mode, resume, generation) {
                Ok(live) => live,
                Err(err) => {
                    session.status = SessionStatus::Idle;
                    return Err(err);
                }
            };
            session.live = Some(live);
            session.fingerprint = Some(fingerprint);
            session.model = options.model().map(str::to_owned);
            session.permission_mode = mode;
        } else {
            let model_change = options
                .model()
                .filter(|model| session.model.as_deref() != Some(*model))
                .map(str::to_owned);
            let mode_change = (session.permission_mode != mode).then_some(mode);

            if let Some(live) = session.live.as_ref() {
                if let Some(model) = &model_change {
                    debug!(session_id, model = %model, "switching claude model live");
                    live.send_control(set_model_request(model));
                }
                if let Some(mode) = &mode_change {
                    debug!(session_id, mode = %mode, "switching claude permission mode live");
                    live.send_control(set_permission_mode_request(mode));
                }
            }
            if model_change.is_some() {
                session.model = model_change;
            }
            if let Some(mode) = mode_change {
                session.permission_mode = mode;
            }
        }

        let Some(inbox) = session.live.as_ref().map(|live| live.inbox.clone()) else {
            return Err(AppError::Backend("claude process is not running".into()));
        };
        if !inbox.push(prompt.to_owned()).await {
            return Err(AppError::Backend(
                "claude session closed before the prompt was delivered".into(),
            ));
        }
        session.open_turns += 1;
        session.status = SessionStatus::Streaming;
        Ok(())
    }

    /// Interrupt and stop the live process if a turn is streaming.
    ///
    /// The session entry is kept so the next query can resume it.
    pub async fn cancel(&self, session_id: &str) -> bool {
        let Some(handle) = self.registry.get(session_id).await else {
            return false;
        };
        let mut session = handle.lock().await;
        if session.status != SessionStatus::Streaming {
            return false;
        }
        let Some(live) = session.live.take() else {
            return false;
        };

        live.send_control(interrupt_request());
        live.terminate().await;
        session.status = SessionStatus::Idle;
        session.clear_turns();
        session.touch();
        drop(session);

        info!(session_id, "claude turn cancelled");
        self.bridge
            .emit_error(&ErrorEvent::aborted(session_id, AgentKind::Claude));
        true
    }

    /// Switch the permission mode of a live process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParams` for an unknown mode.
    pub async fn set_permission_mode(&self, session_id: &str, mode: &str) -> Result<bool> {
        validate_permission_mode(mode)?;
        let Some(handle) = self.registry.get(session_id).await else {
            return Ok(false);
        };
        let mut session = handle.lock().await;
        let sent = session
            .live
            .as_ref()
            .is_some_and(|live| live.send_control(set_permission_mode_request(mode)));
        if sent {
            mode.clone_into(&mut session.permission_mode);
            session.touch();
        }
        Ok(sent)
    }

    /// Snapshot of `session_id`.
    pub async fn info(&self, session_id: &str) -> SessionInfo {
        let Some(handle) = self.registry.get(session_id).await else {
            return SessionInfo::missing();
        };
        let session = handle.lock().await;
        SessionInfo {
            exists: true,
            live: session.live.is_some(),
            status: Some(session.status),
            resume_id: session.agent_session_id.clone(),
            permission_mode: Some(session.permission_mode.clone()),
            last_activity: session.last_activity,
        }
    }

    /// Terminate every live process; entries stay registered.
    pub async fn stop_all(&self) {
        for (session_id, handle) in self.registry.entries().await {
            let mut session = handle.lock().await;
            if let Some(live) = session.live.take() {
                debug!(session_id, "stopping claude process");
                live.terminate().await;
                session.status = SessionStatus::Terminated;
                session.clear_turns();
            }
        }
    }

    fn launch(
        &self,
        session_id: &str,
        handle: &SessionHandle<ClaudeSession>,
        options: &TurnOptions,
        mode: &str,
        resume: Option<String>,
        generation: u64,
    ) -> Result<LiveProcess> {
        let launch = ClaudeLaunch {
            binary: self.settings.binary.clone(),
            cwd: options.cwd.clone(),
            model: options.model().map(str::to_owned),
            permission_mode: mode.to_owned(),
            resume,
            additional_directories: options.additional_directories.clone(),
            extra_args: self.settings.extra_args.clone(),
            env: agent_env(AgentKind::Claude, options),
        };
        info!(
            session_id,
            generation,
            resume = launch.resume.as_deref().unwrap_or(""),
            "launching claude process"
        );

        let AgentProcess {
            child,
            stdin,
            stdout,
            stderr,
        } = spawn_agent(&launch.spawn_spec(), session_id)?;
        let stdin = stdin.ok_or_else(|| AppError::Backend("claude stdin unavailable".into()))?;

        let inbox = Inbox::new();
        let cancel = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let _ = control_tx.send(control_request(
            &Uuid::new_v4().to_string(),
            initialize_request(),
        ));

        let ctx = SessionContext {
            session_id: session_id.to_owned(),
            generation,
            handle: Arc::clone(handle),
            bridge: self.bridge.clone(),
            control: control_tx.clone(),
            stderr,
        };
        let span = info_span!("claude_session", session_id, generation);

        tokio::spawn(
            write_frames(stdin, inbox.clone(), control_rx, cancel.clone()).instrument(span.clone()),
        );
        tokio::spawn(read_events(ctx, stdout, cancel.clone()).instrument(span.clone()));
        let monitor = tokio::spawn(
            monitor_process(
                session_id.to_owned(),
                child,
                cancel.clone(),
                self.settings.terminate_grace,
            )
            .instrument(span),
        );

        Ok(LiveProcess {
            generation,
            inbox,
            control: control_tx,
            cancel,
            monitor,
        })
    }
}

impl Orchestrator for ClaudeOrchestrator {
    fn kind(&self) -> AgentKind {
        AgentKind::Claude
    }

    fn run_turn(
        &self,
        session_id: &str,
        prompt: &str,
        options: TurnOptions,
    ) -> OrchestratorFuture<'_, ()> {
        let session_id = session_id.to_owned();
        let prompt = prompt.to_owned();
        Box::pin(async move { self.start_turn(&session_id, &prompt, &options).await })
    }

    fn cancel_turn(&self, session_id: &str) -> OrchestratorFuture<'_, bool> {
        let session_id = session_id.to_owned();
        Box::pin(async move { Ok(self.cancel(&session_id).await) })
    }

    fn update_permission_mode(&self, session_id: &str, mode: &str) -> OrchestratorFuture<'_, bool> {
        let session_id = session_id.to_owned();
        let mode = mode.to_owned();
        Box::pin(async move { self.set_permission_mode(&session_id, &mode).await })
    }

    fn session_info(&self, session_id: &str) -> OrchestratorFuture<'_, SessionInfo> {
        let session_id = session_id.to_owned();
        Box::pin(async move { Ok(self.info(&session_id).await) })
    }

    fn shutdown(&self) -> OrchestratorFuture<'_, ()> {
        Box::pin(async move {
            self.stop_all().await;
            Ok(())
        })
    }
}

// ── Process tasks ─────────────────────────────────────────────────────────────

/// Writer: control frames first, then queued prompts, until cancelled or the
/// inbox closes.
async fn write_frames(
    mut stdin: ChildStdin,
    inbox: Inbox,
    mut control: mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;

            frame = control.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            () = cancel.cancelled() => break,
            prompt = inbox.next() => match prompt {
                Some(text) => user_frame(&text),
                None => break,
            },
        };

        let mut line = frame.to_string();
        line.push('\n');
        if let Err(err) = stdin.write_all(line.as_bytes()).await {
            warn!(%err, "claude writer: write to stdin failed");
            break;
        }
        if let Err(err) = stdin.flush().await {
            warn!(%err, "claude writer: flush failed");
            break;
        }
    }
    debug!("claude writer stopped");
}

/// Reader: translate stdout events until EOF or cancellation.
async fn read_events(ctx: SessionContext, stdout: ChildStdout, cancel: CancellationToken) {
    let tunnel = McpTunnel::open(SidecarTools::new(ctx.bridge.clone(), &ctx.session_id));
    let mut framed = FramedRead::new(stdout, RpcCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("claude reader: cancellation received, stopping");
                return;
            }

            item = framed.next() => match item {
                None => break,
                Some(Err(AppError::Rpc(ref msg))) => {
                    warn!(error = msg.as_str(), "claude reader: framing error, skipping");
                }
                Some(Err(err)) => {
                    warn!(error = %err, "claude reader: IO error, stopping");
                    break;
                }
                Some(Ok(line)) => handle_line(&ctx, &tunnel, &line).await,
            },
        }
    }

    on_process_exit(&ctx).await;
}

async fn handle_line(ctx: &SessionContext, tunnel: &McpTunnel, line: &str) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    let raw: Value = match serde_json::from_str(trimmed) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "claude reader: skipping non-json line");
            return;
        }
    };
    let event = serde_json::from_value::<ClaudeEvent>(raw.clone()).unwrap_or_else(|err| {
        debug!(error = %err, "claude reader: unrecognised event shape");
        ClaudeEvent::Other
    });

    match event {
        ClaudeEvent::ControlRequest {
            request_id,
            request: ControlRequest::McpMessage {
                server_name,
                message,
            },
        } if server_name == MCP_SERVER_NAME => {
            // Written here so the server sees messages in the order claude sent them.
            let reply = tunnel.submit(message).await;
            tokio::spawn(
                answer_mcp(ctx.clone(), request_id, reply).instrument(tracing::Span::current()),
            );
            return;
        }
        ClaudeEvent::ControlRequest {
            request_id,
            request,
        } => {
            tokio::spawn(
                answer_control(ctx.clone(), request_id, request)
                    .instrument(tracing::Span::current()),
            );
            return;
        }
        ClaudeEvent::ControlResponse { ref response } => {
            if response.get("subtype").and_then(Value::as_str) == Some("error") {
                warn!(response = %response, "claude rejected a control request");
            } else {
                debug!("claude acknowledged a control request");
            }
            return;
        }
        _ => {}
    }

    let mut session = ctx.handle.lock().await;
    if !session.is_current(ctx.generation) {
        return;
    }
    session.touch();
    if let Some(id) = event.session_id() {
        if session.agent_session_id.as_deref() != Some(id) {
            debug!(agent_session_id = id, "claude session id recorded");
            session.agent_session_id = Some(id.to_owned());
        }
    }

    let mut message = MessageEvent::new(&ctx.session_id, AgentKind::Claude, raw);
    message.agent_session_id = session.agent_session_id.clone();
    let mut failure = None;

    match &event {
        ClaudeEvent::Assistant { message: body, .. } => {
            session.status = SessionStatus::Streaming;
            let full = body.text();
            if !full.is_empty() {
                if session.buffer.rewrites(&full) {
                    message.text = Some(full.clone());
                }
                let delta = session.buffer.reconcile(&full);
                if !delta.is_empty() {
                    message.text_delta = Some(delta);
                }
            }
        }
        ClaudeEvent::Result {
            subtype,
            is_error,
            result,
            ..
        } => {
            message.is_final = true;
            session.buffer.clear();
            session.open_turns = session.open_turns.saturating_sub(1);
            // A prompt pushed mid-turn is still in flight.
            session.status = if session.open_turns == 0 {
                SessionStatus::Idle
            } else {
                SessionStatus::Streaming
            };
            if *is_error {
                let detail = result
                    .clone()
                    .or_else(|| subtype.clone())
                    .unwrap_or_else(|| "claude turn failed".into());
                failure = Some(AppError::Backend(detail));
            }
        }
        ClaudeEvent::System { .. }
        | ClaudeEvent::User { .. }
        | ClaudeEvent::ControlRequest { .. }
        | ClaudeEvent::ControlResponse { .. }
        | ClaudeEvent::Other => {}
    }
    drop(session);

    ctx.bridge.emit_message(&message);
    if let Some(err) = failure {
        ctx.bridge
            .emit_error(&ErrorEvent::new(&ctx.session_id, AgentKind::Claude, &err));
    }
}

/// The process went away on its own. Clear the live handle and report it
/// when a turn was streaming.
async fn on_process_exit(ctx: &SessionContext) {
    let mut session = ctx.handle.lock().await;
    if !session.is_current(ctx.generation) {
        return;
    }
    let was_streaming = session.status == SessionStatus::Streaming;
    if let Some(live) = session.live.take() {
        live.terminate().await;
    }
    session.status = SessionStatus::Terminated;
    session.clear_turns();
    drop(session);

    let detail = match ctx.stderr.last_line().await {
        Some(line) => format!("claude process exited unexpectedly: {line}"),
        None => "claude process exited unexpectedly".to_owned(),
    };
    warn!(session_id = %ctx.session_id, was_streaming, "{detail}");
    if was_streaming {
        ctx.bridge.emit_error(&ErrorEvent::new(
            &ctx.session_id,
            AgentKind::Claude,
            &AppError::Backend(detail),
        ));
    }
}

/// Wait for the process to exit, or stop it when cancelled.
async fn monitor_process(
    session_id: String,
    mut child: Child,
    cancel: CancellationToken,
    grace: Duration,
) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => info!(session_id, ?status, "claude process exited"),
            Err(err) => warn!(session_id, %err, "error waiting for claude process"),
        },
        () = cancel.cancelled() => terminate(&mut child, grace, &session_id).await,
    }
}

// ── Control requests ──────────────────────────────────────────────────────────

async fn answer_control(
    ctx: SessionContext,
    request_id: String,
    request: ControlRequest,
) {
    let frames = match request {
        ControlRequest::CanUseTool { tool_name, input } if tool_name == PLAN_EXIT_TOOL => {
            gate_plan_exit(&ctx, &request_id, input).await
        }
        ControlRequest::CanUseTool { input, .. } => {
            let decision = PermissionDecision::Allow {
                updated_input: input,
            };
            vec![control_success(&request_id, decision.to_value())]
        }
        ControlRequest::HookCallback { callback_id } => {
            if callback_id == PLAN_MODE_HOOK_ID {
                info!(session_id = %ctx.session_id, "claude entered plan mode");
                if set_mode_if_current(&ctx, "plan").await {
                    ctx.bridge.notify_plan_mode(&ctx.session_id);
                }
            } else {
                debug!(callback_id, "claude reader: unknown hook callback");
            }
            vec![control_success(&request_id, hook_continue())]
        }
        ControlRequest::McpMessage { server_name, .. } => {
            vec![control_error(
                &request_id,
                &format!("unknown mcp server '{server_name}'"),
            )]
        }
        ControlRequest::Unsupported => {
            vec![control_error(&request_id, "unsupported control request")]
        }
    };

    for frame in frames {
        if ctx.control.send(frame).is_err() {
            debug!("claude writer gone, dropping control response");
            break;
        }
    }
}

async fn answer_mcp(ctx: SessionContext, request_id: String, reply: Result<McpReply>) {
    let outcome = match reply {
        Ok(reply) => reply.wait().await,
        Err(err) => Err(err),
    };
    let frame = match outcome {
        Ok(reply) => control_success(&request_id, json!({ "mcp_response": reply })),
        Err(err) => {
            warn!(session_id = %ctx.session_id, error = %err, "mcp message failed");
            control_error(&request_id, &err.to_string())
        }
    };
    if ctx.control.send(frame).is_err() {
        debug!("claude writer gone, dropping mcp response");
    }
}

/// Ask the user whether the agent may leave plan mode.
async fn gate_plan_exit(ctx: &SessionContext, request_id: &str, input: Value) -> Vec<Value> {
    info!(session_id = %ctx.session_id, "requesting plan approval");
    match ctx
        .bridge
        .request_plan_approval(&ctx.session_id, &input)
        .await
    {
        Ok(true) => {
            set_mode_if_current(ctx, "default").await;
            let allow = PermissionDecision::Allow {
                updated_input: input,
            };
            vec![
                control_success(request_id, allow.to_value()),
                control_request(
                    &Uuid::new_v4().to_string(),
                    set_permission_mode_request("default"),
                ),
            ]
        }
        Ok(false) => {
            info!(session_id = %ctx.session_id, "plan rejected by user");
            let deny = PermissionDecision::Deny {
                message: PLAN_REJECTED_MESSAGE.to_owned(),
                interrupt: true,
            };
            vec![control_success(request_id, deny.to_value())]
        }
        Err(err) => {
            warn!(session_id = %ctx.session_id, error = %err, "plan approval failed");
            vec![control_error(request_id, &err.to_string())]
        }
    }
}

/// Record `mode` unless the process this answer belongs to was replaced.
async fn set_mode_if_current(ctx: &SessionContext, mode: &str) -> bool {
    let mut session = ctx.handle.lock().await;
    if !session.is_current(ctx.generation) {
        debug!(mode, "stale process, permission mode left unchanged");
        return false;
    }
    mode.clone_into(&mut session.permission_mode);
    true
}
