//! Turn-based orchestrator for the Codex CLI.
//!
//! Every query runs one `codex exec --json` process to completion. The
//! thread id reported by the first turn is kept on the session so later
//! turns resume the same conversation.
//!
//! State machine: `Idle → Running → {Idle, Aborted}`. Cancelling removes the
//! session entry entirely; the next query starts from `options.resume`.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::bridge::FrontendBridge;
use super::delta::ItemBuffers;
use super::registry::{SessionHandle, SessionRegistry};
use super::{
    validate_permission_mode, AgentKind, ErrorEvent, MessageEvent, Orchestrator,
    OrchestratorFuture, SessionInfo, SessionStatus, TurnOptions,
};
use crate::backend::codex::{CodexEvent, CodexLaunch, ItemKind};
use crate::backend::env::agent_env;
use crate::backend::spawner::{spawn_agent, terminate, AgentProcess, StderrTail};
use crate::config::GlobalConfig;
use crate::rpc::codec::RpcCodec;
use crate::{AppError, Result};

/// Launch settings shared by every Codex session.
#[derive(Debug, Clone)]
pub struct CodexSettings {
    /// CLI executable.
    pub binary: PathBuf,
    /// Arguments inserted after `exec --json`.
    pub extra_args: Vec<String>,
    /// SIGTERM-to-kill grace period.
    pub terminate_grace: Duration,
}

impl CodexSettings {
    /// Settings from the global configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self {
            binary: config.codex.binary.clone(),
            extra_args: config.codex.extra_args.clone(),
            terminate_grace: config.terminate_grace(),
        }
    }
}

struct RunningTurn {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningTurn {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(%err, "codex turn task failed");
        }
    }
}

#[derive(Default)]
struct CodexSession {
    thread_id: Option<String>,
    running: Option<RunningTurn>,
    buffers: ItemBuffers,
    tool_counts: BTreeMap<&'static str, u64>,
    counted: HashSet<String>,
    status: Option<SessionStatus>,
    permission_mode: Option<String>,
    last_activity: Option<DateTime<Utc>>,
    generation: u64,
}

impl CodexSession {
    fn is_current(&self, generation: u64) -> bool {
        self.running
            .as_ref()
            .is_some_and(|turn| turn.generation == generation)
    }

    fn reset_turn_state(&mut self) {
        self.buffers.clear();
        self.tool_counts.clear();
        self.counted.clear();
    }

    fn tool_summary(&self) -> Option<Value> {
        if self.tool_counts.is_empty() {
            None
        } else {
            serde_json::to_value(&self.tool_counts).ok()
        }
    }
}

#[derive(Clone)]
struct TurnContext {
    session_id: String,
    generation: u64,
    handle: SessionHandle<CodexSession>,
    bridge: FrontendBridge,
    stderr: StderrTail,
    grace: Duration,
}

/// Orchestrator for resumable Codex threads.
pub struct CodexOrchestrator {
    registry: SessionRegistry<CodexSession>,
    bridge: FrontendBridge,
    settings: CodexSettings,
}

impl CodexOrchestrator {
    /// Create an orchestrator reporting through `bridge`.
    #[must_use]
    pub fn new(bridge: FrontendBridge, settings: CodexSettings) -> Self {
        Self {
            registry: SessionRegistry::new(),
            bridge,
            settings,
        }
    }

    /// Start a turn for `session_id`, replacing any turn still running.
    ///
    /// A running turn is stopped silently, and its process has exited,
    /// before the new one is spawned. Returns once the process is spawned;
    /// events follow asynchronously.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidParams` for an unknown permission mode.
    /// - `AppError::Backend` if the process cannot be spawned.
    pub async fn start_turn(
        &self,
        session_id: &str,
        prompt: &str,
        options: &TurnOptions,
    ) -> Result<()> {
        if let Some(mode) = options.permission_mode() {
            validate_permission_mode(mode)?;
        }

        let handle = self
            .registry
            .get_or_insert_with(session_id, CodexSession::default)
            .await;
        // The previous process must be gone before the next one spawns. The
        // lock is released while it stops since its task needs the lock to
        // finish.
        let mut session = loop {
            let mut session = handle.lock().await;
            let Some(previous) = session.running.take() else {
                break session;
            };
            drop(session);
            info!(session_id, "replacing running codex turn");
            previous.stop().await;
        };
        session.last_activity = Some(Utc::now());
        session.reset_turn_state();

        let thread_id = if options.reset {
            options.resume().map(str::to_owned)
        } else {
            session
                .thread_id
                .clone()
                .or_else(|| options.resume().map(str::to_owned))
        };
        if options.reset {
            session.thread_id.clone_from(&thread_id);
        }

        let launch = CodexLaunch {
            binary: self.settings.binary.clone(),
            cwd: options.cwd.clone(),
            model: options.model().map(str::to_owned),
            permission_mode: options.permission_mode().map(str::to_owned),
            thread_id,
            additional_directories: options.additional_directories.clone(),
            extra_args: self.settings.extra_args.clone(),
            env: agent_env(AgentKind::Codex, options),
        };
        info!(
            session_id,
            thread_id = launch.thread_id.as_deref().unwrap_or(""),
            turn_id = ?options.turn_id,
            "starting codex turn"
        );

        let process = match spawn_agent(&launch.spawn_spec(), session_id) {
            Ok(process) => process,
            Err(err) => {
                session.status = Some(SessionStatus::Idle);
                return Err(err);
            }
        };

        session.generation += 1;
        session.permission_mode = launch.permission_mode.clone();
        session.status = Some(SessionStatus::Running);

        let ctx = TurnContext {
            session_id: session_id.to_owned(),
            generation: session.generation,
            handle: Arc::clone(&handle),
            bridge: self.bridge.clone(),
            stderr: process.stderr.clone(),
            grace: self.settings.terminate_grace,
        };
        let cancel = CancellationToken::new();
        let span = info_span!("codex_turn", session_id, generation = ctx.generation);
        let task = tokio::spawn(
            run_turn_task(ctx, process, prompt.to_owned(), cancel.clone()).instrument(span),
        );
        session.running = Some(RunningTurn {
            generation: session.generation,
            cancel,
            task,
        });
        Ok(())
    }

    /// Abort the running turn and forget the session.
    pub async fn cancel(&self, session_id: &str) -> bool {
        let Some(handle) = self.registry.get(session_id).await else {
            return false;
        };
        let running = {
            let mut session = handle.lock().await;
            let running = session.running.take();
            if running.is_some() {
                session.status = Some(SessionStatus::Aborted);
            }
            running
        };
        let Some(running) = running else {
            return false;
        };

        running.stop().await;
        self.registry.remove(session_id).await;
        info!(session_id, "codex turn cancelled");
        self.bridge
            .emit_error(&ErrorEvent::aborted(session_id, AgentKind::Codex));
        true
    }

    /// Snapshot of `session_id`.
    pub async fn info(&self, session_id: &str) -> SessionInfo {
        let Some(handle) = self.registry.get(session_id).await else {
            return SessionInfo::missing();
        };
        let session = handle.lock().await;
        SessionInfo {
            exists: true,
            live: session.running.is_some(),
            status: session.status,
            resume_id: session.thread_id.clone(),
            permission_mode: session.permission_mode.clone(),
            last_activity: session.last_activity,
        }
    }

    /// Stop every running turn without emitting abort events.
    pub async fn stop_all(&self) {
        for (session_id, handle) in self.registry.entries().await {
            let running = handle.lock().await.running.take();
            if let Some(running) = running {
                debug!(session_id, "stopping codex turn");
                running.stop().await;
            }
        }
    }
}

impl Orchestrator for CodexOrchestrator {
    fn kind(&self) -> AgentKind {
        AgentKind::Codex
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

    /// Codex reads the mode at launch only; the next turn picks it up from
    /// the query options.
    fn update_permission_mode(&self, session_id: &str, mode: &str) -> OrchestratorFuture<'_, bool> {
        let session_id = session_id.to_owned();
        let mode = mode.to_owned();
        Box::pin(async move {
            validate_permission_mode(&mode)?;
            debug!(session_id, mode, "codex permission mode applies from the next turn");
            Ok(false)
        })
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

// ── Turn task ─────────────────────────────────────────────────────────────────

async fn run_turn_task(
    ctx: TurnContext,
    process: AgentProcess,
    prompt: String,
    cancel: CancellationToken,
) {
    let AgentProcess {
        mut child,
        stdin,
        stdout,
        ..
    } = process;

    if let Some(stdin) = stdin {
        tokio::spawn(write_prompt(stdin, prompt));
    }

    let mut framed = FramedRead::new(stdout, RpcCodec::new());
    let mut outcome: Option<Result<()>> = None;

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                terminate(&mut child, ctx.grace, &ctx.session_id).await;
                outcome = Some(Err(AppError::Aborted));
                break;
            }

            item = framed.next() => match item {
                None => break,
                Some(Err(AppError::Rpc(ref msg))) => {
                    warn!(error = msg.as_str(), "codex reader: framing error, skipping");
                }
                Some(Err(err)) => {
                    warn!(error = %err, "codex reader: IO error, stopping");
                    break;
                }
                Some(Ok(line)) => {
                    if let Some(result) = handle_line(&ctx, &line).await {
                        outcome = Some(result);
                    }
                }
            },
        }
    }

    if !matches!(outcome, Some(Err(AppError::Aborted))) {
        let status = tokio::select! {
            status = child.wait() => Some(status),
            () = cancel.cancelled() => {
                terminate(&mut child, ctx.grace, &ctx.session_id).await;
                outcome = Some(Err(AppError::Aborted));
                None
            }
        };
        if outcome.is_none() {
            let exit = match status {
                Some(Ok(status)) => status.to_string(),
                Some(Err(err)) => err.to_string(),
                None => "unknown".to_owned(),
            };
            let detail = match ctx.stderr.last_line().await {
                Some(line) => format!("codex exited ({exit}) without finishing the turn: {line}"),
                None => format!("codex exited ({exit}) without finishing the turn"),
            };
            outcome = Some(Err(AppError::Backend(detail)));
        }
    }

    finish_turn(&ctx, outcome.unwrap_or(Ok(()))).await;
}

async fn write_prompt(mut stdin: ChildStdin, prompt: String) {
    if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
        warn!(%err, "codex: failed to write prompt");
        return;
    }
    if let Err(err) = stdin.shutdown().await {
        debug!(%err, "codex: failed to close stdin");
    }
}

/// Translate one stdout line. Returns the turn outcome for terminal events.
async fn handle_line(ctx: &TurnContext, line: &str) -> Option<Result<()>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let raw: Value = match serde_json::from_str(trimmed) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "codex reader: skipping non-json line");
            return None;
        }
    };
    let event = serde_json::from_value::<CodexEvent>(raw.clone()).unwrap_or_else(|err| {
        debug!(error = %err, "codex reader: unrecognised event shape");
        CodexEvent::Other
    });

    let mut session = ctx.handle.lock().await;
    if !session.is_current(ctx.generation) {
        return None;
    }
    session.last_activity = Some(Utc::now());

    if let CodexEvent::ThreadStarted { thread_id } = &event {
        info!(thread_id = %thread_id, "codex thread started");
        session.thread_id = Some(thread_id.clone());
    }

    let mut message = MessageEvent::new(&ctx.session_id, AgentKind::Codex, raw);
    if let Some(item) = event.item() {
        if let Some(label) = item.kind.tool_label() {
            if session.counted.insert(item.id.clone()) {
                *session.tool_counts.entry(label).or_insert(0) += 1;
            }
        }
        if item.kind == ItemKind::AgentMessage {
            if let Some(text) = item.text.as_deref() {
                if session.buffers.rewrites(&item.id, text) {
                    message.text = Some(text.to_owned());
                }
                let delta = session.buffers.reconcile(&item.id, text);
                if !delta.is_empty() {
                    message.text_delta = Some(delta);
                }
            }
        }
    }

    let terminal = event.is_terminal();
    message.is_final = terminal;
    message.tool_summary = session.tool_summary();
    message.thread_id = session.thread_id.clone();
    drop(session);

    ctx.bridge.emit_message(&message);

    terminal.then(|| match event.failure() {
        Some(failure) if !failure.is_empty() => Err(AppError::Backend(failure.to_owned())),
        Some(_) => Err(AppError::Backend("codex turn failed".into())),
        None => Ok(()),
    })
}

async fn finish_turn(ctx: &TurnContext, outcome: Result<()>) {
    {
        let mut session = ctx.handle.lock().await;
        if !session.is_current(ctx.generation) {
            debug!("codex turn superseded");
            return;
        }
        session.running = None;
        session.status = Some(SessionStatus::Idle);
    }

    match outcome {
        Ok(()) => debug!("codex turn completed"),
        Err(err) if err.is_abort() => debug!("codex turn aborted"),
        Err(err) => {
            warn!(error = %err, "codex turn failed");
            ctx.bridge
                .emit_error(&ErrorEvent::new(&ctx.session_id, AgentKind::Codex, &err));
        }
    }
}
