//! In-process MCP server exposed to Claude.
//!
//! The CLI tunnels MCP JSON-RPC messages for the `sidecar` server through
//! `mcp_message` control requests. [`McpTunnel`] writes each one into an
//! in-memory duplex pipe served by [`SidecarTools`] through `rmcp`, and the
//! reply travels back inside the control response.
//!
//! | Tool               | Backed by                         |
//! |--------------------|-----------------------------------|
//! | `AskUserQuestion`  | host `askUserQuestion` survey     |
//! | `GetWorkspaceDiff` | host `getDiff`                    |

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::StreamExt;
use rmcp::handler::server::{
    tool::{ToolCallContext, ToolRoute, ToolRouter},
    ServerHandler,
};
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, Implementation, ListToolsResult,
    PaginatedRequestParam, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::ServiceExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::bridge::{FrontendBridge, SurveyOutcome, SurveyQuestion, MAX_SURVEY_QUESTIONS};
use crate::backend::claude::MCP_SERVER_NAME;
use crate::rpc::codec::RpcCodec;
use crate::rpc::{Message, RequestId};
use crate::{AppError, Result};

/// Tool result text when the user dismisses a survey.
pub const SURVEY_DISMISSED_TEXT: &str = "The user dismissed the questions without answering.";

const ASK_USER_QUESTION: &str = "AskUserQuestion";
const GET_WORKSPACE_DIFF: &str = "GetWorkspaceDiff";

const TUNNEL_BUFFER: usize = 256 * 1024;

type ToolOutcome = std::result::Result<CallToolResult, rmcp::ErrorData>;

#[derive(Debug, Deserialize)]
struct AskUserQuestionInput {
    questions: Vec<SurveyQuestion>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkspaceDiffInput {
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    stat: bool,
}

/// MCP tool server bound to one session.
#[derive(Debug, Clone)]
pub struct SidecarTools {
    bridge: FrontendBridge,
    session_id: String,
}

impl SidecarTools {
    /// Tools acting on behalf of `session_id`.
    #[must_use]
    pub fn new(bridge: FrontendBridge, session_id: &str) -> Self {
        Self {
            bridge,
            session_id: session_id.to_owned(),
        }
    }

    fn tool_router() -> ToolRouter<Self> {
        let mut router = ToolRouter::new();
        for tool in Self::all_tools() {
            let name = tool.name.to_string();
            match name.as_str() {
                ASK_USER_QUESTION => {
                    router.add_route(ToolRoute::new_dyn(tool, |context| {
                        Box::pin(ask_user_question(context))
                    }));
                }
                GET_WORKSPACE_DIFF => {
                    router.add_route(ToolRoute::new_dyn(tool, |context| {
                        Box::pin(workspace_diff(context))
                    }));
                }
                _ => {
                    router.add_route(ToolRoute::new_dyn(tool, |_context| {
                        Box::pin(async {
                            Err(rmcp::ErrorData::internal_error("tool not implemented", None))
                        })
                    }));
                }
            }
        }
        router
    }

    fn schema(value: Value) -> Arc<serde_json::Map<String, Value>> {
        match value {
            Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::default()),
        }
    }

    /// Tool catalogue returned by `tools/list`.
    #[must_use]
    pub fn all_tools() -> Vec<Tool> {
        vec![
            Tool::new(
                ASK_USER_QUESTION,
                "Ask the user up to four multiple-choice questions and wait for the answers.",
                Self::schema(json!({
                    "type": "object",
                    "properties": {
                        "questions": {
                            "type": "array",
                            "minItems": 1,
                            "maxItems": MAX_SURVEY_QUESTIONS,
                            "items": {
                                "type": "object",
                                "properties": {
                                    "question": { "type": "string" },
                                    "options": { "type": "array", "items": { "type": "string" } }
                                },
                                "required": ["question", "options"]
                            }
                        }
                    },
                    "required": ["questions"]
                })),
            ),
            Tool::new(
                GET_WORKSPACE_DIFF,
                "Show uncommitted changes in the session workspace.",
                Self::schema(json!({
                    "type": "object",
                    "properties": {
                        "file": { "type": "string" },
                        "stat": { "type": "boolean" }
                    }
                })),
            ),
        ]
    }

    /// Host-side failures become an `isError` result so the model sees them.
    fn tool_failure(&self, tool: &str, err: &AppError) -> CallToolResult {
        warn!(session_id = %self.session_id, tool, error = %err, "mcp: tool failed");
        CallToolResult::error(vec![Content::text(err.to_string())])
    }
}

impl ServerHandler for SidecarTools {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: MCP_SERVER_NAME.into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Implementation::default()
            },
            ..ServerInfo::default()
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> impl Future<Output = ToolOutcome> + Send + '_ {
        let router = Self::tool_router();
        let span = info_span!("mcp_call", session_id = %self.session_id, tool = %request.name);

        async move {
            router
                .call(ToolCallContext::new(self, request, context))
                .await
        }
        .instrument(span)
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = std::result::Result<ListToolsResult, rmcp::ErrorData>> + Send + '_
    {
        std::future::ready(Ok(ListToolsResult::with_all_items(Self::all_tools())))
    }
}

async fn ask_user_question(context: ToolCallContext<'_, SidecarTools>) -> ToolOutcome {
    let tools = context.service;
    let args = context.arguments.unwrap_or_default();
    let input: AskUserQuestionInput = serde_json::from_value(Value::Object(args)).map_err(|err| {
        rmcp::ErrorData::invalid_params(format!("invalid {ASK_USER_QUESTION} arguments: {err}"), None)
    })?;
    info!(
        session_id = %tools.session_id,
        questions = input.questions.len(),
        "asking user questions"
    );

    match tools
        .bridge
        .ask_user_questions(&tools.session_id, &input.questions)
        .await
    {
        Ok(SurveyOutcome::Answered(answers)) => Ok(CallToolResult::success(vec![Content::text(
            format_answers(&answers),
        )])),
        Ok(SurveyOutcome::Cancelled) => Ok(CallToolResult::success(vec![Content::text(
            SURVEY_DISMISSED_TEXT,
        )])),
        Err(err) => Ok(tools.tool_failure(ASK_USER_QUESTION, &err)),
    }
}

async fn workspace_diff(context: ToolCallContext<'_, SidecarTools>) -> ToolOutcome {
    let tools = context.service;
    let input: WorkspaceDiffInput = match context.arguments {
        Some(args) => serde_json::from_value(Value::Object(args)).map_err(|err| {
            rmcp::ErrorData::invalid_params(
                format!("invalid {GET_WORKSPACE_DIFF} arguments: {err}"),
                None,
            )
        })?,
        None => WorkspaceDiffInput::default(),
    };

    match tools
        .bridge
        .workspace_diff(&tools.session_id, input.file.as_deref(), input.stat)
        .await
    {
        Ok(diff) if diff.trim().is_empty() => {
            Ok(CallToolResult::success(vec![Content::text("No changes")]))
        }
        Ok(diff) => Ok(CallToolResult::success(vec![Content::text(diff)])),
        Err(err) => Ok(tools.tool_failure(GET_WORKSPACE_DIFF, &err)),
    }
}

/// Render survey answers as numbered lines.
#[must_use]
pub fn format_answers(answers: &[String]) -> String {
    answers
        .iter()
        .enumerate()
        .map(|(i, answer)| format!("{}. {answer}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Tunnel ────────────────────────────────────────────────────────────────────

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>;

/// Client end of an in-process MCP connection to [`SidecarTools`].
///
/// One tunnel lives as long as one `claude` process; dropping it stops the
/// server task.
pub struct McpTunnel {
    writer: Mutex<WriteHalf<DuplexStream>>,
    pending: PendingReplies,
    cancel: CancellationToken,
}

impl McpTunnel {
    /// Start serving `tools` and return the client end.
    #[must_use]
    pub fn open(tools: SidecarTools) -> Self {
        let (client, server) = tokio::io::duplex(TUNNEL_BUFFER);
        let cancel = CancellationToken::new();
        let span = info_span!("mcp_server", session_id = %tools.session_id);
        tokio::spawn(serve_tools(tools, server, cancel.clone()).instrument(span.clone()));

        let (read, write) = tokio::io::split(client);
        let pending = PendingReplies::default();
        tokio::spawn(route_replies(read, Arc::clone(&pending), cancel.clone()).instrument(span));

        Self {
            writer: Mutex::new(write),
            pending,
            cancel,
        }
    }

    /// Forward one tunnelled MCP message and return the JSON-RPC reply.
    ///
    /// # Errors
    ///
    /// See [`McpTunnel::submit`] and [`McpReply::wait`].
    pub async fn forward(&self, message: Value) -> Result<Value> {
        self.submit(message).await?.wait().await
    }

    /// Write one tunnelled MCP message to the server.
    ///
    /// Messages reach the server in the order they are submitted, so the
    /// handshake notification always precedes later calls. Notifications and
    /// stray responses resolve to an empty acknowledgement with id `0`, which
    /// is what the CLI expects in place of no reply.
    ///
    /// # Errors
    ///
    /// - `AppError::Rpc` if `message` is not a JSON-RPC message.
    /// - `AppError::Io` if the pipe to the server is closed.
    pub async fn submit(&self, message: Value) -> Result<McpReply> {
        let id = match Message::classify(message.clone())? {
            Message::Call { id, .. } => id,
            Message::Notification { method, .. } => {
                debug!(method, "mcp: forwarding notification");
                self.write(&message).await?;
                return Ok(McpReply::Ready(acknowledgement()));
            }
            Message::Response { id, .. } => {
                debug!(id = %id.key(), "mcp: ignoring response from the client");
                return Ok(McpReply::Ready(acknowledgement()));
            }
        };

        let key = id.key();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), tx);
        if let Err(err) = self.write(&message).await {
            self.pending.lock().await.remove(&key);
            return Err(err);
        }
        Ok(McpReply::Pending {
            rx,
            cancel: self.cancel.clone(),
        })
    }

    async fn write(&self, message: &Value) -> Result<()> {
        let mut line = message.to_string();
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Drop for McpTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reply to a message written by [`McpTunnel::submit`].
#[derive(Debug)]
pub enum McpReply {
    /// Acknowledgement for a message the server does not answer.
    Ready(Value),
    /// Server reply still outstanding.
    Pending {
        /// Filled by the reply router.
        rx: oneshot::Receiver<Value>,
        /// Tunnel shutdown.
        cancel: CancellationToken,
    },
}

impl McpReply {
    /// Wait for the server's JSON-RPC reply.
    ///
    /// # Errors
    ///
    /// `AppError::Backend` if the server or the tunnel went away first.
    pub async fn wait(self) -> Result<Value> {
        match self {
            Self::Ready(reply) => Ok(reply),
            Self::Pending { rx, cancel } => tokio::select! {
                reply = rx => reply.map_err(|_| AppError::Backend("mcp server closed before replying".into())),
                () = cancel.cancelled() => Err(AppError::Backend("mcp tunnel closed".into())),
            },
        }
    }
}

fn acknowledgement() -> Value {
    Message::Response {
        id: RequestId::Number(0),
        outcome: Ok(json!({})),
    }
    .to_value()
}

async fn serve_tools(tools: SidecarTools, io: DuplexStream, cancel: CancellationToken) {
    let transport = tokio::io::split(io);
    match tools.serve_with_ct(transport, cancel).await {
        Ok(service) => match service.waiting().await {
            Ok(reason) => debug!(?reason, "mcp server stopped"),
            Err(err) => warn!(%err, "mcp server task failed"),
        },
        Err(err) => warn!(%err, "mcp server failed to initialize"),
    }
}

/// Deliver each server reply to the waiting [`McpTunnel::forward`] call.
async fn route_replies(
    read: ReadHalf<DuplexStream>,
    pending: PendingReplies,
    cancel: CancellationToken,
) {
    let mut framed = FramedRead::new(read, RpcCodec::new());
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            item = framed.next() => match item {
                None => break,
                Some(Ok(line)) => line,
                Some(Err(AppError::Rpc(ref msg))) => {
                    warn!(error = msg.as_str(), "mcp: framing error, skipping");
                    continue;
                }
                Some(Err(err)) => {
                    warn!(error = %err, "mcp: read failed, stopping");
                    break;
                }
            },
        };

        let reply: Value = match serde_json::from_str(&line) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "mcp: skipping malformed reply");
                continue;
            }
        };
        match Message::classify(reply.clone()) {
            Ok(Message::Response { id, .. }) => match pending.lock().await.remove(&id.key()) {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => debug!(id = %id.key(), "mcp: reply for unknown request"),
            },
            Ok(_) => debug!("mcp: ignoring server-initiated message"),
            Err(err) => warn!(error = %err, "mcp: unclassifiable reply"),
        }
    }
    // Dropped senders fail the waiting forwards.
    pending.lock().await.clear();
}
