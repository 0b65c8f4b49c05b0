//! Typed access to the host's collaborator methods.
//!
//! | Method                      | Kind         | Used for                        |
//! |-----------------------------|--------------|---------------------------------|
//! | `message`                   | notification | streaming output                |
//! | `queryError`                | notification | session errors and aborts       |
//! | `enterPlanModeNotification` | notification | agent entered plan mode         |
//! | `exitPlanMode`              | call         | approval gate for leaving plan  |
//! | `askUserQuestion`           | call         | multiple-choice survey          |
//! | `getDiff`                   | call         | workspace diff for the agent    |
//!
//! Calls that wait on a person use the frontend timeout; `getDiff` uses the
//! peer's default.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{ErrorEvent, MessageEvent};
use crate::rpc::Peer;
use crate::{AppError, Result};

/// Answer the host returns in place of answers when the user dismisses a
/// survey.
pub const SURVEY_CANCELLED: &str = "__cancelled__";

/// Upper bound on questions per survey.
pub const MAX_SURVEY_QUESTIONS: usize = 4;

/// One multiple-choice question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyQuestion {
    /// Question text.
    pub question: String,
    /// Option labels.
    #[serde(default)]
    pub options: Vec<String>,
}

/// Result of a survey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurveyOutcome {
    /// One answer per question, in order.
    Answered(Vec<String>),
    /// The user dismissed the survey.
    Cancelled,
}

#[derive(Debug, Deserialize)]
struct PlanApprovalReply {
    #[serde(default)]
    approved: bool,
}

#[derive(Debug, Deserialize)]
struct SurveyReply {
    #[serde(default)]
    answers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DiffReply {
    #[serde(default)]
    diff: String,
}

/// Host-facing side of the orchestrators. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FrontendBridge {
    peer: Peer,
    frontend_timeout: Duration,
}

impl FrontendBridge {
    /// Wrap `peer`; human-answered calls wait up to `frontend_timeout`.
    #[must_use]
    pub fn new(peer: Peer, frontend_timeout: Duration) -> Self {
        Self {
            peer,
            frontend_timeout,
        }
    }

    /// Underlying peer.
    #[must_use]
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Send a streaming event.
    pub fn emit_message(&self, event: &MessageEvent) {
        self.notify_serialized("message", event);
    }

    /// Send a session error.
    pub fn emit_error(&self, event: &ErrorEvent) {
        debug!(session_id = %event.id, error = %event.error, "bridge: emitting query error");
        self.notify_serialized("queryError", event);
    }

    /// Tell the host the agent switched itself into plan mode.
    pub fn notify_plan_mode(&self, session_id: &str) {
        self.peer.notify(
            "enterPlanModeNotification",
            Some(json!({ "sessionId": session_id })),
        );
    }

    /// Ask the user whether the agent may leave plan mode.
    ///
    /// # Errors
    ///
    /// Propagates peer failures (timeout, stopped, remote error) and
    /// `AppError::Rpc` for an unreadable reply.
    pub async fn request_plan_approval(&self, session_id: &str, tool_input: &Value) -> Result<bool> {
        let reply = self
            .peer
            .call_with_timeout(
                "exitPlanMode",
                Some(json!({ "sessionId": session_id, "toolInput": tool_input })),
                self.frontend_timeout,
            )
            .await?;
        let reply: PlanApprovalReply = parse_reply("exitPlanMode", reply)?;
        Ok(reply.approved)
    }

    /// Present up to [`MAX_SURVEY_QUESTIONS`] questions to the user.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidParams` for zero or too many questions.
    /// - `AppError::Rpc` when the number of answers does not match.
    /// - Peer failures as in [`FrontendBridge::request_plan_approval`].
    pub async fn ask_user_questions(
        &self,
        session_id: &str,
        questions: &[SurveyQuestion],
    ) -> Result<SurveyOutcome> {
        if questions.is_empty() || questions.len() > MAX_SURVEY_QUESTIONS {
            return Err(AppError::InvalidParams(format!(
                "a survey takes 1 to {MAX_SURVEY_QUESTIONS} questions, got {}",
                questions.len()
            )));
        }

        let reply = self
            .peer
            .call_with_timeout(
                "askUserQuestion",
                Some(json!({ "sessionId": session_id, "questions": questions })),
                self.frontend_timeout,
            )
            .await?;
        let SurveyReply { answers } = parse_reply("askUserQuestion", reply)?;

        if answers.len() == 1 && answers[0] == SURVEY_CANCELLED {
            return Ok(SurveyOutcome::Cancelled);
        }
        if answers.len() != questions.len() {
            return Err(AppError::Rpc(format!(
                "expected {} answers, got {}",
                questions.len(),
                answers.len()
            )));
        }
        Ok(SurveyOutcome::Answered(answers))
    }

    /// Fetch the session workspace diff, optionally for one file or as a
    /// `--stat` summary.
    ///
    /// # Errors
    ///
    /// Propagates peer failures, including the host's own error when the
    /// diff cannot be produced.
    pub async fn workspace_diff(
        &self,
        session_id: &str,
        file: Option<&str>,
        stat: bool,
    ) -> Result<String> {
        let mut params = json!({ "sessionId": session_id, "stat": stat });
        if let Some(file) = file {
            params["file"] = Value::from(file);
        }
        let reply = self.peer.call("getDiff", Some(params)).await?;
        let DiffReply { diff } = parse_reply("getDiff", reply)?;
        Ok(diff)
    }

    fn notify_serialized<T: Serialize>(&self, method: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(params) => self.peer.notify(method, Some(params)),
            Err(err) => warn!(method, error = %err, "bridge: failed to serialize event"),
        }
    }
}

fn parse_reply<T: for<'de> Deserialize<'de>>(method: &str, reply: Value) -> Result<T> {
    serde_json::from_value(reply)
        .map_err(|err| AppError::Rpc(format!("unreadable {method} reply: {err}")))
}
