//! One inbound delivery in, at most one effect out.
//!
//! The session ledger is written before the agent runs, so a redelivered message is
//! answered from the ledger and never reaches the agent or the reservation store a
//! second time. When the agent fails before any intent is applied, the ledger entry
//! is dropped again so the provider's retry is processed as new.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use mesa_core::config::AppConfig;
use mesa_core::domain::session::Role;
use mesa_core::errors::{InterfaceError, SessionError};
use mesa_db::{AppendOutcome, SessionStore};
use mesa_whatsapp::{notices, Inbound};

use crate::runtime::{AgentError, AgentRequest, ReservationAgent};
use crate::tools::{ToolExecutor, ToolResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntakeSettings {
    pub agent_timeout: Duration,
    pub history_turns: usize,
}

impl Default for IntakeSettings {
    fn default() -> Self {
        Self { agent_timeout: Duration::from_secs(30), history_turns: 20 }
    }
}

impl From<&AppConfig> for IntakeSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            agent_timeout: Duration::from_secs(config.agent.timeout_secs.max(1)),
            history_turns: (config.session.window_turns as usize).max(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Fixed notice; the agent was not consulted and nothing was stored.
    Notice,
    /// Redelivery of a message already in the ledger.
    Replayed,
    Answered,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntakeOutcome {
    pub reply: String,
    pub disposition: Disposition,
    pub tool_results: Vec<ToolResult>,
}

impl IntakeOutcome {
    fn notice(reply: &str) -> Self {
        Self { reply: reply.to_string(), disposition: Disposition::Notice, tool_results: Vec::new() }
    }

    fn replayed(reply: String) -> Self {
        Self { reply, disposition: Disposition::Replayed, tool_results: Vec::new() }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IntakeError {
    #[error("session store failed: {0}")]
    Session(#[from] SessionError),
    #[error("reservation store unavailable before any change was applied")]
    StoreUnavailable,
    #[error("agent failed: {0}")]
    Agent(#[from] AgentError),
}

impl IntakeError {
    /// What the customer sees when the failure is answered instead of retried.
    pub fn user_notice(&self) -> &'static str {
        match self {
            Self::Agent(AgentError::TimedOut(_)) => notices::SLOW_PROCESSING,
            Self::Agent(_) => notices::TECHNICAL_ERROR,
            Self::Session(_) | Self::StoreUnavailable => notices::GENERIC,
        }
    }
}

impl From<IntakeError> for InterfaceError {
    fn from(value: IntakeError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            IntakeError::Session(error) => error.into(),
            IntakeError::StoreUnavailable => {
                Self::ServiceUnavailable { message: value.to_string(), correlation_id }
            }
            IntakeError::Agent(error) => {
                Self::ServiceUnavailable { message: error.to_string(), correlation_id }
            }
        }
    }
}

#[derive(Clone)]
pub struct WebhookIntakeCoordinator {
    sessions: SessionStore,
    executor: ToolExecutor,
    agent: Arc<dyn ReservationAgent>,
    settings: IntakeSettings,
}

impl WebhookIntakeCoordinator {
    pub fn new(
        sessions: SessionStore,
        executor: ToolExecutor,
        agent: Arc<dyn ReservationAgent>,
        settings: IntakeSettings,
    ) -> Self {
        Self { sessions, executor, agent, settings }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub async fn handle(&self, inbound: Inbound) -> Result<IntakeOutcome, IntakeError> {
        match inbound {
            Inbound::Media { user_id, count } => {
                info!(event_name = "intake.media_rejected", user_id = %user_id, count);
                Ok(IntakeOutcome::notice(notices::MEDIA_NOT_SUPPORTED))
            }
            Inbound::Empty { user_id } => {
                info!(event_name = "intake.empty_message", user_id = %user_id);
                Ok(IntakeOutcome::notice(notices::EMPTY_MESSAGE))
            }
            Inbound::Text { user_id, message_id, content } => {
                self.process(&user_id, message_id.as_deref(), &content).await
            }
        }
    }

    async fn process(
        &self,
        user_id: &str,
        message_id: Option<&str>,
        content: &str,
    ) -> Result<IntakeOutcome, IntakeError> {
        let session = match self.sessions.append_turn(user_id, Role::User, content, message_id).await? {
            AppendOutcome::Duplicate { reply } => {
                return Ok(IntakeOutcome::replayed(
                    reply.unwrap_or_else(|| notices::STILL_PROCESSING.to_string()),
                ));
            }
            AppendOutcome::Appended(session) => session,
        };

        let request = AgentRequest {
            user_id: user_id.to_string(),
            message: content.to_string(),
            history: session.recent_turns(self.settings.history_turns),
            reservation_ids: session.reservation_ids.clone(),
            received_at: session.last_activity_at,
        };

        let reply = match tokio::time::timeout(self.settings.agent_timeout, self.agent.respond(request)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(error)) => return Err(self.abandon(user_id, message_id, error.into()).await),
            Err(_) => {
                let error = AgentError::TimedOut(self.settings.agent_timeout);
                return Err(self.abandon(user_id, message_id, error.into()).await);
            }
        };

        let mut results = Vec::with_capacity(reply.intents.len());
        let mut mutated = false;
        for intent in &reply.intents {
            let result = self.executor.apply(user_id, intent).await;
            if result.is_transient() {
                if !mutated {
                    return Err(self.abandon(user_id, message_id, IntakeError::StoreUnavailable).await);
                }
                // Earlier intents already committed; report and stop here.
                results.push(result);
                break;
            }
            mutated |= result.outcome().is_some_and(|outcome| outcome.is_mutation());
            results.push(result);
        }

        let mut text = self.agent.compose(&reply, &results);
        if text.trim().is_empty() {
            text = notices::GENERIC.to_string();
        }

        if let Err(error) = self.sessions.record_reply(user_id, message_id, &text).await {
            // The reply still goes out; a redelivery will get the acknowledgement instead.
            warn!(
                event_name = "intake.record_reply_failed",
                user_id,
                error = %error,
                "reply could not be remembered"
            );
        }
        for id in results.iter().filter_map(ToolResult::created) {
            if let Err(error) = self.sessions.link_reservation(user_id, id).await {
                warn!(
                    event_name = "intake.link_reservation_failed",
                    user_id,
                    reservation_id = %id,
                    error = %error,
                    "reservation could not be linked to the session"
                );
            }
        }

        info!(
            event_name = "intake.answered",
            user_id,
            message_id = message_id.unwrap_or_default(),
            intents = reply.intents.len(),
            mutated,
            "message processed"
        );
        Ok(IntakeOutcome { reply: text, disposition: Disposition::Answered, tool_results: results })
    }

    /// Drops the ledger entry so the same message id can be processed again.
    async fn abandon(&self, user_id: &str, message_id: Option<&str>, error: IntakeError) -> IntakeError {
        warn!(
            event_name = "intake.abandoned",
            user_id,
            message_id = message_id.unwrap_or_default(),
            error = %error,
            "message processing abandoned before any change"
        );
        if let Some(message_id) = message_id {
            if let Err(forget_error) = self.sessions.forget_message(user_id, message_id).await {
                warn!(
                    event_name = "intake.forget_failed",
                    user_id,
                    message_id,
                    error = %forget_error,
                    "ledger entry could not be dropped; redelivery will be acknowledged only"
                );
            }
        }
        error
    }
}
