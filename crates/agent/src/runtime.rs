use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use mesa_core::domain::reservation::{
    NewReservation, ReservationId, ReservationPatch, ReservationStatus,
};
use mesa_core::domain::session::Turn;

use crate::tools::ToolResult;

/// What the agent sees for one inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentRequest {
    pub user_id: String,
    pub message: String,
    /// Recent window, oldest first. The current message is the last user turn.
    pub history: Vec<Turn>,
    pub reservation_ids: Vec<ReservationId>,
    pub received_at: DateTime<Utc>,
}

/// A reservation operation the agent asks the tool layer to perform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum ReservationIntent {
    Create(NewReservation),
    /// The sender's own reservations, optionally narrowed to one date and/or status.
    List {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        date: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<ReservationStatus>,
    },
    Update { id: ReservationId, patch: ReservationPatch },
    Cancel { id: ReservationId },
    Details { id: ReservationId },
}

impl ReservationIntent {
    /// Unfiltered listing of the sender's reservations.
    pub fn all_reservations() -> Self {
        Self::List { date: None, status: None }
    }

    pub fn target(&self) -> Option<&ReservationId> {
        match self {
            Self::Update { id, .. } | Self::Cancel { id } | Self::Details { id } => Some(id),
            Self::Create(_) | Self::List { .. } => None,
        }
    }

    pub fn action_key(&self) -> &'static str {
        match self {
            Self::Create(_) => "reservation.create",
            Self::List { .. } => "reservation.list",
            Self::Update { .. } => "reservation.update",
            Self::Cancel { .. } => "reservation.cancel",
            Self::Details { .. } => "reservation.details",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReply {
    /// Draft text. May be empty when the intents carry the whole answer.
    pub text: String,
    #[serde(default)]
    pub intents: Vec<ReservationIntent>,
}

impl AgentReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), intents: Vec::new() }
    }

    pub fn with_intent(mut self, intent: ReservationIntent) -> Self {
        self.intents.push(intent);
        self
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent backend unavailable: {0}")]
    Unavailable(String),
    #[error("agent did not answer within {0:?}")]
    TimedOut(Duration),
    #[error("agent produced an unusable reply: {0}")]
    InvalidReply(String),
}

/// Seam between the intake pipeline and whatever interprets messages.
///
/// `respond` must not touch storage; every side effect goes through the returned
/// intents so the pipeline can apply guardrails and keep delivery idempotent.
#[async_trait]
pub trait ReservationAgent: Send + Sync {
    async fn respond(&self, request: AgentRequest) -> Result<AgentReply, AgentError>;

    /// Draft text followed by a note for every tool that failed.
    fn compose(&self, reply: &AgentReply, results: &[ToolResult]) -> String {
        let mut parts = Vec::new();
        let draft = reply.text.trim();
        if !draft.is_empty() {
            parts.push(draft.to_string());
        }
        parts.extend(results.iter().filter_map(ToolResult::failure_message).map(str::to_string));
        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use mesa_core::domain::reservation::{ReservationId, ReservationStatus};

    use super::{AgentError, AgentReply, AgentRequest, ReservationAgent, ReservationIntent};
    use crate::tools::{ToolName, ToolResult};

    struct EchoAgent;

    #[async_trait]
    impl ReservationAgent for EchoAgent {
        async fn respond(&self, request: AgentRequest) -> Result<AgentReply, AgentError> {
            Ok(AgentReply::text(request.message))
        }
    }

    #[test]
    fn default_compose_appends_failure_notes_only() {
        let reply = AgentReply::text("  Claro, lo reviso.  ");
        let results = vec![
            ToolResult::Failed {
                tool: ToolName::CancelReservation,
                reason_code: "already_cancelled",
                user_message: "Esta reserva ya estaba cancelada".to_string(),
                transient: false,
            },
            ToolResult::Failed {
                tool: ToolName::ReservationDetails,
                reason_code: "not_found",
                user_message: "No se encontró la reserva".to_string(),
                transient: false,
            },
        ];

        let text = EchoAgent.compose(&reply, &results);
        assert_eq!(
            text,
            "Claro, lo reviso.\n\nEsta reserva ya estaba cancelada\n\nNo se encontró la reserva"
        );
    }

    #[test]
    fn intents_use_tagged_json() {
        let intent: ReservationIntent = serde_json::from_value(serde_json::json!({
            "intent": "cancel",
            "id": "RES-20250606-0A1B2C3D"
        }))
        .expect("intent");

        assert_eq!(intent, ReservationIntent::Cancel { id: ReservationId("RES-20250606-0A1B2C3D".into()) });
        assert_eq!(intent.action_key(), "reservation.cancel");
        assert!(ReservationIntent::all_reservations().target().is_none());
    }

    #[test]
    fn list_filters_are_optional_in_json() {
        let bare: ReservationIntent =
            serde_json::from_value(serde_json::json!({ "intent": "list" })).expect("bare list");
        assert_eq!(bare, ReservationIntent::all_reservations());

        let narrowed: ReservationIntent = serde_json::from_value(serde_json::json!({
            "intent": "list",
            "date": "2025-06-06",
            "status": "CONFIRMED"
        }))
        .expect("filtered list");
        assert_eq!(
            narrowed,
            ReservationIntent::List {
                date: Some("2025-06-06".to_string()),
                status: Some(ReservationStatus::Confirmed),
            }
        );
        assert_eq!(
            serde_json::to_value(ReservationIntent::all_reservations()).expect("json"),
            serde_json::json!({ "intent": "list" })
        );
    }
}
