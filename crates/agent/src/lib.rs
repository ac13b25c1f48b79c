//! Agent seam and intake pipeline for the reservation assistant.
//!
//! The agent only translates messages into [`runtime::ReservationIntent`]s. Every
//! side effect is applied here, deterministically, after the ownership guardrail:
//!
//! 1. **Intake** (`intake`) - dedup through the session ledger, agent call under a timeout
//! 2. **Guardrails** (`guardrails`) - a user only touches reservations under their own number
//! 3. **Tools** (`tools`) - intents applied to the reservation store, results made user-safe
//! 4. **Composition** (`runtime`) - draft reply plus tool results become the outbound text
//!
//! `conversation::CommandAgent` is a keyword agent for local runs and tests.

pub mod conversation;
pub mod guardrails;
pub mod intake;
pub mod runtime;
pub mod tools;

pub use conversation::CommandAgent;
pub use guardrails::{GuardrailDecision, GuardrailPolicy};
pub use intake::{Disposition, IntakeError, IntakeOutcome, IntakeSettings, WebhookIntakeCoordinator};
pub use runtime::{AgentError, AgentReply, AgentRequest, ReservationAgent, ReservationIntent};
pub use tools::{ToolExecutor, ToolName, ToolOutcome, ToolResult};
