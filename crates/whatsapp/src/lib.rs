//! WhatsApp transport adaptation for a Twilio-style webhook.
//!
//! - **Inbound** (`inbound`) - form fields (`From`, `Body`, `MessageSid`, `NumMedia`)
//!   normalized into one [`inbound::Inbound`] value
//! - **TwiML** (`twiml`) - `<Response><Message>` builder with XML escaping
//! - **Chunking** (`chunking`) - splits long replies on paragraph and word boundaries
//! - **Notices** (`notices`) - fixed user-facing texts that never reach the agent
//!
//! ```text
//! POST /webhook (form) → InboundForm::classify → Intake Coordinator
//!                                                      ↓
//!                 TwimlResponse ← split_message_chunks ← reply
//! ```

pub mod chunking;
pub mod inbound;
pub mod notices;
pub mod twiml;

pub use chunking::split_message_chunks;
pub use inbound::{Inbound, InboundError, InboundForm};
pub use twiml::{TwimlResponse, TWIML_CONTENT_TYPE};

/// Renders `reply` as TwiML, one `<Message>` per chunk of at most `max_length` characters.
pub fn reply_twiml(reply: &str, max_length: usize) -> String {
    let mut chunks = split_message_chunks(reply, max_length);
    if chunks.is_empty() {
        chunks.push(notices::GENERIC.to_string());
    }
    chunks.into_iter().fold(TwimlResponse::new(), TwimlResponse::message).render()
}

#[cfg(test)]
mod tests {
    use super::reply_twiml;
    use crate::notices;

    #[test]
    fn empty_reply_falls_back_to_generic_notice() {
        let xml = reply_twiml("   ", 1600);
        assert!(xml.contains(notices::GENERIC));
        assert_eq!(xml.matches("<Message>").count(), 1);
    }

    #[test]
    fn long_reply_becomes_several_messages() {
        let reply = format!("{}\n\n{}", "a".repeat(12), "b".repeat(12));
        let xml = reply_twiml(&reply, 15);
        assert_eq!(xml.matches("<Message>").count(), 2);
    }
}
