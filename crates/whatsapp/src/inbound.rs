use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Prefix Twilio puts in front of WhatsApp addresses.
pub const WHATSAPP_PREFIX: &str = "whatsapp:";

/// Raw webhook form. Field names follow the provider's casing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct InboundForm {
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "Body", default)]
    pub body: String,
    #[serde(rename = "MessageSid", default)]
    pub message_sid: Option<String>,
    #[serde(rename = "NumMedia", default)]
    pub num_media: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Text { user_id: String, message_id: Option<String>, content: String },
    /// Attachments are not processed; the sender gets a fixed notice.
    Media { user_id: String, count: u32 },
    Empty { user_id: String },
}

impl Inbound {
    pub fn user_id(&self) -> &str {
        match self {
            Self::Text { user_id, .. } | Self::Media { user_id, .. } | Self::Empty { user_id } => {
                user_id
            }
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InboundError {
    #[error("inbound message has no sender")]
    MissingSender,
    #[error("NumMedia `{0}` is not a count")]
    InvalidMediaCount(String),
}

impl InboundForm {
    pub fn classify(&self) -> Result<Inbound, InboundError> {
        let user_id = normalize_sender(&self.from).ok_or(InboundError::MissingSender)?;

        let count = match self.num_media.as_deref().map(str::trim) {
            None | Some("") => 0,
            Some(raw) => {
                raw.parse::<u32>().map_err(|_| InboundError::InvalidMediaCount(raw.to_string()))?
            }
        };
        if count > 0 {
            debug!(event_name = "whatsapp.inbound.media", user_id = %user_id, count);
            return Ok(Inbound::Media { user_id, count });
        }

        let content = self.body.trim();
        if content.is_empty() {
            return Ok(Inbound::Empty { user_id });
        }

        let message_id = self
            .message_sid
            .as_deref()
            .map(str::trim)
            .filter(|sid| !sid.is_empty())
            .map(str::to_string);

        Ok(Inbound::Text { user_id, message_id, content: content.to_string() })
    }
}

/// `whatsapp:+34 600 111 222` becomes `+34600111222`.
pub fn normalize_sender(from: &str) -> Option<String> {
    let trimmed = from.trim();
    let address = trimmed.strip_prefix(WHATSAPP_PREFIX).unwrap_or(trimmed);
    let compact: String = address.chars().filter(|ch| !ch.is_whitespace()).collect();
    (!compact.is_empty()).then_some(compact)
}

#[cfg(test)]
mod tests {
    use super::{normalize_sender, Inbound, InboundError, InboundForm};

    fn form(from: &str, body: &str, sid: Option<&str>, media: Option<&str>) -> InboundForm {
        InboundForm {
            from: from.to_string(),
            body: body.to_string(),
            message_sid: sid.map(str::to_string),
            num_media: media.map(str::to_string),
        }
    }

    #[test]
    fn text_message_is_normalized() {
        let inbound = form("whatsapp:+34600111222", "  mesa para 4  ", Some("SM1"), Some("0"))
            .classify()
            .expect("valid");
        assert_eq!(
            inbound,
            Inbound::Text {
                user_id: "+34600111222".to_string(),
                message_id: Some("SM1".to_string()),
                content: "mesa para 4".to_string(),
            }
        );
    }

    #[test]
    fn media_wins_over_body() {
        let inbound = form("whatsapp:+34600111222", "mira", Some("SM2"), Some("2")).classify();
        assert_eq!(inbound, Ok(Inbound::Media { user_id: "+34600111222".to_string(), count: 2 }));
    }

    #[test]
    fn blank_body_is_empty_and_blank_sid_is_absent() {
        let empty = form("+34600111222", "   ", Some("SM3"), None).classify().expect("valid");
        assert_eq!(empty, Inbound::Empty { user_id: "+34600111222".to_string() });

        let no_sid = form("+34600111222", "hola", Some(" "), None).classify().expect("valid");
        assert!(matches!(no_sid, Inbound::Text { message_id: None, .. }));
    }

    #[test]
    fn rejects_missing_sender_and_bad_media_count() {
        assert_eq!(form(" ", "hola", None, None).classify(), Err(InboundError::MissingSender));
        assert_eq!(
            form("+34600111222", "hola", None, Some("many")).classify(),
            Err(InboundError::InvalidMediaCount("many".to_string()))
        );
        assert_eq!(normalize_sender("whatsapp:"), None);
    }

    #[test]
    fn deserializes_provider_field_names() {
        let form: InboundForm = serde_json::from_value(serde_json::json!({
            "From": "whatsapp:+34600111222",
            "Body": "hola",
            "MessageSid": "SM9",
            "NumMedia": "0",
            "AccountSid": "ignored"
        }))
        .expect("form");
        assert_eq!(form.message_sid.as_deref(), Some("SM9"));
        assert_eq!(form.classify().map(|inbound| inbound.user_id().to_string()), Ok("+34600111222".to_string()));
    }
}
