use async_trait::async_trait;
use chrono::{Duration, NaiveDate};

use mesa_core::domain::reservation::{
    NewReservation, ReservationId, ReservationPatch, ReservationStatus,
};

use crate::runtime::{AgentError, AgentReply, AgentRequest, ReservationAgent, ReservationIntent};
use crate::tools::ToolResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Book,
    List,
    Change,
    Cancel,
    Details,
    Help,
}

/// Everything the keyword pass could pull out of one message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: Option<Command>,
    pub reservation_id: Option<ReservationId>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub party_size: Option<u32>,
    pub customer_name: Option<String>,
    pub status: Option<ReservationStatus>,
}

#[derive(Clone, Debug, Default)]
pub struct CommandParser;

impl CommandParser {
    pub fn new() -> Self {
        Self
    }

    /// `today` anchors `hoy` and `mañana`.
    pub fn parse(&self, text: &str, today: NaiveDate) -> ParsedCommand {
        let normalized_text = normalize_text(text);
        let tokens = tokenize(&normalized_text);

        ParsedCommand {
            command: extract_command(&normalized_text, &tokens),
            reservation_id: extract_reservation_id(&tokens),
            date: extract_date(&tokens, today),
            time: extract_time(&tokens),
            party_size: extract_party_size(&tokens),
            customer_name: extract_customer_name(text),
            status: extract_status(&tokens),
        }
    }
}

/// Keyword agent for local runs and tests. It never interprets free text beyond
/// the fixed command vocabulary.
#[derive(Clone, Debug)]
pub struct CommandAgent {
    restaurant_name: String,
    parser: CommandParser,
}

impl CommandAgent {
    pub fn new(restaurant_name: impl Into<String>) -> Self {
        Self { restaurant_name: restaurant_name.into(), parser: CommandParser::new() }
    }

    pub fn interpret(&self, request: &AgentRequest) -> AgentReply {
        let parsed = self.parser.parse(&request.message, request.received_at.date_naive());
        // Follow-ups without a code refer to the reservation made last in this conversation.
        let reservation_id =
            parsed.reservation_id.clone().or_else(|| request.reservation_ids.last().cloned());

        match parsed.command.unwrap_or(Command::Help) {
            Command::Help => AgentReply::text(self.help_text()),
            Command::List => AgentReply::default()
                .with_intent(ReservationIntent::List { date: parsed.date.clone(), status: parsed.status }),
            Command::Book => match (&parsed.date, &parsed.time, parsed.party_size) {
                (Some(date), Some(time), Some(party_size)) => {
                    AgentReply::default().with_intent(ReservationIntent::Create(NewReservation {
                        customer_phone: request.user_id.clone(),
                        customer_name: parsed.customer_name.clone().unwrap_or_default(),
                        date: date.clone(),
                        time: time.clone(),
                        party_size,
                        special_occasion: None,
                        preferences: None,
                    }))
                }
                _ => AgentReply::text(missing_booking_details(&parsed)),
            },
            Command::Cancel | Command::Change | Command::Details => {
                let Some(id) = reservation_id else {
                    return AgentReply::text(
                        "¿De qué reserva se trata? Indícame el código, por ejemplo \
                         RES-20250606-1A2B3C4D, o escribe \"mis reservas\" para verlas.",
                    );
                };
                let intent = match parsed.command {
                    Some(Command::Cancel) => ReservationIntent::Cancel { id },
                    Some(Command::Change) => ReservationIntent::Update {
                        id,
                        patch: ReservationPatch {
                            date: parsed.date.clone(),
                            time: parsed.time.clone(),
                            party_size: parsed.party_size,
                            status: None,
                        },
                    },
                    _ => ReservationIntent::Details { id },
                };
                AgentReply::default().with_intent(intent)
            }
        }
    }

    fn help_text(&self) -> String {
        format!(
            "¡Hola! Soy el asistente de reservas de {}. 🇪🇸\n\n\
             Puedes escribirme:\n\
             • reservar 2025-06-06 20:30 4 personas a nombre de Lucía\n\
             • mis reservas (o: mis reservas confirmadas mañana)\n\
             • detalles RES-20250606-1A2B3C4D\n\
             • cambiar RES-20250606-1A2B3C4D 21:00\n\
             • cancelar RES-20250606-1A2B3C4D",
            self.restaurant_name
        )
    }
}

#[async_trait]
impl ReservationAgent for CommandAgent {
    async fn respond(&self, request: AgentRequest) -> Result<AgentReply, AgentError> {
        Ok(self.interpret(&request))
    }

    /// The draft never restates tool output, so every result is rendered in full.
    fn compose(&self, reply: &AgentReply, results: &[ToolResult]) -> String {
        let mut parts = Vec::new();
        if !reply.text.trim().is_empty() {
            parts.push(reply.text.trim().to_string());
        }
        parts.extend(results.iter().map(ToolResult::message));
        parts.join("\n\n")
    }
}

fn missing_booking_details(parsed: &ParsedCommand) -> String {
    let mut missing = Vec::new();
    if parsed.date.is_none() {
        missing.push("la fecha (YYYY-MM-DD)");
    }
    if parsed.time.is_none() {
        missing.push("la hora (HH:MM)");
    }
    if parsed.party_size.is_none() {
        missing.push("el número de personas");
    }
    format!(
        "Para completar la reserva necesito {}.\n\nEjemplo: reservar 2025-06-06 20:30 4 personas \
         a nombre de Lucía",
        missing.join(", ")
    )
}

fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|character| match character {
            'á' => 'a',
            'é' => 'e',
            'í' => 'i',
            'ó' => 'o',
            'ú' | 'ü' => 'u',
            other => other,
        })
        .collect()
}

fn tokenize(text: &str) -> Vec<String> {
    let mut sanitized = String::with_capacity(text.len());
    for character in text.chars() {
        if character.is_alphanumeric() || matches!(character, '-' | ':' | '/' | '+') {
            sanitized.push(character);
        } else {
            sanitized.push(' ');
        }
    }
    sanitized.split_whitespace().map(|token| token.to_string()).collect()
}

fn extract_command(normalized_text: &str, tokens: &[String]) -> Option<Command> {
    let has = |words: &[&str]| tokens.iter().any(|token| words.contains(&token.as_str()));

    if has(&["cancelar", "cancela", "cancelo", "anular", "anula"]) {
        return Some(Command::Cancel);
    }
    if has(&["cambiar", "cambia", "modificar", "modifica", "mover", "mueve"]) {
        return Some(Command::Change);
    }
    if normalized_text.contains("mis reservas")
        || normalized_text.contains("ver reservas")
        || has(&["listar", "lista"])
    {
        return Some(Command::List);
    }
    if has(&["detalle", "detalles", "estado", "consultar", "consulta"]) {
        return Some(Command::Details);
    }
    if has(&["reservar", "reserva", "reservo", "mesa"]) {
        return Some(Command::Book);
    }
    if has(&["hola", "ayuda", "buenas", "menu", "info"]) {
        return Some(Command::Help);
    }
    None
}

fn extract_reservation_id(tokens: &[String]) -> Option<ReservationId> {
    tokens
        .iter()
        .find(|token| token.starts_with("res-") && token.len() > "res-".len())
        .map(|token| ReservationId(token.to_ascii_uppercase()))
}

fn extract_date(tokens: &[String], today: NaiveDate) -> Option<String> {
    for token in tokens {
        let date = match token.as_str() {
            "hoy" => Some(today),
            "manana" | "mañana" => Some(today + Duration::days(1)),
            raw => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
                .ok(),
        };
        if let Some(date) = date {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    None
}

fn extract_time(tokens: &[String]) -> Option<String> {
    tokens.iter().find_map(|token| {
        let (hour, minute) = token.split_once(':')?;
        let hour = hour.parse::<u32>().ok().filter(|hour| *hour < 24)?;
        let minute = minute.parse::<u32>().ok().filter(|minute| *minute < 60)?;
        (token.len() <= 5).then(|| format!("{hour:02}:{minute:02}"))
    })
}

fn extract_party_size(tokens: &[String]) -> Option<u32> {
    for window in tokens.windows(2) {
        if let [value, unit] = window {
            if is_party_unit(unit) {
                if let Ok(size) = value.parse::<u32>() {
                    return Some(size);
                }
            }
            if value == "para" {
                if let Ok(size) = unit.parse::<u32>() {
                    return Some(size);
                }
            }
        }
    }

    // A bare count after the time, as in `reservar 2025-06-06 20:30 4`.
    let time_index = tokens.iter().position(|token| token.contains(':'))?;
    tokens.get(time_index + 1).and_then(|token| token.parse::<u32>().ok())
}

fn extract_status(tokens: &[String]) -> Option<ReservationStatus> {
    tokens.iter().find_map(|token| match token.trim_end_matches('s') {
        "pendiente" => Some(ReservationStatus::Pending),
        "confirmada" | "confirmado" => Some(ReservationStatus::Confirmed),
        "cancelada" | "cancelado" => Some(ReservationStatus::Cancelled),
        "completada" | "completado" => Some(ReservationStatus::Completed),
        _ => None,
    })
}

fn is_party_unit(token: &str) -> bool {
    matches!(token, "persona" | "personas" | "pax" | "comensales" | "comensal" | "adultos")
}

fn extract_customer_name(text: &str) -> Option<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let start = words.windows(2).position(|pair| {
        pair[0].eq_ignore_ascii_case("nombre") && pair[1].eq_ignore_ascii_case("de")
    })? + 2;

    let name = words[start..]
        .iter()
        .take_while(|word| !word.chars().any(|character| character.is_ascii_digit()))
        .take(4)
        .map(|word| word.trim_matches(|character: char| !character.is_alphanumeric()))
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};
    use mesa_core::domain::reservation::{ReservationId, ReservationPatch, ReservationStatus};

    use super::{Command, CommandAgent, CommandParser};
    use crate::runtime::{AgentRequest, ReservationIntent};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 5).expect("date")
    }

    fn request(message: &str, linked: Vec<ReservationId>) -> AgentRequest {
        AgentRequest {
            user_id: "+34600111222".to_string(),
            message: message.to_string(),
            history: Vec::new(),
            reservation_ids: linked,
            received_at: Utc.with_ymd_and_hms(2025, 6, 5, 18, 0, 0).unwrap(),
        }
    }

    #[test]
    fn parses_a_full_booking_sentence() {
        let parsed = CommandParser::new().parse(
            "Quiero reservar mesa el 06/06/2025 a las 20:30 para 4 a nombre de Lucía Pérez",
            today(),
        );

        assert_eq!(parsed.command, Some(Command::Book));
        assert_eq!(parsed.date.as_deref(), Some("2025-06-06"));
        assert_eq!(parsed.time.as_deref(), Some("20:30"));
        assert_eq!(parsed.party_size, Some(4));
        assert_eq!(parsed.customer_name.as_deref(), Some("Lucía Pérez"));
    }

    #[test]
    fn command_vocabulary_table() {
        struct Case {
            text: &'static str,
            command: Option<Command>,
        }

        let cases = [
            Case { text: "Cancelar RES-20250606-1A2B3C4D", command: Some(Command::Cancel) },
            Case { text: "quiero cambiar mi reserva a las 21:00", command: Some(Command::Change) },
            Case { text: "¿Puedes enseñarme mis reservas?", command: Some(Command::List) },
            Case { text: "estado de res-20250606-1a2b3c4d", command: Some(Command::Details) },
            Case { text: "Hola!", command: Some(Command::Help) },
            Case { text: "una mesa para mañana", command: Some(Command::Book) },
            Case { text: "qué tal el tiempo", command: None },
        ];

        let parser = CommandParser::new();
        for (index, case) in cases.iter().enumerate() {
            assert_eq!(parser.parse(case.text, today()).command, case.command, "case {index}: {}", case.text);
        }
    }

    #[test]
    fn list_requests_carry_date_and_status_filters() {
        let agent = CommandAgent::new("El Rincón");

        let reply = agent.interpret(&request("mis reservas confirmadas para mañana", Vec::new()));
        assert_eq!(
            reply.intents,
            vec![ReservationIntent::List {
                date: Some("2025-06-06".to_string()),
                status: Some(ReservationStatus::Confirmed),
            }]
        );

        let reply = agent.interpret(&request("ver reservas canceladas", Vec::new()));
        assert_eq!(
            reply.intents,
            vec![ReservationIntent::List { date: None, status: Some(ReservationStatus::Cancelled) }]
        );

        let reply = agent.interpret(&request("mis reservas", Vec::new()));
        assert_eq!(reply.intents, vec![ReservationIntent::all_reservations()]);
    }

    #[test]
    fn relative_dates_and_bare_counts() {
        let parsed = CommandParser::new().parse("reservar mañana 9:30 3", today());
        assert_eq!(parsed.date.as_deref(), Some("2025-06-06"));
        assert_eq!(parsed.time.as_deref(), Some("09:30"));
        assert_eq!(parsed.party_size, Some(3));
    }

    #[test]
    fn booking_intent_uses_sender_phone() {
        let agent = CommandAgent::new("El Rincón");
        let reply = agent.interpret(&request("reservar 2025-06-06 20:30 2 personas", Vec::new()));

        assert!(reply.text.is_empty());
        let [ReservationIntent::Create(new)] = reply.intents.as_slice() else {
            panic!("expected one create intent, got {:?}", reply.intents);
        };
        assert_eq!(new.customer_phone, "+34600111222");
        assert_eq!(new.party_size, 2);
    }

    #[test]
    fn incomplete_booking_asks_for_missing_fields() {
        let agent = CommandAgent::new("El Rincón");
        let reply = agent.interpret(&request("quiero reservar el 2025-06-06", Vec::new()));

        assert!(reply.intents.is_empty());
        assert!(reply.text.contains("la hora"));
        assert!(reply.text.contains("el número de personas"));
        assert!(!reply.text.contains("la fecha"));
    }

    #[test]
    fn follow_ups_fall_back_to_last_linked_reservation() {
        let agent = CommandAgent::new("El Rincón");
        let linked = vec![
            ReservationId("RES-20250606-00000001".into()),
            ReservationId("RES-20250607-00000002".into()),
        ];

        let reply = agent.interpret(&request("cambiar a las 21:30", linked));
        assert_eq!(
            reply.intents,
            vec![ReservationIntent::Update {
                id: ReservationId("RES-20250607-00000002".into()),
                patch: ReservationPatch { time: Some("21:30".into()), ..ReservationPatch::default() },
            }]
        );

        let unknown = agent.interpret(&request("cancelar", Vec::new()));
        assert!(unknown.intents.is_empty());
        assert!(unknown.text.contains("mis reservas"));
    }

    #[test]
    fn unknown_text_gets_help() {
        let agent = CommandAgent::new("El Rincón");
        let reply = agent.interpret(&request("qué tal el tiempo", Vec::new()));
        assert!(reply.intents.is_empty());
        assert!(reply.text.contains("El Rincón"));
    }
}
