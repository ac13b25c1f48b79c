//! Applies [`ReservationIntent`]s against the reservation store.
//!
//! Every outcome, including storage failures, comes back as a [`ToolResult`] whose
//! text is safe to show to the customer. Internal detail only reaches the logs.

use chrono::{Datelike, NaiveDate, Weekday};
use tracing::{info, warn};

use mesa_core::domain::reservation::{
    parse_date, parse_time, NewReservation, Reservation, ReservationId, ReservationPatch,
    ReservationStatus, Slot,
};
use mesa_core::domain::schedule::{ScheduleViolation, ServiceHours};
use mesa_core::errors::ReservationError;
use mesa_db::ReservationStore;
use mesa_whatsapp::inbound::normalize_sender;
use mesa_whatsapp::notices;

use crate::guardrails::{GuardrailDecision, GuardrailPolicy};
use crate::runtime::ReservationIntent;

pub const MIN_PHONE_LENGTH: usize = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ToolName {
    CreateReservation,
    ListReservations,
    UpdateReservation,
    CancelReservation,
    ReservationDetails,
}

impl ToolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateReservation => "create_reservation",
            Self::ListReservations => "list_reservations",
            Self::UpdateReservation => "update_reservation",
            Self::CancelReservation => "cancel_reservation",
            Self::ReservationDetails => "get_reservation_details",
        }
    }

    fn for_intent(intent: &ReservationIntent) -> Self {
        match intent {
            ReservationIntent::Create(_) => Self::CreateReservation,
            ReservationIntent::List { .. } => Self::ListReservations,
            ReservationIntent::Update { .. } => Self::UpdateReservation,
            ReservationIntent::Cancel { .. } => Self::CancelReservation,
            ReservationIntent::Details { .. } => Self::ReservationDetails,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolOutcome {
    Created(Reservation),
    /// `filtered` is set when a date or status narrowed the listing.
    Listed { reservations: Vec<Reservation>, filtered: bool },
    Updated { before: Reservation, after: Reservation },
    Cancelled(Reservation),
    Details(Reservation),
}

impl ToolOutcome {
    /// Whether the outcome changed stored state.
    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Created(_) | Self::Updated { .. } | Self::Cancelled(_))
    }

    pub fn summary(&self) -> String {
        match self {
            Self::Created(reservation) => format!(
                "✅ ¡Reserva registrada exitosamente!\n\n{}\n\n\
                 Nuestro equipo te confirmará la reserva por WhatsApp en las próximas 2 horas.",
                reservation_card(reservation)
            ),
            Self::Listed { reservations, filtered: false } if reservations.is_empty() => {
                "No tienes reservas registradas con este número.".to_string()
            }
            Self::Listed { reservations, filtered: true } if reservations.is_empty() => {
                "No tienes reservas que coincidan con esa fecha o estado.".to_string()
            }
            Self::Listed { reservations, .. } => {
                let lines = reservations
                    .iter()
                    .map(|reservation| {
                        format!(
                            "• {} · {} {} · {} personas · {}",
                            reservation.id,
                            display_date(reservation.date),
                            reservation.slot().time_key(),
                            reservation.party_size,
                            status_label(reservation.status)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("📋 Tus reservas ({}):\n{lines}", reservations.len())
            }
            Self::Updated { before, after } => {
                let changes = describe_changes(before, after);
                format!(
                    "✅ ¡Reserva actualizada exitosamente!\n\n🔄 CAMBIOS REALIZADOS:\n{}\n\n{}",
                    changes.join("\n"),
                    reservation_card(after)
                )
            }
            Self::Cancelled(reservation) => format!(
                "❌ Reserva cancelada exitosamente\n\n{}\n\n\
                 Si deseas realizar una nueva reserva, estaremos encantados de atenderte.",
                reservation_card(reservation)
            ),
            Self::Details(reservation) => reservation_card(reservation),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolResult {
    Succeeded { tool: ToolName, outcome: ToolOutcome },
    Failed { tool: ToolName, reason_code: &'static str, user_message: String, transient: bool },
}

impl ToolResult {
    pub fn tool(&self) -> ToolName {
        match self {
            Self::Succeeded { tool, .. } | Self::Failed { tool, .. } => *tool,
        }
    }

    pub fn outcome(&self) -> Option<&ToolOutcome> {
        match self {
            Self::Succeeded { outcome, .. } => Some(outcome),
            Self::Failed { .. } => None,
        }
    }

    pub fn failure_message(&self) -> Option<&str> {
        match self {
            Self::Failed { user_message, .. } => Some(user_message),
            Self::Succeeded { .. } => None,
        }
    }

    /// The storage layer could not answer; retrying the delivery may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Failed { transient: true, .. })
    }

    pub fn created(&self) -> Option<&ReservationId> {
        match self.outcome() {
            Some(ToolOutcome::Created(reservation)) => Some(&reservation.id),
            _ => None,
        }
    }

    /// Customer-facing text for either branch.
    pub fn message(&self) -> String {
        match self {
            Self::Succeeded { outcome, .. } => outcome.summary(),
            Self::Failed { user_message, .. } => user_message.clone(),
        }
    }

    fn failed(tool: ToolName, reason_code: &'static str, user_message: impl Into<String>) -> Self {
        Self::Failed { tool, reason_code, user_message: user_message.into(), transient: false }
    }
}

#[derive(Clone)]
pub struct ToolExecutor {
    reservations: ReservationStore,
    hours: ServiceHours,
    guardrails: GuardrailPolicy,
    list_limit: usize,
}

impl ToolExecutor {
    pub fn new(reservations: ReservationStore, hours: ServiceHours, guardrails: GuardrailPolicy) -> Self {
        let list_limit = reservations.settings().page_size;
        Self { reservations, hours, guardrails, list_limit }
    }

    pub fn with_list_limit(mut self, list_limit: usize) -> Self {
        self.list_limit = list_limit.max(1);
        self
    }

    pub fn reservations(&self) -> &ReservationStore {
        &self.reservations
    }

    /// Runs one intent for `user_id`. A create without a phone, or with the sender's
    /// number in another spelling, is booked under `user_id`.
    pub async fn apply(&self, user_id: &str, intent: &ReservationIntent) -> ToolResult {
        let tool = ToolName::for_intent(intent);
        let intent = bind_sender(user_id, intent);

        let target = match intent.target() {
            Some(id) => match self.reservations.get(id).await {
                Ok(reservation) => Some(reservation),
                Err(ReservationError::NotFound(_)) => None,
                Err(error) => return self.storage_failure(tool, error),
            },
            None => None,
        };

        match self.guardrails.evaluate(user_id, &intent, target.as_ref()) {
            GuardrailDecision::Allow => {}
            GuardrailDecision::Deny { reason_code, user_message, fallback_path }
            | GuardrailDecision::Degrade { reason_code, user_message, fallback_path } => {
                info!(
                    event_name = "agent.guardrail.blocked",
                    tool = tool.as_str(),
                    reason_code,
                    fallback_path,
                    "intent blocked by guardrail"
                );
                return ToolResult::failed(tool, reason_code, user_message);
            }
        }

        let result = match (intent, target) {
            (ReservationIntent::Create(new), _) => self.create(new).await,
            (ReservationIntent::List { date, status }, _) => {
                self.list(user_id, date.as_deref(), status).await
            }
            (ReservationIntent::Update { id, patch }, Some(before)) => {
                self.update(&id, patch, before).await
            }
            (ReservationIntent::Cancel { id }, Some(_)) => {
                self.reservations.cancel(&id).await.map(ToolOutcome::Cancelled).map_err(Rejection::from)
            }
            (ReservationIntent::Details { .. }, Some(reservation)) => {
                Ok(ToolOutcome::Details(reservation))
            }
            // The guardrail denies targeted intents without a loaded reservation.
            (_, None) => return ToolResult::failed(tool, "not_found", notices::GENERIC),
        };

        match result {
            Ok(outcome) => {
                info!(
                    event_name = "agent.tool.succeeded",
                    tool = tool.as_str(),
                    mutation = outcome.is_mutation(),
                    "tool applied"
                );
                ToolResult::Succeeded { tool, outcome }
            }
            Err(Rejection::Rule(reason_code, user_message)) => {
                ToolResult::failed(tool, reason_code, user_message)
            }
            Err(Rejection::Store(error)) => self.storage_failure(tool, error),
        }
    }

    async fn create(&self, new: NewReservation) -> Result<ToolOutcome, Rejection> {
        if new.customer_phone.trim().chars().count() < MIN_PHONE_LENGTH {
            return Err(Rejection::Rule(
                "invalid_phone",
                "Por favor proporciona un número de teléfono válido.".to_string(),
            ));
        }
        let slot = Slot::parse(&new.date, &new.time).map_err(|_| malformed_slot())?;
        self.check_schedule(&slot)?;
        self.check_party_size(new.party_size)?;

        Ok(ToolOutcome::Created(self.reservations.create(new).await?))
    }

    /// Pages through the sender's reservations until `list_limit` of them match.
    async fn list(
        &self,
        user_id: &str,
        date: Option<&str>,
        status: Option<ReservationStatus>,
    ) -> Result<ToolOutcome, Rejection> {
        let date = date
            .map(|date| {
                parse_date(date).map_err(|_| {
                    Rejection::Rule(
                        "malformed_date",
                        "Formato de fecha inválido. Usa YYYY-MM-DD (ej: 2025-06-06).".to_string(),
                    )
                })
            })
            .transpose()?;
        let filtered = date.is_some() || status.is_some();

        let mut pager = self.reservations.list_by_customer(user_id).with_page_size(self.list_limit);
        let mut reservations = Vec::new();
        while reservations.len() < self.list_limit {
            let Some(page) = pager.next_page().await? else {
                break;
            };
            reservations.extend(page.into_iter().filter(|reservation| {
                date.map_or(true, |date| reservation.date == date)
                    && status.map_or(true, |status| reservation.status == status)
            }));
            if !filtered {
                break;
            }
        }
        reservations.truncate(self.list_limit);
        Ok(ToolOutcome::Listed { reservations, filtered })
    }

    async fn update(
        &self,
        id: &ReservationId,
        patch: ReservationPatch,
        before: Reservation,
    ) -> Result<ToolOutcome, Rejection> {
        if patch.date.is_some() || patch.time.is_some() {
            let date = match &patch.date {
                Some(date) => parse_date(date).map_err(|_| malformed_slot())?,
                None => before.date,
            };
            let time = match &patch.time {
                Some(time) => parse_time(time).map_err(|_| malformed_slot())?,
                None => before.time,
            };
            self.check_schedule(&Slot::new(date, time))?;
        }
        if let Some(party_size) = patch.party_size {
            self.check_party_size(party_size)?;
        }

        let after = self.reservations.update(id, patch).await?;
        Ok(ToolOutcome::Updated { before, after })
    }

    fn check_schedule(&self, slot: &Slot) -> Result<(), Rejection> {
        self.hours.check(slot).map_err(|violation| {
            Rejection::Rule("outside_service_hours", schedule_message(&violation))
        })
    }

    fn check_party_size(&self, party_size: u32) -> Result<(), Rejection> {
        let max_party_size = self.reservations.settings().max_party_size;
        if party_size == 0 {
            return Err(Rejection::Rule(
                "invalid_party_size",
                "El número de personas debe ser al menos 1.".to_string(),
            ));
        }
        if party_size > max_party_size {
            return Err(Rejection::Rule(
                "party_too_large",
                format!(
                    "Para grupos mayores a {max_party_size} personas, por favor contacta \
                     directamente al restaurante."
                ),
            ));
        }
        Ok(())
    }

    fn storage_failure(&self, tool: ToolName, error: ReservationError) -> ToolResult {
        let (reason_code, user_message) = match &error {
            ReservationError::NotFound(id) => {
                ("not_found", format!("❌ No se encontró la reserva con ID: {id}"))
            }
            ReservationError::CapacityExceeded { date, time, requested, available } => {
                let remaining = match available {
                    0 => String::new(),
                    n => format!(" (quedan {n} plazas)"),
                };
                (
                    "capacity_exceeded",
                    format!(
                        "Lo sentimos, no queda disponibilidad para {requested} personas el {date} a \
                         las {time}{remaining}. ¿Quieres probar otra hora?"
                    ),
                )
            }
            ReservationError::AlreadyCancelled(_) => {
                ("already_cancelled", "⚠️ Esta reserva ya estaba cancelada previamente.".to_string())
            }
            ReservationError::InvalidTransition { from, .. } => (
                "invalid_transition",
                format!("Esta reserva está {} y no admite ese cambio.", status_label(*from)),
            ),
            ReservationError::Validation(_) => (
                "invalid_request",
                "No he podido procesar los datos de la reserva. Revisa la fecha, la hora y el \
                 número de personas."
                    .to_string(),
            ),
            ReservationError::StoreUnavailable(_) | ReservationError::MalformedKey(_) => {
                ("storage_failure", notices::TECHNICAL_ERROR.to_string())
            }
        };

        if reason_code == "storage_failure" {
            warn!(
                event_name = "agent.tool.storage_failure",
                tool = tool.as_str(),
                error = %error,
                "tool could not reach the reservation store"
            );
        }

        ToolResult::Failed { tool, reason_code, user_message, transient: error.is_transient() }
    }
}

enum Rejection {
    Rule(&'static str, String),
    Store(ReservationError),
}

impl From<ReservationError> for Rejection {
    fn from(error: ReservationError) -> Self {
        Self::Store(error)
    }
}

fn bind_sender(user_id: &str, intent: &ReservationIntent) -> ReservationIntent {
    match intent {
        ReservationIntent::Create(new)
            if new.customer_phone.trim().is_empty()
                || normalize_sender(&new.customer_phone).as_deref() == Some(user_id) =>
        {
            ReservationIntent::Create(NewReservation {
                customer_phone: user_id.to_string(),
                ..new.clone()
            })
        }
        other => other.clone(),
    }
}

fn malformed_slot() -> Rejection {
    Rejection::Rule(
        "malformed_slot",
        "Formato de fecha u hora inválido. Usa YYYY-MM-DD y HH:MM (ej: 2025-06-06 20:30)."
            .to_string(),
    )
}

fn schedule_message(violation: &ScheduleViolation) -> String {
    match violation {
        ScheduleViolation::OffGrid { slot_minutes } => format!(
            "Las reservas se gestionan en bloques de {slot_minutes} minutos (ej: 20:00, 20:30, 21:00)."
        ),
        ScheduleViolation::Closed { weekday } => format!(
            "Lo sentimos, el restaurante está cerrado los {}. Por favor elige otro día.",
            weekday_plural(*weekday)
        ),
        ScheduleViolation::OutsideHours { weekday, windows, .. } => format!(
            "Horario no disponible. {}: {}.",
            weekday_name(*weekday),
            windows.replace(", ", " y ")
        ),
    }
}

fn reservation_card(reservation: &Reservation) -> String {
    let mut card = format!(
        "📋 ID de Reserva: {}\n👤 Nombre: {}\n📅 Fecha: {}\n🕐 Hora: {}\n👥 Número de personas: {}\n📞 Teléfono: {}",
        reservation.id,
        if reservation.customer_name.is_empty() { "-" } else { &reservation.customer_name },
        display_date(reservation.date),
        reservation.slot().time_key(),
        reservation.party_size,
        reservation.customer_phone
    );
    if let Some(occasion) = &reservation.special_occasion {
        card.push_str(&format!("\n🎉 Ocasión especial: {occasion}"));
    }
    if let Some(preferences) = &reservation.preferences {
        card.push_str(&format!("\n📝 Preferencias: {preferences}"));
    }
    card.push_str(&format!("\n📊 Estado: {}", status_label(reservation.status)));
    card
}

fn describe_changes(before: &Reservation, after: &Reservation) -> Vec<String> {
    let mut changes = Vec::new();
    if before.date != after.date {
        changes.push(format!(
            "  • 📅 Fecha: {} → {}",
            display_date(before.date),
            display_date(after.date)
        ));
    }
    if before.time != after.time {
        changes.push(format!(
            "  • 🕐 Hora: {} → {}",
            before.slot().time_key(),
            after.slot().time_key()
        ));
    }
    if before.party_size != after.party_size {
        changes.push(format!("  • 👥 Personas: {} → {}", before.party_size, after.party_size));
    }
    if before.status != after.status {
        changes.push(format!(
            "  • 📊 Estado: {} → {}",
            status_label(before.status),
            status_label(after.status)
        ));
    }
    if changes.is_empty() {
        changes.push("  • Sin cambios".to_string());
    }
    changes
}

pub fn status_label(status: ReservationStatus) -> &'static str {
    match status {
        ReservationStatus::Pending => "⏳ Pendiente",
        ReservationStatus::Confirmed => "✅ Confirmada",
        ReservationStatus::Cancelled => "❌ Cancelada",
        ReservationStatus::Completed => "🍽️ Completada",
    }
}

/// `Viernes, 06/06/2025`.
pub fn display_date(date: NaiveDate) -> String {
    format!("{}, {}", weekday_name(date.weekday()), date.format("%d/%m/%Y"))
}

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Lunes",
        Weekday::Tue => "Martes",
        Weekday::Wed => "Miércoles",
        Weekday::Thu => "Jueves",
        Weekday::Fri => "Viernes",
        Weekday::Sat => "Sábado",
        Weekday::Sun => "Domingo",
    }
}

fn weekday_plural(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "lunes",
        Weekday::Tue => "martes",
        Weekday::Wed => "miércoles",
        Weekday::Thu => "jueves",
        Weekday::Fri => "viernes",
        Weekday::Sat => "sábados",
        Weekday::Sun => "domingos",
    }
}
