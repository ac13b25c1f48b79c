use mesa_core::domain::reservation::{Reservation, ReservationStatus};
use mesa_whatsapp::inbound::normalize_sender;

use crate::runtime::ReservationIntent;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Deny { reason_code: &'static str, user_message: String, fallback_path: &'static str },
    Degrade { reason_code: &'static str, user_message: String, fallback_path: &'static str },
}

impl GuardrailDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Chat users act only on reservations booked under their own number.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GuardrailPolicy {
    /// Staff confirm reservations; chat may only move them to cancelled.
    pub chat_can_confirm: bool,
}

impl GuardrailPolicy {
    /// `target` is the stored reservation an intent refers to, already loaded.
    pub fn evaluate(
        &self,
        user_id: &str,
        intent: &ReservationIntent,
        target: Option<&Reservation>,
    ) -> GuardrailDecision {
        match intent {
            // Listing is scoped to the sender by the tool layer, whatever the filters.
            ReservationIntent::List { .. } => GuardrailDecision::Allow,
            ReservationIntent::Create(new) => {
                if same_phone(&new.customer_phone, user_id) {
                    GuardrailDecision::Allow
                } else {
                    GuardrailDecision::Deny {
                        reason_code: "foreign_phone_create",
                        user_message:
                            "Solo puedo registrar reservas con el número desde el que me escribes."
                                .to_string(),
                        fallback_path: "book_with_sender_phone",
                    }
                }
            }
            ReservationIntent::Update { .. }
            | ReservationIntent::Cancel { .. }
            | ReservationIntent::Details { .. } => {
                let Some(target) = target.filter(|target| same_phone(&target.customer_phone, user_id))
                else {
                    // Same answer as a missing id, so other customers' ids are not probed.
                    return GuardrailDecision::Deny {
                        reason_code: "not_reservation_owner",
                        user_message: format!(
                            "❌ No encontré la reserva {} entre las tuyas. Revisa el código de reserva.",
                            intent.target().map(|id| id.as_str()).unwrap_or_default()
                        ),
                        fallback_path: "list_own_reservations",
                    };
                };

                let ReservationIntent::Update { patch, .. } = intent else {
                    return GuardrailDecision::Allow;
                };
                if patch.is_empty() {
                    return GuardrailDecision::Degrade {
                        reason_code: "empty_update",
                        user_message: "⚠️ No se especificaron cambios para realizar.".to_string(),
                        fallback_path: "request_explicit_changes",
                    };
                }
                match patch.status {
                    Some(ReservationStatus::Confirmed | ReservationStatus::Completed)
                        if !self.chat_can_confirm && patch.status != Some(target.status) =>
                    {
                        GuardrailDecision::Deny {
                            reason_code: "status_change_disallowed",
                            user_message: "La confirmación de reservas la realiza nuestro equipo. \
                                           Te avisaremos por WhatsApp."
                                .to_string(),
                            fallback_path: "staff_confirmation",
                        }
                    }
                    _ => GuardrailDecision::Allow,
                }
            }
        }
    }
}

fn same_phone(phone: &str, user_id: &str) -> bool {
    match (normalize_sender(phone), normalize_sender(user_id)) {
        (Some(phone), Some(user_id)) => phone == user_id,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use mesa_core::domain::reservation::{
        NewReservation, Reservation, ReservationPatch, ReservationStatus,
    };

    use super::{GuardrailDecision, GuardrailPolicy};
    use crate::runtime::ReservationIntent;

    const OWNER: &str = "+34600111222";

    fn reservation(phone: &str) -> Reservation {
        NewReservation {
            customer_phone: phone.to_string(),
            customer_name: "Lucia".to_string(),
            date: "2025-06-06".to_string(),
            time: "20:30".to_string(),
            party_size: 4,
            ..NewReservation::default()
        }
        .into_reservation(20, Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap())
        .expect("valid")
    }

    fn reason(decision: GuardrailDecision) -> &'static str {
        match decision {
            GuardrailDecision::Allow => "allow",
            GuardrailDecision::Deny { reason_code, .. }
            | GuardrailDecision::Degrade { reason_code, .. } => reason_code,
        }
    }

    #[test]
    fn owner_may_cancel_and_read_own_reservation() {
        let policy = GuardrailPolicy::default();
        let own = reservation("whatsapp:+34 600 111 222");

        let cancel = ReservationIntent::Cancel { id: own.id.clone() };
        let details = ReservationIntent::Details { id: own.id.clone() };
        assert_eq!(policy.evaluate(OWNER, &cancel, Some(&own)), GuardrailDecision::Allow);
        assert_eq!(policy.evaluate(OWNER, &details, Some(&own)), GuardrailDecision::Allow);
        assert_eq!(
            policy.evaluate(OWNER, &ReservationIntent::all_reservations(), None),
            GuardrailDecision::Allow
        );
    }

    #[test]
    fn foreign_reservation_is_denied_like_a_missing_one() {
        let policy = GuardrailPolicy::default();
        let foreign = reservation("+34699000000");
        let cancel = ReservationIntent::Cancel { id: foreign.id.clone() };

        let denied = policy.evaluate(OWNER, &cancel, Some(&foreign));
        let missing = policy.evaluate(OWNER, &cancel, None);
        assert_eq!(denied, missing);
        assert_eq!(reason(denied), "not_reservation_owner");
    }

    #[test]
    fn create_must_use_sender_phone() {
        let policy = GuardrailPolicy::default();
        let own = ReservationIntent::Create(NewReservation {
            customer_phone: OWNER.to_string(),
            ..NewReservation::default()
        });
        let other = ReservationIntent::Create(NewReservation {
            customer_phone: "+34699000000".to_string(),
            ..NewReservation::default()
        });

        assert!(policy.evaluate(OWNER, &own, None).is_allowed());
        assert_eq!(reason(policy.evaluate(OWNER, &other, None)), "foreign_phone_create");
    }

    #[test]
    fn chat_cannot_confirm_and_empty_updates_degrade() {
        let policy = GuardrailPolicy::default();
        let own = reservation(OWNER);
        let id = own.id.clone();

        let confirm = ReservationIntent::Update {
            id: id.clone(),
            patch: ReservationPatch::status(ReservationStatus::Confirmed),
        };
        assert_eq!(reason(policy.evaluate(OWNER, &confirm, Some(&own))), "status_change_disallowed");

        let cancel_by_update = ReservationIntent::Update {
            id: id.clone(),
            patch: ReservationPatch::status(ReservationStatus::Cancelled),
        };
        assert!(policy.evaluate(OWNER, &cancel_by_update, Some(&own)).is_allowed());

        let empty = ReservationIntent::Update { id, patch: ReservationPatch::default() };
        assert!(matches!(
            policy.evaluate(OWNER, &empty, Some(&own)),
            GuardrailDecision::Degrade { reason_code: "empty_update", .. }
        ));

        let permissive = GuardrailPolicy { chat_can_confirm: true };
        assert!(permissive.evaluate(OWNER, &confirm, Some(&own)).is_allowed());
    }
}
