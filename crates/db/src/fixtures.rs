//! Deterministic demo data for local runs and end-to-end checks.
//!
//! Seeding goes through [`ReservationStore`] like any other writer, so fixtures obey
//! the same capacity and status rules as live traffic.

use chrono::{Duration, NaiveDate};
use serde::Serialize;
use tracing::info;

use mesa_core::domain::reservation::{
    NewReservation, ReservationId, ReservationPatch, ReservationStatus, Slot, DATE_FORMAT,
    TIME_FORMAT,
};
use mesa_core::domain::schedule::ServiceHours;
use mesa_core::errors::ReservationError;

use crate::repositories::ReservationStore;

const GUEST_NAMES: &[&str] =
    &["Lucía Fernández", "Javier Romero", "Carmen Ortega", "Manuel Ruiz", "Rocío Molina"];

const OCCASIONS: &[Option<&str>] = &[None, Some("cumpleaños"), None, Some("aniversario"), None];

/// Phone numbers handed out by fixtures all start with this prefix.
pub const SEED_PHONE_PREFIX: &str = "+3460000";

#[derive(Clone, Debug)]
pub struct SeedPlan {
    pub start: NaiveDate,
    pub days: u32,
    pub party_size: u32,
    pub hours: ServiceHours,
}

impl SeedPlan {
    pub fn new(start: NaiveDate, days: u32) -> Self {
        Self { start, days, party_size: 2, hours: ServiceHours::default() }
    }

    pub fn with_party_size(mut self, party_size: u32) -> Self {
        self.party_size = party_size;
        self
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        (0..self.days).map(|offset| self.start + Duration::days(i64::from(offset))).collect()
    }

    /// Every other seating of each service day, so half the grid stays free.
    pub fn slots(&self) -> Vec<Slot> {
        self.dates()
            .into_iter()
            .flat_map(|date| {
                self.hours
                    .seatings(date)
                    .into_iter()
                    .step_by(2)
                    .map(move |time| Slot::new(date, time))
            })
            .collect()
    }

    pub async fn load(&self, store: &ReservationStore) -> Result<SeedReport, ReservationError> {
        let mut report = SeedReport::default();

        for (index, slot) in self.slots().into_iter().enumerate() {
            let new = NewReservation {
                customer_phone: seed_phone(index),
                customer_name: GUEST_NAMES[index % GUEST_NAMES.len()].to_string(),
                date: slot.date.format(DATE_FORMAT).to_string(),
                time: slot.time.format(TIME_FORMAT).to_string(),
                party_size: self.party_size,
                special_occasion: OCCASIONS[index % OCCASIONS.len()].map(str::to_string),
                preferences: None,
            };

            let reservation = match store.create(new).await {
                Ok(reservation) => reservation,
                Err(ReservationError::CapacityExceeded { .. }) => {
                    report.skipped_full += 1;
                    continue;
                }
                Err(error) => return Err(error),
            };

            if index % 2 == 0 {
                store
                    .update(&reservation.id, ReservationPatch::status(ReservationStatus::Confirmed))
                    .await?;
                report.confirmed += 1;
            }
            report.created += 1;
            report.reservation_ids.push(reservation.id);
        }

        info!(
            event_name = "fixtures.seed.completed",
            created = report.created,
            confirmed = report.confirmed,
            skipped_full = report.skipped_full,
            "demo reservations seeded"
        );
        Ok(report)
    }

    /// Checks that every seeded slot holds at least one fixture reservation.
    pub async fn verify(&self, store: &ReservationStore) -> Result<SeedVerification, ReservationError> {
        let mut checks = Vec::new();

        for date in self.dates() {
            let expected: Vec<Slot> =
                self.slots().into_iter().filter(|slot| slot.date == date).collect();
            let seeded: Vec<Slot> = store
                .list_by_date(date)
                .collect_all()
                .await?
                .into_iter()
                .filter(|reservation| reservation.customer_phone.starts_with(SEED_PHONE_PREFIX))
                .map(|reservation| reservation.slot())
                .collect();

            let present = expected.iter().all(|slot| seeded.contains(slot));
            checks.push(SeedCheck { label: date.format(DATE_FORMAT).to_string(), present });
        }

        let all_present = checks.iter().all(|check| check.present);
        Ok(SeedVerification { all_present, checks })
    }
}

fn seed_phone(index: usize) -> String {
    format!("{SEED_PHONE_PREFIX}{:05}", index % 100_000)
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub created: usize,
    pub confirmed: usize,
    /// Slots already at capacity from earlier runs.
    pub skipped_full: usize,
    pub reservation_ids: Vec<ReservationId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SeedCheck {
    pub label: String,
    pub present: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SeedVerification {
    pub all_present: bool,
    pub checks: Vec<SeedCheck>,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{NaiveDate, TimeZone, Utc};

    use mesa_core::clock::ManualClock;
    use mesa_core::domain::reservation::ReservationStatus;

    use super::SeedPlan;
    use crate::repositories::{ReservationStore, ReservationStoreSettings};
    use crate::store::InMemoryKeyValueStore;

    fn store(capacity: u32) -> ReservationStore {
        ReservationStore::new(
            Arc::new(InMemoryKeyValueStore::default()),
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap())),
            ReservationStoreSettings { bucket_capacity: capacity, ..Default::default() },
        )
    }

    #[test]
    fn plan_skips_closed_days_and_alternate_seatings() {
        // Monday 2025-06-02 and Tuesday 2025-06-03.
        let plan = SeedPlan::new(NaiveDate::from_ymd_opt(2025, 6, 2).expect("date"), 2);
        let slots = plan.slots();

        assert!(slots.iter().all(|slot| slot.date_key() == "2025-06-03"));
        assert_eq!(slots.len(), 8, "4 of 7 lunch seatings and 4 of 8 dinner seatings");
        assert_eq!(slots[0].time_key(), "13:00");
        assert_eq!(slots[1].time_key(), "14:00");
    }

    #[tokio::test]
    async fn load_then_verify() {
        let store = store(40);
        let plan = SeedPlan::new(NaiveDate::from_ymd_opt(2025, 6, 3).expect("date"), 1);

        let report = plan.load(&store).await.expect("seed");
        assert_eq!(report.created, 8);
        assert_eq!(report.confirmed, 4);
        assert_eq!(report.skipped_full, 0);

        let first = store.get(&report.reservation_ids[0]).await.expect("seeded");
        assert_eq!(first.status, ReservationStatus::Confirmed);

        let verification = plan.verify(&store).await.expect("verify");
        assert!(verification.all_present);
    }

    #[tokio::test]
    async fn reseeding_full_slots_is_skipped_not_fatal() {
        let store = store(2);
        let plan = SeedPlan::new(NaiveDate::from_ymd_opt(2025, 6, 3).expect("date"), 1);

        plan.load(&store).await.expect("first run");
        let again = plan.load(&store).await.expect("second run");
        assert_eq!(again.created, 0);
        assert_eq!(again.skipped_full, 8);
    }
}
