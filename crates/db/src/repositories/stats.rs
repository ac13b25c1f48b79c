use std::collections::BTreeMap;

use chrono::NaiveDate;
use futures::TryStreamExt;
use serde::Serialize;

use mesa_core::domain::reservation::{Reservation, ReservationStatus};
use mesa_core::domain::session::Session;
use mesa_core::errors::{ReservationError, SessionError};

use super::{DateRange, ReservationStore, SessionStore};

/// Reservation tallies keyed by status. Every status is always present.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: u64,
    pub by_status: BTreeMap<ReservationStatus, u64>,
    /// Covers every status except `CANCELLED`.
    pub covers: u64,
}

impl Default for StatusCounts {
    fn default() -> Self {
        Self {
            total: 0,
            by_status: ReservationStatus::ALL.iter().map(|status| (*status, 0)).collect(),
            covers: 0,
        }
    }
}

impl StatusCounts {
    pub fn get(&self, status: ReservationStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    fn tally(&mut self, reservation: &Reservation) {
        self.total += 1;
        *self.by_status.entry(reservation.status).or_insert(0) += 1;
        if reservation.holds_capacity() {
            self.covers += u64::from(reservation.party_size);
        }
    }
}

/// Read-only reporting plus the session reset used by operators.
#[derive(Clone)]
pub struct StatsFacade {
    reservations: ReservationStore,
    sessions: SessionStore,
}

impl StatsFacade {
    pub fn new(reservations: ReservationStore, sessions: SessionStore) -> Self {
        Self { reservations, sessions }
    }

    pub async fn counts_by_status(&self, range: DateRange) -> Result<StatusCounts, ReservationError> {
        let mut counts = StatusCounts::default();
        for status in ReservationStatus::ALL {
            let mut stream = self.reservations.list_by_status(status, range).into_stream();
            while let Some(reservation) = stream.try_next().await? {
                counts.tally(&reservation);
            }
        }
        Ok(counts)
    }

    pub async fn counts_for_date(&self, date: NaiveDate) -> Result<StatusCounts, ReservationError> {
        let mut counts = StatusCounts::default();
        let mut stream = self.reservations.list_by_date(date).into_stream();
        while let Some(reservation) = stream.try_next().await? {
            counts.tally(&reservation);
        }
        Ok(counts)
    }

    pub async fn reset_session(&self, user_id: &str) -> Result<Session, SessionError> {
        self.sessions.reset(user_id).await
    }
}
