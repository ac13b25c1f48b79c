use chrono::NaiveDate;

use mesa_core::domain::reservation::DATE_FORMAT;
use mesa_core::errors::{ReservationError, SessionError};

use crate::store::{SortRange, StorageError};

pub mod reservation;
pub mod session;
pub mod stats;

pub use reservation::{
    PageToken, ReservationPage, ReservationPager, ReservationStore, ReservationStoreSettings,
};
pub use session::{AppendOutcome, SessionStore, SessionStoreSettings};
pub use stats::{StatsFacade, StatusCounts};

/// Inclusive date range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, ReservationError> {
        if from > to {
            return Err(ReservationError::Validation(format!(
                "date range starts after it ends ({} > {})",
                from.format(DATE_FORMAT),
                to.format(DATE_FORMAT)
            )));
        }
        Ok(Self { from, to })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self { from: date, to: date }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.from && date <= self.to
    }

    pub(crate) fn sort_range(&self) -> SortRange {
        SortRange::Between(
            self.from.format(DATE_FORMAT).to_string(),
            self.to.format(DATE_FORMAT).to_string(),
        )
    }
}

pub(crate) fn reservation_error(error: StorageError) -> ReservationError {
    match error {
        StorageError::Decode { key, reason } => {
            ReservationError::StoreUnavailable(format!("stored item {key} is unreadable: {reason}"))
        }
        other => ReservationError::StoreUnavailable(other.to_string()),
    }
}

pub(crate) fn session_error(error: StorageError) -> SessionError {
    match error {
        StorageError::Decode { key, reason } => {
            SessionError::StoreUnavailable(format!("stored item {key} is unreadable: {reason}"))
        }
        other => SessionError::StoreUnavailable(other.to_string()),
    }
}
