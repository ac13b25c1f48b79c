use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(pub String);

impl ReservationId {
    /// `RES-YYYYMMDD-XXXXXXXX`, dated by the reservation slot rather than creation time.
    pub fn generate(date: NaiveDate) -> Self {
        let unique = Uuid::new_v4().simple().to_string();
        Self(format!("RES-{}-{}", date.format("%Y%m%d"), unique[..8].to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    pub const ALL: [Self; 4] = [Self::Pending, Self::Confirmed, Self::Cancelled, Self::Completed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "CONFIRMED" => Some(Self::Confirmed),
            "CANCELLED" | "CANCELED" => Some(Self::Cancelled),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed)
    }

    /// Every status except `Cancelled` counts against the bucket capacity.
    pub fn holds_capacity(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        if *self == next {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Self::Pending, Self::Confirmed)
                | (Self::Confirmed, Self::Completed)
                | (Self::Pending, Self::Cancelled)
                | (Self::Confirmed, Self::Cancelled)
        )
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(date, time)` bucket. Capacity is arbitrated per slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot {
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl Slot {
    pub fn new(date: NaiveDate, time: NaiveTime) -> Self {
        Self { date, time }
    }

    pub fn parse(date: &str, time: &str) -> Result<Self, DomainError> {
        Ok(Self { date: parse_date(date)?, time: parse_time(time)? })
    }

    pub fn date_key(&self) -> String {
        self.date.format(DATE_FORMAT).to_string()
    }

    pub fn time_key(&self) -> String {
        self.time.format(TIME_FORMAT).to_string()
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.date_key(), self.time_key())
    }
}

pub fn parse_date(value: &str) -> Result<NaiveDate, DomainError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).map_err(|_| {
        DomainError::Validation(format!("date `{value}` must use the YYYY-MM-DD format"))
    })
}

pub fn parse_time(value: &str) -> Result<NaiveTime, DomainError> {
    let trimmed = value.trim();
    // NaiveTime accepts `9:5`; the bucket key needs zero-padded HH:MM.
    if trimmed.len() != 5 {
        return Err(DomainError::Validation(format!("time `{value}` must use the HH:MM format")));
    }
    NaiveTime::parse_from_str(trimmed, TIME_FORMAT)
        .map_err(|_| DomainError::Validation(format!("time `{value}` must use the HH:MM format")))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub customer_phone: String,
    pub customer_name: String,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    pub party_size: u32,
    pub status: ReservationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_occasion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl Reservation {
    pub fn slot(&self) -> Slot {
        Slot::new(self.date, self.time)
    }

    pub fn holds_capacity(&self) -> bool {
        self.status.holds_capacity()
    }

    pub fn transition_to(
        &mut self,
        next: ReservationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition { from: self.status, to: next });
        }

        self.status = next;
        self.touch(now);
        Ok(())
    }

    /// Builds the post-patch candidate without mutating `self`, so a rejected
    /// capacity check leaves the stored reservation untouched.
    pub fn patched(
        &self,
        patch: &ReservationPatch,
        max_party_size: u32,
        now: DateTime<Utc>,
    ) -> Result<Reservation, DomainError> {
        let mut next = self.clone();

        if let Some(status) = patch.status {
            next.transition_to(status, now)?;
        }
        if patch.touches_bucket() && next.status.is_terminal() {
            return Err(DomainError::Validation(format!(
                "reservation {} is {} and can no longer be rescheduled",
                self.id, next.status
            )));
        }

        if let Some(date) = &patch.date {
            next.date = parse_date(date)?;
        }
        if let Some(time) = &patch.time {
            next.time = parse_time(time)?;
        }
        if let Some(party_size) = patch.party_size {
            validate_party_size(party_size, max_party_size)?;
            next.party_size = party_size;
        }
        next.touch(now);
        Ok(next)
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now.max(self.created_at);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    pub customer_phone: String,
    pub customer_name: String,
    pub date: String,
    pub time: String,
    pub party_size: u32,
    #[serde(default)]
    pub special_occasion: Option<String>,
    #[serde(default)]
    pub preferences: Option<String>,
}

impl NewReservation {
    pub fn into_reservation(
        self,
        max_party_size: u32,
        now: DateTime<Utc>,
    ) -> Result<Reservation, DomainError> {
        let phone = self.customer_phone.trim();
        if phone.is_empty() {
            return Err(DomainError::Validation("customer phone is required".to_string()));
        }
        validate_party_size(self.party_size, max_party_size)?;
        let slot = Slot::parse(&self.date, &self.time)?;

        Ok(Reservation {
            id: ReservationId::generate(slot.date),
            customer_phone: phone.to_string(),
            customer_name: self.customer_name.trim().to_string(),
            date: slot.date,
            time: slot.time,
            party_size: self.party_size,
            status: ReservationStatus::Pending,
            special_occasion: non_empty(self.special_occasion),
            preferences: non_empty(self.preferences),
            created_at: now,
            updated_at: now,
            ttl: None,
        })
    }
}

/// Only the mutable fields of a reservation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationPatch {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub party_size: Option<u32>,
    #[serde(default)]
    pub status: Option<ReservationStatus>,
}

impl ReservationPatch {
    pub fn status(status: ReservationStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    pub fn touches_bucket(&self) -> bool {
        self.date.is_some() || self.time.is_some() || self.party_size.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.touches_bucket() && self.status.is_none()
    }
}

fn validate_party_size(party_size: u32, max_party_size: u32) -> Result<(), DomainError> {
    if party_size == 0 {
        return Err(DomainError::Validation("party size must be at least 1".to_string()));
    }
    if party_size > max_party_size {
        return Err(DomainError::Validation(format!(
            "party size {party_size} exceeds the maximum of {max_party_size}"
        )));
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TIME_FORMAT;

    pub fn serialize<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.format(TIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, TIME_FORMAT).map_err(serde::de::Error::custom)
    }
}
