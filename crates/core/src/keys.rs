//! Single-table key layout.
//!
//! Every entity lives in one keyed table under a `(partition, sort)` pair. Reservations
//! also project two secondary index keys so the same items answer "by date" and "by
//! status then date" queries:
//!
//! | entity              | partition                    | sort                                 |
//! |---------------------|------------------------------|--------------------------------------|
//! | reservation         | `RES#<id>`                   | `META`                               |
//! | ├ GSI1              | `DATE#<date>`                | `<HH:MM>#<id>`                       |
//! | └ StatusDateIndex   | `<STATUS>`                   | `<date>`                             |
//! | customer pointer    | `CUSTOMER#<phone>`           | `RESERVATION#<date>#<HH:MM>#<id>`    |
//! | bucket fence        | `BUCKET#<date>#<HH:MM>`      | `FENCE`                              |
//! | session             | `SESSION#<user>`             | `STATE`                              |

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::reservation::{
    parse_date, parse_time, Reservation, ReservationId, ReservationStatus, Slot, DATE_FORMAT,
};
use crate::errors::KeyError;

pub const RESERVATION_PREFIX: &str = "RES#";
pub const RESERVATION_SORT: &str = "META";
pub const DATE_PREFIX: &str = "DATE#";
pub const SESSION_PREFIX: &str = "SESSION#";
pub const SESSION_SORT: &str = "STATE";
pub const CUSTOMER_PREFIX: &str = "CUSTOMER#";
pub const CUSTOMER_SORT_PREFIX: &str = "RESERVATION#";
pub const BUCKET_PREFIX: &str = "BUCKET#";
pub const BUCKET_SORT: &str = "FENCE";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub partition: String,
    pub sort: String,
}

impl ItemKey {
    pub fn new(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self { partition: partition.into(), sort: sort.into() }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.partition, self.sort)
    }
}

/// Projection attributes for one secondary index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexKey {
    pub partition: String,
    pub sort: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexName {
    Primary,
    Gsi1,
    StatusDate,
}

impl IndexName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "PRIMARY",
            Self::Gsi1 => "GSI1",
            Self::StatusDate => "StatusDateIndex",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservationKeys {
    pub primary: ItemKey,
    pub by_date: IndexKey,
    pub by_status: IndexKey,
    pub customer: ItemKey,
    pub fence: ItemKey,
}

pub fn reservation_keys(reservation: &Reservation) -> ReservationKeys {
    ReservationKeys {
        primary: reservation_key(&reservation.id),
        by_date: IndexKey {
            partition: date_partition(reservation.date),
            sort: format!("{}#{}", reservation.slot().time_key(), reservation.id),
        },
        by_status: status_index_key(reservation.status, reservation.date),
        customer: customer_pointer_key(reservation),
        fence: bucket_fence_key(&reservation.slot()),
    }
}

pub fn reservation_key(id: &ReservationId) -> ItemKey {
    ItemKey::new(format!("{RESERVATION_PREFIX}{id}"), RESERVATION_SORT)
}

pub fn date_partition(date: NaiveDate) -> String {
    format!("{DATE_PREFIX}{}", date.format(DATE_FORMAT))
}

/// GSI1 sort-key prefix selecting one bucket inside a date partition.
pub fn bucket_sort_prefix(slot: &Slot) -> String {
    format!("{}#", slot.time_key())
}

pub fn status_index_key(status: ReservationStatus, date: NaiveDate) -> IndexKey {
    IndexKey {
        partition: status.as_str().to_string(),
        sort: date.format(DATE_FORMAT).to_string(),
    }
}

pub fn customer_partition(phone: &str) -> String {
    format!("{CUSTOMER_PREFIX}{phone}")
}

pub fn customer_pointer_key(reservation: &Reservation) -> ItemKey {
    let slot = reservation.slot();
    ItemKey::new(
        customer_partition(&reservation.customer_phone),
        format!("{CUSTOMER_SORT_PREFIX}{}#{}#{}", slot.date_key(), slot.time_key(), reservation.id),
    )
}

pub fn bucket_fence_key(slot: &Slot) -> ItemKey {
    ItemKey::new(format!("{BUCKET_PREFIX}{}#{}", slot.date_key(), slot.time_key()), BUCKET_SORT)
}

pub fn session_key(user_id: &str) -> ItemKey {
    ItemKey::new(format!("{SESSION_PREFIX}{user_id}"), SESSION_SORT)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntityKey {
    Reservation(ReservationId),
    Session { user_id: String },
    CustomerPointer { phone: String, slot: Slot, reservation_id: ReservationId },
    BucketFence(Slot),
}

pub fn decode(key: &ItemKey) -> Result<EntityKey, KeyError> {
    let malformed = |reason: &'static str| KeyError::Malformed { key: key.to_string(), reason };

    if let Some(id) = key.partition.strip_prefix(RESERVATION_PREFIX) {
        if key.sort != RESERVATION_SORT {
            return Err(malformed("reservation items use the META sort key"));
        }
        return non_blank(id)
            .map(|id| EntityKey::Reservation(ReservationId(id.to_string())))
            .ok_or_else(|| malformed("reservation id is empty"));
    }

    if let Some(user_id) = key.partition.strip_prefix(SESSION_PREFIX) {
        if key.sort != SESSION_SORT {
            return Err(malformed("session items use the STATE sort key"));
        }
        return non_blank(user_id)
            .map(|user_id| EntityKey::Session { user_id: user_id.to_string() })
            .ok_or_else(|| malformed("session user id is empty"));
    }

    if let Some(phone) = key.partition.strip_prefix(CUSTOMER_PREFIX) {
        let phone = non_blank(phone).ok_or_else(|| malformed("customer phone is empty"))?;
        let rest = key
            .sort
            .strip_prefix(CUSTOMER_SORT_PREFIX)
            .ok_or_else(|| malformed("customer pointer sort key lacks RESERVATION#"))?;
        let (slot, id) = split_slot_and_id(rest).ok_or_else(|| malformed("bad pointer sort"))?;
        return Ok(EntityKey::CustomerPointer {
            phone: phone.to_string(),
            slot,
            reservation_id: id,
        });
    }

    if let Some(rest) = key.partition.strip_prefix(BUCKET_PREFIX) {
        if key.sort != BUCKET_SORT {
            return Err(malformed("bucket fences use the FENCE sort key"));
        }
        let (date, time) = rest.split_once('#').ok_or_else(|| malformed("bucket lacks time"))?;
        let slot = Slot::parse(date, time).map_err(|_| malformed("bucket slot is invalid"))?;
        return Ok(EntityKey::BucketFence(slot));
    }

    Err(malformed("unknown partition prefix"))
}

/// Splits a GSI1 sort key (`HH:MM#<id>`) back into its parts.
pub fn decode_date_index_sort(sort: &str) -> Result<(chrono::NaiveTime, ReservationId), KeyError> {
    let malformed = |reason: &'static str| KeyError::Malformed { key: sort.to_string(), reason };
    let (time, id) = sort.split_once('#').ok_or_else(|| malformed("GSI1 sort lacks `#`"))?;
    let time = parse_time(time).map_err(|_| malformed("GSI1 sort time is invalid"))?;
    let id = non_blank(id).ok_or_else(|| malformed("GSI1 sort id is empty"))?;
    Ok((time, ReservationId(id.to_string())))
}

fn split_slot_and_id(rest: &str) -> Option<(Slot, ReservationId)> {
    let mut parts = rest.splitn(3, '#');
    let date = parse_date(parts.next()?).ok()?;
    let time = parse_time(parts.next()?).ok()?;
    let id = non_blank(parts.next()?)?;
    Some((Slot::new(date, time), ReservationId(id.to_string())))
}

fn non_blank(value: &str) -> Option<&str> {
    (!value.trim().is_empty()).then_some(value)
}
