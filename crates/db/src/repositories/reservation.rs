//! Reservation persistence and per-bucket capacity arbitration.
//!
//! Capacity is never cached. Every write that adds load to a `(date, time)` bucket
//! reads the bucket fence version, recomputes the committed total from the GSI1
//! projection, and commits the reservation together with a fence write conditioned
//! on the version it read. A concurrent writer to the same bucket moves the fence, so
//! at most one of two racing writers commits per fence version; the loser re-reads.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use mesa_core::clock::Clock;
use mesa_core::config::ReservationsConfig;
use mesa_core::domain::reservation::{
    NewReservation, Reservation, ReservationId, ReservationPatch, ReservationStatus, Slot,
};
use mesa_core::errors::{KeyError, ReservationError};
use mesa_core::keys::{self, EntityKey, IndexName, ItemKey};

use super::{reservation_error, DateRange};
use crate::store::{
    Cursor, KeyValueStore, PutItem, Query, SortRange, StorageError, StoredItem, WriteCondition,
    WriteOp,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservationStoreSettings {
    pub bucket_capacity: u32,
    pub max_party_size: u32,
    pub write_attempts: u32,
    pub cancelled_retention: Duration,
    pub completed_retention: Duration,
    pub page_size: usize,
}

impl Default for ReservationStoreSettings {
    fn default() -> Self {
        Self {
            bucket_capacity: 40,
            max_party_size: 20,
            write_attempts: 3,
            cancelled_retention: Duration::days(30),
            completed_retention: Duration::days(90),
            page_size: 50,
        }
    }
}

impl From<&ReservationsConfig> for ReservationStoreSettings {
    fn from(config: &ReservationsConfig) -> Self {
        Self {
            bucket_capacity: config.bucket_capacity,
            max_party_size: config.max_party_size,
            write_attempts: config.write_attempts.max(1),
            cancelled_retention: config.cancelled_retention(),
            completed_retention: config.completed_retention(),
            page_size: config.page_size.max(1) as usize,
        }
    }
}

#[derive(Clone)]
pub struct ReservationStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    settings: ReservationStoreSettings,
}

impl ReservationStore {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        settings: ReservationStoreSettings,
    ) -> Self {
        Self { store, clock, settings }
    }

    pub fn settings(&self) -> &ReservationStoreSettings {
        &self.settings
    }

    pub async fn create(&self, new: NewReservation) -> Result<Reservation, ReservationError> {
        let now = self.clock.now();
        let mut reservation = new.into_reservation(self.settings.max_party_size, now)?;
        let slot = reservation.slot();

        for attempt in 1..=self.settings.write_attempts {
            let fence = self.fence_version(&slot).await?;
            let committed = self.bucket_load(&slot, None).await?;
            let available = self.settings.bucket_capacity.saturating_sub(committed);
            if reservation.party_size > available {
                return Err(self.capacity_exceeded(&slot, reservation.party_size, available));
            }

            let ops = vec![
                WriteOp::Put(reservation_item(&reservation, WriteCondition::Absent)?),
                WriteOp::Put(pointer_item(&reservation)?),
                WriteOp::Put(fence_item(&slot, fence)),
            ];

            match self.store.transact_write(ops).await {
                Ok(()) => {
                    info!(
                        event_name = "reservation.created",
                        reservation_id = %reservation.id,
                        slot = %slot,
                        party_size = reservation.party_size,
                        attempt,
                        "reservation created"
                    );
                    return Ok(reservation);
                }
                Err(StorageError::ConditionFailed { key }) if key == keys::bucket_fence_key(&slot) => {
                    debug!(
                        event_name = "reservation.create.fence_moved",
                        slot = %slot,
                        attempt,
                        "bucket changed underneath create, re-reading"
                    );
                }
                Err(StorageError::ConditionFailed { key }) => {
                    warn!(event_name = "reservation.create.id_collision", key = %key);
                    reservation.id = ReservationId::generate(slot.date);
                }
                Err(error) => return Err(reservation_error(error)),
            }
        }

        warn!(
            event_name = "reservation.create.exhausted",
            slot = %slot,
            attempts = self.settings.write_attempts,
            "bucket contention outlasted write attempts"
        );
        // The bucket never settled long enough to seat the party.
        Err(self.capacity_exceeded(&slot, reservation.party_size, 0))
    }

    pub async fn get(&self, id: &ReservationId) -> Result<Reservation, ReservationError> {
        self.load(id).await.map(|(reservation, _)| reservation)
    }

    /// Applies `patch` to the mutable fields. Bucket-affecting changes re-run the
    /// capacity check against the target bucket without this reservation's own load.
    pub async fn update(
        &self,
        id: &ReservationId,
        patch: ReservationPatch,
    ) -> Result<Reservation, ReservationError> {
        if patch.is_empty() {
            return self.get(id).await;
        }

        let mut fence_contention: Option<(Slot, u32)> = None;

        for attempt in 1..=self.settings.write_attempts {
            let (current, version) = self.load(id).await?;
            let now = self.clock.now();
            let mut next = current.patched(&patch, self.settings.max_party_size, now)?;
            self.stamp_expiry(&current, &mut next, now);

            let slot = next.slot();
            let moved = slot != current.slot();
            let grows = moved || next.party_size > current.party_size;
            let mut ops = vec![WriteOp::Put(reservation_item(&next, WriteCondition::Version(version))?)];

            if next.holds_capacity() && grows {
                let fence = self.fence_version(&slot).await?;
                let committed = self.bucket_load(&slot, Some(id)).await?;
                let available = self.settings.bucket_capacity.saturating_sub(committed);
                if next.party_size > available {
                    return Err(self.capacity_exceeded(&slot, next.party_size, available));
                }
                ops.push(WriteOp::Put(fence_item(&slot, fence)));
            }

            if moved {
                ops.push(WriteOp::Delete {
                    key: keys::customer_pointer_key(&current),
                    condition: WriteCondition::Any,
                });
            }
            ops.push(WriteOp::Put(pointer_item(&next)?));

            match self.store.transact_write(ops).await {
                Ok(()) => {
                    info!(
                        event_name = "reservation.updated",
                        reservation_id = %id,
                        status = %next.status,
                        slot = %slot,
                        attempt,
                        "reservation updated"
                    );
                    return Ok(next);
                }
                Err(StorageError::ConditionFailed { key }) => {
                    fence_contention = (key == keys::bucket_fence_key(&slot))
                        .then_some((slot, next.party_size));
                    debug!(
                        event_name = "reservation.update.conflict",
                        reservation_id = %id,
                        key = %key,
                        attempt,
                        "concurrent write detected, re-applying patch"
                    );
                }
                Err(error) => return Err(reservation_error(error)),
            }
        }

        if let Some((slot, requested)) = fence_contention {
            warn!(
                event_name = "reservation.update.exhausted",
                reservation_id = %id,
                slot = %slot,
                attempts = self.settings.write_attempts,
                "bucket contention outlasted write attempts"
            );
            return Err(self.capacity_exceeded(&slot, requested, 0));
        }
        Err(ReservationError::StoreUnavailable(format!(
            "reservation {id} kept changing across {} write attempts",
            self.settings.write_attempts
        )))
    }

    pub async fn cancel(&self, id: &ReservationId) -> Result<Reservation, ReservationError> {
        let current = self.get(id).await?;
        if current.status == ReservationStatus::Cancelled {
            return Err(ReservationError::AlreadyCancelled(id.clone()));
        }

        self.update(id, ReservationPatch::status(ReservationStatus::Cancelled)).await.map_err(
            |error| match error {
                // Lost a race with another cancellation.
                ReservationError::InvalidTransition { from: ReservationStatus::Cancelled, .. } => {
                    ReservationError::AlreadyCancelled(id.clone())
                }
                other => other,
            },
        )
    }

    /// Reservations on `date`, ordered by `(time, id)`.
    pub fn list_by_date(&self, date: NaiveDate) -> ReservationPager {
        let query = Query::new(IndexName::Gsi1, keys::date_partition(date), SortRange::All);
        ReservationPager::new(self.clone(), query, PagerSource::Index)
    }

    /// Reservations in `status` within `range`, ordered by date then id.
    pub fn list_by_status(&self, status: ReservationStatus, range: DateRange) -> ReservationPager {
        let query = Query::new(IndexName::StatusDate, status.as_str(), range.sort_range());
        ReservationPager::new(self.clone(), query, PagerSource::Index)
    }

    /// Reservations made from `phone`, ordered by date then time.
    pub fn list_by_customer(&self, phone: &str) -> ReservationPager {
        let query = Query::new(
            IndexName::Primary,
            keys::customer_partition(phone.trim()),
            SortRange::Prefix(keys::CUSTOMER_SORT_PREFIX.to_string()),
        );
        ReservationPager::new(self.clone(), query, PagerSource::CustomerPointers)
    }

    /// Reclaims every item whose retention has lapsed.
    pub async fn purge_expired(&self) -> Result<u64, ReservationError> {
        let now = self.clock.now();
        let purged = self.store.purge_expired(now.timestamp()).await.map_err(reservation_error)?;
        if purged > 0 {
            info!(event_name = "reservation.purge.completed", purged, "expired items purged");
        }
        Ok(purged)
    }

    /// Sum of party sizes holding capacity in `slot`, optionally without one reservation.
    pub async fn bucket_load(
        &self,
        slot: &Slot,
        excluding: Option<&ReservationId>,
    ) -> Result<u32, ReservationError> {
        let base = Query::new(
            IndexName::Gsi1,
            keys::date_partition(slot.date),
            SortRange::Prefix(keys::bucket_sort_prefix(slot)),
        );
        let mut pager = ReservationPager::new(self.clone(), base, PagerSource::Index);
        let mut total = 0_u32;
        while let Some(page) = pager.next_page().await? {
            total = page
                .iter()
                .filter(|reservation| reservation.holds_capacity())
                .filter(|reservation| Some(&reservation.id) != excluding)
                .fold(total, |sum, reservation| sum.saturating_add(reservation.party_size));
        }
        Ok(total)
    }

    async fn load(&self, id: &ReservationId) -> Result<(Reservation, u64), ReservationError> {
        let item = self
            .store
            .get(&keys::reservation_key(id))
            .await
            .map_err(reservation_error)?
            .ok_or_else(|| ReservationError::NotFound(id.clone()))?;
        let version = item.version;
        Ok((decode_reservation(item)?, version))
    }

    async fn fence_version(&self, slot: &Slot) -> Result<u64, ReservationError> {
        let fence = self
            .store
            .get(&keys::bucket_fence_key(slot))
            .await
            .map_err(reservation_error)?;
        Ok(fence.map_or(0, |item| item.version))
    }

    fn stamp_expiry(&self, current: &Reservation, next: &mut Reservation, now: DateTime<Utc>) {
        if current.status == next.status {
            return;
        }
        let retention = match next.status {
            ReservationStatus::Cancelled => self.settings.cancelled_retention,
            ReservationStatus::Completed => self.settings.completed_retention,
            _ => return,
        };
        match now.checked_add_signed(retention) {
            Some(expires_at) => next.ttl = Some(expires_at.timestamp()),
            None => warn!(
                event_name = "reservation.ttl.overflow",
                reservation_id = %next.id,
                "retention does not fit a timestamp; item kept without ttl"
            ),
        }
    }

    fn capacity_exceeded(&self, slot: &Slot, requested: u32, available: u32) -> ReservationError {
        ReservationError::CapacityExceeded {
            date: slot.date_key(),
            time: slot.time_key(),
            requested,
            available,
        }
    }
}

fn reservation_item(
    reservation: &Reservation,
    condition: WriteCondition,
) -> Result<PutItem, ReservationError> {
    let keys = keys::reservation_keys(reservation);
    let body = serde_json::to_value(reservation)
        .map_err(|error| ReservationError::Validation(format!("unencodable reservation: {error}")))?;

    Ok(PutItem {
        gsi1: Some(keys.by_date),
        status_date: Some(keys.by_status),
        expires_at: reservation.ttl,
        ..PutItem::new(keys.primary, body, condition)
    })
}

fn pointer_item(reservation: &Reservation) -> Result<PutItem, ReservationError> {
    let body = json!({ "reservation_id": reservation.id });
    Ok(PutItem {
        expires_at: reservation.ttl,
        ..PutItem::new(keys::customer_pointer_key(reservation), body, WriteCondition::Any)
    })
}

fn fence_item(slot: &Slot, read_version: u64) -> PutItem {
    PutItem::new(
        keys::bucket_fence_key(slot),
        json!({ "date": slot.date_key(), "time": slot.time_key() }),
        WriteCondition::expecting(read_version),
    )
}

fn decode_reservation(item: StoredItem) -> Result<Reservation, ReservationError> {
    let EntityKey::Reservation(id) = keys::decode(&item.key)? else {
        return Err(KeyError::Malformed {
            key: item.key.to_string(),
            reason: "expected a reservation item",
        }
        .into());
    };

    let reservation: Reservation = serde_json::from_value(item.body).map_err(|error| {
        ReservationError::StoreUnavailable(format!("reservation {id} is unreadable: {error}"))
    })?;
    if reservation.id != id {
        return Err(KeyError::Malformed {
            key: item.key.to_string(),
            reason: "item key does not match the reservation id in its body",
        }
        .into());
    }
    Ok(reservation)
}

fn decode_pointer(item: &StoredItem) -> Result<ReservationId, ReservationError> {
    match keys::decode(&item.key)? {
        EntityKey::CustomerPointer { reservation_id, .. } => Ok(reservation_id),
        _ => Err(KeyError::Malformed {
            key: item.key.to_string(),
            reason: "expected a customer pointer item",
        }
        .into()),
    }
}

/// Opaque resume position of a [`ReservationPager`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    sort: String,
    partition: String,
}

impl PageToken {
    fn into_cursor(self) -> Cursor {
        Cursor { sort: self.sort, partition: self.partition }
    }
}

impl From<Cursor> for PageToken {
    fn from(cursor: Cursor) -> Self {
        Self { sort: cursor.sort, partition: cursor.partition }
    }
}

impl fmt::Display for PageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&encoded)
    }
}

impl FromStr for PageToken {
    type Err = ReservationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(value)
            .map_err(|_| ReservationError::Validation("malformed page token".to_string()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PagerSource {
    /// Index items are reservations.
    Index,
    /// Items are customer pointers that resolve to reservations.
    CustomerPointers,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservationPage {
    pub reservations: Vec<Reservation>,
    /// `None` once the listing is exhausted.
    pub next: Option<PageToken>,
}

/// Lazy, finite and restartable listing. Nothing is read until a page is requested.
pub struct ReservationPager {
    store: ReservationStore,
    query: Query,
    source: PagerSource,
    page_size: usize,
    cursor: Option<Cursor>,
    exhausted: bool,
}

impl ReservationPager {
    fn new(store: ReservationStore, query: Query, source: PagerSource) -> Self {
        let page_size = store.settings.page_size.max(1);
        Self { store, query, source, page_size, cursor: None, exhausted: false }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Continues a listing from a token handed out by an earlier pager.
    pub fn resume_from(mut self, token: PageToken) -> Self {
        self.cursor = Some(token.into_cursor());
        self.exhausted = false;
        self
    }

    pub fn resume_token(&self) -> Option<PageToken> {
        if self.exhausted {
            return None;
        }
        self.cursor.clone().map(PageToken::from)
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<Reservation>>, ReservationError> {
        Ok(self.fetch().await?.map(|page| page.reservations))
    }

    /// Like [`Self::next_page`] but also reports where the following page starts.
    pub async fn fetch(&mut self) -> Result<Option<ReservationPage>, ReservationError> {
        if self.exhausted {
            return Ok(None);
        }

        // One extra row tells whether another page exists without a trailing empty read.
        let query =
            self.query.clone().after(self.cursor.clone()).limit(self.page_size.saturating_add(1));
        let mut items = self.store.store.query(&query).await.map_err(reservation_error)?;
        self.exhausted = items.len() <= self.page_size;
        items.truncate(self.page_size);

        if items.is_empty() {
            return Ok(None);
        }
        if let Some(cursor) = items.last().and_then(|item| item.cursor(self.query.index)) {
            self.cursor = Some(cursor);
        }

        let mut reservations = Vec::with_capacity(items.len());
        for item in items {
            match self.source {
                PagerSource::Index => reservations.push(decode_reservation(item)?),
                PagerSource::CustomerPointers => {
                    let id = decode_pointer(&item)?;
                    match self.store.get(&id).await {
                        Ok(reservation) => reservations.push(reservation),
                        // Pointer outlived its reservation between purges.
                        Err(ReservationError::NotFound(_)) => continue,
                        Err(error) => return Err(error),
                    }
                }
            }
        }

        Ok(Some(ReservationPage { reservations, next: self.resume_token() }))
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<Reservation, ReservationError>> {
        stream::try_unfold(self, |mut pager| async move {
            let page = pager.next_page().await?;
            Ok::<_, ReservationError>(page.map(|reservations| {
                (stream::iter(reservations.into_iter().map(Ok::<_, ReservationError>)), pager)
            }))
        })
        .try_flatten()
        .boxed()
    }

    pub async fn collect_all(self) -> Result<Vec<Reservation>, ReservationError> {
        self.into_stream().try_collect().await
    }
}
