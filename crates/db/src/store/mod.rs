//! Keyed storage engine.
//!
//! Every entity is a [`StoredItem`] addressed by an [`ItemKey`]. Items may project a
//! GSI1 key and a status/date key so the same table answers date and status queries.
//! Writes carry a [`WriteCondition`]; a failed condition aborts the whole call, and
//! [`KeyValueStore::transact_write`] applies either every operation or none.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use mesa_core::config::DatabaseConfig;
use mesa_core::keys::{IndexKey, IndexName, ItemKey};

use crate::{connect_with_settings, migrations, DbPool};

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryKeyValueStore;
pub use sqlite::SqliteKeyValueStore;

pub const MEMORY_URL: &str = "memory://";

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("condition failed for item {key}")]
    ConditionFailed { key: ItemKey },
    #[error("storage call `{operation}` timed out after {elapsed_ms}ms")]
    Timeout { operation: &'static str, elapsed_ms: u64 },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("could not decode stored item {key}: {reason}")]
    Decode { key: String, reason: String },
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(value: sqlx::Error) -> Self {
        Self::Unavailable(value.to_string())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredItem {
    pub key: ItemKey,
    pub gsi1: Option<IndexKey>,
    pub status_date: Option<IndexKey>,
    pub version: u64,
    /// Epoch seconds after which `purge_expired` may reclaim the item.
    pub expires_at: Option<i64>,
    pub body: serde_json::Value,
}

impl StoredItem {
    /// Position of this item inside `index`, if the item is projected there.
    pub fn cursor(&self, index: IndexName) -> Option<Cursor> {
        let sort = match index {
            IndexName::Primary => Some(self.key.sort.clone()),
            IndexName::Gsi1 => self.gsi1.as_ref().map(|key| key.sort.clone()),
            IndexName::StatusDate => self.status_date.as_ref().map(|key| key.sort.clone()),
        }?;
        Some(Cursor { sort, partition: self.key.partition.clone() })
    }

    fn index_key(&self, index: IndexName) -> Option<(&str, &str)> {
        match index {
            IndexName::Primary => Some((&self.key.partition, &self.key.sort)),
            IndexName::Gsi1 => {
                self.gsi1.as_ref().map(|key| (key.partition.as_str(), key.sort.as_str()))
            }
            IndexName::StatusDate => {
                self.status_date.as_ref().map(|key| (key.partition.as_str(), key.sort.as_str()))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteCondition {
    /// Unconditional.
    Any,
    /// The item must not exist yet.
    Absent,
    /// The item must exist at exactly this version.
    Version(u64),
}

impl WriteCondition {
    /// Version `0` stands for "read as absent".
    pub fn expecting(version: u64) -> Self {
        if version == 0 {
            Self::Absent
        } else {
            Self::Version(version)
        }
    }

    pub(crate) fn holds(&self, current: Option<u64>) -> bool {
        match (self, current) {
            (Self::Any, _) => true,
            (Self::Absent, None) => true,
            (Self::Version(expected), Some(current)) => *expected == current,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PutItem {
    pub key: ItemKey,
    pub gsi1: Option<IndexKey>,
    pub status_date: Option<IndexKey>,
    pub expires_at: Option<i64>,
    pub body: serde_json::Value,
    pub condition: WriteCondition,
}

impl PutItem {
    pub fn new(key: ItemKey, body: serde_json::Value, condition: WriteCondition) -> Self {
        Self { key, gsi1: None, status_date: None, expires_at: None, body, condition }
    }

    pub(crate) fn into_stored(self, version: u64) -> StoredItem {
        StoredItem {
            key: self.key,
            gsi1: self.gsi1,
            status_date: self.status_date,
            version,
            expires_at: self.expires_at,
            body: self.body,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    Put(PutItem),
    Delete { key: ItemKey, condition: WriteCondition },
}

impl WriteOp {
    pub fn key(&self) -> &ItemKey {
        match self {
            Self::Put(put) => &put.key,
            Self::Delete { key, .. } => key,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SortRange {
    All,
    Prefix(String),
    /// Inclusive on both ends.
    Between(String, String),
}

impl SortRange {
    pub(crate) fn contains(&self, sort: &str) -> bool {
        match self {
            Self::All => true,
            Self::Prefix(prefix) => sort.starts_with(prefix.as_str()),
            Self::Between(from, to) => sort >= from.as_str() && sort <= to.as_str(),
        }
    }
}

/// Exclusive start position: results resume strictly after `(sort, partition)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    pub sort: String,
    pub partition: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub index: IndexName,
    pub partition: String,
    pub range: SortRange,
    pub start_after: Option<Cursor>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(index: IndexName, partition: impl Into<String>, range: SortRange) -> Self {
        Self { index, partition: partition.into(), range, start_after: None, limit: None }
    }

    pub fn after(mut self, cursor: Option<Cursor>) -> Self {
        self.start_after = cursor;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn matches(&self, item: &StoredItem) -> bool {
        let Some((partition, sort)) = item.index_key(self.index) else {
            return false;
        };
        if partition != self.partition || !self.range.contains(sort) {
            return false;
        }
        match &self.start_after {
            Some(cursor) => {
                (sort, item.key.partition.as_str())
                    > (cursor.sort.as_str(), cursor.partition.as_str())
            }
            None => true,
        }
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &ItemKey) -> Result<Option<StoredItem>, StorageError>;

    /// Writes the item and returns its new version.
    async fn put(&self, item: PutItem) -> Result<u64, StorageError>;

    async fn delete(&self, key: &ItemKey, condition: WriteCondition) -> Result<(), StorageError>;

    async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<(), StorageError>;

    /// Items in `(index sort, partition)` order.
    async fn query(&self, query: &Query) -> Result<Vec<StoredItem>, StorageError>;

    /// Removes items whose `expires_at` is at or before `now_epoch`; returns the count.
    async fn purge_expired(&self, now_epoch: i64) -> Result<u64, StorageError>;
}

/// Bounds every call with a timeout and retries transient failures a fixed number
/// of times before surfacing them.
pub struct GuardedStore {
    inner: Arc<dyn KeyValueStore>,
    call_timeout: Duration,
    transient_retries: u32,
}

impl GuardedStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, call_timeout: Duration, transient_retries: u32) -> Self {
        Self { inner, call_timeout, transient_retries }
    }

    async fn guarded<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StorageError>> + Send,
        T: Send,
    {
        let mut attempt = 0_u32;
        loop {
            let outcome = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StorageError::Timeout {
                    operation,
                    elapsed_ms: self.call_timeout.as_millis() as u64,
                }),
            };

            match outcome {
                Err(error) if error.is_transient() && attempt < self.transient_retries => {
                    attempt += 1;
                    warn!(
                        event_name = "storage.call.retry",
                        operation,
                        attempt,
                        error = %error,
                        "transient storage failure, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for GuardedStore {
    async fn get(&self, key: &ItemKey) -> Result<Option<StoredItem>, StorageError> {
        self.guarded("get", || self.inner.get(key)).await
    }

    async fn put(&self, item: PutItem) -> Result<u64, StorageError> {
        self.guarded("put", || self.inner.put(item.clone())).await
    }

    async fn delete(&self, key: &ItemKey, condition: WriteCondition) -> Result<(), StorageError> {
        self.guarded("delete", || self.inner.delete(key, condition)).await
    }

    async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        self.guarded("transact_write", || self.inner.transact_write(ops.clone())).await
    }

    async fn query(&self, query: &Query) -> Result<Vec<StoredItem>, StorageError> {
        self.guarded("query", || self.inner.query(query)).await
    }

    async fn purge_expired(&self, now_epoch: i64) -> Result<u64, StorageError> {
        self.guarded("purge_expired", || self.inner.purge_expired(now_epoch)).await
    }
}

/// Opens the engine selected by `database.url` and wraps it in a [`GuardedStore`].
/// SQLite databases are migrated before use.
pub async fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn KeyValueStore>, StorageError> {
    let engine: Arc<dyn KeyValueStore> = if config.url.trim() == MEMORY_URL {
        Arc::new(InMemoryKeyValueStore::default())
    } else {
        let pool = open_pool(config).await?;
        Arc::new(SqliteKeyValueStore::new(pool))
    };

    Ok(Arc::new(GuardedStore::new(
        engine,
        Duration::from_millis(config.call_timeout_ms),
        config.transient_retries,
    )))
}

pub async fn open_pool(config: &DatabaseConfig) -> Result<DbPool, StorageError> {
    let pool =
        connect_with_settings(&config.url, config.max_connections, config.timeout_secs).await?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| StorageError::Unavailable(format!("migrations failed: {error}")))?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use mesa_core::keys::ItemKey;

    use super::{
        GuardedStore, InMemoryKeyValueStore, KeyValueStore, PutItem, Query, StorageError,
        StoredItem, WriteCondition, WriteOp,
    };

    /// Fails the first `failures` gets with `Unavailable`, then delegates.
    struct FlakyStore {
        inner: InMemoryKeyValueStore,
        failures: AtomicU32,
        slow: bool,
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, key: &ItemKey) -> Result<Option<StoredItem>, StorageError> {
            if self.slow {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StorageError::Unavailable("disk on fire".to_string()));
            }
            self.inner.get(key).await
        }

        async fn put(&self, item: PutItem) -> Result<u64, StorageError> {
            self.inner.put(item).await
        }

        async fn delete(&self, key: &ItemKey, condition: WriteCondition) -> Result<(), StorageError> {
            self.inner.delete(key, condition).await
        }

        async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
            self.inner.transact_write(ops).await
        }

        async fn query(&self, query: &Query) -> Result<Vec<StoredItem>, StorageError> {
            self.inner.query(query).await
        }

        async fn purge_expired(&self, now_epoch: i64) -> Result<u64, StorageError> {
            self.inner.purge_expired(now_epoch).await
        }
    }

    fn flaky(failures: u32, slow: bool) -> Arc<FlakyStore> {
        Arc::new(FlakyStore {
            inner: InMemoryKeyValueStore::default(),
            failures: AtomicU32::new(failures),
            slow,
        })
    }

    #[test]
    fn write_condition_semantics() {
        assert!(WriteCondition::Any.holds(None));
        assert!(WriteCondition::Any.holds(Some(3)));
        assert!(WriteCondition::Absent.holds(None));
        assert!(!WriteCondition::Absent.holds(Some(1)));
        assert!(WriteCondition::Version(2).holds(Some(2)));
        assert!(!WriteCondition::Version(2).holds(Some(3)));
        assert!(!WriteCondition::Version(2).holds(None));
        assert_eq!(WriteCondition::expecting(0), WriteCondition::Absent);
        assert_eq!(WriteCondition::expecting(4), WriteCondition::Version(4));
    }

    #[tokio::test]
    async fn guarded_store_retries_transient_failures() {
        let store = GuardedStore::new(flaky(2, false), Duration::from_secs(1), 2);
        let found = store.get(&ItemKey::new("RES#x", "META")).await.expect("third attempt succeeds");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn guarded_store_surfaces_exhausted_retries() {
        let store = GuardedStore::new(flaky(5, false), Duration::from_secs(1), 1);
        let error = store.get(&ItemKey::new("RES#x", "META")).await.expect_err("still failing");
        assert!(matches!(error, StorageError::Unavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn guarded_store_times_out_slow_calls() {
        let store = GuardedStore::new(flaky(0, true), Duration::from_millis(100), 0);
        let error = store.get(&ItemKey::new("RES#x", "META")).await.expect_err("times out");
        assert_eq!(error, StorageError::Timeout { operation: "get", elapsed_ms: 100 });
    }
}
