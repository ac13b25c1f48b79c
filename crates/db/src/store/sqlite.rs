use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};

use mesa_core::keys::{IndexKey, IndexName, ItemKey};

use super::{
    KeyValueStore, PutItem, Query, SortRange, StorageError, StoredItem, WriteCondition, WriteOp,
};
use crate::DbPool;

const ITEM_COLUMNS: &str =
    "pk, sk, gsi1pk, gsi1sk, status_key, date_key, version, expires_at, body";

pub struct SqliteKeyValueStore {
    pool: DbPool,
}

impl SqliteKeyValueStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

/// `(partition column, sort column)` backing each index.
fn index_columns(index: IndexName) -> (&'static str, &'static str) {
    match index {
        IndexName::Primary => ("pk", "sk"),
        IndexName::Gsi1 => ("gsi1pk", "gsi1sk"),
        IndexName::StatusDate => ("status_key", "date_key"),
    }
}

async fn put_in(conn: &mut SqliteConnection, item: &PutItem) -> Result<u64, StorageError> {
    let body = serde_json::to_string(&item.body).map_err(|error| StorageError::Decode {
        key: item.key.to_string(),
        reason: error.to_string(),
    })?;
    let (gsi1pk, gsi1sk) = split_index(item.gsi1.as_ref());
    let (status_key, date_key) = split_index(item.status_date.as_ref());

    let row = match item.condition {
        WriteCondition::Absent => {
            sqlx::query(
                "INSERT INTO items (pk, sk, gsi1pk, gsi1sk, status_key, date_key, version, expires_at, body)
                 VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
                 ON CONFLICT(pk, sk) DO NOTHING
                 RETURNING version",
            )
            .bind(&item.key.partition)
            .bind(&item.key.sort)
            .bind(gsi1pk)
            .bind(gsi1sk)
            .bind(status_key)
            .bind(date_key)
            .bind(item.expires_at)
            .bind(&body)
            .fetch_optional(&mut *conn)
            .await?
        }
        WriteCondition::Version(expected) => {
            sqlx::query(
                "UPDATE items
                 SET gsi1pk = ?, gsi1sk = ?, status_key = ?, date_key = ?,
                     version = version + 1, expires_at = ?, body = ?
                 WHERE pk = ? AND sk = ? AND version = ?
                 RETURNING version",
            )
            .bind(gsi1pk)
            .bind(gsi1sk)
            .bind(status_key)
            .bind(date_key)
            .bind(item.expires_at)
            .bind(&body)
            .bind(&item.key.partition)
            .bind(&item.key.sort)
            .bind(to_i64(expected))
            .fetch_optional(&mut *conn)
            .await?
        }
        WriteCondition::Any => {
            sqlx::query(
                "INSERT INTO items (pk, sk, gsi1pk, gsi1sk, status_key, date_key, version, expires_at, body)
                 VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
                 ON CONFLICT(pk, sk) DO UPDATE SET
                    gsi1pk = excluded.gsi1pk,
                    gsi1sk = excluded.gsi1sk,
                    status_key = excluded.status_key,
                    date_key = excluded.date_key,
                    version = items.version + 1,
                    expires_at = excluded.expires_at,
                    body = excluded.body
                 RETURNING version",
            )
            .bind(&item.key.partition)
            .bind(&item.key.sort)
            .bind(gsi1pk)
            .bind(gsi1sk)
            .bind(status_key)
            .bind(date_key)
            .bind(item.expires_at)
            .bind(&body)
            .fetch_optional(&mut *conn)
            .await?
        }
    };

    match row {
        Some(row) => from_i64(&item.key, row.try_get("version")?),
        None => Err(StorageError::ConditionFailed { key: item.key.clone() }),
    }
}

async fn delete_in(
    conn: &mut SqliteConnection,
    key: &ItemKey,
    condition: WriteCondition,
) -> Result<(), StorageError> {
    match condition {
        WriteCondition::Any => {
            sqlx::query("DELETE FROM items WHERE pk = ? AND sk = ?")
                .bind(&key.partition)
                .bind(&key.sort)
                .execute(&mut *conn)
                .await?;
            Ok(())
        }
        WriteCondition::Version(expected) => {
            let result = sqlx::query("DELETE FROM items WHERE pk = ? AND sk = ? AND version = ?")
                .bind(&key.partition)
                .bind(&key.sort)
                .bind(to_i64(expected))
                .execute(&mut *conn)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StorageError::ConditionFailed { key: key.clone() });
            }
            Ok(())
        }
        WriteCondition::Absent => {
            let exists = sqlx::query("SELECT 1 AS present FROM items WHERE pk = ? AND sk = ?")
                .bind(&key.partition)
                .bind(&key.sort)
                .fetch_optional(&mut *conn)
                .await?;
            if exists.is_some() {
                return Err(StorageError::ConditionFailed { key: key.clone() });
            }
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &ItemKey) -> Result<Option<StoredItem>, StorageError> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE pk = ? AND sk = ?"))
            .bind(&key.partition)
            .bind(&key.sort)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(item_from_row).transpose()
    }

    async fn put(&self, item: PutItem) -> Result<u64, StorageError> {
        let mut conn = self.pool.acquire().await?;
        put_in(&mut conn, &item).await
    }

    async fn delete(&self, key: &ItemKey, condition: WriteCondition) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await?;
        delete_in(&mut conn, key, condition).await
    }

    async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        for op in &ops {
            match op {
                WriteOp::Put(put) => {
                    put_in(&mut tx, put).await?;
                }
                WriteOp::Delete { key, condition } => delete_in(&mut tx, key, *condition).await?,
            }
        }

        // Dropping `tx` on an early return rolls everything back.
        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<StoredItem>, StorageError> {
        let (partition_column, sort_column) = index_columns(query.index);

        let mut builder: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {ITEM_COLUMNS} FROM items WHERE {partition_column} = "));
        builder.push_bind(query.partition.as_str());

        match &query.range {
            SortRange::All => {}
            SortRange::Prefix(prefix) => {
                builder.push(format!(" AND substr({sort_column}, 1, length("));
                builder.push_bind(prefix.as_str());
                builder.push(")) = ");
                builder.push_bind(prefix.as_str());
            }
            SortRange::Between(from, to) => {
                builder.push(format!(" AND {sort_column} >= "));
                builder.push_bind(from.as_str());
                builder.push(format!(" AND {sort_column} <= "));
                builder.push_bind(to.as_str());
            }
        }

        if let Some(cursor) = &query.start_after {
            builder.push(format!(" AND ({sort_column} > "));
            builder.push_bind(cursor.sort.as_str());
            builder.push(format!(" OR ({sort_column} = "));
            builder.push_bind(cursor.sort.as_str());
            builder.push(" AND pk > ");
            builder.push_bind(cursor.partition.as_str());
            builder.push("))");
        }

        builder.push(format!(" ORDER BY {sort_column} ASC, pk ASC"));
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn purge_expired(&self, now_epoch: i64) -> Result<u64, StorageError> {
        let result =
            sqlx::query("DELETE FROM items WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(now_epoch)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

fn split_index(key: Option<&IndexKey>) -> (Option<&str>, Option<&str>) {
    match key {
        Some(key) => (Some(key.partition.as_str()), Some(key.sort.as_str())),
        None => (None, None),
    }
}

fn item_from_row(row: &SqliteRow) -> Result<StoredItem, StorageError> {
    let key = ItemKey::new(row.try_get::<String, _>("pk")?, row.try_get::<String, _>("sk")?);
    let gsi1 = join_index(row.try_get("gsi1pk")?, row.try_get("gsi1sk")?);
    let status_date = join_index(row.try_get("status_key")?, row.try_get("date_key")?);
    let version = from_i64(&key, row.try_get("version")?)?;
    let raw_body: String = row.try_get("body")?;
    let body = serde_json::from_str(&raw_body).map_err(|error| StorageError::Decode {
        key: key.to_string(),
        reason: format!("body is not valid JSON ({error})"),
    })?;

    Ok(StoredItem { key, gsi1, status_date, version, expires_at: row.try_get("expires_at")?, body })
}

fn join_index(partition: Option<String>, sort: Option<String>) -> Option<IndexKey> {
    Some(IndexKey { partition: partition?, sort: sort? })
}

fn to_i64(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn from_i64(key: &ItemKey, value: i64) -> Result<u64, StorageError> {
    u64::try_from(value).map_err(|_| StorageError::Decode {
        key: key.to_string(),
        reason: format!("invalid version (expected non-negative): {value}"),
    })
}

#[cfg(test)]
mod tests {
    use mesa_core::keys::{IndexKey, IndexName, ItemKey};
    use serde_json::json;

    use super::SqliteKeyValueStore;
    use crate::migrations;
    use crate::store::{
        KeyValueStore, PutItem, Query, SortRange, StorageError, WriteCondition, WriteOp,
    };
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn by_status(id: &str, status: &str, date: &str) -> PutItem {
        PutItem {
            status_date: Some(IndexKey { partition: status.to_string(), sort: date.to_string() }),
            ..PutItem::new(
                ItemKey::new(format!("RES#{id}"), "META"),
                json!({"id": id, "status": status}),
                WriteCondition::Absent,
            )
        }
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_and_enforces_versions() {
        let pool = setup_pool().await;
        let store = SqliteKeyValueStore::new(pool.clone());
        let item = by_status("RES-1", "PENDING", "2025-06-06");

        assert_eq!(store.put(item.clone()).await.expect("insert"), 1);
        assert!(matches!(
            store.put(item.clone()).await,
            Err(StorageError::ConditionFailed { .. })
        ));

        let stored = store.get(&item.key).await.expect("get").expect("present");
        assert_eq!(stored.version, 1);
        assert_eq!(stored.body, json!({"id": "RES-1", "status": "PENDING"}));
        assert_eq!(stored.status_date.as_ref().map(|key| key.partition.as_str()), Some("PENDING"));
        assert!(stored.gsi1.is_none());

        let next = PutItem { condition: WriteCondition::Version(1), ..item.clone() };
        assert_eq!(store.put(next.clone()).await.expect("update"), 2);
        assert!(matches!(store.put(next).await, Err(StorageError::ConditionFailed { .. })));

        pool.close().await;
    }

    #[tokio::test]
    async fn sqlite_transaction_rolls_back_on_failed_condition() {
        let pool = setup_pool().await;
        let store = SqliteKeyValueStore::new(pool.clone());
        let fence = ItemKey::new("BUCKET#2025-06-06#21:00", "FENCE");

        let result = store
            .transact_write(vec![
                WriteOp::Put(by_status("RES-1", "PENDING", "2025-06-06")),
                WriteOp::Put(PutItem::new(fence.clone(), json!({}), WriteCondition::Version(3))),
            ])
            .await;

        assert!(matches!(result, Err(StorageError::ConditionFailed { ref key }) if *key == fence));
        let leaked = store.get(&ItemKey::new("RES#RES-1", "META")).await.expect("get");
        assert!(leaked.is_none(), "first put must be rolled back");

        pool.close().await;
    }

    #[tokio::test]
    async fn sqlite_query_filters_ranges_and_pages() {
        let pool = setup_pool().await;
        let store = SqliteKeyValueStore::new(pool.clone());
        for (id, date) in [("RES-3", "2025-06-08"), ("RES-1", "2025-06-06"), ("RES-2", "2025-06-06")] {
            store.put(by_status(id, "CONFIRMED", date)).await.expect("put");
        }
        store.put(by_status("RES-4", "PENDING", "2025-06-06")).await.expect("put");

        let query = Query::new(
            IndexName::StatusDate,
            "CONFIRMED",
            SortRange::Between("2025-06-06".to_string(), "2025-06-07".to_string()),
        );
        let ids: Vec<_> = store
            .query(&query)
            .await
            .expect("query")
            .into_iter()
            .map(|item| item.key.partition)
            .collect();
        assert_eq!(ids, vec!["RES#RES-1", "RES#RES-2"]);

        let first = store.query(&query.clone().limit(1)).await.expect("page one");
        let cursor = first.last().and_then(|item| item.cursor(IndexName::StatusDate));
        let second = store.query(&query.clone().after(cursor)).await.expect("page two");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].key.partition, "RES#RES-2");

        let prefixed = Query::new(IndexName::Primary, "RES#RES-1", SortRange::Prefix("ME".into()));
        assert_eq!(store.query(&prefixed).await.expect("prefix").len(), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn sqlite_purge_expired_deletes_stale_rows() {
        let pool = setup_pool().await;
        let store = SqliteKeyValueStore::new(pool.clone());
        let mut stale = by_status("RES-OLD", "CANCELLED", "2025-06-01");
        stale.expires_at = Some(1_000);
        store.put(stale).await.expect("put");
        store.put(by_status("RES-NEW", "CONFIRMED", "2025-06-06")).await.expect("put");

        assert_eq!(store.purge_expired(999).await.expect("early purge"), 0);
        assert_eq!(store.purge_expired(1_000).await.expect("purge"), 1);
        assert!(store.get(&ItemKey::new("RES#RES-NEW", "META")).await.expect("get").is_some());

        pool.close().await;
    }
}
