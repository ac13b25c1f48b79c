use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use mesa_core::keys::ItemKey;

use super::{KeyValueStore, PutItem, Query, StorageError, StoredItem, WriteCondition, WriteOp};

/// Process-local engine with the same conditional-write semantics as the SQLite one.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    items: RwLock<BTreeMap<ItemKey, StoredItem>>,
}

impl InMemoryKeyValueStore {
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

fn check(
    items: &BTreeMap<ItemKey, StoredItem>,
    key: &ItemKey,
    condition: WriteCondition,
) -> Result<Option<u64>, StorageError> {
    let current = items.get(key).map(|item| item.version);
    if condition.holds(current) {
        Ok(current)
    } else {
        Err(StorageError::ConditionFailed { key: key.clone() })
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &ItemKey) -> Result<Option<StoredItem>, StorageError> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn put(&self, item: PutItem) -> Result<u64, StorageError> {
        let mut items = self.items.write().await;
        let current = check(&items, &item.key, item.condition)?;
        let version = current.unwrap_or(0) + 1;
        items.insert(item.key.clone(), item.into_stored(version));
        Ok(version)
    }

    async fn delete(&self, key: &ItemKey, condition: WriteCondition) -> Result<(), StorageError> {
        let mut items = self.items.write().await;
        check(&items, key, condition)?;
        items.remove(key);
        Ok(())
    }

    async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        let mut items = self.items.write().await;

        for op in &ops {
            let condition = match op {
                WriteOp::Put(put) => put.condition,
                WriteOp::Delete { condition, .. } => *condition,
            };
            check(&items, op.key(), condition)?;
        }

        for op in ops {
            match op {
                WriteOp::Put(put) => {
                    let version = items.get(&put.key).map_or(0, |item| item.version) + 1;
                    items.insert(put.key.clone(), put.into_stored(version));
                }
                WriteOp::Delete { key, .. } => {
                    items.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<StoredItem>, StorageError> {
        let items = self.items.read().await;
        let mut matched: Vec<StoredItem> =
            items.values().filter(|item| query.matches(item)).cloned().collect();
        matched.sort_by(|left, right| left.cursor(query.index).cmp(&right.cursor(query.index)));
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn purge_expired(&self, now_epoch: i64) -> Result<u64, StorageError> {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|_, item| item.expires_at.map_or(true, |expires_at| expires_at > now_epoch));
        Ok((before - items.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use mesa_core::keys::{IndexKey, IndexName, ItemKey};
    use serde_json::json;

    use super::InMemoryKeyValueStore;
    use crate::store::{
        KeyValueStore, PutItem, Query, SortRange, StorageError, WriteCondition, WriteOp,
    };

    fn dated(id: &str, time: &str) -> PutItem {
        PutItem {
            gsi1: Some(IndexKey {
                partition: "DATE#2025-06-06".to_string(),
                sort: format!("{time}#{id}"),
            }),
            ..PutItem::new(ItemKey::new(format!("RES#{id}"), "META"), json!({"id": id}), WriteCondition::Absent)
        }
    }

    #[tokio::test]
    async fn conditional_put_tracks_versions() {
        let store = InMemoryKeyValueStore::default();
        let key = ItemKey::new("SESSION#u", "STATE");

        let v1 = store
            .put(PutItem::new(key.clone(), json!({"n": 1}), WriteCondition::Absent))
            .await
            .expect("insert");
        assert_eq!(v1, 1);

        let duplicate =
            store.put(PutItem::new(key.clone(), json!({"n": 2}), WriteCondition::Absent)).await;
        assert_eq!(duplicate, Err(StorageError::ConditionFailed { key: key.clone() }));

        let v2 = store
            .put(PutItem::new(key.clone(), json!({"n": 2}), WriteCondition::Version(1)))
            .await
            .expect("versioned update");
        assert_eq!(v2, 2);

        let stale = store.put(PutItem::new(key.clone(), json!({"n": 3}), WriteCondition::Version(1))).await;
        assert!(matches!(stale, Err(StorageError::ConditionFailed { .. })));
        assert_eq!(store.get(&key).await.expect("get").map(|item| item.body), Some(json!({"n": 2})));
    }

    #[tokio::test]
    async fn transact_write_is_all_or_nothing() {
        let store = InMemoryKeyValueStore::default();
        let fence = ItemKey::new("BUCKET#2025-06-06#21:00", "FENCE");
        store.put(PutItem::new(fence.clone(), json!({}), WriteCondition::Absent)).await.expect("fence");

        let result = store
            .transact_write(vec![
                WriteOp::Put(dated("RES-1", "21:00")),
                WriteOp::Put(PutItem::new(fence.clone(), json!({}), WriteCondition::Version(7))),
            ])
            .await;

        assert!(matches!(result, Err(StorageError::ConditionFailed { ref key }) if *key == fence));
        assert_eq!(store.len().await, 1, "the reservation put must not be applied");
    }

    #[tokio::test]
    async fn query_orders_by_sort_and_resumes_after_cursor() {
        let store = InMemoryKeyValueStore::default();
        for (id, time) in [("RES-C", "21:00"), ("RES-A", "20:00"), ("RES-B", "21:00")] {
            store.put(dated(id, time)).await.expect("put");
        }

        let query = Query::new(IndexName::Gsi1, "DATE#2025-06-06", SortRange::All);
        let all = store.query(&query).await.expect("query");
        let sorts: Vec<_> =
            all.iter().filter_map(|item| item.gsi1.as_ref().map(|key| key.sort.clone())).collect();
        assert_eq!(sorts, vec!["20:00#RES-A", "21:00#RES-B", "21:00#RES-C"]);

        let first = store.query(&query.clone().limit(2)).await.expect("first page");
        let cursor = first.last().and_then(|item| item.cursor(IndexName::Gsi1));
        let rest = store.query(&query.clone().after(cursor)).await.expect("second page");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].key.partition, "RES#RES-C");

        let bucket = Query::new(IndexName::Gsi1, "DATE#2025-06-06", SortRange::Prefix("21:00#".into()));
        assert_eq!(store.query(&bucket).await.expect("bucket").len(), 2);
    }

    #[tokio::test]
    async fn purge_removes_only_expired_items() {
        let store = InMemoryKeyValueStore::default();
        let mut expired = dated("RES-OLD", "20:00");
        expired.expires_at = Some(100);
        let mut later = dated("RES-LATER", "20:30");
        later.expires_at = Some(500);
        store.put(expired).await.expect("put");
        store.put(later).await.expect("put");
        store.put(dated("RES-KEEP", "21:00")).await.expect("put");

        assert_eq!(store.purge_expired(100).await.expect("purge"), 1);
        assert_eq!(store.len().await, 2);
    }
}
