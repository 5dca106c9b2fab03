use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use ordersync_core::ExpectedVersion;

use super::{RecordQuery, RecordStore, StoreError, StoredRecord};

/// In-memory record store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    tables: RwLock<HashMap<String, BTreeMap<String, StoredRecord>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::Backend("lock poisoned".to_string())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, table: &str, id: &str) -> Result<Option<StoredRecord>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables.get(table).and_then(|t| t.get(id)).cloned())
    }

    async fn insert(&self, table: &str, id: &str, data: Value) -> Result<StoredRecord, StoreError> {
        if !data.is_object() {
            return Err(StoreError::Constraint(format!("{table}/{id}: record must be an object")));
        }
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        let rows = tables.entry(table.to_string()).or_default();
        if rows.contains_key(id) {
            return Err(StoreError::Constraint(format!("{table}/{id} already exists")));
        }
        let record = StoredRecord {
            id: id.to_string(),
            revision: 1,
            data,
        };
        rows.insert(id.to_string(), record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        data: Value,
        expected: ExpectedVersion,
    ) -> Result<StoredRecord, StoreError> {
        if !data.is_object() {
            return Err(StoreError::Constraint(format!("{table}/{id}: record must be an object")));
        }
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        let row = tables
            .get_mut(table)
            .and_then(|t| t.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            })?;
        if !expected.matches(row.revision) {
            return Err(StoreError::Concurrency(format!(
                "{table}/{id}: expected {expected:?}, found {}",
                row.revision
            )));
        }
        row.revision += 1;
        row.data = data;
        Ok(row.clone())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        Ok(tables.get_mut(table).is_some_and(|t| t.remove(id).is_some()))
    }

    async fn query(&self, table: &str, query: &RecordQuery) -> Result<Vec<StoredRecord>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter(|r| query.matches(r))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Filter;
    use serde_json::json;

    #[tokio::test]
    async fn duplicate_insert_is_a_constraint_violation() {
        let store = InMemoryRecordStore::new();
        store.insert("t", "1", json!({"a": 1})).await.unwrap();
        let err = store.insert("t", "1", json!({"a": 2})).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn update_checks_revision() {
        let store = InMemoryRecordStore::new();
        store.insert("t", "1", json!({"a": 1})).await.unwrap();
        let updated = store
            .update("t", "1", json!({"a": 2}), ExpectedVersion::Exact(1))
            .await
            .unwrap();
        assert_eq!(updated.revision, 2);
        let err = store
            .update("t", "1", json!({"a": 3}), ExpectedVersion::Exact(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Concurrency(_)));
    }

    #[tokio::test]
    async fn query_filters_and_pages_by_id() {
        let store = InMemoryRecordStore::new();
        for (id, status) in [("a", "X"), ("b", "Y"), ("c", "X"), ("d", "X")] {
            store.insert("t", id, json!({"status": status})).await.unwrap();
        }
        let page = store
            .query(
                "t",
                &RecordQuery::new()
                    .filter(Filter::eq("status", json!("X")))
                    .after(Some("a".into()))
                    .limit(1),
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "c");

        let any = store
            .query("t", &RecordQuery::new().filter(Filter::is_in("status", vec![json!("Y")])))
            .await
            .unwrap();
        assert_eq!(any[0].id, "b");
    }
}
