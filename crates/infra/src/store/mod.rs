//! Local persistence contract: a table-scoped record store.
//!
//! Records are JSON objects keyed by a string id. The store assigns each row a
//! revision that increases on every write, so callers can do optimistic
//! read-modify-write cycles without knowing the record's shape.

pub mod in_memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use ordersync_core::{ErrorClass, ExpectedVersion};

pub use in_memory::InMemoryRecordStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("{table}/{id} not found")]
    NotFound { table: String, id: String },

    #[error("stale revision: {0}")]
    Concurrency(String),

    #[error("record (de)serialization failed: {0}")]
    Serialization(String),

    #[error("store backend failed: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Constraint(_) | StoreError::Serialization(_) => ErrorClass::Validation,
            StoreError::NotFound { .. } => ErrorClass::NotFound,
            StoreError::Concurrency(_) => ErrorClass::Conflict,
            StoreError::Backend(_) => ErrorClass::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub revision: u64,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Top-level field equals the value.
    Eq { field: String, value: Value },
    /// Top-level field equals one of the values.
    In { field: String, values: Vec<Value> },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::Eq {
            field: field.into(),
            value,
        }
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::In {
            field: field.into(),
            values,
        }
    }

    pub fn matches(&self, data: &Value) -> bool {
        match self {
            Filter::Eq { field, value } => data.get(field) == Some(value),
            Filter::In { field, values } => data.get(field).is_some_and(|v| values.contains(v)),
        }
    }
}

/// Conjunctive filter with keyset paging over ascending ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub filters: Vec<Filter>,
    /// Only ids strictly greater than this one.
    pub after_id: Option<String>,
    pub limit: Option<usize>,
}

impl RecordQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn after(mut self, id: Option<String>) -> Self {
        self.after_id = id;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &StoredRecord) -> bool {
        self.after_id.as_ref().is_none_or(|after| record.id.as_str() > after.as_str())
            && self.filters.iter().all(|f| f.matches(&record.data))
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, table: &str, id: &str) -> Result<Option<StoredRecord>, StoreError>;

    /// Insert a new row at revision 1. Fails with `Constraint` if the id exists.
    async fn insert(&self, table: &str, id: &str, data: Value) -> Result<StoredRecord, StoreError>;

    /// Replace a row's data. `expected` is checked against the row revision.
    async fn update(
        &self,
        table: &str,
        id: &str,
        data: Value,
        expected: ExpectedVersion,
    ) -> Result<StoredRecord, StoreError>;

    async fn delete(&self, table: &str, id: &str) -> Result<bool, StoreError>;

    /// Matching rows in ascending id order.
    async fn query(&self, table: &str, query: &RecordQuery) -> Result<Vec<StoredRecord>, StoreError>;
}

#[async_trait]
impl<S> RecordStore for Arc<S>
where
    S: RecordStore + ?Sized,
{
    async fn get(&self, table: &str, id: &str) -> Result<Option<StoredRecord>, StoreError> {
        (**self).get(table, id).await
    }

    async fn insert(&self, table: &str, id: &str, data: Value) -> Result<StoredRecord, StoreError> {
        (**self).insert(table, id, data).await
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        data: Value,
        expected: ExpectedVersion,
    ) -> Result<StoredRecord, StoreError> {
        (**self).update(table, id, data, expected).await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<bool, StoreError> {
        (**self).delete(table, id).await
    }

    async fn query(&self, table: &str, query: &RecordQuery) -> Result<Vec<StoredRecord>, StoreError> {
        (**self).query(table, query).await
    }
}
