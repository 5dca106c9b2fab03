//! Remote ERP client contract.
//!
//! The wire protocol is an implementation detail of each client. This module
//! fixes the method set the sync engine relies on, the search-domain shape and
//! the error taxonomy every client maps its failures onto.

pub mod circuit_breaker;
pub mod in_memory;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use ordersync_core::ErrorClass;
use ordersync_purchasing::{ErpRecord, parse_erp_datetime};

use crate::retry::Retryable;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerErpClient, CircuitState};
pub use in_memory::InMemoryErpClient;

/// Failure reported by an ERP client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ErpError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rejected by ERP: {0}")]
    Validation(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("{model} record(s) not found: {ids:?}")]
    NotFound { model: String, ids: Vec<i64> },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("circuit breaker is open")]
    CircuitOpen,
}

impl ErpError {
    pub fn not_found(model: &str, ids: Vec<i64>) -> Self {
        Self::NotFound {
            model: model.to_string(),
            ids,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ErpError::Network(_) | ErpError::Timeout(_) | ErpError::CircuitOpen => ErrorClass::Network,
            ErpError::Authentication(_) => ErrorClass::Authentication,
            ErpError::Validation(_) => ErrorClass::Validation,
            ErpError::RateLimited { .. } => ErrorClass::RateLimit,
            ErpError::NotFound { .. } => ErrorClass::NotFound,
            ErpError::Protocol(_) => ErrorClass::Internal,
        }
    }

    /// Failures that count against the circuit breaker.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErpError::Network(_) | ErpError::Timeout(_) | ErpError::RateLimited { .. }
        )
    }
}

impl Retryable for ErpError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ErpError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DomainOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
    #[serde(rename = "ilike")]
    ILike,
}

/// One `(field, operator, value)` search term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainTerm {
    pub field: String,
    pub operator: DomainOperator,
    pub value: Value,
}

impl DomainTerm {
    /// Evaluate the term against a record. Many-to-one pairs compare by id;
    /// strings that parse as ERP datetimes compare chronologically.
    pub fn matches(&self, record: &ErpRecord) -> bool {
        let actual = normalize(record.get(&self.field).unwrap_or(&Value::Null));
        match self.operator {
            DomainOperator::Eq => compare(actual, &self.value) == Some(std::cmp::Ordering::Equal),
            DomainOperator::Ne => compare(actual, &self.value) != Some(std::cmp::Ordering::Equal),
            DomainOperator::Gt => compare(actual, &self.value) == Some(std::cmp::Ordering::Greater),
            DomainOperator::Ge => matches!(
                compare(actual, &self.value),
                Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
            ),
            DomainOperator::Lt => compare(actual, &self.value) == Some(std::cmp::Ordering::Less),
            DomainOperator::Le => matches!(
                compare(actual, &self.value),
                Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
            ),
            DomainOperator::In => in_list(actual, &self.value),
            DomainOperator::NotIn => !in_list(actual, &self.value),
            DomainOperator::ILike => match (actual.as_str(), self.value.as_str()) {
                (Some(a), Some(needle)) => a.to_lowercase().contains(&needle.to_lowercase()),
                _ => false,
            },
        }
    }
}

/// Conjunction of search terms. An empty domain matches every record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchDomain(pub Vec<DomainTerm>);

impl SearchDomain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, operator: DomainOperator, value: Value) -> Self {
        self.0.push(DomainTerm {
            field: field.into(),
            operator,
            value,
        });
        self
    }

    pub fn matches(&self, record: &ErpRecord) -> bool {
        self.0.iter().all(|t| t.matches(record))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub offset: usize,
    /// `"field"` or `"field desc"`; defaults to ascending id.
    pub order: Option<String>,
}

impl SearchOptions {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

/// Field introspection result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub field_type: String,
    pub label: String,
    pub required: bool,
    pub readonly: bool,
    pub relation: Option<String>,
}

/// Abstract RPC contract of the remote ERP.
#[async_trait]
pub trait ErpClient: Send + Sync {
    async fn create(&self, model: &str, values: ErpRecord) -> Result<i64, ErpError>;

    async fn read(
        &self,
        model: &str,
        ids: &[i64],
        fields: Option<&[&str]>,
    ) -> Result<Vec<ErpRecord>, ErpError>;

    async fn write(&self, model: &str, ids: &[i64], values: ErpRecord) -> Result<bool, ErpError>;

    async fn unlink(&self, model: &str, ids: &[i64]) -> Result<bool, ErpError>;

    async fn search(
        &self,
        model: &str,
        domain: &SearchDomain,
        options: SearchOptions,
    ) -> Result<Vec<i64>, ErpError>;

    async fn search_read(
        &self,
        model: &str,
        domain: &SearchDomain,
        fields: Option<&[&str]>,
        options: SearchOptions,
    ) -> Result<Vec<ErpRecord>, ErpError>;

    async fn search_count(&self, model: &str, domain: &SearchDomain) -> Result<usize, ErpError>;

    async fn fields_get(
        &self,
        model: &str,
        fields: Option<&[&str]>,
    ) -> Result<BTreeMap<String, FieldMetadata>, ErpError>;

    async fn connection_status(&self) -> ConnectionStatus;

    async fn authenticate(&self) -> Result<(), ErpError>;

    async fn logout(&self) -> Result<(), ErpError>;
}

#[async_trait]
impl<C> ErpClient for Arc<C>
where
    C: ErpClient + ?Sized,
{
    async fn create(&self, model: &str, values: ErpRecord) -> Result<i64, ErpError> {
        (**self).create(model, values).await
    }

    async fn read(
        &self,
        model: &str,
        ids: &[i64],
        fields: Option<&[&str]>,
    ) -> Result<Vec<ErpRecord>, ErpError> {
        (**self).read(model, ids, fields).await
    }

    async fn write(&self, model: &str, ids: &[i64], values: ErpRecord) -> Result<bool, ErpError> {
        (**self).write(model, ids, values).await
    }

    async fn unlink(&self, model: &str, ids: &[i64]) -> Result<bool, ErpError> {
        (**self).unlink(model, ids).await
    }

    async fn search(
        &self,
        model: &str,
        domain: &SearchDomain,
        options: SearchOptions,
    ) -> Result<Vec<i64>, ErpError> {
        (**self).search(model, domain, options).await
    }

    async fn search_read(
        &self,
        model: &str,
        domain: &SearchDomain,
        fields: Option<&[&str]>,
        options: SearchOptions,
    ) -> Result<Vec<ErpRecord>, ErpError> {
        (**self).search_read(model, domain, fields, options).await
    }

    async fn search_count(&self, model: &str, domain: &SearchDomain) -> Result<usize, ErpError> {
        (**self).search_count(model, domain).await
    }

    async fn fields_get(
        &self,
        model: &str,
        fields: Option<&[&str]>,
    ) -> Result<BTreeMap<String, FieldMetadata>, ErpError> {
        (**self).fields_get(model, fields).await
    }

    async fn connection_status(&self) -> ConnectionStatus {
        (**self).connection_status().await
    }

    async fn authenticate(&self) -> Result<(), ErpError> {
        (**self).authenticate().await
    }

    async fn logout(&self) -> Result<(), ErpError> {
        (**self).logout().await
    }
}

fn normalize(value: &Value) -> &Value {
    match value {
        Value::Array(pair) if !pair.is_empty() => &pair[0],
        other => other,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<std::cmp::Ordering> {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => {
            match (parse_erp_datetime(a), parse_erp_datetime(b)) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => Some(a.cmp(b)),
            }
        }
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Bool(false)) | (Value::Bool(false), Value::Null) => {
            Some(std::cmp::Ordering::Equal)
        }
        (Value::Null, Value::Null) => Some(std::cmp::Ordering::Equal),
        _ => None,
    }
}

fn in_list(actual: &Value, list: &Value) -> bool {
    list.as_array().is_some_and(|items| {
        items
            .iter()
            .any(|v| compare(actual, v) == Some(std::cmp::Ordering::Equal))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> ErpRecord {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn many_to_one_pairs_compare_by_id() {
        let r = record(json!({ "partner_id": [7, "Acme"] }));
        let domain = SearchDomain::new().filter("partner_id", DomainOperator::Eq, json!(7));
        assert!(domain.matches(&r));
    }

    #[test]
    fn datetimes_compare_chronologically_across_formats() {
        let r = record(json!({ "write_date": "2026-03-02 10:00:00" }));
        let domain = SearchDomain::new().filter(
            "write_date",
            DomainOperator::Gt,
            json!("2026-03-02T09:59:59.000000Z"),
        );
        assert!(domain.matches(&r));
    }

    #[test]
    fn in_operator_and_empty_domain() {
        let r = record(json!({ "state": "purchase" }));
        assert!(SearchDomain::new().matches(&r));
        assert!(
            SearchDomain::new()
                .filter("state", DomainOperator::In, json!(["draft", "purchase"]))
                .matches(&r)
        );
        assert!(
            !SearchDomain::new()
                .filter("state", DomainOperator::NotIn, json!(["purchase"]))
                .matches(&r)
        );
    }

    #[test]
    fn error_classes_drive_retry() {
        assert!(ErpError::Network("reset".into()).is_retryable());
        assert!(ErpError::RateLimited { retry_after: None }.is_retryable());
        assert!(!ErpError::CircuitOpen.is_retryable());
        assert_eq!(ErpError::CircuitOpen.class(), ErrorClass::Network);
        assert!(!ErpError::Authentication("expired".into()).is_retryable());
        assert_eq!(ErpError::not_found("purchase.order", vec![1]).class(), ErrorClass::NotFound);
    }
}
