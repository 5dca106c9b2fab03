//! Dual-sided purchase order access: the local record store on one side, the
//! ERP on the other, plus the sync mappings that tie them together.

pub mod conflict;
pub mod erp_backed;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ordersync_core::{DomainError, ErrorClass, ExpectedVersion, OrderId, RemoteId, SyncStatus};
use ordersync_purchasing::{PurchaseOrder, RecordError, RemoteOrder};

use crate::cache::CacheError;
use crate::erp::{ErpError, SearchDomain, SearchOptions};
use crate::retry::Retryable;
use crate::store::StoreError;

pub use conflict::{Conflict, ConflictSet, SyncBaseline};
pub use erp_backed::ErpPurchaseOrderRepository;

pub const ORDERS_TABLE: &str = "purchase_orders";
pub const MAPPINGS_TABLE: &str = "sync_mappings";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RepositoryError {
    #[error(transparent)]
    Erp(#[from] ErpError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("malformed remote record: {0}")]
    Record(#[from] RecordError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("cache failed: {0}")]
    Cache(String),

    #[error("purchase order {0} not found")]
    NotFound(OrderId),

    #[error("purchase order {id} was modified concurrently (expected {expected:?}, found {actual})")]
    Concurrency {
        id: OrderId,
        expected: ExpectedVersion,
        actual: u64,
    },
}

impl RepositoryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RepositoryError::Erp(e) => e.class(),
            RepositoryError::Store(e) => e.class(),
            RepositoryError::Record(_) => ErrorClass::Validation,
            RepositoryError::Domain(e) => e.class(),
            RepositoryError::Cache(_) => ErrorClass::Internal,
            RepositoryError::NotFound(_) => ErrorClass::NotFound,
            RepositoryError::Concurrency { .. } => ErrorClass::Conflict,
        }
    }
}

impl From<CacheError> for RepositoryError {
    fn from(err: CacheError) -> Self {
        RepositoryError::Cache(err.to_string())
    }
}

impl Retryable for RepositoryError {
    fn is_retryable(&self) -> bool {
        match self {
            RepositoryError::Erp(e) => e.is_retryable(),
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            RepositoryError::Erp(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// Association between a local order and its remote record, with the
/// baseline captured at the last successful sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMapping {
    pub local_id: OrderId,
    pub remote_id: RemoteId,
    pub last_synced_at: DateTime<Utc>,
    pub local_version: u64,
    pub remote_write_date: Option<DateTime<Utc>>,
}

impl SyncMapping {
    pub fn baseline(&self) -> SyncBaseline {
        SyncBaseline {
            local_version: self.local_version,
            remote_write_date: self.remote_write_date,
        }
    }
}

/// Outcome of a successful sync, as recorded by [`PurchaseOrderRepository::mark_synced`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMark {
    pub remote_id: RemoteId,
    pub synced_at: DateTime<Utc>,
    /// Local version that was reconciled.
    pub local_version: u64,
    pub remote_write_date: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PurchaseOrderRepository: Send + Sync {
    async fn find_local(&self, id: OrderId) -> Result<Option<PurchaseOrder>, RepositoryError>;

    /// Remote header plus expanded lines. Reads through the cache.
    async fn find_remote(&self, remote_id: RemoteId) -> Result<Option<RemoteOrder>, RepositoryError>;

    /// Drop any cached copy of a remote order.
    async fn invalidate_remote(&self, remote_id: RemoteId) -> Result<(), RepositoryError>;

    async fn create_local(&self, order: &PurchaseOrder) -> Result<(), RepositoryError>;

    /// Persist `order`. `expected` is checked against the stored order version.
    async fn update_local(
        &self,
        order: &PurchaseOrder,
        expected: ExpectedVersion,
    ) -> Result<(), RepositoryError>;

    /// Remove the order and its sync mapping.
    async fn delete_local(&self, id: OrderId) -> Result<bool, RepositoryError>;

    async fn create_remote(&self, order: &PurchaseOrder) -> Result<RemoteId, RepositoryError>;

    /// Write the header and replace the lines of an existing remote order.
    async fn update_remote(
        &self,
        remote_id: RemoteId,
        order: &PurchaseOrder,
    ) -> Result<(), RepositoryError>;

    async fn find_remote_modified_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteOrder>, RepositoryError>;

    async fn search_remote(
        &self,
        domain: &SearchDomain,
        options: SearchOptions,
    ) -> Result<Vec<RemoteOrder>, RepositoryError>;

    async fn find_orders_requiring_sync(&self) -> Result<Vec<PurchaseOrder>, RepositoryError>;

    /// Orders requiring sync with ids strictly after `after`, ascending.
    async fn find_orders_requiring_sync_page(
        &self,
        after: Option<OrderId>,
        limit: usize,
    ) -> Result<Vec<PurchaseOrder>, RepositoryError>;

    async fn find_sync_mapping(&self, local_id: OrderId) -> Result<Option<SyncMapping>, RepositoryError>;

    async fn find_sync_mapping_by_remote(
        &self,
        remote_id: RemoteId,
    ) -> Result<Option<SyncMapping>, RepositoryError>;

    /// Record a successful sync: set the remote id and baseline. Does not bump
    /// the order version; an order edited after `mark.local_version` stays
    /// pending.
    async fn mark_synced(&self, local_id: OrderId, mark: SyncMark) -> Result<SyncMapping, RepositoryError>;

    async fn set_sync_status(&self, local_id: OrderId, status: SyncStatus) -> Result<(), RepositoryError>;

    fn detect_conflicts(
        &self,
        local: &PurchaseOrder,
        remote: &RemoteOrder,
        mapping: Option<&SyncMapping>,
    ) -> ConflictSet {
        let baseline = mapping.map(SyncMapping::baseline);
        conflict::detect(local, remote, baseline.as_ref())
    }
}

#[async_trait]
impl<R> PurchaseOrderRepository for Arc<R>
where
    R: PurchaseOrderRepository + ?Sized,
{
    async fn find_local(&self, id: OrderId) -> Result<Option<PurchaseOrder>, RepositoryError> {
        (**self).find_local(id).await
    }

    async fn find_remote(&self, remote_id: RemoteId) -> Result<Option<RemoteOrder>, RepositoryError> {
        (**self).find_remote(remote_id).await
    }

    async fn invalidate_remote(&self, remote_id: RemoteId) -> Result<(), RepositoryError> {
        (**self).invalidate_remote(remote_id).await
    }

    async fn create_local(&self, order: &PurchaseOrder) -> Result<(), RepositoryError> {
        (**self).create_local(order).await
    }

    async fn update_local(
        &self,
        order: &PurchaseOrder,
        expected: ExpectedVersion,
    ) -> Result<(), RepositoryError> {
        (**self).update_local(order, expected).await
    }

    async fn delete_local(&self, id: OrderId) -> Result<bool, RepositoryError> {
        (**self).delete_local(id).await
    }

    async fn create_remote(&self, order: &PurchaseOrder) -> Result<RemoteId, RepositoryError> {
        (**self).create_remote(order).await
    }

    async fn update_remote(
        &self,
        remote_id: RemoteId,
        order: &PurchaseOrder,
    ) -> Result<(), RepositoryError> {
        (**self).update_remote(remote_id, order).await
    }

    async fn find_remote_modified_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteOrder>, RepositoryError> {
        (**self).find_remote_modified_since(since).await
    }

    async fn search_remote(
        &self,
        domain: &SearchDomain,
        options: SearchOptions,
    ) -> Result<Vec<RemoteOrder>, RepositoryError> {
        (**self).search_remote(domain, options).await
    }

    async fn find_orders_requiring_sync(&self) -> Result<Vec<PurchaseOrder>, RepositoryError> {
        (**self).find_orders_requiring_sync().await
    }

    async fn find_orders_requiring_sync_page(
        &self,
        after: Option<OrderId>,
        limit: usize,
    ) -> Result<Vec<PurchaseOrder>, RepositoryError> {
        (**self).find_orders_requiring_sync_page(after, limit).await
    }

    async fn find_sync_mapping(&self, local_id: OrderId) -> Result<Option<SyncMapping>, RepositoryError> {
        (**self).find_sync_mapping(local_id).await
    }

    async fn find_sync_mapping_by_remote(
        &self,
        remote_id: RemoteId,
    ) -> Result<Option<SyncMapping>, RepositoryError> {
        (**self).find_sync_mapping_by_remote(remote_id).await
    }

    async fn mark_synced(&self, local_id: OrderId, mark: SyncMark) -> Result<SyncMapping, RepositoryError> {
        (**self).mark_synced(local_id, mark).await
    }

    async fn set_sync_status(&self, local_id: OrderId, status: SyncStatus) -> Result<(), RepositoryError> {
        (**self).set_sync_status(local_id, status).await
    }

    fn detect_conflicts(
        &self,
        local: &PurchaseOrder,
        remote: &RemoteOrder,
        mapping: Option<&SyncMapping>,
    ) -> ConflictSet {
        (**self).detect_conflicts(local, remote, mapping)
    }
}
