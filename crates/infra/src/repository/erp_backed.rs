use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use ordersync_core::{ExpectedVersion, OrderId, RemoteId, SyncStatus};
use ordersync_purchasing::{
    ErpRecord, LINE_MODEL, ORDER_MODEL, PurchaseOrder, RemoteOrder, RemoteOrderLine, fields,
    format_erp_datetime, line_values, order_values,
};

use super::{
    MAPPINGS_TABLE, ORDERS_TABLE, PurchaseOrderRepository, RepositoryError, SyncMapping, SyncMark,
};
use crate::cache::{CacheService, CacheServiceExt, SetOptions, keys};
use crate::erp::{DomainOperator, ErpClient, ErpError, SearchDomain, SearchOptions};
use crate::store::{Filter, RecordQuery, RecordStore, StoreError, StoredRecord};

/// Tag attached to every cached remote order.
pub const REMOTE_ORDER_TAG: &str = "erp:purchase.order";

/// Repository over an ERP client, a local record store and a cache for
/// remote reads.
pub struct ErpPurchaseOrderRepository {
    erp: Arc<dyn ErpClient>,
    store: Arc<dyn RecordStore>,
    cache: Arc<dyn CacheService>,
    remote_ttl: Option<Duration>,
}

impl ErpPurchaseOrderRepository {
    pub fn new(
        erp: Arc<dyn ErpClient>,
        store: Arc<dyn RecordStore>,
        cache: Arc<dyn CacheService>,
    ) -> Self {
        Self {
            erp,
            store,
            cache,
            remote_ttl: None,
        }
    }

    /// Override the tier TTLs for cached remote orders.
    pub fn with_remote_ttl(mut self, ttl: Duration) -> Self {
        self.remote_ttl = Some(ttl);
        self
    }

    fn cache_options(&self) -> SetOptions {
        SetOptions {
            ttl: self.remote_ttl,
            tags: vec![REMOTE_ORDER_TAG.to_string()],
        }
    }

    async fn load_order(&self, id: OrderId) -> Result<(StoredRecord, PurchaseOrder), RepositoryError> {
        let record = self
            .store
            .get(ORDERS_TABLE, &id.to_string())
            .await?
            .ok_or(RepositoryError::NotFound(id))?;
        let order = decode(&record.data)?;
        Ok((record, order))
    }

    async fn save_order(&self, record: &StoredRecord, order: &PurchaseOrder) -> Result<(), RepositoryError> {
        self.store
            .update(
                ORDERS_TABLE,
                &record.id,
                encode(order)?,
                ExpectedVersion::Exact(record.revision),
            )
            .await?;
        Ok(())
    }

    /// Fetch the line records referenced by a header.
    async fn expand(&self, remote: RemoteOrder) -> Result<RemoteOrder, RepositoryError> {
        if remote.line_ids.is_empty() {
            return Ok(remote);
        }
        let ids: Vec<i64> = remote.line_ids.iter().map(|id| id.get()).collect();
        let records = self
            .erp
            .read(LINE_MODEL, &ids, Some(fields::LINE_FIELDS))
            .await?;
        let lines = records
            .iter()
            .map(RemoteOrderLine::from_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(remote.with_lines(lines))
    }

    async fn expand_all(&self, records: Vec<ErpRecord>) -> Result<Vec<RemoteOrder>, RepositoryError> {
        let mut orders = Vec::with_capacity(records.len());
        for record in &records {
            orders.push(self.expand(RemoteOrder::from_record(record)?).await?);
        }
        Ok(orders)
    }

    /// Create one remote line per item. If any create fails, the lines
    /// already created are unlinked before the error is returned.
    async fn create_lines(
        &self,
        remote_id: RemoteId,
        order: &PurchaseOrder,
    ) -> Result<Vec<i64>, RepositoryError> {
        let mut ids = Vec::with_capacity(order.items.len());
        for item in &order.items {
            match self.erp.create(LINE_MODEL, line_values(remote_id, item)).await {
                Ok(id) => ids.push(id),
                Err(err) => {
                    self.unlink_quietly(LINE_MODEL, &ids).await;
                    return Err(err.into());
                }
            }
        }
        Ok(ids)
    }

    async fn unlink_quietly(&self, model: &str, ids: &[i64]) {
        if ids.is_empty() {
            return;
        }
        if let Err(err) = self.erp.unlink(model, ids).await {
            warn!(model, ?ids, error = %err, "failed to unlink partially created records");
        }
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, RepositoryError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()).into())
}

fn decode<T: serde::de::DeserializeOwned>(data: &Value) -> Result<T, RepositoryError> {
    serde_json::from_value(data.clone()).map_err(|e| StoreError::Serialization(e.to_string()).into())
}

fn decode_all(records: Vec<StoredRecord>) -> Result<Vec<PurchaseOrder>, RepositoryError> {
    records.iter().map(|r| decode(&r.data)).collect()
}

fn requiring_sync() -> Filter {
    Filter::is_in(
        "sync_status",
        SyncStatus::ALL
            .into_iter()
            .filter(|s| s.requires_sync())
            .map(|s| json!(s))
            .collect(),
    )
}

#[async_trait]
impl PurchaseOrderRepository for ErpPurchaseOrderRepository {
    async fn find_local(&self, id: OrderId) -> Result<Option<PurchaseOrder>, RepositoryError> {
        match self.store.get(ORDERS_TABLE, &id.to_string()).await? {
            Some(record) => Ok(Some(decode(&record.data)?)),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn find_remote(&self, remote_id: RemoteId) -> Result<Option<RemoteOrder>, RepositoryError> {
        let key = keys::remote_order(remote_id);
        match self.cache.get_as::<RemoteOrder>(&key).await {
            Ok(Some(cached)) => return Ok(Some(cached)),
            Ok(None) => {}
            Err(err) => warn!(%key, error = %err, "cache read failed, falling back to ERP"),
        }

        let records = match self
            .erp
            .read(ORDER_MODEL, &[remote_id.get()], Some(fields::ORDER_FIELDS))
            .await
        {
            Ok(records) => records,
            Err(ErpError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(record) = records.first() else {
            return Ok(None);
        };
        let remote = self.expand(RemoteOrder::from_record(record)?).await?;

        if let Err(err) = self.cache.set_as(&key, &remote, self.cache_options()).await {
            warn!(%key, error = %err, "failed to cache remote order");
        }
        Ok(Some(remote))
    }

    async fn invalidate_remote(&self, remote_id: RemoteId) -> Result<(), RepositoryError> {
        self.cache.delete(&keys::remote_order(remote_id)).await?;
        Ok(())
    }

    async fn create_local(&self, order: &PurchaseOrder) -> Result<(), RepositoryError> {
        self.store
            .insert(ORDERS_TABLE, &order.id.to_string(), encode(order)?)
            .await?;
        debug!(order_id = %order.id, "local purchase order created");
        Ok(())
    }

    async fn update_local(
        &self,
        order: &PurchaseOrder,
        expected: ExpectedVersion,
    ) -> Result<(), RepositoryError> {
        let (record, current) = self.load_order(order.id).await?;
        if !expected.matches(current.version) {
            return Err(RepositoryError::Concurrency {
                id: order.id,
                expected,
                actual: current.version,
            });
        }
        // Sync fields belong to the pipeline; callers may hold a stale copy.
        let mut order = order.clone();
        order.remote_id = current.remote_id;
        order.last_synced_at = current.last_synced_at;
        order.sync_status = match current.sync_status {
            SyncStatus::Synced if order.version > current.version => SyncStatus::PendingSync,
            status => status,
        };
        self.save_order(&record, &order).await
    }

    async fn delete_local(&self, id: OrderId) -> Result<bool, RepositoryError> {
        let key = id.to_string();
        let removed = self.store.delete(ORDERS_TABLE, &key).await?;
        self.store.delete(MAPPINGS_TABLE, &key).await?;
        Ok(removed)
    }

    #[tracing::instrument(skip(self, order), fields(order_id = %order.id))]
    async fn create_remote(&self, order: &PurchaseOrder) -> Result<RemoteId, RepositoryError> {
        let id = self.erp.create(ORDER_MODEL, order_values(order)).await?;
        let remote_id = RemoteId::new(id)?;
        if let Err(err) = self.create_lines(remote_id, order).await {
            // Nothing maps to this header yet; a retried create must not orphan it.
            self.unlink_quietly(ORDER_MODEL, &[remote_id.get()]).await;
            return Err(err);
        }
        info!(%remote_id, lines = order.items.len(), "remote purchase order created");
        Ok(remote_id)
    }

    #[tracing::instrument(skip(self, order), fields(order_id = %order.id))]
    async fn update_remote(
        &self,
        remote_id: RemoteId,
        order: &PurchaseOrder,
    ) -> Result<(), RepositoryError> {
        let header = self
            .erp
            .read(ORDER_MODEL, &[remote_id.get()], Some(&[fields::ORDER_LINE]))
            .await?;
        let Some(record) = header.first() else {
            return Err(ErpError::not_found(ORDER_MODEL, vec![remote_id.get()]).into());
        };
        let stale: Vec<i64> = record
            .get(fields::ORDER_LINE)
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();
        if !stale.is_empty() {
            self.erp.unlink(LINE_MODEL, &stale).await?;
        }
        let line_ids = self.create_lines(remote_id, order).await?;

        let mut values = order_values(order);
        values.insert(fields::ORDER_LINE.into(), json!(line_ids));
        self.erp.write(ORDER_MODEL, &[remote_id.get()], values).await?;
        self.invalidate_remote(remote_id).await?;
        info!(lines = line_ids.len(), "remote purchase order updated");
        Ok(())
    }

    async fn find_remote_modified_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteOrder>, RepositoryError> {
        let domain = SearchDomain::new().filter(
            fields::WRITE_DATE,
            DomainOperator::Gt,
            json!(format_erp_datetime(since)),
        );
        let options = SearchOptions {
            order: Some(format!("{} asc", fields::WRITE_DATE)),
            ..SearchOptions::default()
        };
        self.search_remote(&domain, options).await
    }

    async fn search_remote(
        &self,
        domain: &SearchDomain,
        options: SearchOptions,
    ) -> Result<Vec<RemoteOrder>, RepositoryError> {
        let records = self
            .erp
            .search_read(ORDER_MODEL, domain, Some(fields::ORDER_FIELDS), options)
            .await?;
        self.expand_all(records).await
    }

    async fn find_orders_requiring_sync(&self) -> Result<Vec<PurchaseOrder>, RepositoryError> {
        let records = self
            .store
            .query(ORDERS_TABLE, &RecordQuery::new().filter(requiring_sync()))
            .await?;
        decode_all(records)
    }

    async fn find_orders_requiring_sync_page(
        &self,
        after: Option<OrderId>,
        limit: usize,
    ) -> Result<Vec<PurchaseOrder>, RepositoryError> {
        let query = RecordQuery::new()
            .filter(requiring_sync())
            .after(after.map(|id| id.to_string()))
            .limit(limit);
        let records = self.store.query(ORDERS_TABLE, &query).await?;
        decode_all(records)
    }

    async fn find_sync_mapping(&self, local_id: OrderId) -> Result<Option<SyncMapping>, RepositoryError> {
        match self.store.get(MAPPINGS_TABLE, &local_id.to_string()).await? {
            Some(record) => Ok(Some(decode(&record.data)?)),
            None => Ok(None),
        }
    }

    async fn find_sync_mapping_by_remote(
        &self,
        remote_id: RemoteId,
    ) -> Result<Option<SyncMapping>, RepositoryError> {
        let query = RecordQuery::new()
            .filter(Filter::eq("remote_id", json!(remote_id.get())))
            .limit(1);
        match self.store.query(MAPPINGS_TABLE, &query).await?.first() {
            Some(record) => Ok(Some(decode(&record.data)?)),
            None => Ok(None),
        }
    }

    async fn mark_synced(&self, local_id: OrderId, mark: SyncMark) -> Result<SyncMapping, RepositoryError> {
        let (record, mut order) = self.load_order(local_id).await?;
        order.mark_synced(mark.remote_id, mark.synced_at);
        if order.version > mark.local_version {
            order.sync_status = SyncStatus::PendingSync;
        }
        self.save_order(&record, &order).await?;

        let mapping = SyncMapping {
            local_id,
            remote_id: mark.remote_id,
            last_synced_at: mark.synced_at,
            local_version: mark.local_version,
            remote_write_date: mark.remote_write_date,
        };
        let key = local_id.to_string();
        let data = encode(&mapping)?;
        if self.store.get(MAPPINGS_TABLE, &key).await?.is_some() {
            self.store
                .update(MAPPINGS_TABLE, &key, data, ExpectedVersion::Any)
                .await?;
        } else {
            self.store.insert(MAPPINGS_TABLE, &key, data).await?;
        }
        debug!(order_id = %local_id, remote_id = %mark.remote_id, "sync mapping recorded");
        Ok(mapping)
    }

    async fn set_sync_status(&self, local_id: OrderId, status: SyncStatus) -> Result<(), RepositoryError> {
        let (record, mut order) = self.load_order(local_id).await?;
        if order.sync_status == status {
            return Ok(());
        }
        order.sync_status = status;
        self.save_order(&record, &order).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TieredCache;
    use crate::config::CacheConfig;
    use crate::erp::InMemoryErpClient;
    use crate::store::InMemoryRecordStore;
    use ordersync_core::{Money, TaxRate};
    use ordersync_purchasing::OrderItem;

    struct Fixture {
        erp: Arc<InMemoryErpClient>,
        repo: ErpPurchaseOrderRepository,
    }

    fn fixture() -> Fixture {
        let erp = Arc::new(InMemoryErpClient::new());
        let repo = ErpPurchaseOrderRepository::new(
            erp.clone(),
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(TieredCache::in_memory(CacheConfig::default())),
        );
        Fixture { erp, repo }
    }

    fn order() -> PurchaseOrder {
        let items = vec![
            OrderItem::new("SKU-1", 10, Money::from_cents(3_000)).unwrap(),
            OrderItem::new("SKU-2", 4, Money::from_cents(5_000)).unwrap(),
        ];
        PurchaseOrder::new("PO-1", "7", items, TaxRate::from_basis_points(1_000).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn local_crud_checks_versions() {
        let f = fixture();
        let mut po = order();
        f.repo.create_local(&po).await.unwrap();
        assert!(f.repo.create_local(&po).await.is_err());

        po.submit().unwrap();
        f.repo.update_local(&po, ExpectedVersion::Exact(1)).await.unwrap();
        let err = f
            .repo
            .update_local(&po, ExpectedVersion::Exact(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Concurrency { actual: 2, .. }));

        assert_eq!(f.repo.find_local(po.id).await.unwrap().unwrap().version, 2);
        assert!(f.repo.delete_local(po.id).await.unwrap());
        assert!(f.repo.find_local(po.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remote_round_trip_and_cached_reads() {
        let f = fixture();
        let po = order();
        let remote_id = f.repo.create_remote(&po).await.unwrap();

        let remote = f.repo.find_remote(remote_id).await.unwrap().unwrap();
        assert_eq!(remote.lines.len(), 2);
        assert_eq!(remote.amount_total, po.total);
        assert!(!f.repo.detect_conflicts(&po, &remote, None).has_conflicts);

        let calls = f.erp.call_count();
        f.repo.find_remote(remote_id).await.unwrap().unwrap();
        assert_eq!(f.erp.call_count(), calls, "second read is served by the cache");

        f.repo.invalidate_remote(remote_id).await.unwrap();
        f.repo.find_remote(remote_id).await.unwrap().unwrap();
        assert!(f.erp.call_count() > calls);
    }

    #[tokio::test]
    async fn failed_line_create_leaves_nothing_behind() {
        let f = fixture();
        let po = order();
        // First line lands, the second one fails.
        f.erp.fail_create_after(LINE_MODEL, 1, ErpError::Network("reset".into()));
        let err = f.repo.create_remote(&po).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Erp(ErpError::Network(_))));
        assert_eq!(f.erp.count(ORDER_MODEL), 0);
        assert_eq!(f.erp.count(LINE_MODEL), 0);

        let remote_id = f.repo.create_remote(&po).await.unwrap();
        assert_eq!(f.erp.count(ORDER_MODEL), 1);
        assert_eq!(f.repo.find_remote(remote_id).await.unwrap().unwrap().lines.len(), 2);
    }

    #[tokio::test]
    async fn update_remote_replaces_lines() {
        let f = fixture();
        let mut po = order();
        let remote_id = f.repo.create_remote(&po).await.unwrap();
        f.repo.find_remote(remote_id).await.unwrap();

        let first = po.items[0].id;
        po.remove_item(first).unwrap();
        f.repo.update_remote(remote_id, &po).await.unwrap();

        let remote = f.repo.find_remote(remote_id).await.unwrap().unwrap();
        assert_eq!(remote.lines.len(), 1);
        assert_eq!(remote.lines[0].product_ref, "SKU-2");
        assert_eq!(remote.amount_total, po.total);
        assert_eq!(f.erp.count(LINE_MODEL), 1);
    }

    #[tokio::test]
    async fn missing_remote_is_none() {
        let f = fixture();
        let missing = RemoteId::new(404).unwrap();
        assert!(f.repo.find_remote(missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_synced_records_mapping_and_keeps_later_edits_pending() {
        let f = fixture();
        let mut po = order();
        f.repo.create_local(&po).await.unwrap();
        let remote_id = RemoteId::new(9).unwrap();
        let at = Utc::now();

        let mapping = f
            .repo
            .mark_synced(
                po.id,
                SyncMark {
                    remote_id,
                    synced_at: at,
                    local_version: 1,
                    remote_write_date: Some(at),
                },
            )
            .await
            .unwrap();
        assert_eq!(mapping.local_version, 1);
        let stored = f.repo.find_local(po.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(stored.version, 1);
        assert_eq!(
            f.repo.find_sync_mapping_by_remote(remote_id).await.unwrap(),
            Some(mapping.clone())
        );
        assert!(f.repo.find_orders_requiring_sync().await.unwrap().is_empty());

        po = stored;
        po.submit().unwrap();
        f.repo.update_local(&po, ExpectedVersion::Exact(1)).await.unwrap();
        f.repo
            .mark_synced(
                po.id,
                SyncMark {
                    remote_id,
                    synced_at: at,
                    local_version: 1,
                    remote_write_date: Some(at),
                },
            )
            .await
            .unwrap();
        let stored = f.repo.find_local(po.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::PendingSync);
        assert_eq!(f.repo.find_orders_requiring_sync().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pending_orders_page_in_id_order() {
        let f = fixture();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let po = order();
            ids.push(po.id);
            f.repo.create_local(&po).await.unwrap();
        }
        f.repo.set_sync_status(ids[1], SyncStatus::Conflict).await.unwrap();

        let first = f.repo.find_orders_requiring_sync_page(None, 2).await.unwrap();
        assert_eq!(first.iter().map(|o| o.id).collect::<Vec<_>>(), vec![ids[0], ids[2]]);
        let rest = f
            .repo
            .find_orders_requiring_sync_page(Some(ids[2]), 10)
            .await
            .unwrap();
        assert_eq!(rest.iter().map(|o| o.id).collect::<Vec<_>>(), vec![ids[3], ids[4]]);
    }

    #[tokio::test]
    async fn modified_since_sees_remote_edits() {
        let f = fixture();
        let a = f.repo.create_remote(&order()).await.unwrap();
        let b = f.repo.create_remote(&order()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let cutoff = Utc::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.erp.modify(ORDER_MODEL, b.get(), ErpRecord::new());

        let changed = f.repo.find_remote_modified_since(cutoff).await.unwrap();
        let ids: Vec<RemoteId> = changed.iter().map(|r| r.remote_id).collect();
        assert_eq!(ids, vec![b]);
        assert!(!ids.contains(&a));
    }
}
