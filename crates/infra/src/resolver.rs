//! Applying and suggesting conflict resolutions.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::info;

use ordersync_core::{
    ConflictId, ConflictType, ErrorClass, ExpectedVersion, OrderId, RemoteId, ResolutionStrategy,
};
use ordersync_purchasing::{ORDER_MODEL, PurchaseOrder, fields};

use crate::erp::ErpError;
use crate::repository::{PurchaseOrderRepository, RepositoryError, SyncMark};
use crate::sync_state::{
    ConflictResolution, SyncConflict, SyncStateError, SyncStateManager, SyncTransition,
};

/// Which side owns a field when both disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAuthority {
    Remote,
    Local,
    Shared,
}

pub fn field_authority(field: &str) -> FieldAuthority {
    match field {
        fields::AMOUNT_UNTAXED | fields::AMOUNT_TAX | fields::AMOUNT_TOTAL | fields::STATE => {
            FieldAuthority::Remote
        }
        fields::DATE_PLANNED => FieldAuthority::Local,
        _ => FieldAuthority::Shared,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionRequest {
    pub strategy: ResolutionStrategy,
    pub resolved_by: String,
    pub notes: Option<String>,
    /// Required for [`ResolutionStrategy::ManualMerge`].
    pub merged: Option<PurchaseOrder>,
}

impl ResolutionRequest {
    pub fn new(strategy: ResolutionStrategy, resolved_by: impl Into<String>) -> Self {
        Self {
            strategy,
            resolved_by: resolved_by.into(),
            notes: None,
            merged: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn merged(order: PurchaseOrder, resolved_by: impl Into<String>) -> Self {
        Self {
            merged: Some(order),
            ..Self::new(ResolutionStrategy::ManualMerge, resolved_by)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    pub conflict: SyncConflict,
    pub order: PurchaseOrder,
    pub remote_id: RemoteId,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    State(#[from] SyncStateError),

    #[error("manual merge requires a merged order")]
    MissingMergedValue,

    #[error("merged order {merged} does not belong to entity {entity}")]
    EntityMismatch { entity: String, merged: OrderId },

    #[error("entity id `{0}` is not a purchase order id")]
    InvalidEntity(String),

    #[error("purchase order {0} has no remote counterpart")]
    NoMapping(OrderId),

    #[error("conflict {0} is already resolved")]
    AlreadyResolved(ConflictId),
}

impl ResolveError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ResolveError::Repository(e) => e.class(),
            ResolveError::State(e) => e.class(),
            ResolveError::MissingMergedValue
            | ResolveError::EntityMismatch { .. }
            | ResolveError::InvalidEntity(_) => ErrorClass::Validation,
            ResolveError::NoMapping(_) => ErrorClass::NotFound,
            ResolveError::AlreadyResolved(_) => ErrorClass::Conflict,
        }
    }
}

pub struct ConflictResolver {
    repository: Arc<dyn PurchaseOrderRepository>,
    state: Arc<dyn SyncStateManager>,
}

impl ConflictResolver {
    pub fn new(
        repository: Arc<dyn PurchaseOrderRepository>,
        state: Arc<dyn SyncStateManager>,
    ) -> Self {
        Self { repository, state }
    }

    /// Remote-authoritative fields only → accept remote; local-authoritative
    /// only → accept local; anything else needs a human.
    pub fn suggest_resolution(&self, conflict: &SyncConflict) -> ResolutionStrategy {
        let authorities: Vec<FieldAuthority> = conflict
            .conflicts
            .iter()
            .map(|c| field_authority(&c.field))
            .collect();
        if authorities.is_empty() {
            return ResolutionStrategy::ManualMerge;
        }
        if authorities.iter().all(|a| *a == FieldAuthority::Remote) {
            ResolutionStrategy::AcceptRemote
        } else if authorities.iter().all(|a| *a == FieldAuthority::Local) {
            ResolutionStrategy::AcceptLocal
        } else {
            ResolutionStrategy::ManualMerge
        }
    }

    pub fn can_auto_resolve(&self, conflict: &SyncConflict) -> bool {
        conflict.is_open()
            && conflict.conflict_type == ConflictType::DataMismatch
            && !conflict.conflicts.is_empty()
            && conflict
                .conflicts
                .iter()
                .all(|c| field_authority(&c.field) == FieldAuthority::Remote)
    }

    /// Apply `request` to both sides, then close the conflict and mark the
    /// entity synced.
    #[tracing::instrument(skip(self, conflict, request), fields(conflict_id = %conflict.id, strategy = %request.strategy))]
    pub async fn resolve_conflict(
        &self,
        conflict: &SyncConflict,
        request: ResolutionRequest,
    ) -> Result<ResolutionOutcome, ResolveError> {
        if !conflict.is_open() {
            return Err(ResolveError::AlreadyResolved(conflict.id));
        }
        if request.strategy == ResolutionStrategy::ManualMerge && request.merged.is_none() {
            return Err(ResolveError::MissingMergedValue);
        }
        let order_id: OrderId = conflict
            .entity_id
            .parse()
            .map_err(|_| ResolveError::InvalidEntity(conflict.entity_id.clone()))?;
        let local = self
            .repository
            .find_local(order_id)
            .await?
            .ok_or(RepositoryError::NotFound(order_id))?;
        let mapping = self
            .repository
            .find_sync_mapping(order_id)
            .await?
            .ok_or(ResolveError::NoMapping(order_id))?;
        let remote_id = mapping.remote_id;

        let order = match request.strategy {
            ResolutionStrategy::AcceptLocal => {
                self.repository.update_remote(remote_id, &local).await?;
                local
            }
            ResolutionStrategy::AcceptRemote => {
                self.repository.invalidate_remote(remote_id).await?;
                let remote = self
                    .repository
                    .find_remote(remote_id)
                    .await?
                    .ok_or_else(|| {
                        RepositoryError::Erp(ErpError::not_found(ORDER_MODEL, vec![remote_id.get()]))
                    })?;
                let mut adopted = local.clone();
                adopted
                    .adopt_remote(&remote)
                    .map_err(RepositoryError::from)?;
                self.repository
                    .update_local(&adopted, ExpectedVersion::Exact(local.version))
                    .await?;
                adopted
            }
            ResolutionStrategy::ManualMerge => {
                let mut merged = request.merged.clone().ok_or(ResolveError::MissingMergedValue)?;
                if merged.id != order_id {
                    return Err(ResolveError::EntityMismatch {
                        entity: conflict.entity_id.clone(),
                        merged: merged.id,
                    });
                }
                merged.version = local.version;
                merged.touch();
                self.repository
                    .update_local(&merged, ExpectedVersion::Exact(local.version))
                    .await?;
                self.repository.update_remote(remote_id, &merged).await?;
                merged
            }
        };

        self.repository.invalidate_remote(remote_id).await?;
        let remote_write_date = self
            .repository
            .find_remote(remote_id)
            .await?
            .and_then(|r| r.write_date);
        let now = Utc::now();
        self.repository
            .mark_synced(
                order_id,
                SyncMark {
                    remote_id,
                    synced_at: now,
                    local_version: order.version,
                    remote_write_date,
                },
            )
            .await?;

        let closed = self
            .state
            .resolve_conflict(
                conflict.id,
                ConflictResolution {
                    strategy: request.strategy,
                    resolved_by: request.resolved_by.clone(),
                    notes: request.notes.clone(),
                    resolved_at: now,
                },
            )
            .await?;
        self.state
            .update_sync_state(
                &conflict.entity_id,
                &conflict.entity_type,
                SyncTransition::Succeeded,
                ExpectedVersion::Any,
            )
            .await?;
        info!(order_id = %order_id, %remote_id, "conflict resolved");

        let order = self
            .repository
            .find_local(order_id)
            .await?
            .unwrap_or(order);
        Ok(ResolutionOutcome {
            conflict: closed,
            order,
            remote_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Conflict;
    use serde_json::json;

    fn conflict(conflict_type: ConflictType, fields: &[&str]) -> SyncConflict {
        SyncConflict {
            id: ConflictId::new(),
            entity_id: OrderId::new().to_string(),
            entity_type: "purchase_order".into(),
            conflict_type,
            conflicts: fields
                .iter()
                .map(|f| Conflict {
                    field: f.to_string(),
                    local_value: json!(1),
                    remote_value: json!(2),
                    conflict_type,
                })
                .collect(),
            local_snapshot: json!({}),
            remote_snapshot: json!({}),
            detected_at: Utc::now(),
            resolution: None,
        }
    }

    fn resolver() -> ConflictResolver {
        use crate::cache::TieredCache;
        use crate::config::CacheConfig;
        use crate::erp::InMemoryErpClient;
        use crate::repository::ErpPurchaseOrderRepository;
        use crate::store::InMemoryRecordStore;
        use crate::sync_state::InMemorySyncStateManager;

        let repo = ErpPurchaseOrderRepository::new(
            Arc::new(InMemoryErpClient::new()),
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(TieredCache::in_memory(CacheConfig::default())),
        );
        ConflictResolver::new(Arc::new(repo), Arc::new(InMemorySyncStateManager::new()))
    }

    #[test]
    fn suggestions_follow_field_authority() {
        let r = resolver();
        let totals = conflict(ConflictType::DataMismatch, &["amount_total", "state"]);
        assert_eq!(r.suggest_resolution(&totals), ResolutionStrategy::AcceptRemote);

        let date = conflict(ConflictType::DataMismatch, &["date_planned"]);
        assert_eq!(r.suggest_resolution(&date), ResolutionStrategy::AcceptLocal);

        let mixed = conflict(ConflictType::DataMismatch, &["amount_total", "lines[SKU-1].quantity"]);
        assert_eq!(r.suggest_resolution(&mixed), ResolutionStrategy::ManualMerge);
    }

    #[tokio::test]
    async fn manual_merge_requires_a_merged_order() {
        let r = resolver();
        let c = conflict(ConflictType::DataMismatch, &["partner_id"]);
        let err = r
            .resolve_conflict(&c, ResolutionRequest::new(ResolutionStrategy::ManualMerge, "ops"))
            .await
            .unwrap_err();
        assert_eq!(err, ResolveError::MissingMergedValue);
    }

    #[test]
    fn only_remote_owned_data_mismatches_auto_resolve() {
        let r = resolver();
        assert!(r.can_auto_resolve(&conflict(ConflictType::DataMismatch, &["amount_tax"])));
        assert!(!r.can_auto_resolve(&conflict(ConflictType::DataMismatch, &["date_planned"])));
        assert!(!r.can_auto_resolve(&conflict(ConflictType::VersionConflict, &["amount_tax"])));
        assert!(!r.can_auto_resolve(&conflict(
            ConflictType::ConcurrentModification,
            &["amount_tax"]
        )));
    }
}
