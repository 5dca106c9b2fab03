//! Sync orchestration: single-entity sync in both directions, resumable batch
//! sync, batch import, the realtime loop and health reporting.
//!
//! At most one sync runs per entity at a time (a second caller gets
//! [`SyncError::AlreadyInProgress`]); different entities run concurrently up
//! to `max_concurrency`.

pub mod health;
pub mod types;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use ordersync_core::{
    ConflictId, ConflictType, ExpectedVersion, OrderId, RemoteId, SyncDirection, SyncOperation,
    SyncStatus,
};
use ordersync_events::{PURCHASE_ORDER, SyncEvent};
use ordersync_purchasing::{PurchaseOrder, RemoteOrder};

use crate::cache::CacheService;
use crate::config::{ConflictStrategy, OrchestratorConfig, SyncSettings};
use crate::erp::{ErpClient, SearchDomain, SearchOptions};
use crate::event_service::{EventService, publish_typed};
use crate::repository::{Conflict, PurchaseOrderRepository, RepositoryError, SyncMark};
use crate::resolver::{ConflictResolver, ResolutionOutcome, ResolutionRequest};
use crate::retry::{RetryOptions, with_retry};
use crate::sync_state::{SyncConflict, SyncErrorRecord, SyncStateManager, SyncTransition};

pub use health::{BacklogLevel, HealthStatus};
pub use types::{BatchSyncResult, BatchToken, SyncError, SyncResult};

/// Identity recorded on resolutions applied without an operator.
pub const AUTO_RESOLVER: &str = "auto-resolver";

/// The collaborators an orchestrator is wired from.
pub struct SyncComponents {
    pub erp: Arc<dyn ErpClient>,
    pub repository: Arc<dyn PurchaseOrderRepository>,
    pub state: Arc<dyn SyncStateManager>,
    pub cache: Arc<dyn CacheService>,
    pub events: Arc<dyn EventService>,
}

struct RealtimeHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// What one attempt did, before state and events are updated.
enum Attempt {
    Synced {
        local_id: OrderId,
        operation: SyncOperation,
        remote_id: RemoteId,
        warnings: Vec<String>,
        /// Local edits are still waiting to be pushed.
        pending: bool,
    },
    Conflicted {
        conflict: SyncConflict,
        remote_id: RemoteId,
        warnings: Vec<String>,
    },
}

/// Entity keys held by a running sync; released on drop.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    keys: Vec<String>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        for key in &self.keys {
            set.remove(key);
        }
    }
}

pub struct SyncOrchestrator {
    erp: Arc<dyn ErpClient>,
    repository: Arc<dyn PurchaseOrderRepository>,
    state: Arc<dyn SyncStateManager>,
    cache: Arc<dyn CacheService>,
    events: Arc<dyn EventService>,
    resolver: ConflictResolver,
    config: OrchestratorConfig,
    settings: RwLock<SyncSettings>,
    in_flight: Mutex<HashSet<String>>,
    permits: Semaphore,
    consecutive_failures: AtomicU32,
    realtime: tokio::sync::Mutex<Option<RealtimeHandle>>,
    last_remote_poll: Mutex<Option<DateTime<Utc>>>,
}

impl SyncOrchestrator {
    pub fn new(
        components: SyncComponents,
        config: OrchestratorConfig,
        settings: SyncSettings,
    ) -> Result<Self, SyncError> {
        settings.validate()?;
        let resolver = ConflictResolver::new(components.repository.clone(), components.state.clone());
        Ok(Self {
            erp: components.erp,
            repository: components.repository,
            state: components.state,
            cache: components.cache,
            events: components.events,
            resolver,
            permits: Semaphore::new(config.max_concurrency.max(1)),
            config,
            settings: RwLock::new(settings),
            in_flight: Mutex::new(HashSet::new()),
            consecutive_failures: AtomicU32::new(0),
            realtime: tokio::sync::Mutex::new(None),
            last_remote_poll: Mutex::new(None),
        })
    }

    pub fn repository(&self) -> &Arc<dyn PurchaseOrderRepository> {
        &self.repository
    }

    pub fn state(&self) -> &Arc<dyn SyncStateManager> {
        &self.state
    }

    pub fn events(&self) -> &Arc<dyn EventService> {
        &self.events
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn get_sync_settings(&self) -> SyncSettings {
        self.settings
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Validate and apply new settings. Toggling `enable_realtime_sync`
    /// starts or stops the realtime loop.
    pub async fn update_sync_settings(
        self: &Arc<Self>,
        settings: SyncSettings,
    ) -> Result<SyncSettings, SyncError> {
        settings.validate()?;
        let enable = settings.enable_realtime_sync;
        {
            let mut current = self.settings.write().unwrap_or_else(|e| e.into_inner());
            *current = settings.clone();
        }
        info!(
            batch_size = settings.batch_size,
            retry_attempts = settings.retry_attempts,
            interval_ms = settings.sync_interval.as_millis() as u64,
            realtime = enable,
            "sync settings updated"
        );
        if enable {
            self.start_realtime_sync().await;
        } else {
            self.stop_realtime_sync().await;
        }
        Ok(settings)
    }

    fn retry_options(&self) -> RetryOptions {
        RetryOptions {
            max_attempts: self.get_sync_settings().retry_attempts.max(1),
            ..self.config.retry.clone()
        }
    }

    fn acquire(&self, keys: Vec<String>) -> Result<InFlight<'_>, SyncError> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(busy) = keys.iter().find(|k| set.contains(*k)) {
            return Err(SyncError::AlreadyInProgress(busy.clone()));
        }
        set.extend(keys.iter().cloned());
        Ok(InFlight {
            set: &self.in_flight,
            keys,
        })
    }

    async fn emit(&self, entity_id: &str, event: SyncEvent) {
        if let Err(err) = publish_typed(self.events.as_ref(), entity_id, PURCHASE_ORDER, &event).await {
            warn!(entity_id, error = %err, "failed to publish sync event");
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Push a local order to the ERP.
    ///
    /// Creates the remote order when no mapping exists. Otherwise compares
    /// against a fresh remote read and either pushes local edits or records
    /// a conflict.
    #[tracing::instrument(skip(self))]
    pub async fn sync_to_remote(&self, local_id: OrderId) -> Result<SyncResult, SyncError> {
        let _guard = self.acquire(vec![local_id.to_string()])?;
        let _permit = self.permits.acquire().await.map_err(|_| SyncError::ShuttingDown)?;

        if self.repository.find_local(local_id).await?.is_none() {
            return Err(SyncError::LocalNotFound(local_id));
        }
        let entity_id = local_id.to_string();
        self.state
            .update_sync_state(&entity_id, PURCHASE_ORDER, SyncTransition::Begin, ExpectedVersion::Any)
            .await?;

        let started = Instant::now();
        let outcome = with_retry(&self.retry_options(), "sync_to_remote", || {
            self.attempt_to_remote(local_id)
        })
        .await;
        let mut result = self
            .finish(&entity_id, Some(local_id), SyncDirection::ToRemote, outcome)
            .await;
        result.duration = started.elapsed();
        Ok(result)
    }

    async fn attempt_to_remote(&self, local_id: OrderId) -> Result<Attempt, SyncError> {
        let order = self
            .repository
            .find_local(local_id)
            .await?
            .ok_or(SyncError::LocalNotFound(local_id))?;

        let Some(mapping) = self.repository.find_sync_mapping(local_id).await? else {
            let remote_id = self.repository.create_remote(&order).await?;
            let remote_write_date = self
                .repository
                .find_remote(remote_id)
                .await?
                .and_then(|r| r.write_date);
            self.repository
                .mark_synced(
                    local_id,
                    SyncMark {
                        remote_id,
                        synced_at: Utc::now(),
                        local_version: order.version,
                        remote_write_date,
                    },
                )
                .await?;
            return Ok(Attempt::Synced {
                local_id,
                operation: SyncOperation::Create,
                remote_id,
                warnings: Vec::new(),
                pending: false,
            });
        };

        let remote_id = mapping.remote_id;
        self.repository.invalidate_remote(remote_id).await?;
        let remote = self
            .repository
            .find_remote(remote_id)
            .await?
            .ok_or(SyncError::RemoteNotFound(remote_id))?;

        let set = self.repository.detect_conflicts(&order, &remote, Some(&mapping));
        if set.has_conflicts {
            return Ok(Attempt::Conflicted {
                conflict: new_conflict(&order, &remote, set.conflict_type(), set.conflicts),
                remote_id,
                warnings: set.warnings,
            });
        }

        let (operation, remote_write_date) = if mapping.baseline().local_changed(&order) {
            self.repository.update_remote(remote_id, &order).await?;
            let write_date = self
                .repository
                .find_remote(remote_id)
                .await?
                .and_then(|r| r.write_date);
            (SyncOperation::Update, write_date)
        } else {
            (SyncOperation::NoChange, remote.write_date)
        };
        self.repository
            .mark_synced(
                local_id,
                SyncMark {
                    remote_id,
                    synced_at: Utc::now(),
                    local_version: order.version,
                    remote_write_date,
                },
            )
            .await?;
        Ok(Attempt::Synced {
            local_id,
            operation,
            remote_id,
            warnings: set.warnings,
            pending: false,
        })
    }

    /// Pull a remote order into the local store.
    ///
    /// Unknown remote orders are imported. Known ones overwrite the local
    /// copy when it has not been edited since the last sync; otherwise any
    /// difference is recorded as a conflict.
    #[tracing::instrument(skip(self))]
    pub async fn sync_from_remote(&self, remote_id: RemoteId) -> Result<SyncResult, SyncError> {
        let mapping = self.repository.find_sync_mapping_by_remote(remote_id).await?;
        let mut keys = vec![format!("remote:{remote_id}")];
        if let Some(mapping) = &mapping {
            keys.push(mapping.local_id.to_string());
        }
        let _guard = self.acquire(keys)?;
        let _permit = self.permits.acquire().await.map_err(|_| SyncError::ShuttingDown)?;

        let known = mapping.map(|m| m.local_id);
        if let Some(local_id) = known {
            self.state
                .update_sync_state(
                    &local_id.to_string(),
                    PURCHASE_ORDER,
                    SyncTransition::Begin,
                    ExpectedVersion::Any,
                )
                .await?;
        }

        let started = Instant::now();
        let outcome = with_retry(&self.retry_options(), "sync_from_remote", || {
            self.attempt_from_remote(remote_id)
        })
        .await;

        if known.is_none() {
            if let Ok(Attempt::Synced { local_id, .. }) = &outcome {
                // First sight of this entity: open its state now that it has an id.
                self.state
                    .update_sync_state(
                        &local_id.to_string(),
                        PURCHASE_ORDER,
                        SyncTransition::Begin,
                        ExpectedVersion::Any,
                    )
                    .await?;
            }
        }

        let entity_id = known.map_or_else(|| remote_id.to_string(), |id| id.to_string());
        let mut result = self
            .finish(&entity_id, known, SyncDirection::FromRemote, outcome)
            .await;
        result.duration = started.elapsed();
        Ok(result)
    }

    async fn attempt_from_remote(&self, remote_id: RemoteId) -> Result<Attempt, SyncError> {
        self.repository.invalidate_remote(remote_id).await?;
        let remote = self
            .repository
            .find_remote(remote_id)
            .await?
            .ok_or(SyncError::RemoteNotFound(remote_id))?;

        let Some(mapping) = self.repository.find_sync_mapping_by_remote(remote_id).await? else {
            let order = PurchaseOrder::from_remote(&remote).map_err(RepositoryError::from)?;
            self.repository.create_local(&order).await?;
            self.repository
                .mark_synced(
                    order.id,
                    SyncMark {
                        remote_id,
                        synced_at: Utc::now(),
                        local_version: order.version,
                        remote_write_date: remote.write_date,
                    },
                )
                .await?;
            return Ok(Attempt::Synced {
                local_id: order.id,
                operation: SyncOperation::Create,
                remote_id,
                warnings: Vec::new(),
                pending: false,
            });
        };

        let local_id = mapping.local_id;
        let order = self
            .repository
            .find_local(local_id)
            .await?
            .ok_or(SyncError::LocalNotFound(local_id))?;
        let baseline = mapping.baseline();
        let local_changed = baseline.local_changed(&order);
        let set = self.repository.detect_conflicts(&order, &remote, Some(&mapping));

        if set.has_conflicts && local_changed {
            return Ok(Attempt::Conflicted {
                conflict: new_conflict(&order, &remote, set.conflict_type(), set.conflicts),
                remote_id,
                warnings: set.warnings,
            });
        }
        if local_changed {
            // Nothing to pull; the local edits go out with the next push.
            return Ok(Attempt::Synced {
                local_id,
                operation: SyncOperation::NoChange,
                remote_id,
                warnings: set.warnings,
                pending: true,
            });
        }

        let (operation, local_version) = if set.has_conflicts || baseline.remote_changed(&remote) {
            let mut adopted = order.clone();
            adopted.adopt_remote(&remote).map_err(RepositoryError::from)?;
            self.repository
                .update_local(&adopted, ExpectedVersion::Exact(order.version))
                .await?;
            (SyncOperation::Update, adopted.version)
        } else {
            (SyncOperation::NoChange, order.version)
        };
        self.repository
            .mark_synced(
                local_id,
                SyncMark {
                    remote_id,
                    synced_at: Utc::now(),
                    local_version,
                    remote_write_date: remote.write_date,
                },
            )
            .await?;
        Ok(Attempt::Synced {
            local_id,
            operation,
            remote_id,
            warnings: set.warnings,
            pending: false,
        })
    }

    /// Turn an attempt outcome into state transitions, events and a result.
    async fn finish(
        &self,
        entity_id: &str,
        known_local: Option<OrderId>,
        direction: SyncDirection,
        outcome: Result<Attempt, SyncError>,
    ) -> SyncResult {
        let mut result = SyncResult::new(entity_id, direction);
        match outcome {
            Ok(Attempt::Synced {
                local_id,
                operation,
                remote_id,
                warnings,
                pending,
            }) => {
                let entity_id = local_id.to_string();
                result.entity_id = entity_id.clone();
                result.success = true;
                result.operation = Some(operation);
                result.remote_id = Some(remote_id);
                result.warnings = warnings;
                self.record_success();

                if !pending {
                    if let Err(err) = self
                        .state
                        .update_sync_state(
                            &entity_id,
                            PURCHASE_ORDER,
                            SyncTransition::Succeeded,
                            ExpectedVersion::Any,
                        )
                        .await
                    {
                        warn!(%entity_id, error = %err, "could not record sync success");
                    }
                }
                let now = Utc::now();
                let event = if direction == SyncDirection::FromRemote && operation == SyncOperation::Create {
                    SyncEvent::OrderImported {
                        remote_id,
                        occurred_at: now,
                    }
                } else {
                    SyncEvent::OrderSynced {
                        direction,
                        operation,
                        remote_id,
                        occurred_at: now,
                    }
                };
                self.emit(&entity_id, event).await;
                info!(%entity_id, %remote_id, ?direction, ?operation, "order synced");
            }
            Ok(Attempt::Conflicted {
                conflict,
                remote_id,
                warnings,
            }) => {
                result.remote_id = Some(remote_id);
                result.conflict_id = Some(conflict.id);
                result.warnings = warnings;
                self.handle_conflict(conflict, &mut result).await;
            }
            Err(err) => {
                let failures = self.record_failure();
                let record = err.to_record();
                error!(entity_id, ?direction, class = %record.class, error = %err, failures, "sync failed");

                if let Some(local_id) = known_local {
                    if let Err(state_err) = self
                        .state
                        .update_sync_state(
                            entity_id,
                            PURCHASE_ORDER,
                            SyncTransition::Failed(record.clone()),
                            ExpectedVersion::Any,
                        )
                        .await
                    {
                        warn!(entity_id, error = %state_err, "could not record sync failure");
                    }
                    if let Err(repo_err) = self
                        .repository
                        .set_sync_status(local_id, SyncStatus::SyncFailed)
                        .await
                    {
                        debug!(entity_id, error = %repo_err, "could not flag order as failed");
                    }
                }
                self.emit(
                    entity_id,
                    SyncEvent::SyncFailed {
                        direction,
                        class: record.class,
                        message: record.message.clone(),
                        occurred_at: record.occurred_at,
                    },
                )
                .await;
                result.error = Some(record);
            }
        }
        result
    }

    async fn handle_conflict(&self, conflict: SyncConflict, result: &mut SyncResult) {
        let entity_id = conflict.entity_id.clone();
        result.entity_id = entity_id.clone();

        if let Err(err) = self.state.record_conflict(conflict.clone()).await {
            error!(%entity_id, error = %err, "could not record conflict");
            result.error = Some(SyncErrorRecord::new(err.class(), err.to_string()));
            return;
        }
        if let Ok(local_id) = entity_id.parse::<OrderId>() {
            if let Err(err) = self.repository.set_sync_status(local_id, SyncStatus::Conflict).await {
                warn!(%entity_id, error = %err, "could not flag order as conflicting");
            }
        }
        warn!(
            %entity_id,
            conflict_id = %conflict.id,
            conflict_type = %conflict.conflict_type,
            fields = ?conflict.fields(),
            "sync conflict recorded"
        );
        self.emit(
            &entity_id,
            SyncEvent::ConflictDetected {
                conflict_id: conflict.id,
                conflict_type: conflict.conflict_type,
                fields: conflict.fields(),
                occurred_at: conflict.detected_at,
            },
        )
        .await;

        if self.get_sync_settings().conflict_resolution_strategy == ConflictStrategy::AutoResolve
            && self.resolver.can_auto_resolve(&conflict)
        {
            let strategy = self.resolver.suggest_resolution(&conflict);
            match self
                .apply_resolution(&conflict, ResolutionRequest::new(strategy, AUTO_RESOLVER))
                .await
            {
                Ok(outcome) => {
                    result.success = true;
                    result.operation = Some(SyncOperation::Update);
                    result.remote_id = Some(outcome.remote_id);
                }
                Err(err) => {
                    warn!(%entity_id, conflict_id = %conflict.id, error = %err, "auto-resolution failed");
                }
            }
        }
    }

    async fn apply_resolution(
        &self,
        conflict: &SyncConflict,
        request: ResolutionRequest,
    ) -> Result<ResolutionOutcome, SyncError> {
        let strategy = request.strategy;
        let resolved_by = request.resolved_by.clone();
        let outcome = self.resolver.resolve_conflict(conflict, request).await?;
        self.record_success();

        let now = Utc::now();
        self.emit(
            &conflict.entity_id,
            SyncEvent::ConflictResolved {
                conflict_id: conflict.id,
                strategy,
                resolved_by,
                occurred_at: now,
            },
        )
        .await;
        self.emit(
            &conflict.entity_id,
            SyncEvent::OrderSynced {
                direction: SyncDirection::ToRemote,
                operation: SyncOperation::Update,
                remote_id: outcome.remote_id,
                occurred_at: now,
            },
        )
        .await;
        Ok(outcome)
    }

    /// Apply an operator's resolution to a recorded conflict.
    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        request: ResolutionRequest,
    ) -> Result<ResolutionOutcome, SyncError> {
        let conflict = self
            .state
            .get_conflict(conflict_id)
            .await
            .ok_or(SyncError::ConflictNotFound(conflict_id))?;
        let _guard = self.acquire(vec![conflict.entity_id.clone()])?;
        self.apply_resolution(&conflict, request).await
    }

    /// Operator reset of an order's sync state.
    pub async fn clear_sync_state(&self, local_id: OrderId) -> bool {
        let entity_id = local_id.to_string();
        let cleared = self.state.clear_sync_state(&entity_id, PURCHASE_ORDER).await;
        if cleared {
            self.emit(
                &entity_id,
                SyncEvent::SyncStateCleared {
                    occurred_at: Utc::now(),
                },
            )
            .await;
        }
        cleared
    }

    /// Sync one page of orders requiring sync, starting after `token`.
    pub async fn batch_sync_pending_orders(
        &self,
        batch_size: usize,
        token: Option<BatchToken>,
    ) -> Result<BatchSyncResult, SyncError> {
        self.batch_sync(batch_size, token, None).await
    }

    /// Like [`Self::batch_sync_pending_orders`], but stops starting new
    /// entities once `stop` turns true. The returned token then points at
    /// the start of the page, so a rerun only revisits orders that are still
    /// pending.
    pub async fn batch_sync_pending_orders_until(
        &self,
        batch_size: usize,
        token: Option<BatchToken>,
        stop: &watch::Receiver<bool>,
    ) -> Result<BatchSyncResult, SyncError> {
        self.batch_sync(batch_size, token, Some(stop)).await
    }

    #[tracing::instrument(skip(self, stop))]
    async fn batch_sync(
        &self,
        batch_size: usize,
        token: Option<BatchToken>,
        stop: Option<&watch::Receiver<bool>>,
    ) -> Result<BatchSyncResult, SyncError> {
        if batch_size == 0 {
            return Err(SyncError::Settings("batch size must be positive".into()));
        }
        let after = token.map(BatchToken::last_processed);
        let mut page = self
            .repository
            .find_orders_requiring_sync_page(after, batch_size + 1)
            .await?;
        let has_more = page.len() > batch_size;
        page.truncate(batch_size);
        let ids: Vec<OrderId> = page.iter().map(|o| o.id).collect();

        let stopped = || stop.is_some_and(|rx| *rx.borrow());
        let mut entries: Vec<(usize, SyncResult)> = stream::iter(ids.iter().copied().enumerate())
            .map(|(index, id)| async move {
                if stopped() {
                    return None;
                }
                Some((index, self.batch_entry(id).await))
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .filter_map(|entry| async move { entry })
            .collect()
            .await;
        entries.sort_by_key(|(index, _)| *index);

        let mut batch = BatchSyncResult::default();
        batch.cancelled = entries.len() < ids.len();
        for (_, result) in entries {
            batch.push(result);
        }
        batch.next_batch_token = if batch.cancelled {
            token
        } else if has_more {
            ids.last().copied().map(BatchToken::after)
        } else {
            None
        };

        info!(
            processed = batch.total_processed,
            successful = batch.successful,
            failed = batch.failed,
            skipped = batch.skipped,
            conflicts = batch.conflicts,
            cancelled = batch.cancelled,
            more = batch.next_batch_token.is_some(),
            "batch sync finished"
        );
        Ok(batch)
    }

    async fn batch_entry(&self, id: OrderId) -> SyncResult {
        match self.sync_to_remote(id).await {
            Ok(result) => result,
            Err(SyncError::AlreadyInProgress(_)) => {
                let mut result = SyncResult::new(id.to_string(), SyncDirection::ToRemote);
                result.skipped = true;
                result
            }
            Err(err) => {
                self.record_failure();
                let mut result = SyncResult::new(id.to_string(), SyncDirection::ToRemote);
                result.error = Some(err.to_record());
                result
            }
        }
    }

    /// Import or refresh every remote order matching `domain`.
    #[tracing::instrument(skip(self, domain))]
    pub async fn batch_import_orders(&self, domain: &SearchDomain) -> Result<BatchSyncResult, SyncError> {
        let remote = with_retry(&self.retry_options(), "batch_import_orders", || async {
            self.repository
                .search_remote(domain, SearchOptions::default())
                .await
                .map_err(SyncError::from)
        })
        .await?;
        let ids: Vec<RemoteId> = remote.iter().map(|r| r.remote_id).collect();
        Ok(self.import_all(ids, None).await)
    }

    async fn import_all(&self, ids: Vec<RemoteId>, stop: Option<&watch::Receiver<bool>>) -> BatchSyncResult {
        let stopped = || stop.is_some_and(|rx| *rx.borrow());
        let mut entries: Vec<(usize, SyncResult)> = stream::iter(ids.iter().copied().enumerate())
            .map(|(index, remote_id)| async move {
                if stopped() {
                    return None;
                }
                let result = match self.sync_from_remote(remote_id).await {
                    Ok(result) => result,
                    Err(SyncError::AlreadyInProgress(_)) => {
                        let mut result = SyncResult::new(remote_id.to_string(), SyncDirection::FromRemote);
                        result.skipped = true;
                        result
                    }
                    Err(err) => {
                        let mut result = SyncResult::new(remote_id.to_string(), SyncDirection::FromRemote);
                        result.error = Some(err.to_record());
                        result
                    }
                };
                Some((index, result))
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .filter_map(|entry| async move { entry })
            .collect()
            .await;
        entries.sort_by_key(|(index, _)| *index);

        let mut batch = BatchSyncResult::default();
        batch.cancelled = entries.len() < ids.len();
        for (_, result) in entries {
            batch.push(result);
        }
        info!(
            processed = batch.total_processed,
            successful = batch.successful,
            failed = batch.failed,
            conflicts = batch.conflicts,
            "batch import finished"
        );
        batch
    }

    /// Start the background loop. Returns false if it was already running.
    pub async fn start_realtime_sync(self: &Arc<Self>) -> bool {
        let mut slot = self.realtime.lock().await;
        if slot.as_ref().is_some_and(|h| !h.join.is_finished()) {
            return false;
        }
        {
            let mut settings = self.settings.write().unwrap_or_else(|e| e.into_inner());
            settings.enable_realtime_sync = true;
        }
        self.set_last_poll(Utc::now());

        let (stop, stop_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let join = tokio::spawn(async move { this.realtime_loop(stop_rx).await });
        *slot = Some(RealtimeHandle { stop, join });
        true
    }

    /// Stop the background loop and wait for in-flight syncs to finish.
    /// Returns false if it was not running.
    pub async fn stop_realtime_sync(&self) -> bool {
        let handle = self.realtime.lock().await.take();
        {
            let mut settings = self.settings.write().unwrap_or_else(|e| e.into_inner());
            settings.enable_realtime_sync = false;
        }
        let Some(handle) = handle else {
            return false;
        };
        let _ = handle.stop.send(true);
        if let Err(err) = handle.join.await {
            error!(error = %err, "realtime sync task panicked");
        }
        info!("realtime sync stopped");
        true
    }

    pub async fn is_realtime_sync_running(&self) -> bool {
        self.realtime
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.join.is_finished())
    }

    fn last_poll(&self) -> Option<DateTime<Utc>> {
        *self.last_remote_poll.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_last_poll(&self, at: DateTime<Utc>) {
        *self.last_remote_poll.lock().unwrap_or_else(|e| e.into_inner()) = Some(at);
    }

    async fn realtime_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!("realtime sync started");
        loop {
            if *stop.borrow() {
                break;
            }
            self.realtime_pass(&stop).await;

            let interval = self.get_sync_settings().sync_interval;
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("realtime sync loop exited");
    }

    /// One realtime iteration: pull remote changes, then push pending orders.
    async fn realtime_pass(&self, stop: &watch::Receiver<bool>) {
        let poll_started = Utc::now();
        let since = self.last_poll().unwrap_or(poll_started);
        match self.repository.find_remote_modified_since(since).await {
            Ok(changed) => {
                if !changed.is_empty() {
                    debug!(count = changed.len(), %since, "pulling remote changes");
                    let ids = changed.iter().map(|r| r.remote_id).collect();
                    self.import_all(ids, Some(stop)).await;
                }
                self.set_last_poll(poll_started);
            }
            Err(err) => warn!(error = %err, "polling remote changes failed"),
        }

        let batch_size = self.get_sync_settings().batch_size;
        let mut token = None;
        loop {
            if *stop.borrow() {
                break;
            }
            match self.batch_sync(batch_size, token, Some(stop)).await {
                Ok(batch) if batch.cancelled => break,
                Ok(batch) => match batch.next_batch_token {
                    Some(next) => token = Some(next),
                    None => break,
                },
                Err(err) => {
                    warn!(error = %err, "realtime batch failed");
                    break;
                }
            }
        }
    }

    pub async fn get_health_status(&self) -> HealthStatus {
        let thresholds = &self.config.health;
        let erp_connection = self.erp.connection_status().await;
        let cache_tiers = self.cache.health().await;
        let backlog = match self.repository.find_orders_requiring_sync().await {
            Ok(orders) => orders.len(),
            Err(err) => {
                warn!(error = %err, "could not count sync backlog");
                0
            }
        };
        let metrics = self.state.get_sync_metrics(thresholds.error_rate_window).await;
        let error_rate = if metrics.total_attempts == 0 {
            0.0
        } else {
            metrics.failed as f64 / metrics.total_attempts as f64
        };

        health::evaluate(
            health::HealthInputs {
                last_successful_sync: self.state.get_last_successful_sync(PURCHASE_ORDER).await,
                consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
                erp_connection,
                cache_tiers,
                backlog,
                error_rate,
                realtime_sync_running: self.is_realtime_sync_running().await,
            },
            thresholds,
        )
    }
}

fn new_conflict(
    order: &PurchaseOrder,
    remote: &RemoteOrder,
    conflict_type: Option<ConflictType>,
    conflicts: Vec<Conflict>,
) -> SyncConflict {
    SyncConflict {
        id: ConflictId::new(),
        entity_id: order.id.to_string(),
        entity_type: PURCHASE_ORDER.to_string(),
        conflict_type: conflict_type.unwrap_or(ConflictType::DataMismatch),
        conflicts,
        local_snapshot: serde_json::to_value(order).unwrap_or(Value::Null),
        remote_snapshot: serde_json::to_value(remote).unwrap_or(Value::Null),
        detected_at: Utc::now(),
        resolution: None,
    }
}
