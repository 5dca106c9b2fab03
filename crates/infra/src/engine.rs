//! Engine wiring: builds the cache stack, event service, repository, state
//! manager and orchestrator from an [`EngineConfig`].

use std::sync::Arc;

use anyhow::Context;

use crate::cache::{CacheService, SqliteTier, TieredCache};
use crate::config::EngineConfig;
use crate::erp::{CircuitBreakerErpClient, ErpClient};
use crate::event_service::{EventService, InProcessEventService};
use crate::event_store::InMemoryEventStore;
use crate::orchestrator::{SyncComponents, SyncOrchestrator};
use crate::repository::{ErpPurchaseOrderRepository, PurchaseOrderRepository};
use crate::store::RecordStore;
use crate::sync_state::{InMemorySyncStateManager, SyncStateManager};

/// Build the tiered cache described by `config`: the in-process tier, then
/// Redis (with the `redis` feature) and SQLite when their URLs are set.
pub async fn build_cache(config: &EngineConfig) -> anyhow::Result<TieredCache> {
    let mut cache = TieredCache::in_memory(config.cache.clone());

    match config.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        Some(url) => {
            let tier = crate::cache::RedisTier::new(url, config.cache.shared_ttl)
                .with_context(|| format!("opening shared cache tier at {url}"))?;
            cache = cache.with_tier(Arc::new(tier));
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => tracing::warn!("ORDERSYNC_REDIS_URL is set but the `redis` feature is disabled"),
        None => {}
    }

    if let Some(url) = config.sqlite_url.as_deref() {
        let tier = SqliteTier::connect(url, config.cache.durable_ttl)
            .await
            .with_context(|| format!("opening durable cache tier at {url}"))?;
        cache = cache.with_tier(Arc::new(tier));
    }

    tracing::info!(tiers = cache.tiers().len(), "cache ready");
    Ok(cache)
}

/// The assembled engine. Hosts keep this alive for the process lifetime and
/// call [`Engine::shutdown`] before exit.
pub struct Engine {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub events: Arc<InProcessEventService<InMemoryEventStore>>,
    pub cache: Arc<TieredCache>,
}

impl Engine {
    /// Wire every component around `erp` and `store`. The ERP client is
    /// wrapped in a circuit breaker; realtime sync starts if enabled.
    pub async fn build(
        config: EngineConfig,
        erp: Arc<dyn ErpClient>,
        store: Arc<dyn RecordStore>,
    ) -> anyhow::Result<Self> {
        let erp: Arc<dyn ErpClient> = Arc::new(CircuitBreakerErpClient::new(erp, config.circuit_breaker.clone()));
        let cache = Arc::new(build_cache(&config).await?);
        let cache_service: Arc<dyn CacheService> = cache.clone();
        let events = Arc::new(InProcessEventService::new(InMemoryEventStore::new()));
        let event_service: Arc<dyn EventService> = events.clone();

        let repository: Arc<dyn PurchaseOrderRepository> = Arc::new(ErpPurchaseOrderRepository::new(
            erp.clone(),
            store,
            cache_service.clone(),
        ));
        let state: Arc<dyn SyncStateManager> =
            Arc::new(InMemorySyncStateManager::new().with_cache(cache_service.clone()));

        let realtime = config.sync.enable_realtime_sync;
        let orchestrator = Arc::new(
            SyncOrchestrator::new(
                SyncComponents {
                    erp,
                    repository,
                    state,
                    cache: cache_service,
                    events: event_service,
                },
                config.orchestrator,
                config.sync,
            )
            .context("invalid sync settings")?,
        );
        if realtime {
            orchestrator.start_realtime_sync().await;
        }

        Ok(Self {
            orchestrator,
            events,
            cache,
        })
    }

    /// Stop the realtime loop, letting in-flight syncs finish.
    pub async fn shutdown(&self) {
        self.orchestrator.stop_realtime_sync().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erp::InMemoryErpClient;
    use crate::store::InMemoryRecordStore;

    #[tokio::test]
    async fn builds_memory_only_engine_from_defaults() {
        let engine = Engine::build(
            EngineConfig::default(),
            Arc::new(InMemoryErpClient::new()),
            Arc::new(InMemoryRecordStore::new()),
        )
        .await
        .unwrap();

        assert_eq!(engine.cache.tiers().len(), 1);
        assert!(!engine.orchestrator.is_realtime_sync_running().await);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn durable_tier_is_added_when_configured() {
        let config = EngineConfig {
            sqlite_url: Some("sqlite::memory:".into()),
            ..Default::default()
        };
        let cache = build_cache(&config).await.unwrap();
        assert_eq!(cache.tiers().len(), 2);
    }

    #[tokio::test]
    async fn realtime_flag_starts_the_loop() {
        let mut config = EngineConfig::default();
        config.sync.enable_realtime_sync = true;
        let engine = Engine::build(
            config,
            Arc::new(InMemoryErpClient::new()),
            Arc::new(InMemoryRecordStore::new()),
        )
        .await
        .unwrap();

        assert!(engine.orchestrator.is_realtime_sync_running().await);
        engine.shutdown().await;
        assert!(!engine.orchestrator.is_realtime_sync_running().await);
    }
}
