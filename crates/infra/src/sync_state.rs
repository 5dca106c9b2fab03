//! Per-entity synchronization state and conflict bookkeeping.
//!
//! All writes for every entity go through one async mutex, so transitions for
//! the same key are strictly serialized and the cache mirror (if any) sees
//! them in commit order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use ordersync_core::{
    ConflictId, ConflictType, DomainError, ErrorClass, ExpectedVersion, ResolutionStrategy,
    SyncStatus,
};

use crate::cache::{CacheService, CacheServiceExt, SetOptions, keys};
use crate::repository::Conflict;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorRecord {
    pub class: ErrorClass,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl SyncErrorRecord {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub entity_id: String,
    pub entity_type: String,
    pub status: SyncStatus,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<SyncErrorRecord>,
    /// Bumped on every write.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    fn new(entity_id: &str, entity_type: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            status: SyncStatus::NotSynced,
            last_attempt_at: None,
            last_success_at: None,
            consecutive_failures: 0,
            last_error: None,
            version: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Requested change to a [`SyncState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTransition {
    /// An attempt starts. Idempotent while already pending.
    Begin,
    Succeeded,
    Failed(SyncErrorRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    pub resolved_by: String,
    pub notes: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: ConflictId,
    pub entity_id: String,
    pub entity_type: String,
    pub conflict_type: ConflictType,
    pub conflicts: Vec<Conflict>,
    pub local_snapshot: Value,
    pub remote_snapshot: Value,
    pub detected_at: DateTime<Utc>,
    pub resolution: Option<ConflictResolution>,
}

impl SyncConflict {
    pub fn is_open(&self) -> bool {
        self.resolution.is_none()
    }

    pub fn fields(&self) -> Vec<String> {
        self.conflicts.iter().map(|c| c.field.clone()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub total_attempts: usize,
    pub successful: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub success_rate: f64,
    pub average_duration: Duration,
    /// Current status of every tracked entity.
    pub by_status: BTreeMap<SyncStatus, usize>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncStateError {
    #[error(transparent)]
    Transition(#[from] DomainError),

    #[error("{entity_type}/{entity_id} has open conflicts")]
    OpenConflicts { entity_id: String, entity_type: String },

    #[error("conflict {0} not found")]
    ConflictNotFound(ConflictId),

    #[error("conflict {0} is already resolved")]
    AlreadyResolved(ConflictId),

    #[error("sync state {entity_type}/{entity_id} changed concurrently (expected {expected:?}, found {actual})")]
    Concurrency {
        entity_id: String,
        entity_type: String,
        expected: ExpectedVersion,
        actual: u64,
    },
}

impl SyncStateError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncStateError::Transition(e) => e.class(),
            SyncStateError::OpenConflicts { .. }
            | SyncStateError::AlreadyResolved(_)
            | SyncStateError::Concurrency { .. } => ErrorClass::Conflict,
            SyncStateError::ConflictNotFound(_) => ErrorClass::NotFound,
        }
    }
}

#[async_trait]
pub trait SyncStateManager: Send + Sync {
    async fn get_sync_state(&self, entity_id: &str, entity_type: &str) -> Option<SyncState>;

    /// Apply `transition`. `expected` is checked against the state version
    /// (0 for an entity never attempted).
    async fn update_sync_state(
        &self,
        entity_id: &str,
        entity_type: &str,
        transition: SyncTransition,
        expected: ExpectedVersion,
    ) -> Result<SyncState, SyncStateError>;

    /// Operator reset. Conflict history is kept.
    async fn clear_sync_state(&self, entity_id: &str, entity_type: &str) -> bool;

    /// Store an open conflict and move the entity to `CONFLICT`.
    async fn record_conflict(&self, conflict: SyncConflict) -> Result<SyncState, SyncStateError>;

    /// Close a conflict. Once none remain open the entity returns to
    /// `PENDING_SYNC`.
    async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        resolution: ConflictResolution,
    ) -> Result<SyncConflict, SyncStateError>;

    async fn get_conflict(&self, conflict_id: ConflictId) -> Option<SyncConflict>;

    async fn get_pending_conflicts(&self, entity_type: Option<&str>) -> Vec<SyncConflict>;

    async fn get_conflict_history(&self, entity_id: &str) -> Vec<SyncConflict>;

    async fn get_last_successful_sync(&self, entity_type: &str) -> Option<DateTime<Utc>>;

    async fn get_failed_sync_count(&self, entity_type: &str, window: Duration) -> usize;

    async fn get_sync_metrics(&self, window: Duration) -> SyncMetrics;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
    Conflict,
}

#[derive(Debug, Clone)]
struct Attempt {
    entity_type: String,
    outcome: Outcome,
    finished_at: DateTime<Utc>,
    duration: Duration,
}

#[derive(Default)]
struct Inner {
    states: HashMap<(String, String), SyncState>,
    conflicts: BTreeMap<ConflictId, SyncConflict>,
    attempts: Vec<Attempt>,
}

impl Inner {
    fn has_open_conflicts(&self, entity_id: &str, entity_type: &str) -> bool {
        self.conflicts
            .values()
            .any(|c| c.is_open() && c.entity_id == entity_id && c.entity_type == entity_type)
    }

    fn log_attempt(&mut self, state: &SyncState, outcome: Outcome, now: DateTime<Utc>) {
        let duration = state
            .last_attempt_at
            .and_then(|start| (now - start).to_std().ok())
            .unwrap_or_default();
        self.attempts.push(Attempt {
            entity_type: state.entity_type.clone(),
            outcome,
            finished_at: now,
            duration,
        });
    }

    fn prune(&mut self, retention: chrono::Duration) {
        let cutoff = Utc::now() - retention;
        self.attempts.retain(|a| a.finished_at >= cutoff);
    }
}

/// In-process state manager, optionally mirroring writes into a cache.
pub struct InMemorySyncStateManager {
    inner: Mutex<Inner>,
    mirror: Option<Arc<dyn CacheService>>,
    attempt_retention: chrono::Duration,
}

impl Default for InMemorySyncStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySyncStateManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            mirror: None,
            attempt_retention: chrono::Duration::days(7),
        }
    }

    /// Write every state and conflict change through to `cache`.
    pub fn with_cache(mut self, cache: Arc<dyn CacheService>) -> Self {
        self.mirror = Some(cache);
        self
    }

    async fn mirror_state(&self, state: &SyncState) {
        if let Some(cache) = &self.mirror {
            let key = keys::sync_state(&state.entity_type, &state.entity_id);
            if let Err(err) = cache.set_as(&key, state, SetOptions::default()).await {
                warn!(%key, error = %err, "failed to mirror sync state");
            }
        }
    }

    async fn mirror_conflict(&self, conflict: &SyncConflict) {
        if let Some(cache) = &self.mirror {
            let key = keys::conflict(conflict.id);
            if let Err(err) = cache.set_as(&key, conflict, SetOptions::default()).await {
                warn!(%key, error = %err, "failed to mirror conflict");
            }
        }
    }
}

fn window_start(window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| Utc::now().checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait]
impl SyncStateManager for InMemorySyncStateManager {
    async fn get_sync_state(&self, entity_id: &str, entity_type: &str) -> Option<SyncState> {
        let inner = self.inner.lock().await;
        inner
            .states
            .get(&(entity_id.to_string(), entity_type.to_string()))
            .cloned()
    }

    async fn update_sync_state(
        &self,
        entity_id: &str,
        entity_type: &str,
        transition: SyncTransition,
        expected: ExpectedVersion,
    ) -> Result<SyncState, SyncStateError> {
        let mut inner = self.inner.lock().await;
        let key = (entity_id.to_string(), entity_type.to_string());
        let mut state = inner
            .states
            .get(&key)
            .cloned()
            .unwrap_or_else(|| SyncState::new(entity_id, entity_type));

        if !expected.matches(state.version) {
            return Err(SyncStateError::Concurrency {
                entity_id: entity_id.to_string(),
                entity_type: entity_type.to_string(),
                expected,
                actual: state.version,
            });
        }

        let open_conflicts = inner.has_open_conflicts(entity_id, entity_type);
        let open_conflicts_error = || SyncStateError::OpenConflicts {
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
        };
        let now = Utc::now();

        match transition {
            SyncTransition::Begin => {
                if open_conflicts {
                    return Err(open_conflicts_error());
                }
                if state.status != SyncStatus::PendingSync {
                    state.status = state.status.transition(SyncStatus::PendingSync)?;
                }
                state.last_attempt_at = Some(now);
            }
            SyncTransition::Succeeded => {
                if open_conflicts {
                    return Err(open_conflicts_error());
                }
                state.status = state.status.transition(SyncStatus::Synced)?;
                state.last_success_at = Some(now);
                state.consecutive_failures = 0;
                state.last_error = None;
                inner.log_attempt(&state, Outcome::Succeeded, now);
            }
            SyncTransition::Failed(error) => {
                state.status = state.status.transition(SyncStatus::SyncFailed)?;
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.last_error = Some(error);
                inner.log_attempt(&state, Outcome::Failed, now);
            }
        }

        state.version += 1;
        state.updated_at = now;
        inner.states.insert(key, state.clone());
        let retention = self.attempt_retention;
        inner.prune(retention);
        debug!(entity_id, entity_type, status = %state.status, version = state.version, "sync state updated");

        self.mirror_state(&state).await;
        Ok(state)
    }

    async fn clear_sync_state(&self, entity_id: &str, entity_type: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner
            .states
            .remove(&(entity_id.to_string(), entity_type.to_string()))
            .is_some();
        if removed {
            if let Some(cache) = &self.mirror {
                let key = keys::sync_state(entity_type, entity_id);
                if let Err(err) = cache.delete(&key).await {
                    warn!(%key, error = %err, "failed to drop mirrored sync state");
                }
            }
        }
        removed
    }

    async fn record_conflict(&self, conflict: SyncConflict) -> Result<SyncState, SyncStateError> {
        let mut inner = self.inner.lock().await;
        let key = (conflict.entity_id.clone(), conflict.entity_type.clone());
        let mut state = inner
            .states
            .get(&key)
            .cloned()
            .unwrap_or_else(|| SyncState::new(&conflict.entity_id, &conflict.entity_type));

        let now = Utc::now();
        if state.status != SyncStatus::Conflict {
            state.status = state.status.transition(SyncStatus::Conflict)?;
            inner.log_attempt(&state, Outcome::Conflict, now);
        }
        state.version += 1;
        state.updated_at = now;

        inner.conflicts.insert(conflict.id, conflict.clone());
        inner.states.insert(key, state.clone());
        debug!(
            entity_id = %conflict.entity_id,
            conflict_id = %conflict.id,
            conflict_type = %conflict.conflict_type,
            "conflict recorded"
        );

        self.mirror_conflict(&conflict).await;
        self.mirror_state(&state).await;
        Ok(state)
    }

    async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        resolution: ConflictResolution,
    ) -> Result<SyncConflict, SyncStateError> {
        let mut inner = self.inner.lock().await;
        let conflict = inner
            .conflicts
            .get_mut(&conflict_id)
            .ok_or(SyncStateError::ConflictNotFound(conflict_id))?;
        if !conflict.is_open() {
            return Err(SyncStateError::AlreadyResolved(conflict_id));
        }
        conflict.resolution = Some(resolution);
        let conflict = conflict.clone();

        let mut reopened = None;
        if !inner.has_open_conflicts(&conflict.entity_id, &conflict.entity_type) {
            let key = (conflict.entity_id.clone(), conflict.entity_type.clone());
            if let Some(state) = inner.states.get_mut(&key) {
                if state.status == SyncStatus::Conflict {
                    state.status = state.status.transition(SyncStatus::PendingSync)?;
                    state.version += 1;
                    state.updated_at = Utc::now();
                    reopened = Some(state.clone());
                }
            }
        }

        self.mirror_conflict(&conflict).await;
        if let Some(state) = &reopened {
            self.mirror_state(state).await;
        }
        Ok(conflict)
    }

    async fn get_conflict(&self, conflict_id: ConflictId) -> Option<SyncConflict> {
        self.inner.lock().await.conflicts.get(&conflict_id).cloned()
    }

    async fn get_pending_conflicts(&self, entity_type: Option<&str>) -> Vec<SyncConflict> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<SyncConflict> = inner
            .conflicts
            .values()
            .filter(|c| c.is_open() && entity_type.is_none_or(|t| c.entity_type == t))
            .cloned()
            .collect();
        pending.sort_by_key(|c| c.detected_at);
        pending
    }

    async fn get_conflict_history(&self, entity_id: &str) -> Vec<SyncConflict> {
        let inner = self.inner.lock().await;
        let mut history: Vec<SyncConflict> = inner
            .conflicts
            .values()
            .filter(|c| c.entity_id == entity_id)
            .cloned()
            .collect();
        history.sort_by_key(|c| c.detected_at);
        history
    }

    async fn get_last_successful_sync(&self, entity_type: &str) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().await;
        inner
            .states
            .values()
            .filter(|s| s.entity_type == entity_type)
            .filter_map(|s| s.last_success_at)
            .max()
    }

    async fn get_failed_sync_count(&self, entity_type: &str, window: Duration) -> usize {
        let since = window_start(window);
        let inner = self.inner.lock().await;
        inner
            .attempts
            .iter()
            .filter(|a| {
                a.outcome == Outcome::Failed && a.entity_type == entity_type && a.finished_at >= since
            })
            .count()
    }

    async fn get_sync_metrics(&self, window: Duration) -> SyncMetrics {
        let since = window_start(window);
        let inner = self.inner.lock().await;
        let recent: Vec<&Attempt> = inner.attempts.iter().filter(|a| a.finished_at >= since).collect();

        let count = |outcome: Outcome| recent.iter().filter(|a| a.outcome == outcome).count();
        let total_attempts = recent.len();
        let successful = count(Outcome::Succeeded);
        let total_duration: Duration = recent.iter().map(|a| a.duration).sum();

        let mut by_status = BTreeMap::new();
        for state in inner.states.values() {
            *by_status.entry(state.status).or_insert(0) += 1;
        }

        SyncMetrics {
            total_attempts,
            successful,
            failed: count(Outcome::Failed),
            conflicts: count(Outcome::Conflict),
            success_rate: if total_attempts == 0 {
                0.0
            } else {
                successful as f64 / total_attempts as f64
            },
            average_duration: if total_attempts == 0 {
                Duration::ZERO
            } else {
                total_duration / total_attempts as u32
            },
            by_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TieredCache;
    use crate::config::CacheConfig;
    use serde_json::json;

    const PO: &str = "purchase_order";

    fn conflict_for(entity_id: &str) -> SyncConflict {
        SyncConflict {
            id: ConflictId::new(),
            entity_id: entity_id.to_string(),
            entity_type: PO.to_string(),
            conflict_type: ConflictType::DataMismatch,
            conflicts: vec![Conflict {
                field: "lines[SKU-1].quantity".into(),
                local_value: json!(20),
                remote_value: json!(10),
                conflict_type: ConflictType::DataMismatch,
            }],
            local_snapshot: json!({}),
            remote_snapshot: json!({}),
            detected_at: Utc::now(),
            resolution: None,
        }
    }

    fn resolution() -> ConflictResolution {
        ConflictResolution {
            strategy: ResolutionStrategy::AcceptLocal,
            resolved_by: "ops".into(),
            notes: None,
            resolved_at: Utc::now(),
        }
    }

    async fn begin(m: &InMemorySyncStateManager, id: &str) -> SyncState {
        m.update_sync_state(id, PO, SyncTransition::Begin, ExpectedVersion::Any)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn happy_path_follows_the_state_machine() {
        let m = InMemorySyncStateManager::new();
        assert!(m.get_sync_state("a", PO).await.is_none());

        let s = begin(&m, "a").await;
        assert_eq!(s.status, SyncStatus::PendingSync);
        assert_eq!(s.version, 1);

        let s = m
            .update_sync_state("a", PO, SyncTransition::Succeeded, ExpectedVersion::Exact(1))
            .await
            .unwrap();
        assert_eq!(s.status, SyncStatus::Synced);
        assert!(s.last_success_at.is_some());
        assert_eq!(m.get_last_successful_sync(PO).await, s.last_success_at);
    }

    #[tokio::test]
    async fn illegal_transitions_and_stale_versions_are_rejected() {
        let m = InMemorySyncStateManager::new();
        let err = m
            .update_sync_state("a", PO, SyncTransition::Succeeded, ExpectedVersion::Any)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncStateError::Transition(_)));

        begin(&m, "a").await;
        let err = m
            .update_sync_state("a", PO, SyncTransition::Begin, ExpectedVersion::Exact(0))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncStateError::Concurrency { actual: 1, .. }));
    }

    #[tokio::test]
    async fn failures_count_up_and_reset_on_success() {
        let m = InMemorySyncStateManager::new();
        for _ in 0..2 {
            begin(&m, "a").await;
            m.update_sync_state(
                "a",
                PO,
                SyncTransition::Failed(SyncErrorRecord::new(ErrorClass::Network, "reset")),
                ExpectedVersion::Any,
            )
            .await
            .unwrap();
        }
        let s = m.get_sync_state("a", PO).await.unwrap();
        assert_eq!(s.status, SyncStatus::SyncFailed);
        assert_eq!(s.consecutive_failures, 2);
        assert_eq!(s.last_error.as_ref().map(|e| e.class), Some(ErrorClass::Network));
        assert_eq!(m.get_failed_sync_count(PO, Duration::from_secs(60)).await, 2);

        begin(&m, "a").await;
        let s = m
            .update_sync_state("a", PO, SyncTransition::Succeeded, ExpectedVersion::Any)
            .await
            .unwrap();
        assert_eq!(s.consecutive_failures, 0);
        assert!(s.last_error.is_none());
    }

    #[tokio::test]
    async fn conflicts_block_sync_until_resolved() {
        let m = InMemorySyncStateManager::new();
        begin(&m, "a").await;
        let conflict = conflict_for("a");
        let s = m.record_conflict(conflict.clone()).await.unwrap();
        assert_eq!(s.status, SyncStatus::Conflict);

        let err = m
            .update_sync_state("a", PO, SyncTransition::Begin, ExpectedVersion::Any)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncStateError::OpenConflicts { .. }));
        assert_eq!(m.get_pending_conflicts(Some(PO)).await.len(), 1);
        assert!(m.get_pending_conflicts(Some("invoice")).await.is_empty());

        let resolved = m.resolve_conflict(conflict.id, resolution()).await.unwrap();
        assert!(!resolved.is_open());
        assert_eq!(m.get_sync_state("a", PO).await.unwrap().status, SyncStatus::PendingSync);
        assert!(m.get_pending_conflicts(None).await.is_empty());
        assert_eq!(m.get_conflict_history("a").await.len(), 1);

        let err = m.resolve_conflict(conflict.id, resolution()).await.unwrap_err();
        assert_eq!(err, SyncStateError::AlreadyResolved(conflict.id));
    }

    #[tokio::test]
    async fn conflict_from_synced_state_is_illegal() {
        let m = InMemorySyncStateManager::new();
        begin(&m, "a").await;
        m.update_sync_state("a", PO, SyncTransition::Succeeded, ExpectedVersion::Any)
            .await
            .unwrap();
        assert!(m.record_conflict(conflict_for("a")).await.is_err());
    }

    #[tokio::test]
    async fn metrics_aggregate_attempts() {
        let m = InMemorySyncStateManager::new();
        begin(&m, "a").await;
        m.update_sync_state("a", PO, SyncTransition::Succeeded, ExpectedVersion::Any)
            .await
            .unwrap();
        begin(&m, "b").await;
        m.update_sync_state(
            "b",
            PO,
            SyncTransition::Failed(SyncErrorRecord::new(ErrorClass::Validation, "bad")),
            ExpectedVersion::Any,
        )
        .await
        .unwrap();
        begin(&m, "c").await;
        m.record_conflict(conflict_for("c")).await.unwrap();

        let metrics = m.get_sync_metrics(Duration::from_secs(3600)).await;
        assert_eq!(metrics.total_attempts, 3);
        assert_eq!(metrics.successful, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.conflicts, 1);
        assert!((metrics.success_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(metrics.by_status.get(&SyncStatus::Conflict), Some(&1));
        assert_eq!(metrics.by_status.get(&SyncStatus::Synced), Some(&1));
    }

    #[tokio::test]
    async fn writes_are_mirrored_into_the_cache() {
        let cache = Arc::new(TieredCache::in_memory(CacheConfig::default()));
        let m = InMemorySyncStateManager::new().with_cache(cache.clone());
        begin(&m, "a").await;

        let mirrored: Option<SyncState> = cache.get_as(&keys::sync_state(PO, "a")).await.unwrap();
        assert_eq!(mirrored.map(|s| s.status), Some(SyncStatus::PendingSync));

        assert!(m.clear_sync_state("a", PO).await);
        let mirrored: Option<SyncState> = cache.get_as(&keys::sync_state(PO, "a")).await.unwrap();
        assert!(mirrored.is_none());
    }
}
