use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ordersync_core::{
    ConflictId, ErrorClass, OrderId, RemoteId, SyncDirection, SyncOperation,
};

use crate::config::ConfigError;
use crate::event_service::EventServiceError;
use crate::repository::RepositoryError;
use crate::resolver::ResolveError;
use crate::retry::Retryable;
use crate::sync_state::{SyncErrorRecord, SyncStateError};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    State(#[from] SyncStateError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("event publication failed: {0}")]
    Events(String),

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("purchase order {0} not found locally")]
    LocalNotFound(OrderId),

    #[error("remote purchase order {0} not found")]
    RemoteNotFound(RemoteId),

    #[error("conflict {0} not found")]
    ConflictNotFound(ConflictId),

    #[error("a sync for {0} is already in flight")]
    AlreadyInProgress(String),

    #[error("invalid batch token `{0}`")]
    InvalidToken(String),

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Repository(e) => e.class(),
            SyncError::State(e) => e.class(),
            SyncError::Resolve(e) => e.class(),
            SyncError::Events(_) | SyncError::ShuttingDown => ErrorClass::Internal,
            SyncError::Settings(_) | SyncError::InvalidToken(_) => ErrorClass::Validation,
            SyncError::LocalNotFound(_)
            | SyncError::RemoteNotFound(_)
            | SyncError::ConflictNotFound(_) => ErrorClass::NotFound,
            SyncError::AlreadyInProgress(_) => ErrorClass::Conflict,
        }
    }

    pub fn to_record(&self) -> SyncErrorRecord {
        SyncErrorRecord::new(self.class(), self.to_string())
    }
}

impl Retryable for SyncError {
    fn is_retryable(&self) -> bool {
        match self {
            SyncError::Repository(e) => e.is_retryable(),
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::Repository(e) => e.retry_after(),
            _ => None,
        }
    }
}

impl From<EventServiceError> for SyncError {
    fn from(err: EventServiceError) -> Self {
        SyncError::Events(err.to_string())
    }
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        SyncError::Settings(err.0)
    }
}

/// Outcome of one entity's sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Local order id, or the remote id for imports that failed before a
    /// local order existed.
    pub entity_id: String,
    pub direction: SyncDirection,
    pub success: bool,
    pub operation: Option<SyncOperation>,
    pub remote_id: Option<RemoteId>,
    /// Set when the sync stopped on a recorded conflict.
    pub conflict_id: Option<ConflictId>,
    pub skipped: bool,
    pub error: Option<SyncErrorRecord>,
    pub warnings: Vec<String>,
    pub duration: Duration,
}

impl SyncResult {
    pub(crate) fn new(entity_id: impl Into<String>, direction: SyncDirection) -> Self {
        Self {
            entity_id: entity_id.into(),
            direction,
            success: false,
            operation: None,
            remote_id: None,
            conflict_id: None,
            skipped: false,
            error: None,
            warnings: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.conflict_id.is_some()
    }
}

/// Opaque resume cursor for batch sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchToken(OrderId);

impl BatchToken {
    pub(crate) fn after(id: OrderId) -> Self {
        Self(id)
    }

    pub(crate) fn last_processed(self) -> OrderId {
        self.0
    }
}

impl core::fmt::Display for BatchToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "po:{}", self.0)
    }
}

impl FromStr for BatchToken {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("po:")
            .and_then(|id| id.parse::<OrderId>().ok())
            .map(Self)
            .ok_or_else(|| SyncError::InvalidToken(s.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSyncResult {
    pub total_processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub results: Vec<SyncResult>,
    /// `None` once every pending order has been visited.
    pub next_batch_token: Option<BatchToken>,
    /// The batch stopped early on a cancellation request.
    pub cancelled: bool,
}

impl BatchSyncResult {
    pub(crate) fn push(&mut self, result: SyncResult) {
        self.total_processed += 1;
        if result.skipped {
            self.skipped += 1;
        } else if result.success {
            self.successful += 1;
        } else if result.is_conflict() {
            self.conflicts += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_opaque_but_parseable() {
        let token = BatchToken::after(OrderId::new());
        let parsed: BatchToken = token.to_string().parse().unwrap();
        assert_eq!(parsed, token);
        assert!(matches!(
            "garbage".parse::<BatchToken>(),
            Err(SyncError::InvalidToken(_))
        ));
    }

    #[test]
    fn counters_follow_result_kind() {
        let mut batch = BatchSyncResult::default();
        let mut ok = SyncResult::new("a", SyncDirection::ToRemote);
        ok.success = true;
        batch.push(ok);
        let mut skipped = SyncResult::new("b", SyncDirection::ToRemote);
        skipped.skipped = true;
        batch.push(skipped);
        let mut conflict = SyncResult::new("c", SyncDirection::ToRemote);
        conflict.conflict_id = Some(ConflictId::new());
        batch.push(conflict);
        batch.push(SyncResult::new("d", SyncDirection::ToRemote));

        assert_eq!(batch.total_processed, 4);
        assert_eq!(
            (batch.successful, batch.skipped, batch.conflicts, batch.failed),
            (1, 1, 1, 1)
        );
    }

    #[test]
    fn only_repository_transients_retry() {
        use crate::erp::ErpError;
        let transient = SyncError::Repository(ErpError::Network("reset".into()).into());
        assert!(transient.is_retryable());
        assert_eq!(transient.class(), ErrorClass::Network);
        let busy = SyncError::AlreadyInProgress("x".into());
        assert!(!busy.is_retryable());
    }
}
