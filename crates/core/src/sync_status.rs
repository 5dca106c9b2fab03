//! Synchronization status state machine.
//!
//! ```text
//! NOT_SYNCED ──► PENDING_SYNC ──► SYNCED ──┐
//!                  ▲   │  │                 │ (next local/remote mutation)
//!                  │   │  └─► SYNC_FAILED ──┤ (retry)
//!                  │   └────► CONFLICT ─────┤ (resolution recorded)
//!                  └────────────────────────┘
//! ```
//!
//! There is no terminal state.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    #[default]
    NotSynced,
    PendingSync,
    Synced,
    SyncFailed,
    Conflict,
}

impl SyncStatus {
    pub const ALL: [SyncStatus; 5] = [
        SyncStatus::NotSynced,
        SyncStatus::PendingSync,
        SyncStatus::Synced,
        SyncStatus::SyncFailed,
        SyncStatus::Conflict,
    ];

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: SyncStatus) -> bool {
        use SyncStatus::*;
        matches!(
            (self, next),
            (NotSynced, PendingSync)
                | (PendingSync, Synced)
                | (PendingSync, SyncFailed)
                | (PendingSync, Conflict)
                | (SyncFailed, PendingSync)
                | (Conflict, PendingSync)
                | (Synced, PendingSync)
        )
    }

    pub fn transition(self, next: SyncStatus) -> Result<SyncStatus, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::invariant(format!(
                "illegal sync status transition {self} -> {next}"
            )))
        }
    }

    /// Entities in these states are picked up by batch synchronization.
    pub fn requires_sync(self) -> bool {
        matches!(
            self,
            SyncStatus::NotSynced | SyncStatus::PendingSync | SyncStatus::SyncFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::NotSynced => "NOT_SYNCED",
            SyncStatus::PendingSync => "PENDING_SYNC",
            SyncStatus::Synced => "SYNCED",
            SyncStatus::SyncFailed => "SYNC_FAILED",
            SyncStatus::Conflict => "CONFLICT",
        }
    }
}

impl core::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a single synchronization.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    ToRemote,
    FromRemote,
}

/// What a synchronization did to the target side.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncOperation {
    Create,
    Update,
    /// Both sides already agreed; only the sync baseline was refreshed.
    NoChange,
}
