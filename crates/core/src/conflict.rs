//! Conflict classification shared by detection, resolution and events.

use serde::{Deserialize, Serialize};

/// How a local/remote divergence came about.
///
/// Variants are ordered by severity so that a set of field conflicts can be
/// summarised by its most severe member.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// Values differ while the recorded versions agree.
    DataMismatch,
    /// The remote moved past the version recorded at the last successful sync.
    VersionConflict,
    /// Both sides were edited after the last successful sync.
    ConcurrentModification,
}

impl ConflictType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictType::DataMismatch => "DATA_MISMATCH",
            ConflictType::VersionConflict => "VERSION_CONFLICT",
            ConflictType::ConcurrentModification => "CONCURRENT_MODIFICATION",
        }
    }
}

impl core::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy applied to close a conflict.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    /// Push the local value to the remote.
    AcceptLocal,
    /// Overwrite the local value with the remote one.
    AcceptRemote,
    /// Apply a caller-supplied merged value. Never auto-selected.
    ManualMerge,
}

impl core::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            ResolutionStrategy::AcceptLocal => "ACCEPT_LOCAL",
            ResolutionStrategy::AcceptRemote => "ACCEPT_REMOTE",
            ResolutionStrategy::ManualMerge => "MANUAL_MERGE",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_modification_is_most_severe() {
        let worst = [
            ConflictType::DataMismatch,
            ConflictType::ConcurrentModification,
            ConflictType::VersionConflict,
        ]
        .into_iter()
        .max();
        assert_eq!(worst, Some(ConflictType::ConcurrentModification));
    }

    #[test]
    fn serializes_in_screaming_case() {
        let json = serde_json::to_string(&ConflictType::DataMismatch).unwrap();
        assert_eq!(json, "\"DATA_MISMATCH\"");
    }
}
