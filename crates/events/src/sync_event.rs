//! Events emitted by the synchronization pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ordersync_core::{
    ConflictId, ConflictType, ErrorClass, RemoteId, ResolutionStrategy, SyncDirection,
    SyncOperation,
};

use crate::event::Event;

/// Entity type tag used for purchase-order event streams.
pub const PURCHASE_ORDER: &str = "purchase_order";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncEvent {
    OrderSynced {
        direction: SyncDirection,
        operation: SyncOperation,
        remote_id: RemoteId,
        occurred_at: DateTime<Utc>,
    },
    SyncFailed {
        direction: SyncDirection,
        class: ErrorClass,
        message: String,
        occurred_at: DateTime<Utc>,
    },
    ConflictDetected {
        conflict_id: ConflictId,
        conflict_type: ConflictType,
        fields: Vec<String>,
        occurred_at: DateTime<Utc>,
    },
    ConflictResolved {
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
        resolved_by: String,
        occurred_at: DateTime<Utc>,
    },
    OrderImported {
        remote_id: RemoteId,
        occurred_at: DateTime<Utc>,
    },
    SyncStateCleared {
        occurred_at: DateTime<Utc>,
    },
}

impl SyncEvent {
    pub const ORDER_SYNCED: &'static str = "sync.order.synced";
    pub const SYNC_FAILED: &'static str = "sync.order.failed";
    pub const CONFLICT_DETECTED: &'static str = "sync.conflict.detected";
    pub const CONFLICT_RESOLVED: &'static str = "sync.conflict.resolved";
    pub const ORDER_IMPORTED: &'static str = "sync.order.imported";
    pub const STATE_CLEARED: &'static str = "sync.state.cleared";
}

impl Event for SyncEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::OrderSynced { .. } => Self::ORDER_SYNCED,
            SyncEvent::SyncFailed { .. } => Self::SYNC_FAILED,
            SyncEvent::ConflictDetected { .. } => Self::CONFLICT_DETECTED,
            SyncEvent::ConflictResolved { .. } => Self::CONFLICT_RESOLVED,
            SyncEvent::OrderImported { .. } => Self::ORDER_IMPORTED,
            SyncEvent::SyncStateCleared { .. } => Self::STATE_CLEARED,
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SyncEvent::OrderSynced { occurred_at, .. }
            | SyncEvent::SyncFailed { occurred_at, .. }
            | SyncEvent::ConflictDetected { occurred_at, .. }
            | SyncEvent::ConflictResolved { occurred_at, .. }
            | SyncEvent::OrderImported { occurred_at, .. }
            | SyncEvent::SyncStateCleared { occurred_at } => *occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DomainEvent, NewEvent};

    #[test]
    fn typed_event_survives_the_envelope() {
        let event = SyncEvent::OrderSynced {
            direction: SyncDirection::ToRemote,
            operation: SyncOperation::Create,
            remote_id: RemoteId::new(7).unwrap(),
            occurred_at: Utc::now(),
        };

        let new = NewEvent::from_typed("order-1", PURCHASE_ORDER, &event).unwrap();
        assert_eq!(new.event_type, "sync.order.synced");
        assert_eq!(new.payload["kind"], "order_synced");

        let stored = DomainEvent::committed(new, 1);
        let decoded: SyncEvent = stored.decode().unwrap();
        assert_eq!(decoded, event);
    }
}
