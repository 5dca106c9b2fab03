//! Infrastructure layer: ERP client, caches, event store, local store,
//! repository, sync state, conflict resolution and the sync orchestrator.

pub mod cache;
pub mod config;
pub mod engine;
pub mod erp;
pub mod event_service;
pub mod event_store;
pub mod orchestrator;
pub mod repository;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod sync_state;


pub use config::{ConflictStrategy, EngineConfig, SyncSettings};
pub use engine::Engine;
pub use orchestrator::{BatchSyncResult, BatchToken, HealthStatus, SyncError, SyncOrchestrator, SyncResult};
