//! Tiered cache for remote reads and sync bookkeeping.
//!
//! A [`CacheTier`] is one storage layer (in-process, shared, durable);
//! [`TieredCache`] stacks them behind the [`CacheService`] contract with
//! read-through backfill and prefix-selected write-through/write-behind.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod sqlite;
pub mod tiered;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryTier;
#[cfg(feature = "redis")]
pub use self::redis::RedisTier;
pub use sqlite::SqliteTier;
pub use tiered::TieredCache;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Memory,
    Shared,
    Durable,
}

impl TierKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TierKind::Memory => "memory",
            TierKind::Shared => "shared",
            TierKind::Durable => "durable",
        }
    }
}

impl core::fmt::Display for TierKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{tier} tier failed: {message}")]
    Backend { tier: TierKind, message: String },

    #[error("cache value could not be (de)serialized: {0}")]
    Serialization(String),

    #[error("invalid key pattern `{pattern}`: {message}")]
    InvalidPattern { pattern: String, message: String },
}

impl CacheError {
    pub fn backend(tier: TierKind, err: impl core::fmt::Display) -> Self {
        Self::Backend {
            tier,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    /// Tier the entry was read from (or written to).
    pub tier: TierKind,
    pub expires_at: DateTime<Utc>,
    pub tags: Vec<String>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Value, tier: TierKind, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value,
            tier,
            expires_at: expiry(Utc::now(), ttl),
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Glob over cache keys (`*`, `?`, `[...]`), e.g. `erp:purchase.order:*`.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    matcher: GlobMatcher,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Result<Self, CacheError> {
        let glob = Glob::new(pattern).map_err(|e| CacheError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            raw: pattern.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_match(&self, key: &str) -> bool {
        self.matcher.is_match(key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Overrides every tier's default TTL.
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    /// Sum of live entries held by every tier.
    pub total_entries: usize,
    pub entries_by_tier: BTreeMap<TierKind, usize>,
    pub hits_by_tier: BTreeMap<TierKind, u64>,
    pub evictions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierHealth {
    pub tier: TierKind,
    pub healthy: bool,
    pub latency: Duration,
    pub error: Option<String>,
}

/// One storage layer of the cache.
///
/// `get` never returns an expired entry.
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn kind(&self) -> TierKind;

    fn default_ttl(&self) -> Duration;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<usize, CacheError>;

    async fn delete_tagged(&self, tag: &str) -> Result<usize, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;

    async fn len(&self) -> Result<usize, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;

    /// Entries dropped for capacity or expiry since startup.
    fn evictions(&self) -> u64 {
        0
    }
}

#[async_trait]
pub trait CacheService: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    async fn set(&self, key: &str, value: Value, options: SetOptions) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Value>, CacheError>;

    async fn set_many(
        &self,
        entries: Vec<(String, Value)>,
        options: SetOptions,
    ) -> Result<(), CacheError>;

    async fn invalidate_pattern(&self, pattern: &str) -> Result<usize, CacheError>;

    async fn invalidate_tag(&self, tag: &str) -> Result<usize, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;

    async fn stats(&self) -> CacheStats;

    async fn health(&self) -> Vec<TierHealth>;
}

/// Typed helpers over any [`CacheService`].
#[async_trait]
pub trait CacheServiceExt: CacheService {
    async fn get_as<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key).await? {
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|e| CacheError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn set_as<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> Result<(), CacheError> {
        let value =
            serde_json::to_value(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.set(key, value, options).await
    }
}

impl<S: CacheService + ?Sized> CacheServiceExt for S {}

/// Cache key builders shared by every component that touches the cache.
pub mod keys {
    use ordersync_core::{ConflictId, RemoteId};

    pub const REMOTE_ORDER_PREFIX: &str = "erp:purchase.order:";

    pub fn remote_order(remote_id: RemoteId) -> String {
        format!("{REMOTE_ORDER_PREFIX}{remote_id}")
    }

    pub fn sync_state(entity_type: &str, entity_id: &str) -> String {
        format!("sync_state:{entity_type}:{entity_id}")
    }

    pub fn conflict(conflict_id: ConflictId) -> String {
        format!("conflict:{conflict_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_patterns_are_globs() {
        let p = KeyPattern::new("erp:purchase.order:*").unwrap();
        assert!(p.is_match("erp:purchase.order:42"));
        assert!(!p.is_match("sync_state:purchase_order:42"));
        assert!(KeyPattern::new("[").is_err());
    }

    #[test]
    fn remaining_ttl_never_goes_negative() {
        let entry = CacheEntry::new("k", Value::Null, TierKind::Memory, Duration::from_secs(1));
        let later = entry.expires_at + chrono::Duration::seconds(5);
        assert!(entry.is_expired(later));
        assert_eq!(entry.remaining_ttl(later), Duration::ZERO);
    }
}
