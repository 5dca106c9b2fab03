use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CacheEntry, CacheError, CacheTier, KeyPattern, TierKind};

/// Entries plus an index ordered by expiry, kept in step on every change.
#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, CacheEntry>,
    by_expiry: BTreeSet<(DateTime<Utc>, String)>,
}

impl Entries {
    fn len(&self) -> usize {
        self.map.len()
    }

    fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.map.get(key)
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.remove(&entry.key);
        self.by_expiry.insert((entry.expires_at, entry.key.clone()));
        self.map.insert(entry.key.clone(), entry);
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.map.remove(key)?;
        self.by_expiry.remove(&(entry.expires_at, entry.key.clone()));
        Some(entry)
    }

    /// Remove the entry that expires first, if `evict` accepts its expiry.
    fn pop_earliest(&mut self, evict: impl FnOnce(DateTime<Utc>) -> bool) -> bool {
        let Some((expires_at, key)) = self.by_expiry.first().cloned() else {
            return false;
        };
        if !evict(expires_at) {
            return false;
        }
        self.by_expiry.remove(&(expires_at, key.clone()));
        self.map.remove(&key);
        true
    }

    fn remove_where(&mut self, doomed: impl Fn(&CacheEntry) -> bool) -> usize {
        let keys: Vec<String> = self
            .map
            .values()
            .filter(|e| doomed(e))
            .map(|e| e.key.clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    fn clear(&mut self) {
        self.map.clear();
        self.by_expiry.clear();
    }
}

/// In-process tier: bounded map with TTL expiry.
///
/// When full, expired entries are purged first; if that frees nothing, the
/// entry closest to expiry is evicted. Both steps walk an expiry-ordered
/// index, so a full tier never scans every entry.
#[derive(Debug)]
pub struct MemoryTier {
    kind: TierKind,
    ttl: Duration,
    max_entries: usize,
    entries: RwLock<Entries>,
    evictions: AtomicU64,
}

impl MemoryTier {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self::with_kind(TierKind::Memory, ttl, max_entries)
    }

    /// A map-backed tier reporting as another kind. Used to stand in for the
    /// shared or durable tier in tests and single-process deployments.
    pub fn with_kind(kind: TierKind, ttl: Duration, max_entries: usize) -> Self {
        Self {
            kind,
            ttl,
            max_entries: max_entries.max(1),
            entries: RwLock::new(Entries::default()),
            evictions: AtomicU64::new(0),
        }
    }

    fn poisoned(&self) -> CacheError {
        CacheError::backend(self.kind, "lock poisoned")
    }

    fn make_room(&self, entries: &mut Entries) {
        let now = Utc::now();
        let mut evicted = 0u64;
        while entries.pop_earliest(|expires_at| expires_at <= now) {
            evicted += 1;
        }
        if entries.len() >= self.max_entries && entries.pop_earliest(|_| true) {
            evicted += 1;
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            tracing::debug!(tier = %self.kind, evicted, "evicted cache entries");
        }
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn kind(&self) -> TierKind {
        self.kind
    }

    fn default_ttl(&self) -> Duration {
        self.ttl
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let now = Utc::now();
        {
            let entries = self.entries.read().map_err(|_| self.poisoned())?;
            match entries.get(key) {
                None => return Ok(None),
                Some(e) if !e.is_expired(now) => {
                    let mut entry = e.clone();
                    entry.tier = self.kind;
                    return Ok(Some(entry));
                }
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write().map_err(|_| self.poisoned())?;
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(None)
    }

    async fn put(&self, mut entry: CacheEntry) -> Result<(), CacheError> {
        entry.tier = self.kind;
        let mut entries = self.entries.write().map_err(|_| self.poisoned())?;
        if entries.get(&entry.key).is_none() && entries.len() >= self.max_entries {
            self.make_room(&mut entries);
        }
        entries.insert(entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut entries = self.entries.write().map_err(|_| self.poisoned())?;
        Ok(entries.remove(key).is_some())
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<usize, CacheError> {
        let mut entries = self.entries.write().map_err(|_| self.poisoned())?;
        Ok(entries.remove_where(|e| pattern.is_match(&e.key)))
    }

    async fn delete_tagged(&self, tag: &str) -> Result<usize, CacheError> {
        let mut entries = self.entries.write().map_err(|_| self.poisoned())?;
        Ok(entries.remove_where(|e| e.tags.iter().any(|t| t == tag)))
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().map_err(|_| self.poisoned())?.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        let now = Utc::now();
        let entries = self.entries.read().map_err(|_| self.poisoned())?;
        Ok(entries.map.values().filter(|e| !e.is_expired(now)).count())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.entries.read().map(|_| ()).map_err(|_| self.poisoned())
    }

    fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(key: &str, ttl: Duration) -> CacheEntry {
        CacheEntry::new(key, json!(key), TierKind::Memory, ttl)
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let tier = MemoryTier::new(Duration::from_secs(60), 10);
        tier.put(entry("stale", Duration::ZERO)).await.unwrap();
        assert!(tier.get("stale").await.unwrap().is_none());
        assert_eq!(tier.evictions(), 1);
    }

    #[tokio::test]
    async fn full_tier_evicts_entry_closest_to_expiry() {
        let tier = MemoryTier::new(Duration::from_secs(60), 2);
        tier.put(entry("short", Duration::from_secs(10))).await.unwrap();
        tier.put(entry("long", Duration::from_secs(100))).await.unwrap();
        tier.put(entry("new", Duration::from_secs(50))).await.unwrap();

        assert!(tier.get("short").await.unwrap().is_none());
        assert!(tier.get("long").await.unwrap().is_some());
        assert!(tier.get("new").await.unwrap().is_some());
        assert_eq!(tier.evictions(), 1);
    }

    #[tokio::test]
    async fn full_tier_purges_expired_entries_before_live_ones() {
        let tier = MemoryTier::new(Duration::from_secs(60), 3);
        tier.put(entry("gone-1", Duration::ZERO)).await.unwrap();
        tier.put(entry("gone-2", Duration::ZERO)).await.unwrap();
        tier.put(entry("live", Duration::from_secs(5))).await.unwrap();
        tier.put(entry("new", Duration::from_secs(50))).await.unwrap();

        assert!(tier.get("live").await.unwrap().is_some());
        assert!(tier.get("new").await.unwrap().is_some());
        assert_eq!(tier.evictions(), 2);
    }

    #[tokio::test]
    async fn rewriting_a_key_moves_it_in_the_expiry_order() {
        let tier = MemoryTier::new(Duration::from_secs(60), 2);
        tier.put(entry("a", Duration::from_secs(10))).await.unwrap();
        tier.put(entry("b", Duration::from_secs(20))).await.unwrap();
        tier.put(entry("a", Duration::from_secs(100))).await.unwrap();
        tier.put(entry("c", Duration::from_secs(50))).await.unwrap();

        assert!(tier.get("a").await.unwrap().is_some());
        assert!(tier.get("b").await.unwrap().is_none());
        let entries = tier.entries.read().unwrap();
        assert_eq!(entries.by_expiry.len(), entries.map.len());
    }

    #[tokio::test]
    async fn pattern_and_tag_deletes() {
        let tier = MemoryTier::new(Duration::from_secs(60), 10);
        tier.put(entry("erp:1", Duration::from_secs(60))).await.unwrap();
        tier.put(entry("erp:2", Duration::from_secs(60)).with_tags(vec!["po".into()]))
            .await
            .unwrap();
        tier.put(entry("other", Duration::from_secs(60)).with_tags(vec!["po".into()]))
            .await
            .unwrap();

        assert_eq!(tier.delete_matching(&KeyPattern::new("erp:*").unwrap()).await.unwrap(), 2);
        assert_eq!(tier.delete_tagged("po").await.unwrap(), 1);
        assert_eq!(tier.len().await.unwrap(), 0);
    }
}
