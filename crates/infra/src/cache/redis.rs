//! Shared cache tier on Redis (feature `redis`).
//!
//! Uses the synchronous client on the blocking pool. Keys are namespaced so
//! `clear` and pattern scans never touch foreign data; tag membership lives
//! in Redis sets next to the entries.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Commands;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CacheEntry, CacheError, CacheTier, KeyPattern, TierKind};

const NAMESPACE: &str = "ordersync:cache:";
const TAG_NAMESPACE: &str = "ordersync:tag:";

#[derive(Debug, Serialize, Deserialize)]
struct Stored {
    value: Value,
    expires_at: DateTime<Utc>,
    tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RedisTier {
    client: redis::Client,
    ttl: Duration,
}

impl RedisTier {
    pub fn new(redis_url: impl AsRef<str>, ttl: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::backend(TierKind::Shared, e))?;
        Ok(Self { client, ttl })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = client.get_connection()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| CacheError::backend(TierKind::Shared, e))?
        .map_err(|e| CacheError::backend(TierKind::Shared, e))
    }

    fn scan(conn: &mut redis::Connection, pattern: &str) -> redis::RedisResult<Vec<String>> {
        let keys: Vec<String> = conn.scan_match(pattern)?.collect();
        Ok(keys)
    }
}

fn namespaced(key: &str) -> String {
    format!("{NAMESPACE}{key}")
}

#[async_trait]
impl CacheTier for RedisTier {
    fn kind(&self) -> TierKind {
        TierKind::Shared
    }

    fn default_ttl(&self) -> Duration {
        self.ttl
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let redis_key = namespaced(key);
        let raw: Option<String> = self.run(move |conn| conn.get(redis_key)).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let stored: Stored =
            serde_json::from_str(&raw).map_err(|e| CacheError::Serialization(e.to_string()))?;
        if stored.expires_at <= Utc::now() {
            return Ok(None);
        }
        Ok(Some(CacheEntry {
            key: key.to_string(),
            value: stored.value,
            tier: TierKind::Shared,
            expires_at: stored.expires_at,
            tags: stored.tags,
        }))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let ttl_ms = entry.remaining_ttl(Utc::now()).as_millis().max(1) as u64;
        let redis_key = namespaced(&entry.key);
        let tags = entry.tags.clone();
        let raw = serde_json::to_string(&Stored {
            value: entry.value,
            expires_at: entry.expires_at,
            tags: entry.tags,
        })
        .map_err(|e| CacheError::Serialization(e.to_string()))?;

        self.run(move |conn| {
            let _: () = conn.pset_ex(&redis_key, raw, ttl_ms)?;
            for tag in tags {
                let _: i64 = conn.sadd(format!("{TAG_NAMESPACE}{tag}"), &redis_key)?;
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let redis_key = namespaced(key);
        let removed: i64 = self.run(move |conn| conn.del(redis_key)).await?;
        Ok(removed > 0)
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<usize, CacheError> {
        let redis_pattern = namespaced(pattern.as_str());
        let pattern = pattern.clone();
        self.run(move |conn| {
            let keys: Vec<String> = Self::scan(conn, &redis_pattern)?
                .into_iter()
                .filter(|k| pattern.is_match(k.trim_start_matches(NAMESPACE)))
                .collect();
            if keys.is_empty() {
                return Ok(0);
            }
            let removed: i64 = conn.del(&keys)?;
            Ok(removed.max(0) as usize)
        })
        .await
    }

    async fn delete_tagged(&self, tag: &str) -> Result<usize, CacheError> {
        let tag_key = format!("{TAG_NAMESPACE}{tag}");
        self.run(move |conn| {
            let keys: Vec<String> = conn.smembers(&tag_key)?;
            let _: i64 = conn.del(&tag_key)?;
            if keys.is_empty() {
                return Ok(0);
            }
            let removed: i64 = conn.del(&keys)?;
            Ok(removed.max(0) as usize)
        })
        .await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.run(|conn| {
            let mut keys = Self::scan(conn, &format!("{NAMESPACE}*"))?;
            keys.extend(Self::scan(conn, &format!("{TAG_NAMESPACE}*"))?);
            if !keys.is_empty() {
                let _: i64 = conn.del(&keys)?;
            }
            Ok(())
        })
        .await
    }

    async fn len(&self) -> Result<usize, CacheError> {
        self.run(|conn| Ok(Self::scan(conn, &format!("{NAMESPACE}*"))?.len()))
            .await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.run(|conn| redis::cmd("PING").query::<String>(conn).map(|_| ()))
            .await
    }
}
