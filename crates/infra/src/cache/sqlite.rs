//! Durable cache tier on SQLite.
//!
//! Entries survive process restarts when backed by a file URL. Expiry is
//! stored as epoch milliseconds so it can be compared in SQL.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use super::{CacheEntry, CacheError, CacheTier, KeyPattern, TierKind};

#[derive(Debug, Clone)]
pub struct SqliteTier {
    pool: SqlitePool,
    ttl: Duration,
    evictions: std::sync::Arc<AtomicU64>,
}

impl SqliteTier {
    /// Open (creating if needed) the cache database at `url`, e.g.
    /// `sqlite://cache.db` or `sqlite::memory:`.
    pub async fn connect(url: &str, ttl: Duration) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid SQLite URL {url:?}"))?
            .create_if_missing(true);

        // An in-memory database lives and dies with its connection.
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(if max_connections == 1 { 1 } else { 0 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open SQLite cache at {url:?}"))?;

        Self::from_pool(pool, ttl).await
    }

    pub async fn from_pool(pool: SqlitePool, ttl: Duration) -> anyhow::Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create cache_entries table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_tags (
                tag TEXT NOT NULL,
                key TEXT NOT NULL,
                PRIMARY KEY (tag, key)
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create cache_tags table")?;

        Ok(Self {
            pool,
            ttl,
            evictions: Default::default(),
        })
    }

    fn err(e: impl core::fmt::Display) -> CacheError {
        CacheError::backend(TierKind::Durable, e)
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<usize, CacheError> {
        let mut tx = self.pool.begin().await.map_err(Self::err)?;
        let mut removed = 0;
        for key in keys {
            let result = sqlx::query("DELETE FROM cache_entries WHERE key = ?1")
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(Self::err)?;
            removed += result.rows_affected() as usize;
            sqlx::query("DELETE FROM cache_tags WHERE key = ?1")
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(Self::err)?;
        }
        tx.commit().await.map_err(Self::err)?;
        Ok(removed)
    }
}

#[async_trait]
impl CacheTier for SqliteTier {
    fn kind(&self) -> TierKind {
        TierKind::Durable
    }

    fn default_ttl(&self) -> Duration {
        self.ttl
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let row = sqlx::query("SELECT value, expires_at FROM cache_entries WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::err)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let expires_ms: i64 = row.try_get("expires_at").map_err(Self::err)?;
        let expires_at = DateTime::<Utc>::from_timestamp_millis(expires_ms)
            .ok_or_else(|| Self::err(format!("invalid expiry {expires_ms}")))?;
        if expires_at <= Utc::now() {
            self.delete_keys(&[key.to_string()]).await?;
            self.evictions.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let raw: String = row.try_get("value").map_err(Self::err)?;
        let value =
            serde_json::from_str(&raw).map_err(|e| CacheError::Serialization(e.to_string()))?;

        let tags: Vec<String> = sqlx::query("SELECT tag FROM cache_tags WHERE key = ?1")
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .map_err(Self::err)?
            .iter()
            .filter_map(|r| r.try_get::<String, _>("tag").ok())
            .collect();

        Ok(Some(CacheEntry {
            key: key.to_string(),
            value,
            tier: TierKind::Durable,
            expires_at,
            tags,
        }))
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let raw = serde_json::to_string(&entry.value)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(Self::err)?;
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(&entry.key)
        .bind(&raw)
        .bind(entry.expires_at.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(Self::err)?;

        sqlx::query("DELETE FROM cache_tags WHERE key = ?1")
            .bind(&entry.key)
            .execute(&mut *tx)
            .await
            .map_err(Self::err)?;
        for tag in &entry.tags {
            sqlx::query("INSERT OR IGNORE INTO cache_tags (tag, key) VALUES (?1, ?2)")
                .bind(tag)
                .bind(&entry.key)
                .execute(&mut *tx)
                .await
                .map_err(Self::err)?;
        }
        tx.commit().await.map_err(Self::err)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.delete_keys(&[key.to_string()]).await? > 0)
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<usize, CacheError> {
        let keys: Vec<String> = sqlx::query("SELECT key FROM cache_entries")
            .fetch_all(&self.pool)
            .await
            .map_err(Self::err)?
            .iter()
            .filter_map(|r| r.try_get::<String, _>("key").ok())
            .filter(|k| pattern.is_match(k))
            .collect();
        self.delete_keys(&keys).await
    }

    async fn delete_tagged(&self, tag: &str) -> Result<usize, CacheError> {
        let keys: Vec<String> = sqlx::query("SELECT key FROM cache_tags WHERE tag = ?1")
            .bind(tag)
            .fetch_all(&self.pool)
            .await
            .map_err(Self::err)?
            .iter()
            .filter_map(|r| r.try_get::<String, _>("key").ok())
            .collect();
        self.delete_keys(&keys).await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut tx = self.pool.begin().await.map_err(Self::err)?;
        sqlx::query("DELETE FROM cache_entries")
            .execute(&mut *tx)
            .await
            .map_err(Self::err)?;
        sqlx::query("DELETE FROM cache_tags")
            .execute(&mut *tx)
            .await
            .map_err(Self::err)?;
        tx.commit().await.map_err(Self::err)
    }

    async fn len(&self) -> Result<usize, CacheError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM cache_entries WHERE expires_at > ?1")
            .bind(Utc::now().timestamp_millis())
            .fetch_one(&self.pool)
            .await
            .map_err(Self::err)?;
        let n: i64 = row.try_get("n").map_err(Self::err)?;
        Ok(n.max(0) as usize)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(Self::err)
    }

    fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}
