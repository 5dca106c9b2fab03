//! Configuration loading and representation.
//!
//! Every section has a `Default` and loads from `ORDERSYNC_*` environment
//! variables. A variable that fails to parse is logged and ignored.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::erp::CircuitBreakerConfig;
use crate::retry::RetryOptions;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// How detected conflicts are handled once recorded.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Record and wait for an operator.
    #[default]
    Manual,
    /// Apply the suggested resolution whenever the conflict is auto-resolvable.
    AutoResolve,
}

impl FromStr for ConflictStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "auto" | "auto_resolve" => Ok(Self::AutoResolve),
            other => Err(ConfigError(format!("unknown conflict strategy `{other}`"))),
        }
    }
}

/// Operator-tunable sync settings, readable and writable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub retry_attempts: u32,
    pub sync_interval: Duration,
    pub enable_realtime_sync: bool,
    pub conflict_resolution_strategy: ConflictStrategy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            retry_attempts: 3,
            sync_interval: Duration::from_secs(60),
            enable_realtime_sync: false,
            conflict_resolution_strategy: ConflictStrategy::Manual,
        }
    }
}

impl SyncSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError("batch_size must be positive".into()));
        }
        if self.sync_interval.is_zero() {
            return Err(ConfigError("sync_interval must be positive".into()));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError("retry_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let src = Source(&lookup);
        Self {
            batch_size: src.parse("ORDERSYNC_BATCH_SIZE", d.batch_size),
            retry_attempts: src.parse("ORDERSYNC_RETRY_ATTEMPTS", d.retry_attempts),
            sync_interval: src.secs("ORDERSYNC_SYNC_INTERVAL_SECS", d.sync_interval),
            enable_realtime_sync: src.parse("ORDERSYNC_ENABLE_REALTIME_SYNC", d.enable_realtime_sync),
            conflict_resolution_strategy: src
                .parse("ORDERSYNC_CONFLICT_STRATEGY", d.conflict_resolution_strategy),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub memory_ttl: Duration,
    pub shared_ttl: Duration,
    pub durable_ttl: Duration,
    pub memory_max_entries: usize,
    /// Keys with these prefixes are written to every tier before `set` returns.
    pub write_through_prefixes: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_ttl: Duration::from_secs(5 * 60),
            shared_ttl: Duration::from_secs(30 * 60),
            durable_ttl: Duration::from_secs(24 * 60 * 60),
            memory_max_entries: 10_000,
            write_through_prefixes: vec!["sync_state:".into(), "conflict:".into()],
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let src = Source(&lookup);
        Self {
            memory_ttl: src.secs("ORDERSYNC_CACHE_MEMORY_TTL_SECS", d.memory_ttl),
            shared_ttl: src.secs("ORDERSYNC_CACHE_SHARED_TTL_SECS", d.shared_ttl),
            durable_ttl: src.secs("ORDERSYNC_CACHE_DURABLE_TTL_SECS", d.durable_ttl),
            memory_max_entries: src.parse("ORDERSYNC_CACHE_MEMORY_MAX_ENTRIES", d.memory_max_entries),
            write_through_prefixes: src
                .raw("ORDERSYNC_CACHE_WRITE_THROUGH_PREFIXES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(d.write_through_prefixes),
        }
    }
}

/// Limits that decide whether the engine reports itself healthy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub max_consecutive_failures: u32,
    /// Failed / total attempts inside `error_rate_window`.
    pub max_error_rate: f64,
    pub error_rate_window: Duration,
    pub backlog_elevated: usize,
    pub backlog_critical: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            max_error_rate: 0.5,
            error_rate_window: Duration::from_secs(15 * 60),
            backlog_elevated: 100,
            backlog_critical: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrent entity syncs.
    pub max_concurrency: usize,
    pub retry: RetryOptions,
    pub health: HealthThresholds,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            retry: RetryOptions::default(),
            health: HealthThresholds::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let src = Source(&lookup);
        Self {
            max_concurrency: src.parse("ORDERSYNC_MAX_CONCURRENCY", d.max_concurrency).max(1),
            retry: RetryOptions {
                max_attempts: src.parse("ORDERSYNC_RETRY_MAX_ATTEMPTS", d.retry.max_attempts),
                base_delay: src.millis("ORDERSYNC_RETRY_BASE_DELAY_MS", d.retry.base_delay),
                max_delay: src.millis("ORDERSYNC_RETRY_MAX_DELAY_MS", d.retry.max_delay),
                backoff_factor: src.parse("ORDERSYNC_RETRY_BACKOFF_FACTOR", d.retry.backoff_factor),
            },
            health: HealthThresholds {
                max_consecutive_failures: src.parse(
                    "ORDERSYNC_HEALTH_MAX_CONSECUTIVE_FAILURES",
                    d.health.max_consecutive_failures,
                ),
                max_error_rate: src.parse("ORDERSYNC_HEALTH_MAX_ERROR_RATE", d.health.max_error_rate),
                error_rate_window: src.secs(
                    "ORDERSYNC_HEALTH_ERROR_RATE_WINDOW_SECS",
                    d.health.error_rate_window,
                ),
                backlog_elevated: src.parse("ORDERSYNC_HEALTH_BACKLOG_ELEVATED", d.health.backlog_elevated),
                backlog_critical: src.parse("ORDERSYNC_HEALTH_BACKLOG_CRITICAL", d.health.backlog_critical),
            },
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let src = Source(&lookup);
        Self {
            failure_threshold: src.parse("ORDERSYNC_CB_FAILURE_THRESHOLD", d.failure_threshold).max(1),
            reset_timeout: src.secs("ORDERSYNC_CB_RESET_TIMEOUT_SECS", d.reset_timeout),
            monitoring_window: src.secs("ORDERSYNC_CB_MONITORING_WINDOW_SECS", d.monitoring_window),
        }
    }
}

/// Everything needed to assemble the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    pub sync: SyncSettings,
    pub orchestrator: OrchestratorConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub cache: CacheConfig,
    /// Durable cache tier location; `None` disables the tier.
    pub sqlite_url: Option<String>,
    /// Shared cache tier location; only honoured with the `redis` feature.
    pub redis_url: Option<String>,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            sync: SyncSettings::from_lookup(&lookup),
            orchestrator: OrchestratorConfig::from_lookup(&lookup),
            circuit_breaker: CircuitBreakerConfig::from_lookup(&lookup),
            cache: CacheConfig::from_lookup(&lookup),
            sqlite_url: lookup("ORDERSYNC_SQLITE_URL").filter(|v| !v.trim().is_empty()),
            redis_url: lookup("ORDERSYNC_REDIS_URL").filter(|v| !v.trim().is_empty()),
        }
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

struct Source<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Source<'_, F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        let Some(raw) = self.raw(key) else {
            return default;
        };
        match raw.trim().parse() {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(key, value = %raw, error = %err, "ignoring unparsable setting");
                default
            }
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        Duration::from_secs(self.parse(key, default.as_secs()))
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        Duration::from_millis(self.parse(key, default.as_millis() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = EngineConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg.sync, SyncSettings::default());
        assert_eq!(cfg.cache.memory_max_entries, 10_000);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
        assert_eq!(cfg.orchestrator.max_concurrency, 8);
        assert!(cfg.sqlite_url.is_none());
    }

    #[test]
    fn values_override_defaults() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("ORDERSYNC_BATCH_SIZE", "25"),
            ("ORDERSYNC_CONFLICT_STRATEGY", "auto_resolve"),
            ("ORDERSYNC_ENABLE_REALTIME_SYNC", "true"),
            ("ORDERSYNC_CB_RESET_TIMEOUT_SECS", "5"),
            ("ORDERSYNC_RETRY_BASE_DELAY_MS", "50"),
            ("ORDERSYNC_CACHE_WRITE_THROUGH_PREFIXES", "a:, b:"),
            ("ORDERSYNC_SQLITE_URL", "sqlite://cache.db"),
        ]));
        assert_eq!(cfg.sync.batch_size, 25);
        assert_eq!(cfg.sync.conflict_resolution_strategy, ConflictStrategy::AutoResolve);
        assert!(cfg.sync.enable_realtime_sync);
        assert_eq!(cfg.circuit_breaker.reset_timeout, Duration::from_secs(5));
        assert_eq!(cfg.orchestrator.retry.base_delay, Duration::from_millis(50));
        assert_eq!(cfg.cache.write_through_prefixes, vec!["a:", "b:"]);
        assert_eq!(cfg.sqlite_url.as_deref(), Some("sqlite://cache.db"));
    }

    #[test]
    fn unparsable_values_fall_back() {
        let cfg = SyncSettings::from_lookup(lookup(&[("ORDERSYNC_BATCH_SIZE", "lots")]));
        assert_eq!(cfg.batch_size, 50);
    }

    #[test]
    fn validation_rejects_zero_batch_and_interval() {
        let mut s = SyncSettings::default();
        s.batch_size = 0;
        assert!(s.validate().is_err());
        let mut s = SyncSettings::default();
        s.sync_interval = Duration::ZERO;
        assert!(s.validate().is_err());
        assert!(SyncSettings::default().validate().is_ok());
    }
}
