use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::TierHealth;
use crate::config::HealthThresholds;
use crate::erp::ConnectionStatus;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklogLevel {
    Normal,
    Elevated,
    Critical,
}

impl BacklogLevel {
    pub fn for_backlog(backlog: usize, thresholds: &HealthThresholds) -> Self {
        if backlog >= thresholds.backlog_critical {
            BacklogLevel::Critical
        } else if backlog >= thresholds.backlog_elevated {
            BacklogLevel::Elevated
        } else {
            BacklogLevel::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub erp_connection: ConnectionStatus,
    pub cache_tiers: Vec<TierHealth>,
    /// Local orders waiting for a sync.
    pub backlog: usize,
    pub backlog_level: BacklogLevel,
    /// Failed share of attempts inside the configured window.
    pub error_rate: f64,
    pub realtime_sync_running: bool,
    /// Why the engine is unhealthy; empty when healthy.
    pub issues: Vec<String>,
}

pub(crate) struct HealthInputs {
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub erp_connection: ConnectionStatus,
    pub cache_tiers: Vec<TierHealth>,
    pub backlog: usize,
    pub error_rate: f64,
    pub realtime_sync_running: bool,
}

pub(crate) fn evaluate(inputs: HealthInputs, thresholds: &HealthThresholds) -> HealthStatus {
    let backlog_level = BacklogLevel::for_backlog(inputs.backlog, thresholds);
    let mut issues = Vec::new();

    if inputs.erp_connection != ConnectionStatus::Connected {
        issues.push(format!("ERP connection is {:?}", inputs.erp_connection));
    }
    if inputs.consecutive_failures >= thresholds.max_consecutive_failures {
        issues.push(format!("{} consecutive sync failures", inputs.consecutive_failures));
    }
    if inputs.error_rate > thresholds.max_error_rate {
        issues.push(format!("error rate {:.2} above {:.2}", inputs.error_rate, thresholds.max_error_rate));
    }
    for tier in inputs.cache_tiers.iter().filter(|t| !t.healthy) {
        issues.push(format!("{} cache tier unhealthy", tier.tier));
    }
    if backlog_level == BacklogLevel::Critical {
        issues.push(format!("sync backlog of {} orders", inputs.backlog));
    }

    HealthStatus {
        is_healthy: issues.is_empty(),
        last_successful_sync: inputs.last_successful_sync,
        consecutive_failures: inputs.consecutive_failures,
        erp_connection: inputs.erp_connection,
        cache_tiers: inputs.cache_tiers,
        backlog: inputs.backlog,
        backlog_level,
        error_rate: inputs.error_rate,
        realtime_sync_running: inputs.realtime_sync_running,
        issues,
    }
}
