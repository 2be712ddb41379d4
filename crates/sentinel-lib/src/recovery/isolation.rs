//! Isolation state and restricted quota computation

use super::host::ResourceQuota;
use crate::config::RecoveryConfig;
use crate::models::ResourceUsage;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationReason {
    Degraded,
    ThresholdBreach,
    Manual,
}

/// Present while a plugin runs isolated
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IsolationContext {
    pub plugin_id: String,
    pub reason: IsolationReason,
    pub isolated_at: DateTime<Utc>,
    pub quota: ResourceQuota,
    /// Quota in force before isolation, restored on release
    pub previous_quota: Option<ResourceQuota>,
    /// Dependency state captured before isolation
    pub dependencies: Vec<String>,
}

fn with_headroom(value: u64, headroom_percent: u32) -> u64 {
    let scaled = value as u128 * (100 + headroom_percent as u128);
    let ceil = scaled.div_ceil(100);
    u64::try_from(ceil).unwrap_or(u64::MAX)
}

/// Current usage plus headroom, with handle, connection and IO caps
pub fn isolation_quota(usage: &ResourceUsage, config: &RecoveryConfig) -> ResourceQuota {
    let headroom = config.isolation_headroom_percent;
    let cap = |current: u32, limit: u32| -> u32 {
        let grown = with_headroom(current as u64, headroom);
        grown.min(limit as u64) as u32
    };

    ResourceQuota {
        max_memory_bytes: with_headroom(usage.memory_bytes, headroom),
        max_file_handles: cap(usage.file_handles, config.isolated_max_file_handles),
        max_network_connections: cap(usage.network_connections, config.isolated_max_network_connections),
        max_io_ops_per_sec: config.isolated_max_io_ops_per_sec,
    }
}
