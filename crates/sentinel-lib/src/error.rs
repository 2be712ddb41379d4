//! Error taxonomy for the sentinel core
//!
//! Expected failure paths are values; panics are reserved for invariant
//! violations.

use crate::models::ResourceType;
use thiserror::Error;

/// Failures while tracking or sizing allocations
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("allocation id must not be empty")]
    InvalidId,

    #[error("allocation {0} is already tracked")]
    AlreadyTracked(String),

    #[error("allocation {0} is not tracked as active")]
    NotTracked(String),

    #[error("failed to create {resource_type} pool for {key}: {reason}")]
    PoolCreation {
        key: String,
        resource_type: ResourceType,
        reason: String,
    },

    #[error("handle source exhausted after {acquired} of {requested} handles")]
    HandlesExhausted { requested: u32, acquired: u32 },
}

/// Failure reported by whatever physically releases a resource
#[derive(Debug, Clone, Error)]
#[error("release of {resource_id} failed: {reason}")]
pub struct ReleaseError {
    pub resource_id: String,
    pub reason: String,
}

impl ReleaseError {
    pub fn new(resource_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            reason: reason.into(),
        }
    }
}

/// Systemic monitoring failures surfaced to the hosting service
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("scan failed: {0}")]
    ScanFailed(String),

    #[error("metrics computation failed for {component}: {reason}")]
    Metrics { component: String, reason: String },
}

/// Recovery strategy failures
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("plugin {0} is not known to the host")]
    PluginNotFound(String),

    #[error("{strategy} failed for plugin {plugin_id}: {reason}")]
    StrategyFailed {
        plugin_id: String,
        strategy: &'static str,
        reason: String,
    },

    #[error("no valid configuration version recorded for plugin {0}")]
    NoValidConfiguration(String),

    #[error("plugin {0} is already isolated")]
    AlreadyIsolated(String),

    #[error("plugin {0} is not isolated")]
    NotIsolated(String),

    #[error("configuration store error for plugin {plugin_id}: {reason}")]
    ConfigurationStore { plugin_id: String, reason: String },
}

/// Configuration loading and validation failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}
