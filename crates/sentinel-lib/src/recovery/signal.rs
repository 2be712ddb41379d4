//! Health signals consumed by the recovery orchestrator

use crate::models::ResourceUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Observed condition of a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PluginCondition {
    Healthy,
    Failed { reason: String },
    Leaking { memory_leaks: u32, handle_leaks: u32 },
    ConfigurationDrift,
    Degraded { usage: ResourceUsage },
}

impl PluginCondition {
    pub fn label(&self) -> &'static str {
        match self {
            PluginCondition::Healthy => "healthy",
            PluginCondition::Failed { .. } => "failed",
            PluginCondition::Leaking { .. } => "leaking",
            PluginCondition::ConfigurationDrift => "configuration_drift",
            PluginCondition::Degraded { .. } => "degraded",
        }
    }
}

/// One observation about a plugin, sent towards the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSignal {
    pub plugin_id: String,
    pub condition: PluginCondition,
    pub observed_at: DateTime<Utc>,
}

impl HealthSignal {
    pub fn new(plugin_id: impl Into<String>, condition: PluginCondition) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            condition,
            observed_at: Utc::now(),
        }
    }

    pub fn failed(plugin_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            plugin_id,
            PluginCondition::Failed {
                reason: reason.into(),
            },
        )
    }

    pub fn leaking(plugin_id: impl Into<String>, memory_leaks: u32, handle_leaks: u32) -> Self {
        Self::new(
            plugin_id,
            PluginCondition::Leaking {
                memory_leaks,
                handle_leaks,
            },
        )
    }

    pub fn degraded(plugin_id: impl Into<String>, usage: ResourceUsage) -> Self {
        Self::new(plugin_id, PluginCondition::Degraded { usage })
    }
}
