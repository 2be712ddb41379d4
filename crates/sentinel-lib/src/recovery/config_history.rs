//! Bounded per-plugin configuration history for rollback and drift checks

use super::host::ConfigurationStore;
use crate::error::RecoveryError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigChangeReason {
    Update,
    Rollback,
    Startup,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigurationVersion {
    pub plugin_id: String,
    pub text: String,
    /// Hex SHA-256 of `text`
    pub hash: String,
    pub recorded_at: DateTime<Utc>,
    pub reason: ConfigChangeReason,
    pub valid: bool,
}

/// Hex-encoded SHA-256 of a configuration text
pub fn hash_configuration(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct ConfigurationHistory {
    depth: usize,
    versions: DashMap<String, VecDeque<ConfigurationVersion>>,
}

impl ConfigurationHistory {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            versions: DashMap::new(),
        }
    }

    pub fn register_configuration_version(
        &self,
        plugin_id: &str,
        text: &str,
        reason: ConfigChangeReason,
        valid: bool,
    ) -> ConfigurationVersion {
        let version = ConfigurationVersion {
            plugin_id: plugin_id.to_string(),
            text: text.to_string(),
            hash: hash_configuration(text),
            recorded_at: Utc::now(),
            reason,
            valid,
        };

        let mut history = self.versions.entry(plugin_id.to_string()).or_default();
        history.push_back(version.clone());
        while history.len() > self.depth {
            history.pop_front();
        }
        version
    }

    /// Plugins with at least one recorded version, sorted
    pub fn plugins(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.versions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn versions(&self, plugin_id: &str) -> Vec<ConfigurationVersion> {
        self.versions
            .get(plugin_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, plugin_id: &str) -> Option<ConfigurationVersion> {
        self.versions.get(plugin_id)?.back().cloned()
    }

    pub fn latest_valid(&self, plugin_id: &str) -> Option<ConfigurationVersion> {
        self.versions
            .get(plugin_id)?
            .iter()
            .rev()
            .find(|v| v.valid)
            .cloned()
    }

    /// Write the most recent valid version back to the store
    pub async fn rollback_configuration(
        &self,
        plugin_id: &str,
        store: &dyn ConfigurationStore,
    ) -> Result<ConfigurationVersion, RecoveryError> {
        let target = self
            .latest_valid(plugin_id)
            .ok_or_else(|| RecoveryError::NoValidConfiguration(plugin_id.to_string()))?;

        store
            .update_configuration(plugin_id, &target.text)
            .await
            .map_err(|e| RecoveryError::ConfigurationStore {
                plugin_id: plugin_id.to_string(),
                reason: e.to_string(),
            })?;

        let applied =
            self.register_configuration_version(plugin_id, &target.text, ConfigChangeReason::Rollback, true);
        info!(
            plugin_id = %plugin_id,
            hash = %applied.hash,
            restored_from = %target.recorded_at,
            "Configuration rolled back"
        );
        Ok(applied)
    }

    /// True when the store's current text no longer matches the latest
    /// recorded version. A plugin without history has nothing to drift from.
    pub async fn detect_drift(
        &self,
        plugin_id: &str,
        store: &dyn ConfigurationStore,
    ) -> Result<bool, RecoveryError> {
        let Some(latest) = self.latest(plugin_id) else {
            return Ok(false);
        };

        let current = store
            .get_configuration(plugin_id)
            .await
            .map_err(|e| RecoveryError::ConfigurationStore {
                plugin_id: plugin_id.to_string(),
                reason: e.to_string(),
            })?;

        let drifted = match current {
            Some(text) => hash_configuration(&text) != latest.hash,
            None => true,
        };
        if drifted {
            warn!(plugin_id = %plugin_id, expected = %latest.hash, "Configuration drift detected");
        }
        Ok(drifted)
    }
}

impl Default for ConfigurationHistory {
    fn default() -> Self {
        Self::new(10)
    }
}
