//! Plugin host and configuration store contracts

use crate::models::ResourceUsage;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Resource limits applied to a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub max_memory_bytes: u64,
    pub max_file_handles: u32,
    pub max_network_connections: u32,
    pub max_io_ops_per_sec: u32,
}

/// What the host knows about a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub dependencies: Vec<String>,
    /// Quota currently applied, `None` when unrestricted
    pub quota: Option<ResourceQuota>,
    pub usage: ResourceUsage,
}

/// Lifecycle control over hosted plugins
#[async_trait]
pub trait PluginHost: Send + Sync {
    async fn stop_plugin(&self, plugin_id: &str) -> Result<()>;

    async fn start_plugin(&self, plugin_id: &str) -> Result<()>;

    async fn get_plugin(&self, plugin_id: &str) -> Result<Option<PluginDescriptor>>;

    /// Apply a quota, or lift it with `None`
    async fn apply_quota(&self, plugin_id: &str, quota: Option<ResourceQuota>) -> Result<()>;

    async fn restore_dependencies(&self, plugin_id: &str, dependencies: &[String]) -> Result<()>;
}

/// Source of truth for plugin configuration text
#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    async fn get_configuration(&self, plugin_id: &str) -> Result<Option<String>>;

    async fn update_configuration(&self, plugin_id: &str, text: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct HostedPlugin {
    descriptor: PluginDescriptor,
    running: bool,
    starts: u32,
    stops: u32,
    refuse_stop: bool,
}

/// Plugin host kept entirely in memory, for standalone mode and tests
#[derive(Default)]
pub struct InMemoryPluginHost {
    plugins: DashMap<String, HostedPlugin>,
}

impl InMemoryPluginHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, plugin_id: &str, dependencies: &[&str]) {
        self.plugins.insert(
            plugin_id.to_string(),
            HostedPlugin {
                descriptor: PluginDescriptor {
                    id: plugin_id.to_string(),
                    dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
                    quota: None,
                    usage: ResourceUsage::default(),
                },
                running: true,
                starts: 0,
                stops: 0,
                refuse_stop: false,
            },
        );
    }

    pub fn set_usage(&self, plugin_id: &str, usage: ResourceUsage) {
        if let Some(mut plugin) = self.plugins.get_mut(plugin_id) {
            plugin.descriptor.usage = usage;
        }
    }

    /// Make subsequent stop requests fail
    pub fn refuse_stop(&self, plugin_id: &str, refuse: bool) {
        if let Some(mut plugin) = self.plugins.get_mut(plugin_id) {
            plugin.refuse_stop = refuse;
        }
    }

    /// Replace the dependency list, as a misbehaving plugin might
    pub fn set_dependencies(&self, plugin_id: &str, dependencies: &[&str]) {
        if let Some(mut plugin) = self.plugins.get_mut(plugin_id) {
            plugin.descriptor.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        }
    }

    pub fn is_running(&self, plugin_id: &str) -> bool {
        self.plugins.get(plugin_id).is_some_and(|p| p.running)
    }

    /// (starts, stops) issued so far
    pub fn lifecycle_counts(&self, plugin_id: &str) -> (u32, u32) {
        self.plugins
            .get(plugin_id)
            .map(|p| (p.starts, p.stops))
            .unwrap_or((0, 0))
    }
}

#[async_trait]
impl PluginHost for InMemoryPluginHost {
    async fn stop_plugin(&self, plugin_id: &str) -> Result<()> {
        let mut plugin = self
            .plugins
            .get_mut(plugin_id)
            .ok_or_else(|| anyhow!("unknown plugin {}", plugin_id))?;
        if plugin.refuse_stop {
            return Err(anyhow!("plugin {} refused to stop", plugin_id));
        }
        plugin.running = false;
        plugin.stops += 1;
        Ok(())
    }

    async fn start_plugin(&self, plugin_id: &str) -> Result<()> {
        let mut plugin = self
            .plugins
            .get_mut(plugin_id)
            .ok_or_else(|| anyhow!("unknown plugin {}", plugin_id))?;
        plugin.running = true;
        plugin.starts += 1;
        Ok(())
    }

    async fn get_plugin(&self, plugin_id: &str) -> Result<Option<PluginDescriptor>> {
        Ok(self.plugins.get(plugin_id).map(|p| p.descriptor.clone()))
    }

    async fn apply_quota(&self, plugin_id: &str, quota: Option<ResourceQuota>) -> Result<()> {
        let mut plugin = self
            .plugins
            .get_mut(plugin_id)
            .ok_or_else(|| anyhow!("unknown plugin {}", plugin_id))?;
        plugin.descriptor.quota = quota;
        Ok(())
    }

    async fn restore_dependencies(&self, plugin_id: &str, dependencies: &[String]) -> Result<()> {
        let mut plugin = self
            .plugins
            .get_mut(plugin_id)
            .ok_or_else(|| anyhow!("unknown plugin {}", plugin_id))?;
        plugin.descriptor.dependencies = dependencies.to_vec();
        Ok(())
    }
}

/// Configuration store kept in memory
#[derive(Default)]
pub struct InMemoryConfigurationStore {
    configurations: DashMap<String, String>,
}

impl InMemoryConfigurationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigurationStore for InMemoryConfigurationStore {
    async fn get_configuration(&self, plugin_id: &str) -> Result<Option<String>> {
        Ok(self.configurations.get(plugin_id).map(|c| c.clone()))
    }

    async fn update_configuration(&self, plugin_id: &str, text: &str) -> Result<()> {
        self.configurations
            .insert(plugin_id.to_string(), text.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_host_lifecycle() {
        let host = InMemoryPluginHost::new();
        host.register("p1", &["db"]);

        host.stop_plugin("p1").await.unwrap();
        assert!(!host.is_running("p1"));
        host.start_plugin("p1").await.unwrap();
        assert!(host.is_running("p1"));
        assert_eq!(host.lifecycle_counts("p1"), (1, 1));

        host.refuse_stop("p1", true);
        assert!(host.stop_plugin("p1").await.is_err());
        assert!(host.stop_plugin("missing").await.is_err());
        assert!(host.get_plugin("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryConfigurationStore::new();
        assert!(store.get_configuration("p1").await.unwrap().is_none());
        store.update_configuration("p1", "a = 1").await.unwrap();
        assert_eq!(store.get_configuration("p1").await.unwrap().as_deref(), Some("a = 1"));
    }
}
