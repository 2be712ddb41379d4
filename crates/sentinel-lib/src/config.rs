//! Typed configuration schema
//!
//! Every option has a default so a partial file (or none at all) produces a
//! usable configuration. Feature toggles carry the environments they may be
//! enabled in; [`validate`] checks the whole tree without side effects.

use crate::error::ConfigError;
use crate::models::ResourceType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Deployment environment the sentinel runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

/// Switch for behaviour that is only permitted in some environments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureToggle {
    pub enabled: bool,
    #[serde(default = "all_environments")]
    pub allowed_environments: Vec<Environment>,
}

fn all_environments() -> Vec<Environment> {
    vec![
        Environment::Development,
        Environment::Staging,
        Environment::Production,
    ]
}

impl FeatureToggle {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            allowed_environments: all_environments(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            allowed_environments: all_environments(),
        }
    }

    pub fn only_in(mut self, environments: &[Environment]) -> Self {
        self.allowed_environments = environments.to_vec();
        self
    }

    /// True when enabled and permitted in `env`
    pub fn is_active(&self, env: Environment) -> bool {
        self.enabled && self.allowed_environments.contains(&env)
    }
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub trend: TrendConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub leak: LeakConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "sentinel".to_string())
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            instance_name: default_instance_name(),
            ledger: LedgerConfig::default(),
            trend: TrendConfig::default(),
            pool: PoolConfig::default(),
            leak: LeakConfig::default(),
            monitor: MonitorConfig::default(),
            recovery: RecoveryConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// How long released/orphaned records stay visible before eviction
    pub release_grace_secs: u64,
    /// Capacity of the ledger event broadcast channel
    pub event_buffer: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            release_grace_secs: 300,
            event_buffer: 1024,
        }
    }
}

impl LedgerConfig {
    pub fn release_grace(&self) -> Duration {
        Duration::from_secs(self.release_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    pub retention_secs: u64,
    pub max_samples_per_key: usize,
    /// History size below which predictions fall back
    pub min_records: usize,
    /// Number of most recent records used for statistics
    pub recent_window: usize,
    pub load_trend_window_secs: u64,
    pub fallback_memory_multiplier: u64,
    pub fallback_file_handles: u32,
    pub fallback_duration_secs: u64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            retention_secs: 3600,
            max_samples_per_key: 100,
            min_records: 10,
            recent_window: 5,
            load_trend_window_secs: 300,
            fallback_memory_multiplier: 10,
            fallback_file_handles: 5,
            fallback_duration_secs: 30,
        }
    }
}

impl TrendConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn load_trend_window(&self) -> Duration {
        Duration::from_secs(self.load_trend_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Minimum prediction confidence for prediction-sized pools
    pub confidence_threshold: f64,
    pub min_pool_bytes: u64,
    pub max_pool_bytes: u64,
    pub min_file_handles: u32,
    pub max_file_handles: u32,
    pub high_priority_headroom_percent: u32,
    pub idle_timeout_secs: u64,
    pub prewarm: FeatureToggle,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            min_pool_bytes: 1024 * 1024,
            max_pool_bytes: 512 * 1024 * 1024,
            min_file_handles: 1,
            max_file_handles: 256,
            high_priority_headroom_percent: 20,
            idle_timeout_secs: 600,
            prewarm: FeatureToggle::enabled(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Weights of the three leak signals
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeakWeights {
    pub unreleased: f64,
    pub lifetime: f64,
    pub growth: f64,
}

impl Default for LeakWeights {
    fn default() -> Self {
        Self {
            unreleased: 0.4,
            lifetime: 0.3,
            growth: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeakConfig {
    pub unreleased_ratio_threshold: f64,
    pub lifetime_threshold_ms: u64,
    pub growth_threshold_percent: f64,
    pub weights: LeakWeights,
    /// Leak probability above which a type is force-released
    pub auto_recovery_threshold: f64,
    pub memory_confidence_threshold_percent: f64,
    /// Number of liveness scans kept for memory-leak confidence
    pub liveness_history: usize,
    /// Live count per type above which a threshold breach is raised
    pub type_limits: HashMap<ResourceType, usize>,
    pub auto_recovery: FeatureToggle,
    pub emergency_cleanup: FeatureToggle,
}

impl Default for LeakConfig {
    fn default() -> Self {
        let type_limits = HashMap::from([
            (ResourceType::Memory, 1_000),
            (ResourceType::FileHandle, 512),
            (ResourceType::DatabaseConnection, 64),
            (ResourceType::NetworkSocket, 256),
            (ResourceType::ThreadPool, 32),
        ]);
        Self {
            unreleased_ratio_threshold: 0.3,
            lifetime_threshold_ms: 300_000,
            growth_threshold_percent: 20.0,
            weights: LeakWeights::default(),
            auto_recovery_threshold: 0.7,
            memory_confidence_threshold_percent: 75.0,
            liveness_history: 20,
            type_limits,
            auto_recovery: FeatureToggle::enabled(),
            emergency_cleanup: FeatureToggle::enabled()
                .only_in(&[Environment::Development, Environment::Staging]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sweep_interval_secs: u64,
    pub stuck_timeout_secs: u64,
    pub orphan_timeout_secs: u64,
    pub max_release_retries: u32,
    pub alert_dedup_secs: u64,
    pub alert_history: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            stuck_timeout_secs: 3600,
            orphan_timeout_secs: 3600,
            max_release_retries: 3,
            alert_dedup_secs: 900,
            alert_history: 200,
        }
    }
}

impl MonitorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }

    pub fn orphan_timeout(&self) -> Duration {
        Duration::from_secs(self.orphan_timeout_secs)
    }

    pub fn alert_dedup_window(&self) -> Duration {
        Duration::from_secs(self.alert_dedup_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    pub cooldown_secs: u64,
    pub restart_grace_millis: u64,
    pub config_history_depth: usize,
    pub event_history: usize,
    pub isolation: FeatureToggle,
    pub isolation_headroom_percent: u32,
    pub isolated_max_file_handles: u32,
    pub isolated_max_network_connections: u32,
    pub isolated_max_io_ops_per_sec: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown_secs: 300,
            restart_grace_millis: 2_000,
            config_history_depth: 10,
            event_history: 100,
            isolation: FeatureToggle::enabled(),
            isolation_headroom_percent: 20,
            isolated_max_file_handles: 64,
            isolated_max_network_connections: 4,
            isolated_max_io_ops_per_sec: 100,
        }
    }
}

impl RecoveryConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub leak_scan_interval_secs: u64,
    pub pool_optimize_interval_secs: u64,
    pub health_report_interval_secs: u64,
    /// Capacity of the health signal channel feeding the orchestrator
    pub signal_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            leak_scan_interval_secs: 60,
            pool_optimize_interval_secs: 120,
            health_report_interval_secs: 30,
            signal_buffer: 256,
        }
    }
}

/// Check a configuration tree, collecting every violation
pub fn validate(config: &SentinelConfig) -> Result<(), ConfigError> {
    let mut problems = Vec::new();
    let env = config.environment;

    let toggles = [
        ("pool.prewarm", &config.pool.prewarm),
        ("leak.auto_recovery", &config.leak.auto_recovery),
        ("leak.emergency_cleanup", &config.leak.emergency_cleanup),
        ("recovery.isolation", &config.recovery.isolation),
    ];
    for (name, toggle) in toggles {
        if toggle.enabled && !toggle.allowed_environments.contains(&env) {
            problems.push(format!("{} is enabled but not allowed in {:?}", name, env));
        }
    }

    let unit_interval = [
        ("pool.confidence_threshold", config.pool.confidence_threshold),
        (
            "leak.unreleased_ratio_threshold",
            config.leak.unreleased_ratio_threshold,
        ),
        ("leak.auto_recovery_threshold", config.leak.auto_recovery_threshold),
    ];
    for (name, value) in unit_interval {
        if !(0.0..=1.0).contains(&value) {
            problems.push(format!("{} must be within [0, 1], got {}", name, value));
        }
    }

    let weights = config.leak.weights;
    if weights.unreleased < 0.0 || weights.lifetime < 0.0 || weights.growth < 0.0 {
        problems.push("leak.weights must not be negative".to_string());
    }
    if !(0.0..=100.0).contains(&config.leak.memory_confidence_threshold_percent) {
        problems.push("leak.memory_confidence_threshold_percent must be within [0, 100]".to_string());
    }

    if config.pool.min_pool_bytes > config.pool.max_pool_bytes {
        problems.push("pool.min_pool_bytes exceeds pool.max_pool_bytes".to_string());
    }
    if config.pool.min_file_handles > config.pool.max_file_handles {
        problems.push("pool.min_file_handles exceeds pool.max_file_handles".to_string());
    }

    let intervals = [
        ("monitor.sweep_interval_secs", config.monitor.sweep_interval_secs),
        ("scheduler.leak_scan_interval_secs", config.scheduler.leak_scan_interval_secs),
        (
            "scheduler.pool_optimize_interval_secs",
            config.scheduler.pool_optimize_interval_secs,
        ),
        (
            "scheduler.health_report_interval_secs",
            config.scheduler.health_report_interval_secs,
        ),
        ("trend.retention_secs", config.trend.retention_secs),
    ];
    for (name, value) in intervals {
        if value == 0 {
            problems.push(format!("{} must be greater than zero", name));
        }
    }

    if config.trend.recent_window == 0 || config.trend.max_samples_per_key == 0 {
        problems.push("trend windows must be greater than zero".to_string());
    }
    if config.recovery.max_attempts == 0 {
        problems.push("recovery.max_attempts must be greater than zero".to_string());
    }
    if config.monitor.max_release_retries == 0 {
        problems.push("monitor.max_release_retries must be greater than zero".to_string());
    }
    if config.ledger.event_buffer == 0 || config.scheduler.signal_buffer == 0 {
        problems.push("channel buffers must be greater than zero".to_string());
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(problems))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SentinelConfig::default();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_toggle_outside_allowed_environment() {
        let mut config = SentinelConfig::default();
        config.environment = Environment::Production;
        config.leak.emergency_cleanup.enabled = true;

        let err = validate(&config).unwrap_err();
        let ConfigError::Invalid(problems) = err;
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("leak.emergency_cleanup"));
    }

    #[test]
    fn test_disabled_toggle_is_not_checked() {
        let mut config = SentinelConfig::default();
        config.environment = Environment::Production;
        config.leak.emergency_cleanup.enabled = false;
        assert!(validate(&config).is_ok());
        assert!(!config.leak.emergency_cleanup.is_active(Environment::Production));
    }

    #[test]
    fn test_collects_all_problems() {
        let mut config = SentinelConfig::default();
        config.pool.confidence_threshold = 1.5;
        config.pool.min_pool_bytes = config.pool.max_pool_bytes + 1;
        config.monitor.sweep_interval_secs = 0;
        config.leak.weights.growth = -0.1;

        let ConfigError::Invalid(problems) = validate(&config).unwrap_err();
        assert_eq!(problems.len(), 4);
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let json = r#"{
            "environment": "staging",
            "monitor": { "sweep_interval_secs": 60 },
            "leak": { "weights": { "unreleased": 0.5 } }
        }"#;
        let config: SentinelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.environment, Environment::Staging);
        assert_eq!(config.monitor.sweep_interval_secs, 60);
        assert_eq!(config.monitor.stuck_timeout_secs, 3600);
        assert_eq!(config.leak.weights.unreleased, 0.5);
        assert_eq!(config.leak.weights.lifetime, 0.3);
        assert_eq!(config.trend.min_records, 10);
    }
}
