//! Recovery orchestration
//!
//! Maps each health signal to at most one strategy:
//! - `Failed` restarts the plugin (stop, grace period, start)
//! - `Leaking` stops the plugin, releases everything it owns, starts it again
//! - `ConfigurationDrift` rolls back to the latest valid configuration
//! - `Degraded` isolates the plugin under a restricted quota
//!
//! Every strategy passes the `RecoveryPolicy` gate first. Recoveries of one
//! plugin are serialized; different plugins recover independently.

use super::config_history::{ConfigChangeReason, ConfigurationHistory, ConfigurationVersion};
use super::host::{ConfigurationStore, PluginHost};
use super::isolation::{isolation_quota, IsolationContext, IsolationReason};
use super::policy::{Ineligible, RecoveryPolicy};
use super::signal::{HealthSignal, PluginCondition};
use crate::config::{Environment, RecoveryConfig};
use crate::error::RecoveryError;
use crate::ledger::AllocationLedger;
use crate::models::ResourceUsage;
use crate::monitor::{Alert, AlertManager, AlertSeverity, AlertType};
use crate::observability::SentinelMetrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Restart,
    Reallocate,
    Rollback,
    Isolate,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Restart => "restart",
            RecoveryStrategy::Reallocate => "reallocate",
            RecoveryStrategy::Rollback => "rollback",
            RecoveryStrategy::Isolate => "isolate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Recovered { strategy: RecoveryStrategy, attempt: u32 },
    NotEligible { reason: Ineligible },
    NoActionNeeded,
}

/// One entry of the recovery event history
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryEvent {
    pub plugin_id: String,
    pub condition: &'static str,
    pub strategy: Option<RecoveryStrategy>,
    pub attempt: u32,
    pub succeeded: bool,
    pub detail: String,
    pub at: DateTime<Utc>,
}

pub struct RecoveryOrchestrator {
    host: Arc<dyn PluginHost>,
    store: Arc<dyn ConfigurationStore>,
    ledger: Arc<AllocationLedger>,
    alerts: Arc<AlertManager>,
    policy: RecoveryPolicy,
    history: ConfigurationHistory,
    isolations: DashMap<String, IsolationContext>,
    plugin_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    events: Mutex<VecDeque<RecoveryEvent>>,
    metrics: SentinelMetrics,
    config: RecoveryConfig,
    environment: Environment,
}

impl RecoveryOrchestrator {
    pub fn new(
        host: Arc<dyn PluginHost>,
        store: Arc<dyn ConfigurationStore>,
        ledger: Arc<AllocationLedger>,
        alerts: Arc<AlertManager>,
        config: RecoveryConfig,
        environment: Environment,
    ) -> Self {
        Self {
            host,
            store,
            ledger,
            alerts,
            policy: RecoveryPolicy::new(config.max_attempts, config.cooldown()),
            history: ConfigurationHistory::new(config.config_history_depth),
            isolations: DashMap::new(),
            plugin_locks: DashMap::new(),
            events: Mutex::new(VecDeque::new()),
            metrics: SentinelMetrics::new(),
            config,
            environment,
        }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn configuration_history(&self) -> &ConfigurationHistory {
        &self.history
    }

    /// Snapshot the store's current configuration into history
    pub async fn record_configuration(
        &self,
        plugin_id: &str,
        reason: ConfigChangeReason,
        valid: bool,
    ) -> Result<ConfigurationVersion, RecoveryError> {
        let text = self
            .store
            .get_configuration(plugin_id)
            .await
            .map_err(|e| RecoveryError::ConfigurationStore {
                plugin_id: plugin_id.to_string(),
                reason: e.to_string(),
            })?
            .unwrap_or_default();
        Ok(self
            .history
            .register_configuration_version(plugin_id, &text, reason, valid))
    }

    pub async fn check_configuration_drift(&self, plugin_id: &str) -> Result<bool, RecoveryError> {
        self.history.detect_drift(plugin_id, self.store.as_ref()).await
    }

    fn select_strategy(&self, plugin_id: &str, condition: &PluginCondition) -> Option<RecoveryStrategy> {
        match condition {
            PluginCondition::Healthy => None,
            PluginCondition::Failed { .. } => Some(RecoveryStrategy::Restart),
            PluginCondition::Leaking {
                memory_leaks,
                handle_leaks,
            } => (memory_leaks + handle_leaks > 0).then_some(RecoveryStrategy::Reallocate),
            PluginCondition::ConfigurationDrift => Some(RecoveryStrategy::Rollback),
            PluginCondition::Degraded { .. } => {
                if !self.config.isolation.is_active(self.environment) {
                    warn!(
                        plugin_id = %plugin_id,
                        environment = ?self.environment,
                        "Isolation disabled in this environment, leaving degraded plugin in place"
                    );
                    return None;
                }
                if self.isolations.contains_key(plugin_id) {
                    debug!(plugin_id = %plugin_id, "Degraded plugin already isolated");
                    return None;
                }
                Some(RecoveryStrategy::Isolate)
            }
        }
    }

    pub async fn handle_signal(&self, signal: HealthSignal) -> Result<RecoveryOutcome, RecoveryError> {
        self.handle_signal_at(signal, Utc::now()).await
    }

    pub async fn handle_signal_at(
        &self,
        signal: HealthSignal,
        now: DateTime<Utc>,
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let plugin_id = signal.plugin_id.as_str();
        let Some(strategy) = self.select_strategy(plugin_id, &signal.condition) else {
            return Ok(RecoveryOutcome::NoActionNeeded);
        };

        let lock = self
            .plugin_locks
            .entry(plugin_id.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let attempt = match self.policy.try_begin(plugin_id, now) {
            Ok(attempt) => attempt,
            Err(reason) => {
                info!(
                    plugin_id = %plugin_id,
                    strategy = strategy.as_str(),
                    reason = ?reason,
                    "Recovery not eligible"
                );
                self.metrics.inc_recovery_attempt(strategy.as_str(), "not_eligible");
                return Ok(RecoveryOutcome::NotEligible { reason });
            }
        };

        info!(
            plugin_id = %plugin_id,
            condition = signal.condition.label(),
            strategy = strategy.as_str(),
            attempt,
            "Starting recovery"
        );

        let result = match (&strategy, &signal.condition) {
            (RecoveryStrategy::Restart, _) => self.restart(plugin_id).await,
            (RecoveryStrategy::Reallocate, _) => self.reallocate(plugin_id).await,
            (RecoveryStrategy::Rollback, _) => self.rollback(plugin_id).await,
            (RecoveryStrategy::Isolate, PluginCondition::Degraded { usage }) => self
                .isolate_at(plugin_id, *usage, IsolationReason::Degraded, now)
                .await
                .map(|_| ()),
            (RecoveryStrategy::Isolate, _) => Ok(()),
        };

        match result {
            Ok(()) => {
                info!(
                    plugin_id = %plugin_id,
                    strategy = strategy.as_str(),
                    attempt,
                    "Recovery succeeded"
                );
                self.metrics.inc_recovery_attempt(strategy.as_str(), "succeeded");
                self.push_event(RecoveryEvent {
                    plugin_id: plugin_id.to_string(),
                    condition: signal.condition.label(),
                    strategy: Some(strategy),
                    attempt,
                    succeeded: true,
                    detail: String::new(),
                    at: now,
                });
                Ok(RecoveryOutcome::Recovered { strategy, attempt })
            }
            Err(e) => {
                error!(
                    plugin_id = %plugin_id,
                    strategy = strategy.as_str(),
                    attempt,
                    error = %e,
                    "Recovery failed"
                );
                self.metrics.inc_recovery_attempt(strategy.as_str(), "failed");
                self.alerts.raise(
                    Alert::new(
                        AlertType::RecoveryFailed,
                        AlertSeverity::Critical,
                        plugin_id,
                        format!("{} recovery failed: {}", strategy.as_str(), e),
                    )
                    .with_label("strategy", strategy.as_str())
                    .with_label("attempt", attempt)
                    .at(now),
                );
                self.push_event(RecoveryEvent {
                    plugin_id: plugin_id.to_string(),
                    condition: signal.condition.label(),
                    strategy: Some(strategy),
                    attempt,
                    succeeded: false,
                    detail: e.to_string(),
                    at: now,
                });
                Err(e)
            }
        }
    }

    fn strategy_failed(plugin_id: &str, strategy: RecoveryStrategy, e: anyhow::Error) -> RecoveryError {
        RecoveryError::StrategyFailed {
            plugin_id: plugin_id.to_string(),
            strategy: strategy.as_str(),
            reason: e.to_string(),
        }
    }

    async fn restart(&self, plugin_id: &str) -> Result<(), RecoveryError> {
        self.host
            .stop_plugin(plugin_id)
            .await
            .map_err(|e| Self::strategy_failed(plugin_id, RecoveryStrategy::Restart, e))?;
        tokio::time::sleep(self.config.restart_grace()).await;
        self.host
            .start_plugin(plugin_id)
            .await
            .map_err(|e| Self::strategy_failed(plugin_id, RecoveryStrategy::Restart, e))
    }

    async fn reallocate(&self, plugin_id: &str) -> Result<(), RecoveryError> {
        self.host
            .stop_plugin(plugin_id)
            .await
            .map_err(|e| Self::strategy_failed(plugin_id, RecoveryStrategy::Reallocate, e))?;

        let released = self.ledger.release_owner(plugin_id);
        info!(plugin_id = %plugin_id, released = released.len(), "Released plugin allocations");

        self.host
            .start_plugin(plugin_id)
            .await
            .map_err(|e| Self::strategy_failed(plugin_id, RecoveryStrategy::Reallocate, e))
    }

    async fn rollback(&self, plugin_id: &str) -> Result<(), RecoveryError> {
        self.history
            .rollback_configuration(plugin_id, self.store.as_ref())
            .await
            .map(|_| ())
    }

    /// Put a plugin under a quota derived from its current usage
    pub async fn isolate(
        &self,
        plugin_id: &str,
        usage: ResourceUsage,
        reason: IsolationReason,
    ) -> Result<IsolationContext, RecoveryError> {
        self.isolate_at(plugin_id, usage, reason, Utc::now()).await
    }

    async fn isolate_at(
        &self,
        plugin_id: &str,
        usage: ResourceUsage,
        reason: IsolationReason,
        now: DateTime<Utc>,
    ) -> Result<IsolationContext, RecoveryError> {
        if self.isolations.contains_key(plugin_id) {
            return Err(RecoveryError::AlreadyIsolated(plugin_id.to_string()));
        }

        let descriptor = self
            .host
            .get_plugin(plugin_id)
            .await
            .map_err(|e| Self::strategy_failed(plugin_id, RecoveryStrategy::Isolate, e))?
            .ok_or_else(|| RecoveryError::PluginNotFound(plugin_id.to_string()))?;

        let quota = isolation_quota(&usage, &self.config);
        self.host
            .apply_quota(plugin_id, Some(quota))
            .await
            .map_err(|e| Self::strategy_failed(plugin_id, RecoveryStrategy::Isolate, e))?;

        let context = IsolationContext {
            plugin_id: plugin_id.to_string(),
            reason,
            isolated_at: now,
            quota,
            previous_quota: descriptor.quota,
            dependencies: descriptor.dependencies,
        };
        self.isolations.insert(plugin_id.to_string(), context.clone());
        self.metrics.set_isolated_plugins(self.isolations.len() as i64);

        warn!(
            plugin_id = %plugin_id,
            reason = ?reason,
            max_memory_bytes = quota.max_memory_bytes,
            max_file_handles = quota.max_file_handles,
            "Plugin isolated"
        );
        Ok(context)
    }

    /// Lift isolation, restoring the prior quota and dependency state
    pub async fn release_isolation(&self, plugin_id: &str) -> Result<IsolationContext, RecoveryError> {
        let context = self
            .isolations
            .get(plugin_id)
            .map(|c| c.clone())
            .ok_or_else(|| RecoveryError::NotIsolated(plugin_id.to_string()))?;

        self.host
            .apply_quota(plugin_id, context.previous_quota)
            .await
            .map_err(|e| Self::strategy_failed(plugin_id, RecoveryStrategy::Isolate, e))?;
        self.host
            .restore_dependencies(plugin_id, &context.dependencies)
            .await
            .map_err(|e| Self::strategy_failed(plugin_id, RecoveryStrategy::Isolate, e))?;

        self.isolations.remove(plugin_id);
        self.metrics.set_isolated_plugins(self.isolations.len() as i64);
        info!(plugin_id = %plugin_id, "Isolation released");
        Ok(context)
    }

    pub fn is_isolated(&self, plugin_id: &str) -> bool {
        self.isolations.contains_key(plugin_id)
    }

    pub fn isolation(&self, plugin_id: &str) -> Option<IsolationContext> {
        self.isolations.get(plugin_id).map(|c| c.clone())
    }

    pub fn isolated_plugins(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.isolations.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn push_event(&self, event: RecoveryEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push_back(event);
        while events.len() > self.config.event_history {
            events.pop_front();
        }
    }

    pub fn recent_events(&self) -> Vec<RecoveryEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Consume health signals until shutdown or until every sender is gone
    pub async fn run(
        self: Arc<Self>,
        mut signals: mpsc::Receiver<HealthSignal>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Recovery orchestrator started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Recovery orchestrator shutting down");
                    break;
                }
                signal = signals.recv() => {
                    let Some(signal) = signal else {
                        info!("Health signal channel closed");
                        break;
                    };
                    let plugin_id = signal.plugin_id.clone();
                    if let Err(e) = self.handle_signal(signal).await {
                        warn!(plugin_id = %plugin_id, error = %e, "Health signal left plugin unrecovered");
                    }
                }
            }
        }
    }
}
