//! Health tracking and aggregate health reports
//!
//! `HealthRegistry` tracks per-component status for liveness and readiness
//! probes. `HealthReporter` folds ledger counts, recent alerts, leak
//! probabilities and isolation state into a single scored report.

use crate::leak::LeakDetector;
use crate::ledger::{AllocationLedger, TypeTotals};
use crate::models::ResourceType;
use crate::monitor::{Alert, AlertManager, AlertSeverity};
use crate::recovery::RecoveryOrchestrator;
use crate::trend::{LoadTrend, TrendAnalyzer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Component status, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Last cycle failed; the component keeps running
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
    /// Failed cycles since the last success
    pub consecutive_failures: u32,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>, consecutive_failures: u32) -> Self {
        Self {
            status,
            message,
            checked_at: Utc::now(),
            consecutive_failures,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Names the sentinel registers its periodic components under
pub mod components {
    pub const RELEASE_MONITOR: &str = "release_monitor";
    pub const LEAK_DETECTOR: &str = "leak_detector";
    pub const POOL_MANAGER: &str = "pool_manager";
    pub const HEALTH_REPORTER: &str = "health_reporter";
    pub const RECOVERY: &str = "recovery";
}

#[derive(Debug, Default)]
struct RegistryState {
    components: BTreeMap<String, ComponentHealth>,
    ready: bool,
}

/// Shared, cloneable view of component health and readiness
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component as healthy; re-registering resets it
    pub async fn register(&self, name: &str) {
        self.state.write().await.components.insert(
            name.to_string(),
            ComponentHealth::new(ComponentStatus::Healthy, None, 0),
        );
    }

    pub async fn set_healthy(&self, name: &str) {
        self.register(name).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.record_problem(name, ComponentStatus::Degraded, message.into())
            .await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.record_problem(name, ComponentStatus::Unhealthy, message.into())
            .await;
    }

    async fn record_problem(&self, name: &str, status: ComponentStatus, message: String) {
        let mut state = self.state.write().await;
        let failures = state
            .components
            .get(name)
            .map_or(0, |c| c.consecutive_failures);
        state.components.insert(
            name.to_string(),
            ComponentHealth::new(status, Some(message), failures + 1),
        );
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    pub async fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.state.read().await.components.get(name).cloned()
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        let status = state
            .components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse {
            status,
            components: state.components.clone(),
        }
    }

    /// Ready once started, as long as no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;
        if !state.ready {
            return ReadinessResponse {
                ready: false,
                reason: Some("sentinel not started".to_string()),
            };
        }

        let unhealthy: Vec<&str> = state
            .components
            .iter()
            .filter(|(_, c)| c.status == ComponentStatus::Unhealthy)
            .map(|(name, _)| name.as_str())
            .collect();
        if unhealthy.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("unhealthy: {}", unhealthy.join(", "))),
            }
        }
    }
}

/// Aggregate view of resource health
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    /// Current and peak live count per resource type
    pub resources: BTreeMap<ResourceType, TypeTotals>,
    /// 0 (failing) to 100 (healthy)
    pub health_score: f64,
    pub alerts: Vec<Alert>,
    pub load_trend: LoadTrend,
    pub leak_probabilities: Vec<(String, f64)>,
    pub isolated_plugins: Vec<String>,
}

/// 100 minus penalties for critical (15) and warning (5) alerts, the worst
/// leak probability (30) and each isolated plugin (10), clamped to [0, 100]
pub fn health_score(critical: usize, warning: usize, max_leak_probability: f64, isolated: usize) -> f64 {
    let score = 100.0
        - 15.0 * critical as f64
        - 5.0 * warning as f64
        - 30.0 * max_leak_probability.clamp(0.0, 1.0)
        - 10.0 * isolated as f64;
    score.clamp(0.0, 100.0)
}

pub struct HealthReporter {
    ledger: Arc<AllocationLedger>,
    alerts: Arc<AlertManager>,
    trend: Arc<TrendAnalyzer>,
    detector: Arc<LeakDetector>,
    orchestrator: Arc<RecoveryOrchestrator>,
    alert_window: Duration,
}

impl HealthReporter {
    pub fn new(
        ledger: Arc<AllocationLedger>,
        alerts: Arc<AlertManager>,
        trend: Arc<TrendAnalyzer>,
        detector: Arc<LeakDetector>,
        orchestrator: Arc<RecoveryOrchestrator>,
        alert_window: Duration,
    ) -> Self {
        Self {
            ledger,
            alerts,
            trend,
            detector,
            orchestrator,
            alert_window,
        }
    }

    pub fn build_report(&self) -> HealthReport {
        self.build_report_at(Utc::now())
    }

    pub fn build_report_at(&self, now: DateTime<Utc>) -> HealthReport {
        let alerts = self.alerts.alerts_since(now, self.alert_window);
        let critical = self.alerts.count_by_severity(&alerts, AlertSeverity::Critical);
        let warning = self.alerts.count_by_severity(&alerts, AlertSeverity::Warning);

        let leak_probabilities = self.detector.leak_probabilities();
        let max_probability = leak_probabilities
            .iter()
            .map(|(_, p)| *p)
            .fold(0.0, f64::max);
        let isolated_plugins = self.orchestrator.isolated_plugins();

        HealthReport {
            generated_at: now,
            resources: self.ledger.type_totals().into_iter().collect(),
            health_score: health_score(critical, warning, max_probability, isolated_plugins.len()),
            alerts,
            load_trend: self.trend.load_trend_at(now),
            leak_probabilities,
            isolated_plugins,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy_but_not_ready() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
        assert!(!registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_worst_component_wins() {
        let registry = HealthRegistry::new();
        registry.register(components::RELEASE_MONITOR).await;
        registry.register(components::LEAK_DETECTOR).await;

        registry.set_degraded(components::LEAK_DETECTOR, "scan failed").await;
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert!(health.status.is_operational());

        registry
            .set_unhealthy(components::RELEASE_MONITOR, "releaser unavailable")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_failures_counted_until_success() {
        let registry = HealthRegistry::new();
        registry.register(components::POOL_MANAGER).await;
        registry.set_degraded(components::POOL_MANAGER, "first").await;
        registry.set_degraded(components::POOL_MANAGER, "second").await;

        let pool = registry.component(components::POOL_MANAGER).await.unwrap();
        assert_eq!(pool.consecutive_failures, 2);
        assert_eq!(pool.message.as_deref(), Some("second"));

        registry.set_healthy(components::POOL_MANAGER).await;
        let pool = registry.component(components::POOL_MANAGER).await.unwrap();
        assert_eq!(pool.consecutive_failures, 0);
        assert!(pool.message.is_none());
    }

    #[tokio::test]
    async fn test_readiness_names_unhealthy_components() {
        let registry = HealthRegistry::new();
        registry.register(components::RECOVERY).await;
        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry.set_unhealthy(components::RECOVERY, "failed").await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("unhealthy: recovery"));
    }

    #[test]
    fn test_health_score_penalties() {
        assert_eq!(health_score(0, 0, 0.0, 0), 100.0);
        assert_eq!(health_score(1, 2, 0.0, 0), 75.0);
        assert_eq!(health_score(0, 0, 1.0, 1), 60.0);
        assert_eq!(health_score(10, 0, 0.0, 0), 0.0);
    }
}
