//! Preventive and emergency cleanup

use crate::config::{Environment, LeakConfig};
use crate::error::ReleaseError;
use crate::ledger::AllocationLedger;
use crate::models::{ResourceAllocation, ResourceType};
use crate::monitor::{Alert, AlertManager, AlertSeverity, AlertType};
use crate::pool::AdaptivePoolManager;
use crate::releaser::ResourceReleaser;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Outcome of preventive measures for one component
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PreventionReport {
    pub released: usize,
    pub reclaimed_bytes: u64,
    pub pools_reclaimed: usize,
}

/// Live count of one type above its configured limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThresholdBreach {
    pub resource_type: ResourceType,
    pub live: usize,
    pub limit: usize,
}

pub struct PreventionSystem {
    ledger: Arc<AllocationLedger>,
    releaser: Arc<dyn ResourceReleaser>,
    alerts: Arc<AlertManager>,
    pools: Option<Arc<AdaptivePoolManager>>,
    config: LeakConfig,
    environment: Environment,
}

impl PreventionSystem {
    pub fn new(
        ledger: Arc<AllocationLedger>,
        releaser: Arc<dyn ResourceReleaser>,
        alerts: Arc<AlertManager>,
        config: LeakConfig,
        environment: Environment,
    ) -> Self {
        Self {
            ledger,
            releaser,
            alerts,
            pools: None,
            config,
            environment,
        }
    }

    /// Also reclaim idle pools as part of preventive measures
    pub fn with_pool_manager(mut self, pools: Arc<AdaptivePoolManager>) -> Self {
        self.pools = Some(pools);
        self
    }

    fn lifetime_threshold(&self) -> Duration {
        Duration::from_millis(self.config.lifetime_threshold_ms)
    }

    pub async fn apply_preventive_measures(&self, component: &str) -> Result<PreventionReport, ReleaseError> {
        self.apply_preventive_measures_at(component, Utc::now()).await
    }

    /// Release a component's memory held past the lifetime threshold and
    /// reclaim idle pools
    pub async fn apply_preventive_measures_at(
        &self,
        component: &str,
        now: DateTime<Utc>,
    ) -> Result<PreventionReport, ReleaseError> {
        let threshold = self.lifetime_threshold();
        let stale: Vec<ResourceAllocation> = self
            .ledger
            .snapshot_owner(component)
            .into_iter()
            .filter(|a| a.resource_type == ResourceType::Memory && a.age(now) > threshold)
            .collect();

        let mut report = PreventionReport::default();
        for allocation in stale {
            self.releaser.force_release(&allocation).await?;
            if let Ok(Some(_)) = self.ledger.track_release_at(&allocation.id, now) {
                report.released += 1;
                report.reclaimed_bytes += allocation.estimated_bytes;
            }
        }

        if let Some(pools) = &self.pools {
            report.pools_reclaimed = pools.reclaim_idle_pools(now, threshold).await;
        }

        info!(
            component = %component,
            released = report.released,
            reclaimed_bytes = report.reclaimed_bytes,
            pools_reclaimed = report.pools_reclaimed,
            "Preventive measures applied"
        );
        Ok(report)
    }

    /// Release everything a component owns
    ///
    /// Returns `Ok(None)` when emergency cleanup is not permitted in this
    /// environment. Every allocation is attempted; the first failure is
    /// returned after the pass.
    pub async fn emergency_cleanup(&self, component: &str) -> Result<Option<usize>, ReleaseError> {
        if !self.config.emergency_cleanup.is_active(self.environment) {
            warn!(
                component = %component,
                environment = ?self.environment,
                "Emergency cleanup not permitted in this environment"
            );
            return Ok(None);
        }

        let now = Utc::now();
        let mut released = 0;
        let mut first_error = None;
        for allocation in self.ledger.snapshot_owner(component) {
            match self.releaser.force_release(&allocation).await {
                Ok(()) => {
                    if let Ok(Some(_)) = self.ledger.track_release_at(&allocation.id, now) {
                        released += 1;
                    }
                }
                Err(e) => {
                    error!(id = %allocation.id, error = %e, "Emergency release failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        warn!(component = %component, released, "Emergency cleanup executed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(Some(released)),
        }
    }

    /// Compare live counts per type against configured limits, raising an
    /// alert for each breach
    pub fn check_thresholds(&self, snapshot: &[ResourceAllocation]) -> Vec<ThresholdBreach> {
        let mut live: BTreeMap<ResourceType, usize> = BTreeMap::new();
        for allocation in snapshot.iter().filter(|a| a.is_active()) {
            *live.entry(allocation.resource_type).or_default() += 1;
        }

        let mut breaches = Vec::new();
        for (resource_type, count) in live {
            let Some(limit) = self.config.type_limits.get(&resource_type).copied() else {
                continue;
            };
            if count > limit {
                self.alerts.raise(
                    Alert::new(
                        AlertType::ThresholdBreach,
                        AlertSeverity::Warning,
                        resource_type.as_str(),
                        format!("{} live {} allocations exceed limit {}", count, resource_type, limit),
                    )
                    .with_label("resource_type", resource_type)
                    .with_label("limit", limit),
                );
                breaches.push(ThresholdBreach {
                    resource_type,
                    live: count,
                    limit,
                });
            }
        }
        breaches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::releaser::testing::FlakyReleaser;
    use crate::releaser::InProcessReleaser;

    fn system(
        ledger: Arc<AllocationLedger>,
        releaser: Arc<dyn ResourceReleaser>,
        environment: Environment,
    ) -> PreventionSystem {
        PreventionSystem::new(
            ledger,
            releaser,
            Arc::new(AlertManager::new()),
            LeakConfig::default(),
            environment,
        )
    }

    #[tokio::test]
    async fn test_preventive_measures_release_old_memory_only() {
        let ledger = Arc::new(AllocationLedger::default());
        let now = Utc::now();
        let old = now - chrono::Duration::minutes(10);
        ledger
            .insert(ResourceAllocation::new("m-old", ResourceType::Memory, "p1", old).with_estimated_bytes(4096))
            .unwrap();
        ledger
            .insert(ResourceAllocation::new("m-new", ResourceType::Memory, "p1", now))
            .unwrap();
        ledger
            .insert(ResourceAllocation::new("h-old", ResourceType::FileHandle, "p1", old))
            .unwrap();
        ledger
            .insert(ResourceAllocation::new("m-other", ResourceType::Memory, "p2", old))
            .unwrap();

        let prevention = system(ledger.clone(), Arc::new(InProcessReleaser), Environment::Development);
        let report = prevention.apply_preventive_measures_at("p1", now).await.unwrap();

        assert_eq!(report.released, 1);
        assert_eq!(report.reclaimed_bytes, 4096);
        assert!(!ledger.is_live("m-old"));
        assert!(ledger.is_live("m-new"));
        assert!(ledger.is_live("h-old"));
        assert!(ledger.is_live("m-other"));
    }

    #[tokio::test]
    async fn test_emergency_cleanup_gated_by_environment() {
        let ledger = Arc::new(AllocationLedger::default());
        ledger.track_allocation("h1", ResourceType::FileHandle, "p1").unwrap();

        let production = system(ledger.clone(), Arc::new(InProcessReleaser), Environment::Production);
        assert_eq!(production.emergency_cleanup("p1").await.unwrap(), None);
        assert!(ledger.is_live("h1"));

        let staging = system(ledger.clone(), Arc::new(InProcessReleaser), Environment::Staging);
        assert_eq!(staging.emergency_cleanup("p1").await.unwrap(), Some(1));
        assert_eq!(ledger.live_count(), 0);
    }

    #[tokio::test]
    async fn test_emergency_cleanup_attempts_everything() {
        let ledger = Arc::new(AllocationLedger::default());
        ledger.track_allocation("h1", ResourceType::FileHandle, "p1").unwrap();
        ledger.track_allocation("h2", ResourceType::FileHandle, "p1").unwrap();

        let releaser = Arc::new(FlakyReleaser::failing(&["h1"]));
        let prevention = system(ledger.clone(), releaser.clone(), Environment::Development);
        assert!(prevention.emergency_cleanup("p1").await.is_err());
        assert!(ledger.is_live("h1"));
        assert!(!ledger.is_live("h2"));
        assert_eq!(releaser.attempts_for("h2"), 1);
    }

    #[test]
    fn test_threshold_breaches_raise_alerts() {
        let ledger = Arc::new(AllocationLedger::default());
        let alerts = Arc::new(AlertManager::new());
        let mut config = LeakConfig::default();
        config.type_limits.insert(ResourceType::DatabaseConnection, 2);
        let prevention = PreventionSystem::new(
            ledger.clone(),
            Arc::new(InProcessReleaser),
            alerts.clone(),
            config,
            Environment::Development,
        );

        for i in 0..3 {
            ledger
                .track_allocation(&format!("db{}", i), ResourceType::DatabaseConnection, "p1")
                .unwrap();
        }
        let breaches = prevention.check_thresholds(&ledger.snapshot());
        assert_eq!(
            breaches,
            vec![ThresholdBreach {
                resource_type: ResourceType::DatabaseConnection,
                live: 3,
                limit: 2
            }]
        );
        assert_eq!(alerts.recent_alerts()[0].alert_type, AlertType::ThresholdBreach);
    }
}
