//! Leak detection
//!
//! Two mechanisms feed the detector: liveness scans over owner-held tokens,
//! and per-type heuristic scoring of a component's allocations. Scores above
//! the auto-recovery threshold trigger forced releases.

use super::growth::GrowthAnalyzer;
use super::prevention::PreventionSystem;
use super::scoring::{LeakScoring, LeakSignals};
use crate::config::{Environment, LeakConfig};
use crate::error::{MonitorError, ReleaseError};
use crate::ledger::AllocationLedger;
use crate::models::{ResourceAllocation, ResourceType};
use crate::monitor::{Alert, AlertManager, AlertSeverity, AlertType};
use crate::pool::{OrphanSink, POOL_OWNER};
use crate::recovery::HealthSignal;
use crate::releaser::ResourceReleaser;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Types released independently by auto-recovery
const FORCE_RELEASED_TYPES: [ResourceType; 3] = [
    ResourceType::FileHandle,
    ResourceType::NetworkSocket,
    ResourceType::DatabaseConnection,
];

const FAILURE_HISTORY: usize = 50;

/// Result of one liveness scan
#[derive(Debug, Clone, Serialize)]
pub struct LivenessReport {
    pub scanned: usize,
    pub leaked: Vec<ResourceAllocation>,
    pub reclaimed_bytes: u64,
    pub scanned_at: DateTime<Utc>,
}

/// Leak metrics of one resource type for one component
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceTypeMetrics {
    pub resource_type: ResourceType,
    pub current_count: usize,
    pub peak_count: usize,
    pub unreleased_count: usize,
    pub unreleased_ratio: f64,
    pub average_lifetime_ms: f64,
    pub growth_rate_percent: f64,
    pub leak_probability: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeakAnalysis {
    pub component: String,
    pub analyzed_at: DateTime<Utc>,
    pub metrics: Vec<ResourceTypeMetrics>,
    /// Memory-leak confidence in percent
    pub memory_leak_confidence: f64,
}

impl LeakAnalysis {
    pub fn max_probability(&self) -> f64 {
        self.metrics
            .iter()
            .map(|m| m.leak_probability)
            .fold(0.0, f64::max)
    }

    pub fn metrics_for(&self, resource_type: ResourceType) -> Option<&ResourceTypeMetrics> {
        self.metrics.iter().find(|m| m.resource_type == resource_type)
    }
}

/// A failed auto-recovery attempt with the analysis it acted on
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryFailure {
    pub component: String,
    pub recorded_at: DateTime<Utc>,
    pub errors: Vec<String>,
    /// Serialized [`LeakAnalysis`]
    pub analysis: String,
}

/// Summary of one periodic leak-scan cycle
#[derive(Debug, Clone, Serialize)]
pub struct ScanCycleReport {
    pub liveness: LivenessReport,
    pub components_analyzed: usize,
    pub recoveries_attempted: usize,
    pub recoveries_failed: usize,
    pub max_probability: f64,
}

#[derive(Debug, Clone, Copy)]
struct LivenessSample {
    timestamp: i64,
    live_memory_bytes: u64,
    dead_ratio: f64,
}

pub struct LeakDetector {
    ledger: Arc<AllocationLedger>,
    releaser: Arc<dyn ResourceReleaser>,
    prevention: Arc<PreventionSystem>,
    alerts: Arc<AlertManager>,
    scoring: LeakScoring,
    growth: GrowthAnalyzer,
    config: LeakConfig,
    environment: Environment,
    /// Live count per (component, type) at the previous analysis
    previous_counts: DashMap<(String, ResourceType), usize>,
    /// Latest leak probability per component
    probabilities: DashMap<String, f64>,
    liveness_history: Mutex<VecDeque<LivenessSample>>,
    failures: Mutex<VecDeque<RecoveryFailure>>,
    reclaimed_bytes: AtomicU64,
    signals: Option<mpsc::Sender<HealthSignal>>,
    orphan_sink: Option<Arc<dyn OrphanSink>>,
}

impl LeakDetector {
    pub fn new(
        ledger: Arc<AllocationLedger>,
        releaser: Arc<dyn ResourceReleaser>,
        prevention: Arc<PreventionSystem>,
        alerts: Arc<AlertManager>,
        config: LeakConfig,
        environment: Environment,
    ) -> Self {
        Self {
            ledger,
            releaser,
            prevention,
            alerts,
            scoring: LeakScoring::from_config(&config),
            growth: GrowthAnalyzer::default(),
            config,
            environment,
            previous_counts: DashMap::new(),
            probabilities: DashMap::new(),
            liveness_history: Mutex::new(VecDeque::new()),
            failures: Mutex::new(VecDeque::new()),
            reclaimed_bytes: AtomicU64::new(0),
            signals: None,
            orphan_sink: None,
        }
    }

    /// Publish leak signals to the recovery orchestrator
    pub fn with_signals(mut self, signals: mpsc::Sender<HealthSignal>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Hand liveness-scan orphans to a sink
    pub fn with_orphan_sink(mut self, sink: Arc<dyn OrphanSink>) -> Self {
        self.orphan_sink = Some(sink);
        self
    }

    pub fn scan_liveness(&self) -> LivenessReport {
        self.scan_liveness_at(Utc::now())
    }

    /// Remove every record whose owner dropped its liveness guard
    pub fn scan_liveness_at(&self, now: DateTime<Utc>) -> LivenessReport {
        let scanned = self.ledger.probe_count();
        let mut leaked = Vec::new();
        let mut reclaimed_bytes = 0;

        for id in self.ledger.dead_probes() {
            // Already removed by a concurrent release
            let Some(record) = self.ledger.mark_orphaned(&id, now) else {
                continue;
            };
            reclaimed_bytes += record.estimated_bytes;
            warn!(
                id = %record.id,
                owner = %record.owner,
                resource_type = %record.resource_type,
                estimated_bytes = record.estimated_bytes,
                "Unreachable resource removed from ledger"
            );
            self.alerts.raise(
                Alert::new(
                    AlertType::LeakSuspected,
                    AlertSeverity::Warning,
                    &record.owner,
                    format!("{} dropped without release", record.id),
                )
                .with_label("resource_type", record.resource_type)
                .at(now),
            );
            leaked.push(record);
        }

        self.reclaimed_bytes.fetch_add(reclaimed_bytes, Ordering::Relaxed);
        if let Some(sink) = &self.orphan_sink {
            if !leaked.is_empty() {
                sink.handle_orphaned_resources(&leaked);
            }
        }

        let live_memory_bytes = self
            .ledger
            .snapshot()
            .iter()
            .filter(|a| a.resource_type == ResourceType::Memory && a.owner != POOL_OWNER)
            .map(|a| a.estimated_bytes)
            .sum();
        let dead_ratio = if scanned == 0 {
            0.0
        } else {
            leaked.len() as f64 / scanned as f64
        };
        {
            let mut history = self.liveness_history.lock().unwrap_or_else(|e| e.into_inner());
            history.push_back(LivenessSample {
                timestamp: now.timestamp(),
                live_memory_bytes,
                dead_ratio,
            });
            while history.len() > self.config.liveness_history.max(1) {
                history.pop_front();
            }
        }

        debug!(scanned, leaked = leaked.len(), reclaimed_bytes, "Liveness scan complete");
        LivenessReport {
            scanned,
            leaked,
            reclaimed_bytes,
            scanned_at: now,
        }
    }

    /// Memory-leak confidence in percent from the liveness history
    ///
    /// The larger of the memory growth confidence and the mean dead-probe
    /// ratio across retained scans.
    pub fn memory_leak_confidence(&self) -> f64 {
        let history = self.liveness_history.lock().unwrap_or_else(|e| e.into_inner());
        if history.is_empty() {
            return 0.0;
        }
        let samples: Vec<(i64, u64)> = history
            .iter()
            .map(|s| (s.timestamp, s.live_memory_bytes))
            .collect();
        let growth = self
            .growth
            .detect(&samples)
            .map(|g| g.confidence)
            .unwrap_or(0.0);
        let dead = history.iter().map(|s| s.dead_ratio).sum::<f64>() / history.len() as f64;
        (growth.max(dead) * 100.0).clamp(0.0, 100.0)
    }

    pub fn analyze_resource_usage(&self, component: &str) -> Result<LeakAnalysis, MonitorError> {
        self.analyze_resource_usage_at(component, Utc::now())
    }

    /// Score every resource type the component has ever allocated
    pub fn analyze_resource_usage_at(
        &self,
        component: &str,
        now: DateTime<Utc>,
    ) -> Result<LeakAnalysis, MonitorError> {
        if component.is_empty() {
            return Err(MonitorError::Metrics {
                component: component.to_string(),
                reason: "component id must not be empty".to_string(),
            });
        }

        let live = self.ledger.snapshot_owner(component);
        let mut metrics = Vec::new();
        for resource_type in ResourceType::ALL {
            let counters = self.ledger.type_counters(component, resource_type);
            if counters.allocated == 0 {
                continue;
            }

            let ages_ms: Vec<f64> = live
                .iter()
                .filter(|a| a.resource_type == resource_type)
                .map(|a| a.age(now).as_millis() as f64)
                .collect();
            let unreleased_count = ages_ms.len();
            let average_lifetime_ms = if ages_ms.is_empty() {
                0.0
            } else {
                ages_ms.iter().sum::<f64>() / ages_ms.len() as f64
            };

            let previous = self
                .previous_counts
                .insert((component.to_string(), resource_type), unreleased_count);
            let growth_rate_percent = match previous {
                None => 0.0,
                Some(0) if unreleased_count > 0 => 100.0,
                Some(0) => 0.0,
                Some(p) => (unreleased_count as f64 - p as f64) / p as f64 * 100.0,
            };

            let signals = LeakSignals {
                unreleased_ratio: unreleased_count as f64 / counters.allocated as f64,
                average_lifetime_ms,
                growth_rate_percent,
            };
            metrics.push(ResourceTypeMetrics {
                resource_type,
                current_count: counters.live,
                peak_count: counters.peak_live,
                unreleased_count,
                unreleased_ratio: signals.unreleased_ratio,
                average_lifetime_ms,
                growth_rate_percent,
                leak_probability: self.scoring.score(&signals),
            });
        }

        let analysis = LeakAnalysis {
            component: component.to_string(),
            analyzed_at: now,
            metrics,
            memory_leak_confidence: self.memory_leak_confidence(),
        };
        self.probabilities
            .insert(component.to_string(), analysis.max_probability());

        if analysis.max_probability() > self.config.auto_recovery_threshold {
            self.report_suspected_leak(&analysis);
        }
        Ok(analysis)
    }

    fn report_suspected_leak(&self, analysis: &LeakAnalysis) {
        let threshold = self.config.auto_recovery_threshold;
        let leaking: Vec<&ResourceTypeMetrics> = analysis
            .metrics
            .iter()
            .filter(|m| m.leak_probability > threshold)
            .collect();

        self.alerts.raise(
            Alert::new(
                AlertType::LeakSuspected,
                AlertSeverity::Warning,
                &analysis.component,
                format!(
                    "leak probability {:.2} across {} resource types",
                    analysis.max_probability(),
                    leaking.len()
                ),
            )
            .at(analysis.analyzed_at),
        );

        let memory_leaks: usize = leaking
            .iter()
            .filter(|m| m.resource_type == ResourceType::Memory)
            .map(|m| m.unreleased_count)
            .sum();
        let handle_leaks: usize = leaking
            .iter()
            .filter(|m| FORCE_RELEASED_TYPES.contains(&m.resource_type))
            .map(|m| m.unreleased_count)
            .sum();
        if memory_leaks == 0 && handle_leaks == 0 {
            return;
        }

        if let Some(signals) = &self.signals {
            let signal = HealthSignal::leaking(
                &analysis.component,
                memory_leaks as u32,
                handle_leaks as u32,
            );
            if let Err(e) = signals.try_send(signal) {
                warn!(component = %analysis.component, error = %e, "Dropped leak signal");
            }
        }
    }

    pub async fn try_auto_recover(&self, component: &str) -> bool {
        let now = Utc::now();
        match self.analyze_resource_usage_at(component, now) {
            Ok(analysis) => self.recover_from(&analysis, now).await,
            Err(e) => {
                self.record_failure(component, vec![e.to_string()], None, now);
                false
            }
        }
    }

    /// Run forced releases and preventive measures for an analysis
    ///
    /// All actions run concurrently and are awaited jointly. Any failure
    /// records a recovery failure and returns false.
    pub async fn recover_from(&self, analysis: &LeakAnalysis, now: DateTime<Utc>) -> bool {
        if !self.config.auto_recovery.is_active(self.environment) {
            debug!(component = %analysis.component, "Auto-recovery disabled");
            return false;
        }

        let threshold = self.config.auto_recovery_threshold;
        let mut actions: JoinSet<Result<usize, ReleaseError>> = JoinSet::new();

        for metrics in analysis
            .metrics
            .iter()
            .filter(|m| FORCE_RELEASED_TYPES.contains(&m.resource_type))
            .filter(|m| m.leak_probability > threshold)
        {
            let ledger = self.ledger.clone();
            let releaser = self.releaser.clone();
            let component = analysis.component.clone();
            let resource_type = metrics.resource_type;
            actions.spawn(async move {
                force_release_type(&ledger, releaser.as_ref(), &component, resource_type, now).await
            });
        }

        if analysis.memory_leak_confidence >= self.config.memory_confidence_threshold_percent {
            let prevention = self.prevention.clone();
            let component = analysis.component.clone();
            actions.spawn(async move {
                prevention
                    .apply_preventive_measures_at(&component, now)
                    .await
                    .map(|report| report.released)
            });
        }

        if actions.is_empty() {
            return true;
        }

        let mut released = 0;
        let mut errors = Vec::new();
        while let Some(result) = actions.join_next().await {
            match result {
                Ok(Ok(count)) => released += count,
                Ok(Err(e)) => errors.push(e.to_string()),
                Err(e) => errors.push(format!("recovery task aborted: {}", e)),
            }
        }

        if errors.is_empty() {
            info!(component = %analysis.component, released, "Auto-recovery succeeded");
            true
        } else {
            self.record_failure(&analysis.component, errors, Some(analysis), now);
            false
        }
    }

    fn record_failure(
        &self,
        component: &str,
        errors: Vec<String>,
        analysis: Option<&LeakAnalysis>,
        now: DateTime<Utc>,
    ) {
        let analysis = match analysis.map(serde_json::to_string) {
            Some(Ok(json)) => json,
            Some(Err(e)) => format!("{{\"serialization_error\":\"{}\"}}", e),
            None => "null".to_string(),
        };
        error!(
            component = %component,
            errors = ?errors,
            "Auto-recovery failed"
        );
        self.alerts.raise(
            Alert::new(
                AlertType::RecoveryFailed,
                AlertSeverity::Critical,
                component,
                errors.join("; "),
            )
            .at(now),
        );

        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.push_back(RecoveryFailure {
            component: component.to_string(),
            recorded_at: now,
            errors,
            analysis,
        });
        while failures.len() > FAILURE_HISTORY {
            failures.pop_front();
        }
    }

    /// Liveness scan, then analysis and recovery for every component
    pub async fn run_scan_cycle(&self, now: DateTime<Utc>) -> ScanCycleReport {
        let liveness = self.scan_liveness_at(now);
        self.prevention.check_thresholds(&self.ledger.snapshot());

        let mut report = ScanCycleReport {
            liveness,
            components_analyzed: 0,
            recoveries_attempted: 0,
            recoveries_failed: 0,
            max_probability: 0.0,
        };

        for component in self.ledger.owners() {
            if component == POOL_OWNER {
                continue;
            }
            let analysis = match self.analyze_resource_usage_at(&component, now) {
                Ok(analysis) => analysis,
                Err(e) => {
                    error!(component = %component, error = %e, "Leak analysis failed");
                    continue;
                }
            };
            report.components_analyzed += 1;
            report.max_probability = report.max_probability.max(analysis.max_probability());

            let needs_recovery = analysis.max_probability() > self.config.auto_recovery_threshold
                || analysis.memory_leak_confidence >= self.config.memory_confidence_threshold_percent;
            if needs_recovery && self.config.auto_recovery.is_active(self.environment) {
                report.recoveries_attempted += 1;
                if !self.recover_from(&analysis, now).await {
                    report.recoveries_failed += 1;
                }
            }
        }
        report
    }

    /// Latest leak probability per component
    pub fn leak_probabilities(&self) -> Vec<(String, f64)> {
        let mut probabilities: Vec<(String, f64)> = self
            .probabilities
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        probabilities.sort_by(|a, b| a.0.cmp(&b.0));
        probabilities
    }

    pub fn recovery_failures(&self) -> Vec<RecoveryFailure> {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn reclaimed_bytes(&self) -> u64 {
        self.reclaimed_bytes.load(Ordering::Relaxed)
    }
}

async fn force_release_type(
    ledger: &AllocationLedger,
    releaser: &dyn ResourceReleaser,
    component: &str,
    resource_type: ResourceType,
    now: DateTime<Utc>,
) -> Result<usize, ReleaseError> {
    let mut released = 0;
    for allocation in ledger
        .snapshot_owner(component)
        .into_iter()
        .filter(|a| a.resource_type == resource_type)
    {
        releaser.force_release(&allocation).await?;
        if let Ok(Some(_)) = ledger.track_release_at(&allocation.id, now) {
            released += 1;
        }
    }
    if released > 0 {
        info!(component = %component, resource_type = %resource_type, released, "Forced release complete");
    }
    Ok(released)
}
