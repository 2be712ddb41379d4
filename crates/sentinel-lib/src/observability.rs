//! Observability infrastructure for the sentinel
//!
//! Provides:
//! - Prometheus metrics (live allocations, orphans, leak probability, sweep and scan latency, recovery attempts)
//! - Structured JSON logging with tracing, including per-operation metric events

use crate::ledger::LedgerEvent;
use crate::models::{ResourceAllocation, ResourceType};
use crate::pool::OrphanSink;
use chrono::{DateTime, Utc};
use prometheus::{
    register_gauge, register_gauge_vec, register_histogram_vec, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Gauge, GaugeVec, HistogramVec, IntCounterVec,
    IntGauge, IntGaugeVec,
};
use serde::Serialize;
use std::sync::OnceLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Default histogram buckets for cycle durations (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<SentinelMetricsInner> = OnceLock::new();

struct SentinelMetricsInner {
    allocations_live: IntGaugeVec,
    allocation_operations: IntCounterVec,
    leak_probability: GaugeVec,
    cycle_duration_seconds: HistogramVec,
    recovery_attempts: IntCounterVec,
    pools_active: IntGauge,
    isolated_plugins: IntGauge,
    health_score: Gauge,
}

impl SentinelMetricsInner {
    fn new() -> Self {
        Self {
            allocations_live: register_int_gauge_vec!(
                "sentinel_allocations_live",
                "Live tracked allocations per resource type",
                &["resource_type"]
            )
            .expect("Failed to register allocations_live"),

            allocation_operations: register_int_counter_vec!(
                "sentinel_allocation_operations_total",
                "Ledger operations per resource type",
                &["resource_type", "operation"]
            )
            .expect("Failed to register allocation_operations"),

            leak_probability: register_gauge_vec!(
                "sentinel_leak_probability",
                "Latest leak probability per component",
                &["component"]
            )
            .expect("Failed to register leak_probability"),

            cycle_duration_seconds: register_histogram_vec!(
                "sentinel_cycle_duration_seconds",
                "Duration of background cycles",
                &["job"],
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            recovery_attempts: register_int_counter_vec!(
                "sentinel_recovery_attempts_total",
                "Recovery attempts by strategy and outcome",
                &["strategy", "outcome"]
            )
            .expect("Failed to register recovery_attempts"),

            pools_active: register_int_gauge!(
                "sentinel_pools_active",
                "Pre-allocated pools currently held"
            )
            .expect("Failed to register pools_active"),

            isolated_plugins: register_int_gauge!(
                "sentinel_isolated_plugins",
                "Plugins currently running isolated"
            )
            .expect("Failed to register isolated_plugins"),

            health_score: register_gauge!(
                "sentinel_health_score",
                "Aggregate health score from 0 to 100"
            )
            .expect("Failed to register health_score"),
        }
    }
}

/// Sentinel metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same
/// underlying series.
#[derive(Clone)]
pub struct SentinelMetrics {
    inner: &'static SentinelMetricsInner,
}

impl Default for SentinelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SentinelMetrics {
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(SentinelMetricsInner::new),
        }
    }

    pub fn set_live_allocations(&self, resource_type: ResourceType, count: i64) {
        self.inner
            .allocations_live
            .with_label_values(&[resource_type.as_str()])
            .set(count);
    }

    pub fn inc_operation(&self, resource_type: ResourceType, operation: &str) {
        self.inner
            .allocation_operations
            .with_label_values(&[resource_type.as_str(), operation])
            .inc();
    }

    pub fn set_leak_probability(&self, component: &str, probability: f64) {
        self.inner
            .leak_probability
            .with_label_values(&[component])
            .set(probability);
    }

    pub fn observe_cycle(&self, job: &str, duration_secs: f64) {
        self.inner
            .cycle_duration_seconds
            .with_label_values(&[job])
            .observe(duration_secs);
    }

    pub fn inc_recovery_attempt(&self, strategy: &str, outcome: &str) {
        self.inner
            .recovery_attempts
            .with_label_values(&[strategy, outcome])
            .inc();
    }

    pub fn set_pools_active(&self, count: i64) {
        self.inner.pools_active.set(count);
    }

    pub fn set_isolated_plugins(&self, count: i64) {
        self.inner.isolated_plugins.set(count);
    }

    pub fn set_health_score(&self, score: f64) {
        self.inner.health_score.set(score);
    }
}

/// One ledger operation or forced release, as consumed by reporting surfaces
#[derive(Debug, Clone, Serialize)]
pub struct MetricEvent {
    pub resource_type: ResourceType,
    pub operation: &'static str,
    pub resource_id: String,
    pub owner: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
}

impl MetricEvent {
    pub fn new(
        resource_type: ResourceType,
        operation: &'static str,
        resource_id: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            operation,
            resource_id: resource_id.into(),
            owner: owner.into(),
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn from_ledger_event(event: &LedgerEvent) -> Self {
        match event {
            LedgerEvent::Allocated(a) => Self::new(a.resource_type, "allocated", &a.id, &a.owner),
            LedgerEvent::Released(r) => Self::new(r.resource_type, "released", &r.id, &r.owner),
            LedgerEvent::Orphaned(a) => Self::new(a.resource_type, "orphaned", &a.id, &a.owner),
        }
    }

    pub fn forced_release(allocation: &ResourceAllocation) -> Self {
        Self::new(
            allocation.resource_type,
            "forced_release",
            &allocation.id,
            &allocation.owner,
        )
    }
}

/// Structured logger for sentinel events
///
/// Emits named events with the instance name attached so a log pipeline can
/// aggregate across hosts.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
    metrics: SentinelMetrics,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            metrics: SentinelMetrics::new(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Log a metric event and count it
    pub fn log_metric_event(&self, event: &MetricEvent) {
        self.metrics.inc_operation(event.resource_type, event.operation);
        info!(
            event = "metric_event",
            instance = %self.instance,
            resource_type = %event.resource_type,
            operation = event.operation,
            resource_id = %event.resource_id,
            owner = %event.owner,
            timestamp = %event.timestamp,
            correlation_id = %event.correlation_id,
            "Resource operation"
        );
    }

    pub fn log_orphan_batch(&self, batch: &[ResourceAllocation]) {
        for allocation in batch {
            warn!(
                event = "allocation_orphaned",
                instance = %self.instance,
                resource_id = %allocation.id,
                resource_type = %allocation.resource_type,
                owner = %allocation.owner,
                allocated_at = %allocation.allocated_at,
                "Allocation orphaned"
            );
        }
    }

    pub fn log_leak_suspected(&self, component: &str, probability: f64, memory_confidence: f64) {
        self.metrics.set_leak_probability(component, probability);
        warn!(
            event = "leak_suspected",
            instance = %self.instance,
            component = %component,
            probability,
            memory_confidence,
            "Leak suspected"
        );
    }

    pub fn log_recovery_failed(&self, component: &str, errors: &[String]) {
        error!(
            event = "recovery_failed",
            instance = %self.instance,
            component = %component,
            errors = ?errors,
            "Automatic recovery failed"
        );
    }

    pub fn log_health_report(&self, health_score: f64, alerts: usize, isolated: usize) {
        self.metrics.set_health_score(health_score);
        self.metrics.set_isolated_plugins(isolated as i64);
        info!(
            event = "health_report",
            instance = %self.instance,
            health_score,
            alerts,
            isolated,
            "Health report"
        );
    }

    pub fn log_startup(&self, version: &str, environment: &str) {
        info!(
            event = "sentinel_started",
            instance = %self.instance,
            version = %version,
            environment = %environment,
            "Resource sentinel started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "sentinel_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Resource sentinel shutting down"
        );
    }
}

impl OrphanSink for StructuredLogger {
    fn handle_orphaned_resources(&self, batch: &[ResourceAllocation]) {
        self.log_orphan_batch(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ReleaseEvent;
    use std::time::Duration;

    #[test]
    fn test_metrics_handles_share_registry() {
        let metrics = SentinelMetrics::new();
        metrics.set_live_allocations(ResourceType::Memory, 3);
        metrics.inc_operation(ResourceType::FileHandle, "allocated");
        metrics.observe_cycle("sweep", 0.01);
        metrics.inc_recovery_attempt("restart", "succeeded");

        let again = SentinelMetrics::new();
        again.set_pools_active(2);
        assert!(std::ptr::eq(metrics.inner, again.inner));
    }

    #[test]
    fn test_metric_events_carry_unique_correlation_ids() {
        let release = LedgerEvent::Released(ReleaseEvent {
            id: "r1".to_string(),
            resource_type: ResourceType::NetworkSocket,
            owner: "p1".to_string(),
            lifetime: Duration::from_secs(1),
            released_at: Utc::now(),
        });
        let a = MetricEvent::from_ledger_event(&release);
        let b = MetricEvent::from_ledger_event(&release);

        assert_eq!(a.operation, "released");
        assert_eq!(a.resource_type, ResourceType::NetworkSocket);
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-instance");
        assert_eq!(logger.instance(), "test-instance");
        logger.log_metric_event(&MetricEvent::new(ResourceType::Memory, "allocated", "m1", "p1"));
    }
}
