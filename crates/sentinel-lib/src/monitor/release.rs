//! Release monitor
//!
//! Periodic sweep over the ledger snapshot. Stuck allocations are alerted
//! and left in place; allocations failing the validity check are released
//! and removed as orphans. Release failures are counted per id across
//! sweeps, and an id that exhausts its retries is parked for manual
//! intervention.

use super::alerts::{Alert, AlertManager, AlertSeverity, AlertType};
use crate::config::MonitorConfig;
use crate::ledger::AllocationLedger;
use crate::models::ResourceAllocation;
use crate::pool::OrphanSink;
use crate::releaser::ResourceReleaser;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of one sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Ids idle past the stuck timeout
    pub stuck: Vec<String>,
    /// Records removed as orphans
    pub orphaned: Vec<ResourceAllocation>,
    /// Ids parked after exhausting their release retries
    pub retry_exhausted: Vec<String>,
    /// Ids whose release failed this sweep and will be retried
    pub failed: Vec<String>,
    pub tombstones_purged: usize,
}

pub struct ReleaseMonitor {
    ledger: Arc<AllocationLedger>,
    releaser: Arc<dyn ResourceReleaser>,
    alerts: Arc<AlertManager>,
    config: MonitorConfig,
    /// Consecutive release failures per id
    failures: DashMap<String, u32>,
    /// Ids left for manual or emergency intervention
    parked: DashMap<String, DateTime<Utc>>,
    orphan_sinks: Vec<Arc<dyn OrphanSink>>,
    sweeps: AtomicU64,
}

impl ReleaseMonitor {
    pub fn new(
        ledger: Arc<AllocationLedger>,
        releaser: Arc<dyn ResourceReleaser>,
        alerts: Arc<AlertManager>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            ledger,
            releaser,
            alerts,
            config,
            failures: DashMap::new(),
            parked: DashMap::new(),
            orphan_sinks: Vec::new(),
            sweeps: AtomicU64::new(0),
        }
    }

    /// Add a receiver for each sweep's orphan batch
    pub fn with_orphan_sink(mut self, sink: Arc<dyn OrphanSink>) -> Self {
        self.orphan_sinks.push(sink);
        self
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let stuck_timeout = self.config.stuck_timeout();
        let orphan_timeout = self.config.orphan_timeout();
        let mut report = SweepReport::default();

        for allocation in self.ledger.snapshot() {
            if self.parked.contains_key(&allocation.id) {
                continue;
            }

            let idle = allocation.idle_for(now);
            if idle > stuck_timeout {
                report.stuck.push(allocation.id.clone());
                self.alerts.raise(
                    Alert::new(
                        AlertType::StuckAllocation,
                        AlertSeverity::Warning,
                        &allocation.id,
                        format!(
                            "{} held by {} idle for {}s",
                            allocation.resource_type,
                            allocation.owner,
                            idle.as_secs()
                        ),
                    )
                    .with_label("owner", &allocation.owner)
                    .with_label("resource_type", allocation.resource_type)
                    .at(now),
                );
            }

            let probe_dead = self
                .ledger
                .probe(&allocation.id)
                .is_some_and(|p| !p.is_alive());
            let invalid = !allocation.is_active() || probe_dead || idle >= orphan_timeout;
            if !invalid {
                continue;
            }

            match self.releaser.force_release(&allocation).await {
                Ok(()) => {
                    self.failures.remove(&allocation.id);
                    // A concurrent release already removed it; nothing to do
                    if let Some(record) = self.ledger.mark_orphaned(&allocation.id, now) {
                        report.orphaned.push(record);
                    }
                }
                Err(e) => self.record_failure(&allocation, &e.to_string(), now, &mut report),
            }
        }

        if !report.orphaned.is_empty() {
            for sink in &self.orphan_sinks {
                sink.handle_orphaned_resources(&report.orphaned);
            }
            let ids: Vec<&str> = report.orphaned.iter().map(|a| a.id.as_str()).collect();
            info!(
                event = "orphan_batch",
                count = ids.len(),
                ids = ?ids,
                "Orphaned allocations removed"
            );
        }

        // Drop bookkeeping for ids released elsewhere
        self.failures.retain(|id, _| self.ledger.is_live(id));
        self.parked.retain(|id, _| self.ledger.is_live(id));
        report.tombstones_purged = self.ledger.purge_tombstones(now);

        self.sweeps.fetch_add(1, Ordering::Relaxed);
        debug!(
            stuck = report.stuck.len(),
            orphaned = report.orphaned.len(),
            failed = report.failed.len(),
            retry_exhausted = report.retry_exhausted.len(),
            "Sweep complete"
        );
        report
    }

    fn record_failure(
        &self,
        allocation: &ResourceAllocation,
        reason: &str,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let attempts = {
            let mut count = self.failures.entry(allocation.id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if attempts >= self.config.max_release_retries {
            self.parked.insert(allocation.id.clone(), now);
            error!(
                id = %allocation.id,
                owner = %allocation.owner,
                resource_type = %allocation.resource_type,
                attempts,
                reason = %reason,
                "Release retries exhausted, leaving resource for manual intervention"
            );
            self.alerts.raise(
                Alert::new(
                    AlertType::ReleaseRetryExhausted,
                    AlertSeverity::Critical,
                    &allocation.id,
                    format!("release failed {} times: {}", attempts, reason),
                )
                .with_label("owner", &allocation.owner)
                .at(now),
            );
            report.retry_exhausted.push(allocation.id.clone());
        } else {
            warn!(
                id = %allocation.id,
                attempts,
                reason = %reason,
                "Release attempt failed, will retry next sweep"
            );
            report.failed.push(allocation.id.clone());
        }
    }

    pub fn failure_count(&self, id: &str) -> u32 {
        self.failures.get(id).map(|c| *c).unwrap_or(0)
    }

    pub fn is_parked(&self, id: &str) -> bool {
        self.parked.contains_key(id)
    }

    /// Ids awaiting manual intervention
    pub fn parked(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.parked.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Return a parked id to normal sweeping
    pub fn unpark(&self, id: &str) -> bool {
        self.failures.remove(id);
        self.parked.remove(id).is_some()
    }

    pub fn sweep_count(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }
}
