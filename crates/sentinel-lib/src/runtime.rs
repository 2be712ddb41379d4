//! Component wiring and background task lifecycle

use crate::config::{validate, SentinelConfig};
use crate::health::{components, HealthRegistry, HealthReport, HealthReporter};
use crate::leak::{LeakDetector, PreventionSystem};
use crate::ledger::{AllocationLedger, LedgerEvent};
use crate::monitor::{AlertManager, ReleaseMonitor};
use crate::observability::{MetricEvent, SentinelMetrics, StructuredLogger};
use crate::pool::{AdaptivePoolManager, HandleSource, InProcessHandleSource, OrphanSink};
use crate::recovery::{
    ConfigurationStore, HealthSignal, InMemoryConfigurationStore, InMemoryPluginHost, PluginCondition,
    PluginHost, RecoveryOrchestrator,
};
use crate::releaser::{InProcessReleaser, InstrumentedReleaser, ResourceReleaser};
use crate::scheduler::{PeriodicJob, Scheduler};
use crate::trend::{Predictor, StatisticalPredictor, TrendAnalyzer};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct SentinelBuilder {
    config: SentinelConfig,
    host: Option<Arc<dyn PluginHost>>,
    store: Option<Arc<dyn ConfigurationStore>>,
    releaser: Option<Arc<dyn ResourceReleaser>>,
    handle_source: Option<Arc<dyn HandleSource>>,
}

impl SentinelBuilder {
    pub fn plugin_host(mut self, host: Arc<dyn PluginHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn configuration_store(mut self, store: Arc<dyn ConfigurationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn releaser(mut self, releaser: Arc<dyn ResourceReleaser>) -> Self {
        self.releaser = Some(releaser);
        self
    }

    pub fn handle_source(mut self, source: Arc<dyn HandleSource>) -> Self {
        self.handle_source = Some(source);
        self
    }

    pub fn build(self) -> Result<Sentinel> {
        validate(&self.config).context("invalid sentinel configuration")?;
        let config = self.config;
        let env = config.environment;
        let logger = StructuredLogger::new(config.instance_name.clone());

        let ledger = Arc::new(AllocationLedger::new(
            config.ledger.release_grace(),
            config.ledger.event_buffer,
        ));
        let alerts = Arc::new(AlertManager::with_settings(
            config.monitor.alert_dedup_window(),
            config.monitor.alert_history,
        ));
        let releaser: Arc<dyn ResourceReleaser> = Arc::new(InstrumentedReleaser::new(
            self.releaser.unwrap_or_else(|| Arc::new(InProcessReleaser)),
            logger.clone(),
        ));

        let trend = Arc::new(TrendAnalyzer::new(config.trend.clone()));
        let predictor: Arc<dyn Predictor> = Arc::new(StatisticalPredictor::new(trend.clone()));
        let pools = Arc::new(AdaptivePoolManager::with_handle_source(
            config.pool.clone(),
            env,
            predictor.clone(),
            trend.clone(),
            ledger.clone(),
            self.handle_source
                .unwrap_or_else(|| Arc::new(InProcessHandleSource::default())),
        ));

        let (signals, signal_rx) = mpsc::channel(config.scheduler.signal_buffer.max(1));

        let prevention = Arc::new(
            PreventionSystem::new(
                ledger.clone(),
                releaser.clone(),
                alerts.clone(),
                config.leak.clone(),
                env,
            )
            .with_pool_manager(pools.clone()),
        );
        let pool_sink: Arc<dyn OrphanSink> = pools.clone();
        let log_sink: Arc<dyn OrphanSink> = Arc::new(logger.clone());

        let detector = Arc::new(
            LeakDetector::new(
                ledger.clone(),
                releaser.clone(),
                prevention.clone(),
                alerts.clone(),
                config.leak.clone(),
                env,
            )
            .with_signals(signals.clone())
            .with_orphan_sink(pool_sink.clone()),
        );
        let monitor = Arc::new(
            ReleaseMonitor::new(
                ledger.clone(),
                releaser.clone(),
                alerts.clone(),
                config.monitor.clone(),
            )
            .with_orphan_sink(pool_sink)
            .with_orphan_sink(log_sink),
        );

        let orchestrator = Arc::new(RecoveryOrchestrator::new(
            self.host.unwrap_or_else(|| Arc::new(InMemoryPluginHost::new())),
            self.store
                .unwrap_or_else(|| Arc::new(InMemoryConfigurationStore::new())),
            ledger.clone(),
            alerts.clone(),
            config.recovery.clone(),
            env,
        ));
        let reporter = Arc::new(HealthReporter::new(
            ledger.clone(),
            alerts.clone(),
            trend.clone(),
            detector.clone(),
            orchestrator.clone(),
            config.monitor.alert_dedup_window(),
        ));

        Ok(Sentinel {
            config,
            ledger,
            alerts,
            trend,
            predictor,
            pools,
            prevention,
            detector,
            monitor,
            orchestrator,
            reporter,
            health: HealthRegistry::new(),
            logger,
            signals,
            signal_rx: Mutex::new(Some(signal_rx)),
        })
    }
}

/// Every component of the resource sentinel, wired together
pub struct Sentinel {
    config: SentinelConfig,
    ledger: Arc<AllocationLedger>,
    alerts: Arc<AlertManager>,
    trend: Arc<TrendAnalyzer>,
    predictor: Arc<dyn Predictor>,
    pools: Arc<AdaptivePoolManager>,
    prevention: Arc<PreventionSystem>,
    detector: Arc<LeakDetector>,
    monitor: Arc<ReleaseMonitor>,
    orchestrator: Arc<RecoveryOrchestrator>,
    reporter: Arc<HealthReporter>,
    health: HealthRegistry,
    logger: StructuredLogger,
    signals: mpsc::Sender<HealthSignal>,
    signal_rx: Mutex<Option<mpsc::Receiver<HealthSignal>>>,
}

impl Sentinel {
    pub fn builder(config: SentinelConfig) -> SentinelBuilder {
        SentinelBuilder {
            config,
            host: None,
            store: None,
            releaser: None,
            handle_source: None,
        }
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<AllocationLedger> {
        &self.ledger
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn trend(&self) -> &Arc<TrendAnalyzer> {
        &self.trend
    }

    pub fn predictor(&self) -> &Arc<dyn Predictor> {
        &self.predictor
    }

    pub fn pools(&self) -> &Arc<AdaptivePoolManager> {
        &self.pools
    }

    pub fn prevention(&self) -> &Arc<PreventionSystem> {
        &self.prevention
    }

    pub fn detector(&self) -> &Arc<LeakDetector> {
        &self.detector
    }

    pub fn monitor(&self) -> &Arc<ReleaseMonitor> {
        &self.monitor
    }

    pub fn orchestrator(&self) -> &Arc<RecoveryOrchestrator> {
        &self.orchestrator
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    /// Sender for health signals raised outside the sentinel
    pub fn signal_sender(&self) -> mpsc::Sender<HealthSignal> {
        self.signals.clone()
    }

    pub fn health_report(&self) -> HealthReport {
        self.reporter.build_report()
    }

    /// Start event forwarding, the recovery loop and the periodic jobs
    ///
    /// May be called once; the health signal receiver moves into the
    /// recovery loop.
    pub async fn start(&self) -> Result<RunningSentinel> {
        let signal_rx = self
            .signal_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| anyhow!("sentinel already started"))?;

        let (shutdown, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(forward_ledger_events(
            self.ledger.subscribe(),
            self.trend.clone(),
            self.pools.clone(),
            self.logger.clone(),
            shutdown.subscribe(),
        )));

        self.health.register(components::RECOVERY).await;
        tasks.push(tokio::spawn(
            self.orchestrator.clone().run(signal_rx, shutdown.subscribe()),
        ));

        let intervals = &self.config.scheduler;
        let mut scheduler = Scheduler::new(self.health.clone());
        scheduler
            .spawn(
                Arc::new(SweepJob {
                    monitor: self.monitor.clone(),
                    ledger: self.ledger.clone(),
                    metrics: SentinelMetrics::new(),
                }),
                self.config.monitor.sweep_interval(),
            )
            .await;
        scheduler
            .spawn(
                Arc::new(LeakScanJob {
                    detector: self.detector.clone(),
                }),
                Duration::from_secs(intervals.leak_scan_interval_secs),
            )
            .await;
        scheduler
            .spawn(
                Arc::new(PoolOptimizationJob {
                    pools: self.pools.clone(),
                    trend: self.trend.clone(),
                    metrics: SentinelMetrics::new(),
                }),
                Duration::from_secs(intervals.pool_optimize_interval_secs),
            )
            .await;
        scheduler
            .spawn(
                Arc::new(HealthReportJob {
                    reporter: self.reporter.clone(),
                    orchestrator: self.orchestrator.clone(),
                    logger: self.logger.clone(),
                    signals: self.signals.clone(),
                }),
                Duration::from_secs(intervals.health_report_interval_secs),
            )
            .await;

        self.health.set_ready(true).await;
        self.logger
            .log_startup(env!("CARGO_PKG_VERSION"), &format!("{:?}", self.config.environment));

        Ok(RunningSentinel {
            scheduler,
            shutdown,
            tasks,
            health: self.health.clone(),
        })
    }
}

/// Handle to the background tasks of a started sentinel
pub struct RunningSentinel {
    scheduler: Scheduler,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    health: HealthRegistry,
}

impl RunningSentinel {
    pub fn job_names(&self) -> Vec<&'static str> {
        self.scheduler.job_names()
    }

    /// Stop periodic jobs, then the forwarding and recovery tasks
    pub async fn shutdown(self) {
        self.health.set_ready(false).await;
        self.scheduler.shutdown().await;
        let _ = self.shutdown.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Sentinel stopped");
    }
}

async fn forward_ledger_events(
    mut events: broadcast::Receiver<LedgerEvent>,
    trend: Arc<TrendAnalyzer>,
    pools: Arc<AdaptivePoolManager>,
    logger: StructuredLogger,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    logger.log_metric_event(&MetricEvent::from_ledger_event(&event));
                    if let LedgerEvent::Released(release) = &event {
                        trend.record_release(release);
                    }
                    pools.on_ledger_event(&event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Ledger event forwarder lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
    debug!("Ledger event forwarder stopped");
}

struct SweepJob {
    monitor: Arc<ReleaseMonitor>,
    ledger: Arc<AllocationLedger>,
    metrics: SentinelMetrics,
}

#[async_trait]
impl PeriodicJob for SweepJob {
    fn name(&self) -> &'static str {
        components::RELEASE_MONITOR
    }

    async fn run_cycle(&self) -> Result<()> {
        let report = self.monitor.sweep().await;
        for (resource_type, totals) in self.ledger.type_totals() {
            self.metrics
                .set_live_allocations(resource_type, totals.live as i64);
        }
        debug!(
            stuck = report.stuck.len(),
            orphaned = report.orphaned.len(),
            failed = report.failed.len(),
            "Sweep complete"
        );
        Ok(())
    }
}

struct LeakScanJob {
    detector: Arc<LeakDetector>,
}

#[async_trait]
impl PeriodicJob for LeakScanJob {
    fn name(&self) -> &'static str {
        components::LEAK_DETECTOR
    }

    async fn run_cycle(&self) -> Result<()> {
        let report = self.detector.run_scan_cycle(Utc::now()).await;
        debug!(
            analyzed = report.components_analyzed,
            recoveries = report.recoveries_attempted,
            max_probability = report.max_probability,
            "Leak scan complete"
        );
        if report.recoveries_failed > 0 {
            return Err(anyhow!(
                "{} of {} automatic recoveries failed",
                report.recoveries_failed,
                report.recoveries_attempted
            ));
        }
        Ok(())
    }
}

struct PoolOptimizationJob {
    pools: Arc<AdaptivePoolManager>,
    trend: Arc<TrendAnalyzer>,
    metrics: SentinelMetrics,
}

#[async_trait]
impl PeriodicJob for PoolOptimizationJob {
    fn name(&self) -> &'static str {
        components::POOL_MANAGER
    }

    async fn run_cycle(&self) -> Result<()> {
        let now = Utc::now();
        let report = self.pools.optimize_resource_pools_at(now).await;
        let expired = self.trend.evict_expired(now);
        self.metrics.set_pools_active(self.pools.pool_count() as i64);
        debug!(
            evicted = report.evicted,
            prewarmed = report.prewarmed,
            expired_samples = expired,
            "Pool optimization complete"
        );
        Ok(())
    }
}

struct HealthReportJob {
    reporter: Arc<HealthReporter>,
    orchestrator: Arc<RecoveryOrchestrator>,
    logger: StructuredLogger,
    signals: mpsc::Sender<HealthSignal>,
}

#[async_trait]
impl PeriodicJob for HealthReportJob {
    fn name(&self) -> &'static str {
        components::HEALTH_REPORTER
    }

    async fn run_cycle(&self) -> Result<()> {
        let report = self.reporter.build_report();
        self.logger.log_health_report(
            report.health_score,
            report.alerts.len(),
            report.isolated_plugins.len(),
        );

        for plugin_id in self.orchestrator.configuration_history().plugins() {
            if self.orchestrator.check_configuration_drift(&plugin_id).await? {
                let signal = HealthSignal::new(plugin_id.clone(), PluginCondition::ConfigurationDrift);
                if self.signals.try_send(signal).is_err() {
                    warn!(plugin_id = %plugin_id, "Health signal channel full, drift signal dropped");
                }
            }
        }
        Ok(())
    }
}
