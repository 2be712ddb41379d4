//! Periodic background jobs
//!
//! Each job runs on its own task with its own cancellation channel. A cycle
//! runs inline in the job's loop, so cycles of one job never overlap; ticks
//! that come due while a cycle is still running are skipped. Cancelling a job
//! waits for its in-flight cycle to finish.

use crate::health::HealthRegistry;
use crate::observability::SentinelMetrics;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

#[async_trait]
pub trait PeriodicJob: Send + Sync {
    /// Stable name, used for logs, metrics and health components
    fn name(&self) -> &'static str;

    async fn run_cycle(&self) -> Result<()>;
}

struct ScheduledJob {
    name: &'static str,
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    health: HealthRegistry,
    metrics: SentinelMetrics,
    jobs: Vec<ScheduledJob>,
}

impl Scheduler {
    pub fn new(health: HealthRegistry) -> Self {
        Self {
            health,
            metrics: SentinelMetrics::new(),
            jobs: Vec::new(),
        }
    }

    /// Start a job; the first cycle runs immediately
    pub async fn spawn(&mut self, job: Arc<dyn PeriodicJob>, period: Duration) {
        let name = job.name();
        self.health.register(name).await;

        let (cancel, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(run_job(
            job,
            period,
            cancel_rx,
            self.health.clone(),
            self.metrics.clone(),
        ));
        info!(job = name, period_secs = period.as_secs(), "Scheduled periodic job");
        self.jobs.push(ScheduledJob {
            name,
            cancel,
            handle,
        });
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|j| j.name).collect()
    }

    /// Stop one job, waiting for any in-flight cycle; false when unknown
    pub async fn cancel(&mut self, name: &str) -> bool {
        let Some(position) = self.jobs.iter().position(|j| j.name == name) else {
            return false;
        };
        let job = self.jobs.remove(position);
        stop_job(job).await;
        true
    }

    /// Stop every job
    pub async fn shutdown(mut self) {
        for job in self.jobs.drain(..) {
            stop_job(job).await;
        }
    }
}

async fn stop_job(job: ScheduledJob) {
    let _ = job.cancel.send(());
    if let Err(e) = job.handle.await {
        error!(job = job.name, error = %e, "Job task ended abnormally");
    }
    info!(job = job.name, "Periodic job stopped");
}

async fn run_job(
    job: Arc<dyn PeriodicJob>,
    period: Duration,
    mut cancel: oneshot::Receiver<()>,
    health: HealthRegistry,
    metrics: SentinelMetrics,
) {
    let name = job.name();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cycles = 0u64;

    loop {
        tokio::select! {
            _ = &mut cancel => break,
            _ = ticker.tick() => {
                let start = Instant::now();
                let result = job.run_cycle().await;
                let elapsed = start.elapsed();
                cycles += 1;
                metrics.observe_cycle(name, elapsed.as_secs_f64());

                match result {
                    Ok(()) => {
                        debug!(job = name, cycles, elapsed_ms = elapsed.as_millis() as u64, "Cycle complete");
                        health.set_healthy(name).await;
                    }
                    Err(e) => {
                        error!(job = name, error = %e, "Cycle failed");
                        health.set_degraded(name, e.to_string()).await;
                    }
                }
            }
        }
    }
}
