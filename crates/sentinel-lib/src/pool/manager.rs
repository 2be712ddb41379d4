//! Adaptive pool manager
//!
//! Sizes and creates per-context resource pools from predictions. Pool
//! creation (size computation plus eager allocation) is serialized through a
//! single async mutex so two racing requests for the same key never build
//! duplicate pools.

use super::handles::{FileHandlePool, HandleSource, InProcessHandleSource};
use super::memory::MemoryPool;
use super::sizing::{compute_pool_size, PoolSize};
use crate::config::{Environment, PoolConfig};
use crate::error::AllocationError;
use crate::ledger::{AllocationLedger, LedgerEvent};
use crate::models::{ContextKey, Priority, ResourceAllocation, ResourceType, ValidationRequest};
use crate::trend::{LoadTrend, Predictor, TrendAnalyzer};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Ledger owner used for pool backing allocations
pub const POOL_OWNER: &str = "pool-manager";

/// Receives the orphans removed by one sweep or scan
pub trait OrphanSink: Send + Sync {
    fn handle_orphaned_resources(&self, batch: &[ResourceAllocation]);
}

/// Sizing decision for a request, before any pool exists
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationPlan {
    pub context_key: ContextKey,
    pub priority: Priority,
    pub memory_bytes: u64,
    pub file_handles: u32,
    pub confidence: f64,
    /// False when sized from configured minimums
    pub from_prediction: bool,
}

/// Resources granted to a validation request
#[derive(Debug, Clone)]
pub struct PoolAllocation {
    pub context_key: ContextKey,
    pub priority: Priority,
    pub memory_bytes: u64,
    pub file_handles: u32,
    pub memory_pool: Option<Arc<MemoryPool>>,
    pub handle_pool: Option<Arc<FileHandlePool>>,
}

impl PoolAllocation {
    pub fn is_minimal(&self) -> bool {
        self.memory_pool.is_none() && self.handle_pool.is_none()
    }
}

struct PoolEntry {
    memory: Arc<MemoryPool>,
    handles: Arc<FileHandlePool>,
    priority: Priority,
    size: PoolSize,
    /// Ledger ids of the backing allocations
    ledger_ids: Vec<String>,
    last_used: DateTime<Utc>,
}

/// Per-type activity counters kept from ledger events and orphan batches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeActivity {
    pub allocated: u64,
    pub released: u64,
    pub orphaned: u64,
}

impl TypeActivity {
    pub fn live(&self) -> u64 {
        self.allocated
            .saturating_sub(self.released)
            .saturating_sub(self.orphaned)
    }
}

/// Observable pool inventory
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pools: usize,
    pub pooled_memory_bytes: u64,
    pub pooled_file_handles: u64,
    pub created: u64,
    pub reused: u64,
    pub evicted: u64,
    pub prewarmed: u64,
    pub activity: BTreeMap<ResourceType, TypeActivity>,
}

/// Outcome of one optimisation pass
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub evicted: usize,
    pub prewarmed: usize,
    pub load_trend: LoadTrend,
}

/// Owner of every resource pool
pub struct AdaptivePoolManager {
    config: PoolConfig,
    environment: Environment,
    predictor: Arc<dyn Predictor>,
    trend: Arc<TrendAnalyzer>,
    ledger: Arc<AllocationLedger>,
    handle_source: Arc<dyn HandleSource>,
    pools: DashMap<ContextKey, PoolEntry>,
    /// Last request seen per key, used to pre-warm pools
    known_requests: DashMap<ContextKey, ValidationRequest>,
    activity: DashMap<ResourceType, TypeActivity>,
    creation: Mutex<()>,
    created: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
    prewarmed: AtomicU64,
}

impl AdaptivePoolManager {
    pub fn new(
        config: PoolConfig,
        environment: Environment,
        predictor: Arc<dyn Predictor>,
        trend: Arc<TrendAnalyzer>,
        ledger: Arc<AllocationLedger>,
    ) -> Self {
        Self::with_handle_source(
            config,
            environment,
            predictor,
            trend,
            ledger,
            Arc::new(InProcessHandleSource::default()),
        )
    }

    pub fn with_handle_source(
        config: PoolConfig,
        environment: Environment,
        predictor: Arc<dyn Predictor>,
        trend: Arc<TrendAnalyzer>,
        ledger: Arc<AllocationLedger>,
        handle_source: Arc<dyn HandleSource>,
    ) -> Self {
        Self {
            config,
            environment,
            predictor,
            trend,
            ledger,
            handle_source,
            pools: DashMap::new(),
            known_requests: DashMap::new(),
            activity: DashMap::new(),
            creation: Mutex::new(()),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            prewarmed: AtomicU64::new(0),
        }
    }

    /// Decide how much to allocate for a request
    ///
    /// Prediction-sized when confidence reaches the threshold, otherwise the
    /// configured minimums.
    pub fn get_optimal_resource_allocation(&self, request: &ValidationRequest) -> AllocationPlan {
        let prediction = self.predictor.predict(request);
        self.known_requests
            .insert(prediction.context_key.clone(), request.clone());

        if prediction.confidence >= self.config.confidence_threshold {
            let size = compute_pool_size(&prediction, &self.config);
            AllocationPlan {
                context_key: prediction.context_key,
                priority: prediction.priority,
                memory_bytes: size.memory_bytes,
                file_handles: size.file_handles,
                confidence: prediction.confidence,
                from_prediction: true,
            }
        } else {
            debug!(
                key = %prediction.context_key,
                confidence = prediction.confidence,
                "Confidence below threshold, using minimum allocation"
            );
            AllocationPlan {
                context_key: prediction.context_key,
                priority: prediction.priority,
                memory_bytes: self.config.min_pool_bytes,
                file_handles: self.config.min_file_handles,
                confidence: prediction.confidence,
                from_prediction: false,
            }
        }
    }

    /// Return the pool for the request's key, creating it when absent
    pub async fn preallocate_resources(
        &self,
        request: &ValidationRequest,
    ) -> Result<PoolAllocation, AllocationError> {
        let plan = self.get_optimal_resource_allocation(request);
        self.preallocate_plan(plan, Utc::now()).await
    }

    /// Like [`preallocate_resources`](Self::preallocate_resources) but never
    /// fails; creation errors degrade to a minimal allocation
    pub async fn preallocate_or_minimal(&self, request: &ValidationRequest) -> PoolAllocation {
        match self.preallocate_resources(request).await {
            Ok(allocation) => allocation,
            Err(e) => {
                warn!(
                    validation_type = %request.validation_type,
                    error = %e,
                    "Pool creation failed, granting minimal allocation"
                );
                self.minimal_allocation(request)
            }
        }
    }

    /// Allocation with no pools and the configured minimum sizes
    pub fn minimal_allocation(&self, request: &ValidationRequest) -> PoolAllocation {
        PoolAllocation {
            context_key: request.context_key(),
            priority: crate::trend::derive_priority(request),
            memory_bytes: self.config.min_pool_bytes,
            file_handles: self.config.min_file_handles,
            memory_pool: None,
            handle_pool: None,
        }
    }

    async fn preallocate_plan(
        &self,
        plan: AllocationPlan,
        now: DateTime<Utc>,
    ) -> Result<PoolAllocation, AllocationError> {
        let _guard = self.creation.lock().await;

        if let Some(mut entry) = self.pools.get_mut(&plan.context_key) {
            entry.last_used = now;
            for id in &entry.ledger_ids {
                let _ = self.ledger.touch_at(id, now);
            }
            self.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(Self::allocation_from(&plan.context_key, &entry));
        }

        let entry = self.create_pool(&plan, now).await?;
        let allocation = Self::allocation_from(&plan.context_key, &entry);
        self.pools.insert(plan.context_key.clone(), entry);
        self.created.fetch_add(1, Ordering::Relaxed);

        info!(
            key = %plan.context_key,
            memory_bytes = plan.memory_bytes,
            file_handles = plan.file_handles,
            from_prediction = plan.from_prediction,
            "Resource pool created"
        );
        Ok(allocation)
    }

    async fn create_pool(
        &self,
        plan: &AllocationPlan,
        now: DateTime<Utc>,
    ) -> Result<PoolEntry, AllocationError> {
        let key = plan.context_key.to_string();

        let memory = MemoryPool::create(plan.memory_bytes)
            .await
            .map_err(|e| AllocationError::PoolCreation {
                key: key.clone(),
                resource_type: ResourceType::Memory,
                reason: e.to_string(),
            })?;
        let handles = FileHandlePool::create(self.handle_source.clone(), plan.file_handles)
            .map_err(|e| AllocationError::PoolCreation {
                key: key.clone(),
                resource_type: ResourceType::FileHandle,
                reason: e.to_string(),
            })?;

        let memory_id = format!("pool:{}:memory", key);
        let handles_id = format!("pool:{}:handles", key);
        self.ledger.insert(
            ResourceAllocation::new(&memory_id, ResourceType::Memory, POOL_OWNER, now)
                .with_estimated_bytes(plan.memory_bytes),
        )?;
        if let Err(e) = self.ledger.insert(ResourceAllocation::new(
            &handles_id,
            ResourceType::FileHandle,
            POOL_OWNER,
            now,
        )) {
            let _ = self.ledger.track_release_at(&memory_id, now);
            return Err(e);
        }

        Ok(PoolEntry {
            memory: Arc::new(memory),
            handles: Arc::new(handles),
            priority: plan.priority,
            size: PoolSize {
                memory_bytes: plan.memory_bytes,
                file_handles: plan.file_handles,
            },
            ledger_ids: vec![memory_id, handles_id],
            last_used: now,
        })
    }

    fn allocation_from(key: &ContextKey, entry: &PoolEntry) -> PoolAllocation {
        PoolAllocation {
            context_key: key.clone(),
            priority: entry.priority,
            memory_bytes: entry.size.memory_bytes,
            file_handles: entry.size.file_handles,
            memory_pool: Some(entry.memory.clone()),
            handle_pool: Some(entry.handles.clone()),
        }
    }

    pub async fn optimize_resource_pools(&self) -> OptimizationReport {
        self.optimize_resource_pools_at(Utc::now()).await
    }

    /// Evict idle pools, then pre-warm known keys when load is rising
    pub async fn optimize_resource_pools_at(&self, now: DateTime<Utc>) -> OptimizationReport {
        let evicted = self.reclaim_idle_pools(now, self.config.idle_timeout()).await;
        let load_trend = self.trend.load_trend_at(now);

        let mut prewarmed = 0;
        if load_trend.increasing && self.config.prewarm.is_active(self.environment) {
            let missing: Vec<ValidationRequest> = self
                .known_requests
                .iter()
                .filter(|e| !self.pools.contains_key(e.key()))
                .map(|e| e.value().clone())
                .collect();

            for request in missing {
                let plan = self.get_optimal_resource_allocation(&request);
                match self.preallocate_plan(plan, now).await {
                    Ok(_) => prewarmed += 1,
                    Err(e) => warn!(
                        validation_type = %request.validation_type,
                        error = %e,
                        "Pool pre-warm failed"
                    ),
                }
            }
            self.prewarmed.fetch_add(prewarmed as u64, Ordering::Relaxed);
        }

        if evicted > 0 || prewarmed > 0 {
            info!(evicted, prewarmed, "Pool optimisation complete");
        }
        OptimizationReport {
            evicted,
            prewarmed,
            load_trend,
        }
    }

    /// Tear down pools unused for longer than `max_idle`
    pub async fn reclaim_idle_pools(&self, now: DateTime<Utc>, max_idle: Duration) -> usize {
        let _guard = self.creation.lock().await;
        let max_idle = chrono::Duration::from_std(max_idle).unwrap_or_else(|_| chrono::Duration::days(36_500));

        let idle: Vec<ContextKey> = self
            .pools
            .iter()
            .filter(|e| now - e.value().last_used > max_idle)
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for key in idle {
            if let Some((key, entry)) = self.pools.remove(&key) {
                self.teardown(&key, entry, now);
                evicted += 1;
            }
        }
        self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    fn teardown(&self, key: &ContextKey, entry: PoolEntry, now: DateTime<Utc>) {
        let handles = entry.handles.teardown();
        for id in &entry.ledger_ids {
            if let Err(e) = self.ledger.track_release_at(id, now) {
                warn!(id = %id, error = %e, "Failed to release pool backing allocation");
            }
        }
        debug!(key = %key, handles_released = handles, "Pool evicted");
    }

    /// Keep per-type activity counters current
    pub fn on_ledger_event(&self, event: &LedgerEvent) {
        // Orphans are counted from batches
        match event {
            LedgerEvent::Allocated(allocation) => {
                self.activity.entry(allocation.resource_type).or_default().allocated += 1;
            }
            LedgerEvent::Released(release) => {
                self.activity.entry(release.resource_type).or_default().released += 1;
            }
            LedgerEvent::Orphaned(_) => {}
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn has_pool(&self, key: &ContextKey) -> bool {
        self.pools.contains_key(key)
    }

    pub fn pool_stats(&self) -> PoolStats {
        let (pooled_memory_bytes, pooled_file_handles) =
            self.pools.iter().fold((0u64, 0u64), |(mem, handles), e| {
                (
                    mem + e.value().size.memory_bytes,
                    handles + e.value().handles.held() as u64,
                )
            });
        PoolStats {
            pools: self.pools.len(),
            pooled_memory_bytes,
            pooled_file_handles,
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            prewarmed: self.prewarmed.load(Ordering::Relaxed),
            activity: self
                .activity
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect(),
        }
    }
}

impl OrphanSink for AdaptivePoolManager {
    fn handle_orphaned_resources(&self, batch: &[ResourceAllocation]) {
        for orphan in batch {
            self.activity.entry(orphan.resource_type).or_default().orphaned += 1;

            // A pool whose backing record was orphaned can no longer be trusted
            if orphan.owner == POOL_OWNER {
                let stale: Vec<ContextKey> = self
                    .pools
                    .iter()
                    .filter(|e| e.value().ledger_ids.contains(&orphan.id))
                    .map(|e| e.key().clone())
                    .collect();
                for key in stale {
                    if let Some((key, entry)) = self.pools.remove(&key) {
                        self.teardown(&key, entry, Utc::now());
                    }
                }
            }
        }
        if !batch.is_empty() {
            debug!(count = batch.len(), "Orphan batch applied to pool counters");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureToggle, TrendConfig};
    use crate::models::UsageStats;
    use crate::trend::StatisticalPredictor;

    const MB: u64 = 1024 * 1024;

    struct Fixture {
        ledger: Arc<AllocationLedger>,
        trend: Arc<TrendAnalyzer>,
        manager: Arc<AdaptivePoolManager>,
        source: Arc<InProcessHandleSource>,
    }

    fn fixture(config: PoolConfig) -> Fixture {
        let ledger = Arc::new(AllocationLedger::default());
        let trend = Arc::new(TrendAnalyzer::new(TrendConfig::default()));
        let predictor = Arc::new(StatisticalPredictor::new(trend.clone()));
        let source = Arc::new(InProcessHandleSource::new(1024));
        let manager = Arc::new(AdaptivePoolManager::with_handle_source(
            config,
            Environment::Development,
            predictor,
            trend.clone(),
            ledger.clone(),
            source.clone(),
        ));
        Fixture {
            ledger,
            trend,
            manager,
            source,
        }
    }

    fn seed(trend: &TrendAnalyzer, request: &ValidationRequest, count: usize, at: DateTime<Utc>) {
        for i in 0..count {
            trend.record_usage_at(
                request.context_key(),
                UsageStats::new(4 * MB, 2, Duration::from_secs(20)),
                at + chrono::Duration::seconds(i as i64),
            );
        }
    }

    #[test]
    fn test_low_confidence_uses_minimums() {
        let f = fixture(PoolConfig::default());
        let plan = f
            .manager
            .get_optimal_resource_allocation(&ValidationRequest::new("rust", 2 * MB));
        assert!(!plan.from_prediction);
        assert_eq!(plan.memory_bytes, MB);
        assert_eq!(plan.file_handles, 1);
        assert_eq!(plan.confidence, 0.5);
    }

    #[test]
    fn test_confident_prediction_sizes_plan() {
        let f = fixture(PoolConfig::default());
        let request = ValidationRequest::new("rust", 2 * MB);
        seed(&f.trend, &request, 10, Utc::now() - chrono::Duration::minutes(1));

        let plan = f.manager.get_optimal_resource_allocation(&request);
        assert!(plan.from_prediction);
        assert_eq!(plan.memory_bytes, 4 * MB);
        assert_eq!(plan.file_handles, 2);
    }

    #[tokio::test]
    async fn test_pool_created_once_and_reused() {
        let f = fixture(PoolConfig::default());
        let request = ValidationRequest::new("rust", 2 * MB);

        let first = f.manager.preallocate_resources(&request).await.unwrap();
        let second = f.manager.preallocate_resources(&request).await.unwrap();

        assert!(Arc::ptr_eq(
            first.memory_pool.as_ref().unwrap(),
            second.memory_pool.as_ref().unwrap()
        ));
        let stats = f.manager.pool_stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(f.ledger.snapshot_owner(POOL_OWNER).len(), 2);
    }

    #[tokio::test]
    async fn test_racing_requests_create_single_pool() {
        let f = fixture(PoolConfig::default());
        let request = ValidationRequest::new("rust", 2 * MB);

        let a = {
            let manager = f.manager.clone();
            let request = request.clone();
            tokio::spawn(async move { manager.preallocate_resources(&request).await })
        };
        let b = {
            let manager = f.manager.clone();
            let request = request.clone();
            tokio::spawn(async move { manager.preallocate_resources(&request).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(f.manager.pool_count(), 1);
        assert_eq!(f.manager.pool_stats().created, 1);
    }

    #[tokio::test]
    async fn test_creation_failure_degrades_to_minimal() {
        let f = fixture(PoolConfig::default());
        let exhausted = Arc::new(InProcessHandleSource::new(0));
        let manager = AdaptivePoolManager::with_handle_source(
            PoolConfig::default(),
            Environment::Development,
            Arc::new(StatisticalPredictor::new(f.trend.clone())),
            f.trend.clone(),
            f.ledger.clone(),
            exhausted,
        );
        let request = ValidationRequest::new("rust", 2 * MB);

        let err = manager.preallocate_resources(&request).await.unwrap_err();
        assert!(matches!(err, AllocationError::PoolCreation { .. }));

        let allocation = manager.preallocate_or_minimal(&request).await;
        assert!(allocation.is_minimal());
        assert_eq!(allocation.memory_bytes, MB);
        assert_eq!(f.ledger.live_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_pools_evicted() {
        let f = fixture(PoolConfig::default());
        let request = ValidationRequest::new("rust", 2 * MB);
        f.manager.preallocate_resources(&request).await.unwrap();
        assert_eq!(f.source.outstanding(), 1);

        let later = Utc::now() + chrono::Duration::minutes(11);
        let report = f.manager.optimize_resource_pools_at(later).await;

        assert_eq!(report.evicted, 1);
        assert_eq!(f.manager.pool_count(), 0);
        assert_eq!(f.source.outstanding(), 0);
        assert!(f.ledger.snapshot_owner(POOL_OWNER).is_empty());
    }

    #[tokio::test]
    async fn test_prewarm_on_increasing_load() {
        let f = fixture(PoolConfig::default());
        let now = Utc::now();
        let request = ValidationRequest::new("rust", 2 * MB);
        f.manager.get_optimal_resource_allocation(&request);

        f.trend.record_usage_at(
            ContextKey::new("other:small"),
            UsageStats::new(MB, 1, Duration::from_secs(1)),
            now - chrono::Duration::seconds(60),
        );
        f.trend.record_usage_at(
            ContextKey::new("other:small"),
            UsageStats::new(8 * MB, 1, Duration::from_secs(1)),
            now,
        );

        let report = f.manager.optimize_resource_pools_at(now).await;
        assert!(report.load_trend.increasing);
        assert_eq!(report.prewarmed, 1);
        assert!(f.manager.has_pool(&request.context_key()));
    }

    #[tokio::test]
    async fn test_prewarm_respects_toggle() {
        let config = PoolConfig {
            prewarm: FeatureToggle::disabled(),
            ..PoolConfig::default()
        };
        let f = fixture(config);
        let now = Utc::now();
        let request = ValidationRequest::new("rust", 2 * MB);
        f.manager.get_optimal_resource_allocation(&request);
        f.trend.record_usage_at(
            request.context_key(),
            UsageStats::new(MB, 1, Duration::from_secs(1)),
            now - chrono::Duration::seconds(60),
        );
        f.trend.record_usage_at(
            request.context_key(),
            UsageStats::new(8 * MB, 1, Duration::from_secs(1)),
            now,
        );

        let report = f.manager.optimize_resource_pools_at(now).await;
        assert_eq!(report.prewarmed, 0);
        assert_eq!(f.manager.pool_count(), 0);
    }

    #[test]
    fn test_activity_counters() {
        let f = fixture(PoolConfig::default());
        let mut events = f.ledger.subscribe();
        f.ledger.track_allocation("h1", ResourceType::FileHandle, "p").unwrap();
        f.ledger.track_allocation("h2", ResourceType::FileHandle, "p").unwrap();
        f.ledger.track_release("h1").unwrap();
        while let Ok(event) = events.try_recv() {
            f.manager.on_ledger_event(&event);
        }
        let orphan = f.ledger.mark_orphaned("h2", Utc::now()).unwrap();
        f.manager.handle_orphaned_resources(&[orphan]);

        let activity = f.manager.pool_stats().activity[&ResourceType::FileHandle];
        assert_eq!(activity.allocated, 2);
        assert_eq!(activity.released, 1);
        assert_eq!(activity.orphaned, 1);
        assert_eq!(activity.live(), 0);
    }

    #[tokio::test]
    async fn test_orphaned_backing_record_drops_pool() {
        let f = fixture(PoolConfig::default());
        let request = ValidationRequest::new("rust", 2 * MB);
        f.manager.preallocate_resources(&request).await.unwrap();

        let id = format!("pool:{}:memory", request.context_key());
        let orphan = f.ledger.mark_orphaned(&id, Utc::now()).unwrap();
        f.manager.handle_orphaned_resources(&[orphan]);

        assert_eq!(f.manager.pool_count(), 0);
        assert_eq!(f.source.outstanding(), 0);
    }
}
