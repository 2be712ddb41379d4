//! Physical release of tracked resources
//!
//! The ledger only records state; whatever actually holds the resource is
//! reached through [`ResourceReleaser`]. Callers perform the ledger
//! transition after a successful release.

use crate::error::ReleaseError;
use crate::models::ResourceAllocation;
use crate::observability::{MetricEvent, StructuredLogger};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait ResourceReleaser: Send + Sync {
    /// Forcibly release the resource behind an allocation record
    async fn force_release(&self, allocation: &ResourceAllocation) -> Result<(), ReleaseError>;
}

/// Releaser for resources with no external backing; always succeeds
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessReleaser;

#[async_trait]
impl ResourceReleaser for InProcessReleaser {
    async fn force_release(&self, allocation: &ResourceAllocation) -> Result<(), ReleaseError> {
        debug!(
            id = %allocation.id,
            resource_type = %allocation.resource_type,
            owner = %allocation.owner,
            "Released in-process resource"
        );
        Ok(())
    }
}

/// Wraps a releaser so every forced release emits a metric event
pub struct InstrumentedReleaser {
    inner: Arc<dyn ResourceReleaser>,
    logger: StructuredLogger,
}

impl InstrumentedReleaser {
    pub fn new(inner: Arc<dyn ResourceReleaser>, logger: StructuredLogger) -> Self {
        Self { inner, logger }
    }
}

#[async_trait]
impl ResourceReleaser for InstrumentedReleaser {
    async fn force_release(&self, allocation: &ResourceAllocation) -> Result<(), ReleaseError> {
        let result = self.inner.force_release(allocation).await;
        match &result {
            Ok(()) => self.logger.log_metric_event(&MetricEvent::forced_release(allocation)),
            Err(e) => warn!(id = %allocation.id, error = %e, "Forced release failed"),
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use dashmap::DashMap;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Releaser that fails for configured ids and counts attempts
    #[derive(Default)]
    pub struct FlakyReleaser {
        failing: DashMap<String, ()>,
        pub attempts: DashMap<String, usize>,
        pub total: AtomicUsize,
    }

    impl FlakyReleaser {
        pub fn failing(ids: &[&str]) -> Self {
            let releaser = Self::default();
            for id in ids.iter().copied().collect::<HashSet<_>>() {
                releaser.failing.insert(id.to_string(), ());
            }
            releaser
        }

        pub fn attempts_for(&self, id: &str) -> usize {
            self.attempts.get(id).map(|a| *a).unwrap_or(0)
        }
    }

    #[async_trait]
    impl ResourceReleaser for FlakyReleaser {
        async fn force_release(&self, allocation: &ResourceAllocation) -> Result<(), ReleaseError> {
            *self.attempts.entry(allocation.id.clone()).or_insert(0) += 1;
            self.total.fetch_add(1, Ordering::Relaxed);
            if self.failing.contains_key(&allocation.id) {
                return Err(ReleaseError::new(&allocation.id, "handle busy"));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FlakyReleaser;
    use super::*;
    use crate::models::ResourceType;
    use chrono::Utc;

    #[tokio::test]
    async fn test_instrumented_releaser_passes_results_through() {
        let flaky = Arc::new(FlakyReleaser::failing(&["bad"]));
        let releaser = InstrumentedReleaser::new(flaky.clone(), StructuredLogger::new("test"));

        let good = ResourceAllocation::new("good", ResourceType::FileHandle, "p1", Utc::now());
        let bad = ResourceAllocation::new("bad", ResourceType::FileHandle, "p1", Utc::now());
        assert!(releaser.force_release(&good).await.is_ok());
        assert!(releaser.force_release(&bad).await.is_err());
        assert_eq!(flaky.attempts_for("good"), 1);
        assert_eq!(flaky.attempts_for("bad"), 1);
    }
}
