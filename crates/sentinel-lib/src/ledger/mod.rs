//! Allocation ledger
//!
//! Concurrent registry of every live resource handle. Mutation is
//! serialized per id through the map's entry locks; no map lock is held
//! while events are broadcast.

mod liveness;

pub use liveness::{LivenessGuard, LivenessProbe};

use crate::error::AllocationError;
use crate::models::{AllocationState, ResourceAllocation, ResourceType};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Default release-confirmation grace period
pub const DEFAULT_RELEASE_GRACE: Duration = Duration::from_secs(300);

/// Emitted when an allocation leaves the live map through a release
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseEvent {
    pub id: String,
    pub resource_type: ResourceType,
    pub owner: String,
    pub lifetime: Duration,
    pub released_at: DateTime<Utc>,
}

/// Change notifications published by the ledger
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    Allocated(ResourceAllocation),
    Released(ReleaseEvent),
    Orphaned(ResourceAllocation),
}

/// Lifetime counters per (owner, resource type)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeCounters {
    pub allocated: u64,
    pub released: u64,
    pub orphaned: u64,
    pub live: usize,
    pub peak_live: usize,
}

/// System-wide live and peak counts for one resource type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeTotals {
    pub live: usize,
    pub peak: usize,
}

/// Registry of live resource allocations
pub struct AllocationLedger {
    live: DashMap<String, ResourceAllocation>,
    /// Released/orphaned records kept until the grace period passes
    tombstones: DashMap<String, ResourceAllocation>,
    probes: DashMap<String, LivenessProbe>,
    counters: DashMap<(String, ResourceType), TypeCounters>,
    totals: DashMap<ResourceType, TypeTotals>,
    events: broadcast::Sender<LedgerEvent>,
    release_grace: Duration,
}

impl Default for AllocationLedger {
    fn default() -> Self {
        Self::new(DEFAULT_RELEASE_GRACE, 1024)
    }
}

impl AllocationLedger {
    pub fn new(release_grace: Duration, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            live: DashMap::new(),
            tombstones: DashMap::new(),
            probes: DashMap::new(),
            counters: DashMap::new(),
            totals: DashMap::new(),
            events,
            release_grace,
        }
    }

    /// Subscribe to allocation, release and orphan events
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Register a new active allocation
    pub fn track_allocation(
        &self,
        id: &str,
        resource_type: ResourceType,
        owner: &str,
    ) -> Result<ResourceAllocation, AllocationError> {
        self.insert(ResourceAllocation::new(id, resource_type, owner, Utc::now()))
    }

    /// Register an allocation paired with an owner-held liveness token
    pub fn track_allocation_with_liveness(
        &self,
        id: &str,
        resource_type: ResourceType,
        owner: &str,
        estimated_bytes: u64,
    ) -> Result<LivenessGuard, AllocationError> {
        let allocation = ResourceAllocation::new(id, resource_type, owner, Utc::now())
            .with_estimated_bytes(estimated_bytes);
        self.insert(allocation)?;
        let (guard, probe) = LivenessGuard::new(id);
        self.probes.insert(id.to_string(), probe);
        Ok(guard)
    }

    /// Register a pre-built allocation record (timestamps taken as given)
    pub fn insert(&self, mut allocation: ResourceAllocation) -> Result<ResourceAllocation, AllocationError> {
        if allocation.id.is_empty() {
            return Err(AllocationError::InvalidId);
        }
        allocation.state = AllocationState::Active;
        allocation.released_at = None;

        match self.live.entry(allocation.id.clone()) {
            Entry::Occupied(_) => {
                return Err(AllocationError::AlreadyTracked(allocation.id));
            }
            Entry::Vacant(slot) => {
                slot.insert(allocation.clone());
            }
        }
        self.tombstones.remove(&allocation.id);

        {
            let mut counters = self
                .counters
                .entry((allocation.owner.clone(), allocation.resource_type))
                .or_default();
            counters.allocated += 1;
            counters.live += 1;
            counters.peak_live = counters.peak_live.max(counters.live);
        }
        {
            let mut totals = self.totals.entry(allocation.resource_type).or_default();
            totals.live += 1;
            totals.peak = totals.peak.max(totals.live);
        }

        debug!(
            resource_id = %allocation.id,
            resource_type = %allocation.resource_type,
            owner = %allocation.owner,
            "Allocation tracked"
        );
        let _ = self.events.send(LedgerEvent::Allocated(allocation.clone()));
        Ok(allocation)
    }

    /// Refresh the last-access timestamp of an active allocation
    pub fn touch(&self, id: &str) -> Result<(), AllocationError> {
        self.touch_at(id, Utc::now())
    }

    pub fn touch_at(&self, id: &str, now: DateTime<Utc>) -> Result<(), AllocationError> {
        match self.live.get_mut(id) {
            Some(mut allocation) => {
                allocation.last_access = now;
                Ok(())
            }
            None => Err(AllocationError::NotTracked(id.to_string())),
        }
    }

    /// Release an allocation; unknown or already released ids are a no-op
    pub fn track_release(&self, id: &str) -> Result<Option<ReleaseEvent>, AllocationError> {
        self.track_release_at(id, Utc::now())
    }

    pub fn track_release_at(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ReleaseEvent>, AllocationError> {
        if id.is_empty() {
            return Err(AllocationError::InvalidId);
        }
        let Some(allocation) = self.retire(id, AllocationState::Released, now) else {
            debug!(resource_id = %id, "Release of untracked allocation ignored");
            return Ok(None);
        };

        let event = ReleaseEvent {
            id: allocation.id.clone(),
            resource_type: allocation.resource_type,
            owner: allocation.owner.clone(),
            lifetime: allocation.lifetime(now),
            released_at: now,
        };
        let _ = self.events.send(LedgerEvent::Released(event.clone()));
        Ok(Some(event))
    }

    /// Remove an allocation as orphaned; `None` if it was already gone
    pub fn mark_orphaned(&self, id: &str, detected_at: DateTime<Utc>) -> Option<ResourceAllocation> {
        let allocation = self.retire(id, AllocationState::Orphaned, detected_at)?;
        let _ = self.events.send(LedgerEvent::Orphaned(allocation.clone()));
        Some(allocation)
    }

    /// Release every live allocation held by `owner`
    pub fn release_owner(&self, owner: &str) -> Vec<ReleaseEvent> {
        let now = Utc::now();
        self.snapshot_owner(owner)
            .into_iter()
            .filter_map(|a| self.track_release_at(&a.id, now).ok().flatten())
            .collect()
    }

    fn retire(
        &self,
        id: &str,
        state: AllocationState,
        at: DateTime<Utc>,
    ) -> Option<ResourceAllocation> {
        let (_, mut allocation) = self.live.remove(id)?;
        allocation.state = state;
        allocation.released_at = Some(at);
        self.probes.remove(id);

        if let Some(mut counters) = self
            .counters
            .get_mut(&(allocation.owner.clone(), allocation.resource_type))
        {
            counters.live = counters.live.saturating_sub(1);
            match state {
                AllocationState::Orphaned => counters.orphaned += 1,
                _ => counters.released += 1,
            }
        }
        if let Some(mut totals) = self.totals.get_mut(&allocation.resource_type) {
            totals.live = totals.live.saturating_sub(1);
        }

        self.tombstones.insert(allocation.id.clone(), allocation.clone());
        Some(allocation)
    }

    /// Point-in-time copy of all live records
    pub fn snapshot(&self) -> Vec<ResourceAllocation> {
        self.live.iter().map(|r| r.value().clone()).collect()
    }

    /// Point-in-time copy of the live records held by one owner
    pub fn snapshot_owner(&self, owner: &str) -> Vec<ResourceAllocation> {
        self.live
            .iter()
            .filter(|r| r.value().owner == owner)
            .map(|r| r.value().clone())
            .collect()
    }

    /// Live record or tombstone for an id
    pub fn get(&self, id: &str) -> Option<ResourceAllocation> {
        self.live
            .get(id)
            .map(|r| r.clone())
            .or_else(|| self.tombstones.get(id).map(|r| r.clone()))
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.live.contains_key(id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Liveness probe for an id, when one was registered
    pub fn probe(&self, id: &str) -> Option<LivenessProbe> {
        self.probes.get(id).map(|r| r.clone())
    }

    /// Ids whose owner dropped its liveness guard
    pub fn dead_probes(&self) -> Vec<String> {
        self.probes
            .iter()
            .filter(|r| !r.value().is_alive())
            .map(|r| r.key().clone())
            .collect()
    }

    /// Number of records paired with a liveness probe
    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }

    pub fn type_counters(&self, owner: &str, resource_type: ResourceType) -> TypeCounters {
        self.counters
            .get(&(owner.to_string(), resource_type))
            .map(|r| *r)
            .unwrap_or_default()
    }

    /// Live and peak counts per type across all owners
    pub fn type_totals(&self) -> HashMap<ResourceType, TypeTotals> {
        ResourceType::ALL
            .iter()
            .map(|t| {
                let totals = self.totals.get(t).map(|r| *r).unwrap_or_default();
                (*t, totals)
            })
            .collect()
    }

    /// Every owner that has ever been granted a resource
    pub fn owners(&self) -> Vec<String> {
        let owners: BTreeSet<String> = self.counters.iter().map(|r| r.key().0.clone()).collect();
        owners.into_iter().collect()
    }

    /// Evict tombstones older than the grace period, returning how many
    pub fn purge_tombstones(&self, now: DateTime<Utc>) -> usize {
        let grace = chrono::Duration::from_std(self.release_grace).unwrap_or(chrono::Duration::zero());
        let before = self.tombstones.len();
        self.tombstones.retain(|_, a| match a.released_at {
            Some(at) => at + grace > now,
            None => false,
        });
        before.saturating_sub(self.tombstones.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> AllocationLedger {
        AllocationLedger::default()
    }

    #[test]
    fn test_track_and_release() {
        let ledger = ledger();
        ledger.track_allocation("r1", ResourceType::FileHandle, "plugin-a").unwrap();
        assert!(ledger.is_live("r1"));
        assert_eq!(ledger.live_count(), 1);

        let event = ledger.track_release("r1").unwrap().unwrap();
        assert_eq!(event.resource_type, ResourceType::FileHandle);
        assert!(!ledger.is_live("r1"));

        let tombstone = ledger.get("r1").unwrap();
        assert_eq!(tombstone.state, AllocationState::Released);
        assert!(tombstone.released_at.is_some());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let ledger = ledger();
        ledger.track_allocation("r1", ResourceType::Memory, "p").unwrap();
        let err = ledger.track_allocation("r1", ResourceType::Memory, "p").unwrap_err();
        assert!(matches!(err, AllocationError::AlreadyTracked(id) if id == "r1"));
    }

    #[test]
    fn test_empty_id_rejected() {
        let ledger = ledger();
        assert!(matches!(
            ledger.track_allocation("", ResourceType::Memory, "p"),
            Err(AllocationError::InvalidId)
        ));
        assert!(matches!(ledger.track_release(""), Err(AllocationError::InvalidId)));
    }

    #[test]
    fn test_double_release_is_noop() {
        let ledger = ledger();
        ledger.track_allocation("r1", ResourceType::Memory, "p").unwrap();
        assert!(ledger.track_release("r1").unwrap().is_some());
        assert!(ledger.track_release("r1").unwrap().is_none());
        assert!(ledger.track_release("never-tracked").unwrap().is_none());
        assert_eq!(ledger.type_counters("p", ResourceType::Memory).released, 1);
    }

    #[test]
    fn test_released_record_rejects_touch() {
        let ledger = ledger();
        ledger.track_allocation("r1", ResourceType::Memory, "p").unwrap();
        assert!(ledger.touch("r1").is_ok());
        ledger.track_release("r1").unwrap();
        assert!(matches!(ledger.touch("r1"), Err(AllocationError::NotTracked(_))));
    }

    #[test]
    fn test_never_active_and_retired_at_once() {
        let ledger = ledger();
        for i in 0..50 {
            let id = format!("r{}", i);
            ledger.track_allocation(&id, ResourceType::NetworkSocket, "p").unwrap();
            if i % 2 == 0 {
                ledger.track_release(&id).unwrap();
            } else if i % 3 == 0 {
                ledger.mark_orphaned(&id, Utc::now());
            }
        }
        for allocation in ledger.snapshot() {
            assert!(allocation.is_active());
            assert!(allocation.released_at.is_none());
        }
        for i in 0..50 {
            let id = format!("r{}", i);
            let record = ledger.get(&id).unwrap();
            assert_eq!(ledger.is_live(&id), record.is_active());
            if !record.is_active() {
                assert!(record.released_at.is_some());
            }
        }
    }

    #[test]
    fn test_racing_release_and_orphan_retire_once() {
        const IDS: usize = 200;
        let ledger = ledger();
        for i in 0..IDS {
            ledger
                .track_allocation(&format!("s{}", i), ResourceType::DatabaseConnection, "p")
                .unwrap();
        }

        let released = std::sync::atomic::AtomicUsize::new(0);
        let orphaned = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for worker in 0..4 {
                let (ledger, released, orphaned) = (&ledger, &released, &orphaned);
                scope.spawn(move || {
                    for i in 0..IDS {
                        // Alternate the order so threads meet on the same ids
                        let idx = if worker % 2 == 0 { i } else { IDS - 1 - i };
                        let id = format!("s{}", idx);
                        if worker < 2 {
                            if ledger.track_release(&id).unwrap().is_some() {
                                released.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            }
                        } else if ledger.mark_orphaned(&id, Utc::now()).is_some() {
                            orphaned.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        let released = released.into_inner();
        let orphaned = orphaned.into_inner();
        assert_eq!(released + orphaned, IDS);
        assert_eq!(ledger.live_count(), 0);

        let counters = ledger.type_counters("p", ResourceType::DatabaseConnection);
        assert_eq!(counters.released as usize, released);
        assert_eq!(counters.orphaned as usize, orphaned);
        assert_eq!(counters.live, 0);
        for i in 0..IDS {
            let record = ledger.get(&format!("s{}", i)).unwrap();
            assert!(!record.is_active());
            assert!(record.released_at.is_some());
        }
    }

    #[test]
    fn test_orphan_twice_returns_none() {
        let ledger = ledger();
        ledger.track_allocation("r1", ResourceType::FileHandle, "p").unwrap();
        let now = Utc::now();
        let orphan = ledger.mark_orphaned("r1", now).unwrap();
        assert_eq!(orphan.state, AllocationState::Orphaned);
        assert_eq!(orphan.released_at, Some(now));
        assert!(ledger.mark_orphaned("r1", now).is_none());
        // a release racing with the orphan sweep is still a no-op
        assert!(ledger.track_release("r1").unwrap().is_none());
    }

    #[test]
    fn test_counters_and_peaks() {
        let ledger = ledger();
        for i in 0..3 {
            ledger
                .track_allocation(&format!("h{}", i), ResourceType::FileHandle, "p")
                .unwrap();
        }
        ledger.track_release("h0").unwrap();
        ledger.mark_orphaned("h1", Utc::now());

        let counters = ledger.type_counters("p", ResourceType::FileHandle);
        assert_eq!(counters.allocated, 3);
        assert_eq!(counters.released, 1);
        assert_eq!(counters.orphaned, 1);
        assert_eq!(counters.live, 1);
        assert_eq!(counters.peak_live, 3);

        let totals = ledger.type_totals();
        assert_eq!(totals[&ResourceType::FileHandle], TypeTotals { live: 1, peak: 3 });
        assert_eq!(totals[&ResourceType::Memory], TypeTotals::default());
    }

    #[test]
    fn test_liveness_probe_reports_dropped_guard() {
        let ledger = ledger();
        let guard = ledger
            .track_allocation_with_liveness("m1", ResourceType::Memory, "p", 4096)
            .unwrap();
        assert!(ledger.dead_probes().is_empty());
        drop(guard);
        assert_eq!(ledger.dead_probes(), vec!["m1".to_string()]);

        ledger.track_release("m1").unwrap();
        assert!(ledger.dead_probes().is_empty());
    }

    #[test]
    fn test_purge_tombstones_after_grace() {
        let ledger = AllocationLedger::new(Duration::from_secs(60), 16);
        ledger.track_allocation("r1", ResourceType::Memory, "p").unwrap();
        let released_at = Utc::now();
        ledger.track_release_at("r1", released_at).unwrap();

        assert_eq!(ledger.purge_tombstones(released_at + chrono::Duration::seconds(30)), 0);
        assert!(ledger.get("r1").is_some());
        assert_eq!(ledger.purge_tombstones(released_at + chrono::Duration::seconds(61)), 1);
        assert!(ledger.get("r1").is_none());
    }

    #[test]
    fn test_release_owner() {
        let ledger = ledger();
        ledger.track_allocation("a", ResourceType::Memory, "p1").unwrap();
        ledger.track_allocation("b", ResourceType::FileHandle, "p1").unwrap();
        ledger.track_allocation("c", ResourceType::FileHandle, "p2").unwrap();

        let released = ledger.release_owner("p1");
        assert_eq!(released.len(), 2);
        assert!(ledger.snapshot_owner("p1").is_empty());
        assert_eq!(ledger.snapshot_owner("p2").len(), 1);
        assert_eq!(ledger.owners(), vec!["p1".to_string(), "p2".to_string()]);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let ledger = ledger();
        let mut rx = ledger.subscribe();
        ledger.track_allocation("r1", ResourceType::ThreadPool, "p").unwrap();
        ledger.track_release("r1").unwrap();

        assert!(matches!(rx.recv().await.unwrap(), LedgerEvent::Allocated(a) if a.id == "r1"));
        assert!(matches!(rx.recv().await.unwrap(), LedgerEvent::Released(e) if e.id == "r1"));
    }
}
