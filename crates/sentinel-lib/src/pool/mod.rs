//! Adaptive resource pools

mod handles;
mod manager;
mod memory;
mod sizing;

pub use handles::{FileHandlePool, HandleSource, InProcessHandleSource, PlaceholderHandle};
pub use manager::{
    AdaptivePoolManager, AllocationPlan, OptimizationReport, OrphanSink, PoolAllocation,
    PoolStats, TypeActivity, POOL_OWNER,
};
pub use memory::MemoryPool;
pub use sizing::{compute_pool_size, duration_factor, PoolSize};
