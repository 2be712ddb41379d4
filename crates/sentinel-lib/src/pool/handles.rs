//! Placeholder file-handle pools

use crate::error::AllocationError;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Reserved handle slot obtained from a [`HandleSource`]
#[derive(Debug, PartialEq, Eq)]
pub struct PlaceholderHandle {
    pub id: u64,
}

/// System a pool borrows handle slots from
pub trait HandleSource: Send + Sync {
    fn acquire(&self) -> Result<PlaceholderHandle, AllocationError>;

    fn release(&self, handle: PlaceholderHandle);

    /// Slots currently handed out
    fn outstanding(&self) -> usize;
}

/// Handle source that only counts reservations
pub struct InProcessHandleSource {
    next_id: AtomicU64,
    outstanding: AtomicUsize,
    limit: usize,
}

impl InProcessHandleSource {
    pub fn new(limit: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            outstanding: AtomicUsize::new(0),
            limit,
        }
    }
}

impl Default for InProcessHandleSource {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl HandleSource for InProcessHandleSource {
    fn acquire(&self) -> Result<PlaceholderHandle, AllocationError> {
        let reserved = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(AllocationError::HandlesExhausted {
                requested: 1,
                acquired: 0,
            });
        }
        Ok(PlaceholderHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn release(&self, _handle: PlaceholderHandle) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// Fixed set of handle slots held for one context key
///
/// Slots return to their source on [`teardown`](Self::teardown) or drop.
pub struct FileHandlePool {
    source: Arc<dyn HandleSource>,
    handles: Mutex<Vec<PlaceholderHandle>>,
    capacity: u32,
}

impl FileHandlePool {
    pub fn create(source: Arc<dyn HandleSource>, count: u32) -> Result<Self, AllocationError> {
        let mut handles = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match source.acquire() {
                Ok(handle) => handles.push(handle),
                Err(_) => {
                    let acquired = handles.len() as u32;
                    for handle in handles {
                        source.release(handle);
                    }
                    return Err(AllocationError::HandlesExhausted {
                        requested: count,
                        acquired,
                    });
                }
            }
        }
        Ok(Self {
            source,
            handles: Mutex::new(handles),
            capacity: count,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn held(&self) -> usize {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Return every held slot to the source; returns the number released
    pub fn teardown(&self) -> usize {
        let drained: Vec<PlaceholderHandle> = {
            let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            handles.drain(..).collect()
        };
        let count = drained.len();
        for handle in drained {
            self.source.release(handle);
        }
        if count > 0 {
            debug!(released = count, "Handle pool torn down");
        }
        count
    }
}

impl Drop for FileHandlePool {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for FileHandlePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandlePool")
            .field("capacity", &self.capacity)
            .field("held", &self.held())
            .finish()
    }
}
