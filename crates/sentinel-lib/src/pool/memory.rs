//! Pre-faulted memory pools
//!
//! Every page of the anonymous mapping is written once at creation so the
//! kernel has backed it before the pool is handed out.

use memmap2::{MmapMut, MmapOptions};
use std::io;

const PAGE_SIZE: usize = 4096;

/// Eagerly committed anonymous memory region
pub struct MemoryPool {
    map: MmapMut,
    pages_faulted: usize,
}

impl MemoryPool {
    /// Map and pre-fault `size_bytes` of anonymous memory off the async runtime
    pub async fn create(size_bytes: u64) -> io::Result<Self> {
        let len = usize::try_from(size_bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pool size exceeds address space"))?;
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "pool size must be non-zero"));
        }

        tokio::task::spawn_blocking(move || Self::map_prefaulted(len))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    fn map_prefaulted(len: usize) -> io::Result<Self> {
        let mut map = MmapOptions::new().len(len).map_anon()?;
        let mut pages_faulted = 0;
        for offset in (0..len).step_by(PAGE_SIZE) {
            map[offset] = 1;
            pages_faulted += 1;
        }
        Ok(Self { map, pages_faulted })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn pages_faulted(&self) -> usize {
        self.pages_faulted
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("len", &self.map.len())
            .field("pages_faulted", &self.pages_faulted)
            .finish()
    }
}
