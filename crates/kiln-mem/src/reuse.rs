//! # Command Buffer Reuse Pool
//!
//! Command buffers released by destroyed immediate command lists are parked
//! here and handed to the next stream of the same device. Lists can be
//! destroyed from any thread, so the pool is locked.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use kiln_core::ByteSize;

use crate::allocation::{AllocationType, GraphicsAllocation};

/// Reuse pool statistics
#[derive(Debug, Clone, Default)]
pub struct ReuseStats {
    /// Buffers handed back out
    pub hits: u64,
    /// Requests that found nothing suitable
    pub misses: u64,
    /// Buffers parked
    pub stored: u64,
    /// Buffers rejected because the pool was full
    pub rejected: u64,
}

/// Shared free-list of command buffers (`allocationsForReuse`)
#[derive(Debug)]
pub struct CommandBufferReusePool {
    buffers: Mutex<Vec<Arc<GraphicsAllocation>>>,
    capacity: usize,
    stats: Mutex<ReuseStats>,
}

impl CommandBufferReusePool {
    /// Create a pool holding at most `capacity` buffers
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            stats: Mutex::new(ReuseStats::default()),
        }
    }

    /// Take a parked buffer of at least `min_size` bytes
    pub fn obtain(&self, min_size: ByteSize) -> Option<Arc<GraphicsAllocation>> {
        let mut buffers = self.buffers.lock();
        let found = buffers
            .iter()
            .position(|b| b.size >= min_size)
            .map(|i| buffers.swap_remove(i));

        let mut stats = self.stats.lock();
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        found
    }

    /// Park a buffer; hands it back when the pool is full
    pub fn store(
        &self,
        buffer: Arc<GraphicsAllocation>,
    ) -> core::result::Result<(), Arc<GraphicsAllocation>> {
        if buffer.allocation_type != AllocationType::CommandBuffer {
            return Err(buffer);
        }

        let mut buffers = self.buffers.lock();
        if buffers.len() >= self.capacity {
            self.stats.lock().rejected += 1;
            log::warn!(
                "command buffer reuse pool full ({}), releasing {:?}",
                self.capacity,
                buffer.id
            );
            return Err(buffer);
        }
        buffers.push(buffer);
        self.stats.lock().stored += 1;
        Ok(())
    }

    /// Remove every parked buffer
    pub fn drain(&self) -> Vec<Arc<GraphicsAllocation>> {
        core::mem::take(&mut *self.buffers.lock())
    }

    /// Number of parked buffers
    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }

    /// Get statistics
    pub fn stats(&self) -> ReuseStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{AllocationId, MemoryPool};
    use crate::kmd::BoHandle;
    use kiln_core::{DeviceBitfield, GpuAddr};

    fn buffer(id: u64, size: ByteSize, allocation_type: AllocationType) -> Arc<GraphicsAllocation> {
        Arc::new(GraphicsAllocation {
            id: AllocationId::new(id),
            handle: BoHandle(id as u32),
            gpu_address: GpuAddr::new(id * 0x10000),
            size,
            pool: MemoryPool::System4K,
            allocation_type,
            root_device_index: 0,
            device_bitfield: DeviceBitfield::new(1),
        })
    }

    #[test]
    fn test_store_and_obtain() {
        let pool = CommandBufferReusePool::new(2);
        pool.store(buffer(1, ByteSize::KIB_4, AllocationType::CommandBuffer)).unwrap();
        pool.store(buffer(2, ByteSize::KIB_64, AllocationType::CommandBuffer)).unwrap();

        let big = pool.obtain(ByteSize::from_kib(16)).unwrap();
        assert_eq!(big.id, AllocationId::new(2));
        assert!(pool.obtain(ByteSize::from_kib(16)).is_none());
        assert_eq!(pool.len(), 1);

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_full_pool_hands_buffer_back() {
        let pool = CommandBufferReusePool::new(1);
        pool.store(buffer(1, ByteSize::KIB_4, AllocationType::CommandBuffer)).unwrap();
        let rejected = pool
            .store(buffer(2, ByteSize::KIB_4, AllocationType::CommandBuffer))
            .unwrap_err();
        assert_eq!(rejected.id, AllocationId::new(2));
        assert_eq!(pool.stats().rejected, 1);
    }

    #[test]
    fn test_only_command_buffers_are_parked() {
        let pool = CommandBufferReusePool::new(4);
        assert!(pool.store(buffer(1, ByteSize::KIB_4, AllocationType::Buffer)).is_err());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_concurrent_store() {
        extern crate std;
        use std::thread;

        let pool = Arc::new(CommandBufferReusePool::new(64));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for i in 0..8 {
                        let id = t * 100 + i + 1;
                        pool.store(buffer(id, ByteSize::KIB_4, AllocationType::CommandBuffer))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.len(), 32);
        assert_eq!(pool.drain().len(), 32);
        assert!(pool.is_empty());
    }
}
