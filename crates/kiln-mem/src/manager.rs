//! # Memory Manager
//!
//! Creates and destroys [`GraphicsAllocation`]s: reserves GPU virtual
//! address ranges and asks the KMD for buffer objects bound at them.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use kiln_core::{ByteSize, DeviceBitfield, Error, GpuAddr, Result};

use crate::allocation::{AllocationId, AllocationType, GraphicsAllocation, MemoryPool};
use crate::kmd::{BoCreateRequest, KmdMemory, MemoryRegion};
use crate::va::{AddressSpace, VaRange};

// =============================================================================
// ALLOCATION PROPERTIES
// =============================================================================

/// Request for a graphics allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationProperties {
    /// Size
    pub size: ByteSize,
    /// Placement
    pub pool: MemoryPool,
    /// Usage
    pub allocation_type: AllocationType,
    /// Root device
    pub root_device_index: u32,
    /// Sub-devices spanned
    pub device_bitfield: DeviceBitfield,
}

impl AllocationProperties {
    /// Region the buffer object is created in
    pub fn region(&self) -> MemoryRegion {
        match self.pool {
            MemoryPool::LocalMemory => MemoryRegion::device(
                self.device_bitfield
                    .sub_device_ids()
                    .first()
                    .copied()
                    .unwrap_or(0),
            ),
            MemoryPool::System4K | MemoryPool::System64K => MemoryRegion::SYSTEM,
        }
    }
}

// =============================================================================
// MEMORY MANAGER
// =============================================================================

/// Memory manager statistics
#[derive(Debug, Clone, Default)]
pub struct MemoryManagerStats {
    /// Buffer objects created
    pub created: u64,
    /// Buffer objects closed
    pub closed: u64,
    /// Bytes currently backed in local memory
    pub local_bytes: u64,
    /// Bytes currently backed in system memory
    pub system_bytes: u64,
}

/// Graphics allocation factory over one KMD
pub struct MemoryManager {
    kmd: Arc<dyn KmdMemory>,
    address_space: Mutex<AddressSpace>,
    next_id: AtomicU64,
    stats: Mutex<MemoryManagerStats>,
}

impl MemoryManager {
    /// Create a manager over the default USM address range
    pub fn new(kmd: Arc<dyn KmdMemory>) -> Self {
        Self::with_address_space(kmd, AddressSpace::default())
    }

    /// Create a manager over a specific address space
    pub fn with_address_space(kmd: Arc<dyn KmdMemory>, address_space: AddressSpace) -> Self {
        Self {
            kmd,
            address_space: Mutex::new(address_space),
            next_id: AtomicU64::new(1),
            stats: Mutex::new(MemoryManagerStats::default()),
        }
    }

    /// KMD memory interface
    pub fn kmd(&self) -> &Arc<dyn KmdMemory> {
        &self.kmd
    }

    /// Reserve a virtual range
    pub fn reserve(&self, size: ByteSize, alignment: u64) -> Result<VaRange> {
        self.address_space.lock().allocate(size, alignment)
    }

    /// Return a virtual range
    pub fn unreserve(&self, range: VaRange) -> Result<()> {
        self.address_space.lock().free(range)
    }

    /// Create a buffer object bound at the start of a reserved range
    pub fn create_at(
        &self,
        range: VaRange,
        props: &AllocationProperties,
    ) -> Result<Arc<GraphicsAllocation>> {
        let out_of_memory = if props.pool.is_system_memory() {
            Error::OutOfHostMemory
        } else {
            Error::OutOfDeviceMemory
        };

        let request = BoCreateRequest {
            size: range.size(),
            region: props.region(),
            root_device_index: props.root_device_index,
        };
        let handle = self.kmd.create_buffer_object(&request).map_err(|e| {
            log::warn!("buffer object creation failed: {}", e);
            out_of_memory
        })?;

        if let Err(e) = self.kmd.bind(handle, range.start, range.size()) {
            log::warn!("bind of {:?} at {} failed: {}", handle, range.start, e);
            let _ = self.kmd.close_buffer_object(handle);
            return Err(out_of_memory);
        }

        let allocation = GraphicsAllocation {
            id: AllocationId::new(self.next_id.fetch_add(1, Ordering::Relaxed)),
            handle,
            gpu_address: range.start,
            size: range.size(),
            pool: props.pool,
            allocation_type: props.allocation_type,
            root_device_index: props.root_device_index,
            device_bitfield: props.device_bitfield,
        };

        let mut stats = self.stats.lock();
        stats.created += 1;
        if allocation.is_system_memory() {
            stats.system_bytes += allocation.size.as_bytes();
        } else {
            stats.local_bytes += allocation.size.as_bytes();
        }

        Ok(Arc::new(allocation))
    }

    /// Reserve a range and create a buffer object in it
    pub fn allocate(&self, props: &AllocationProperties) -> Result<Arc<GraphicsAllocation>> {
        let range = self.reserve(props.size, AddressSpace::PAGE_SIZE)?;
        match self.create_at(range, props) {
            Ok(allocation) => Ok(allocation),
            Err(e) => {
                let _ = self.unreserve(range);
                Err(e)
            }
        }
    }

    /// Close an allocation's buffer object, keeping its virtual range
    pub fn release(&self, allocation: &GraphicsAllocation) {
        if let Err(e) = self.kmd.close_buffer_object(allocation.handle) {
            log::warn!("close of {:?} failed: {}", allocation.handle, e);
        }
        let mut stats = self.stats.lock();
        stats.closed += 1;
        if allocation.is_system_memory() {
            stats.system_bytes = stats.system_bytes.saturating_sub(allocation.size.as_bytes());
        } else {
            stats.local_bytes = stats.local_bytes.saturating_sub(allocation.size.as_bytes());
        }
    }

    /// Close an allocation and return its virtual range
    pub fn free(&self, allocation: &GraphicsAllocation) -> Result<()> {
        self.release(allocation);
        self.unreserve(VaRange::new(allocation.gpu_address, allocation.size))
    }

    /// Get statistics
    pub fn stats(&self) -> MemoryManagerStats {
        self.stats.lock().clone()
    }

    /// Check whether an address is inside the managed range
    pub fn manages(&self, address: GpuAddr) -> bool {
        self.address_space.lock().range().contains(address)
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{KmdCall, SimulatedKmd};

    fn props(pool: MemoryPool) -> AllocationProperties {
        AllocationProperties {
            size: ByteSize::from_bytes(100),
            pool,
            allocation_type: AllocationType::Buffer,
            root_device_index: 0,
            device_bitfield: DeviceBitfield::new(0b10),
        }
    }

    #[test]
    fn test_allocate_creates_and_binds() {
        let kmd = Arc::new(SimulatedKmd::new());
        let mm = MemoryManager::new(kmd.clone());

        let alloc = mm.allocate(&props(MemoryPool::LocalMemory)).unwrap();
        assert_eq!(alloc.size, ByteSize::KIB_4);
        assert!(mm.manages(alloc.gpu_address));

        let calls = kmd.calls();
        assert_eq!(
            calls[0],
            KmdCall::CreateBo {
                handle: alloc.handle,
                size: ByteSize::KIB_4,
                region: MemoryRegion::device(1),
            }
        );
        assert_eq!(
            calls[1],
            KmdCall::Bind {
                handle: alloc.handle,
                address: alloc.gpu_address,
            }
        );
        assert_eq!(mm.stats().local_bytes, 4096);
    }

    #[test]
    fn test_create_failure_maps_to_pool() {
        let kmd = Arc::new(SimulatedKmd::new());
        let mm = MemoryManager::new(kmd.clone());
        kmd.fail_create(SimulatedKmd::ENOMEM);

        assert_eq!(
            mm.allocate(&props(MemoryPool::LocalMemory)).unwrap_err(),
            Error::OutOfDeviceMemory
        );
        assert_eq!(
            mm.allocate(&props(MemoryPool::System4K)).unwrap_err(),
            Error::OutOfHostMemory
        );
        assert_eq!(mm.stats().created, 0);
    }

    #[test]
    fn test_free_returns_range() {
        let kmd = Arc::new(SimulatedKmd::new());
        let mm = MemoryManager::new(kmd);
        let a = mm.allocate(&props(MemoryPool::System4K)).unwrap();
        mm.free(&a).unwrap();
        let b = mm.allocate(&props(MemoryPool::System4K)).unwrap();
        assert_eq!(a.gpu_address, b.gpu_address);
        assert_eq!(mm.stats().system_bytes, 4096);
    }
}
