//! # Graphics Allocations
//!
//! A [`GraphicsAllocation`] is one KMD buffer object bound at a GPU virtual
//! address. USM allocations, command buffers and event pools are all backed
//! by graphics allocations; residency lists are lists of them.

use core::fmt;

use kiln_core::{ByteSize, DeviceBitfield, GpuAddr};

use crate::kmd::BoHandle;

// =============================================================================
// ALLOCATION ID
// =============================================================================

/// Unique identity of a graphics allocation
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AllocationId(u64);

impl AllocationId {
    /// Create from raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AllocationId({})", self.0)
    }
}

// =============================================================================
// MEMORY POOL
// =============================================================================

/// Physical placement of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryPool {
    /// System memory, 4 KiB pages
    System4K,
    /// System memory, 64 KiB pages
    System64K,
    /// Device-local memory
    LocalMemory,
}

impl MemoryPool {
    /// Check if the pool is host-visible system memory
    #[inline]
    pub const fn is_system_memory(self) -> bool {
        matches!(self, Self::System4K | Self::System64K)
    }
}

// =============================================================================
// ALLOCATION TYPE
// =============================================================================

/// What an allocation is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationType {
    /// Host USM allocation
    BufferHostMemory,
    /// Device USM allocation
    Buffer,
    /// CPU side of a shared allocation
    SvmCpu,
    /// GPU side of a shared allocation
    SvmGpu,
    /// Shared allocation migrated by the KMD
    UnifiedShared,
    /// Command buffer backing a command stream
    CommandBuffer,
    /// Kernel argument (indirect object) heap
    IndirectHeap,
    /// Event pool / timestamp storage
    TimestampPacket,
    /// Kernel instructions
    KernelIsa,
}

// =============================================================================
// GRAPHICS ALLOCATION
// =============================================================================

/// A buffer object bound at a GPU virtual address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsAllocation {
    /// Identity
    pub id: AllocationId,
    /// KMD buffer object
    pub handle: BoHandle,
    /// Bound GPU virtual address
    pub gpu_address: GpuAddr,
    /// Size
    pub size: ByteSize,
    /// Placement
    pub pool: MemoryPool,
    /// Usage
    pub allocation_type: AllocationType,
    /// Root device the allocation belongs to
    pub root_device_index: u32,
    /// Sub-devices the allocation spans
    pub device_bitfield: DeviceBitfield,
}

impl GraphicsAllocation {
    /// End address (exclusive)
    #[inline]
    pub fn end(&self) -> GpuAddr {
        self.gpu_address + self.size.as_bytes()
    }

    /// Check if the allocation lives in host-visible system memory
    #[inline]
    pub fn is_system_memory(&self) -> bool {
        self.pool.is_system_memory()
    }

    /// Check if an address falls inside the allocation
    #[inline]
    pub fn contains(&self, addr: GpuAddr) -> bool {
        addr >= self.gpu_address && addr < self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_classification() {
        assert!(MemoryPool::System4K.is_system_memory());
        assert!(MemoryPool::System64K.is_system_memory());
        assert!(!MemoryPool::LocalMemory.is_system_memory());
    }

    #[test]
    fn test_contains() {
        let alloc = GraphicsAllocation {
            id: AllocationId::new(1),
            handle: BoHandle(1),
            gpu_address: GpuAddr::new(0x10000),
            size: ByteSize::KIB_4,
            pool: MemoryPool::LocalMemory,
            allocation_type: AllocationType::Buffer,
            root_device_index: 0,
            device_bitfield: DeviceBitfield::new(1),
        };
        assert!(alloc.contains(GpuAddr::new(0x10000)));
        assert!(alloc.contains(GpuAddr::new(0x10fff)));
        assert!(!alloc.contains(GpuAddr::new(0x11000)));
        assert!(!alloc.is_system_memory());
    }
}
