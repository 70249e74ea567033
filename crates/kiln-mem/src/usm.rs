//! # Unified Memory Allocations
//!
//! The record kept for every USM allocation: its range, kind, the devices
//! it spans, the graphics allocations backing it, advice flags and the
//! count of in-flight submissions still using it.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use arrayvec::ArrayVec;
use spin::Mutex;

use kiln_core::{ByteSize, DeviceBitfield, Error, GpuAddr, Result};

use crate::allocation::GraphicsAllocation;

/// Maximum number of root devices an allocation can span
pub const MAX_ROOT_DEVICES: usize = 4;

// =============================================================================
// KIND
// =============================================================================

/// USM allocation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsmKind {
    /// Host allocation visible to every device
    Host,
    /// Device-private allocation
    Device,
    /// Shared (managed) allocation that migrates between host and device
    Shared,
    /// Memory allocated outside the driver; never stored in the registry
    System,
}

impl UsmKind {
    /// Check if allocations of this kind can be migrated
    #[inline]
    pub const fn is_migratable(self) -> bool {
        matches!(self, Self::Shared)
    }
}

// =============================================================================
// ADVICE
// =============================================================================

bitflags::bitflags! {
    /// Migration/residency flags accumulated from memory advice
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemAdviseFlags: u32 {
        /// Read mostly
        const READ_ONLY = 1 << 0;
        /// Prefer device-local placement
        const DEVICE_PREFERRED_LOCATION = 1 << 1;
        /// Prefer system memory placement
        const SYSTEM_PREFERRED_LOCATION = 1 << 2;
        /// Accessed non-atomically
        const NON_ATOMIC = 1 << 3;
        /// Bias toward cached access
        const CACHED_MEMORY = 1 << 4;
    }
}

/// Memory advice as given by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemAdvice {
    /// Mark read mostly
    SetReadMostly,
    /// Clear read mostly
    ClearReadMostly,
    /// Prefer the advising device
    SetPreferredLocation,
    /// Clear device preference
    ClearPreferredLocation,
    /// Mark non-atomic mostly
    SetNonAtomicMostly,
    /// Clear non-atomic mostly
    ClearNonAtomicMostly,
    /// Bias cached
    BiasCached,
    /// Bias uncached
    BiasUncached,
    /// Prefer system memory
    SetSystemMemoryPreferredLocation,
    /// Clear system memory preference
    ClearSystemMemoryPreferredLocation,
}

impl MemAdviseFlags {
    /// Apply one piece of advice
    pub fn apply(&mut self, advice: MemAdvice) {
        match advice {
            MemAdvice::SetReadMostly => self.insert(Self::READ_ONLY),
            MemAdvice::ClearReadMostly => self.remove(Self::READ_ONLY),
            MemAdvice::SetPreferredLocation => {
                self.insert(Self::DEVICE_PREFERRED_LOCATION);
                self.remove(Self::SYSTEM_PREFERRED_LOCATION);
            }
            MemAdvice::ClearPreferredLocation => self.remove(Self::DEVICE_PREFERRED_LOCATION),
            MemAdvice::SetNonAtomicMostly => self.insert(Self::NON_ATOMIC),
            MemAdvice::ClearNonAtomicMostly => self.remove(Self::NON_ATOMIC),
            MemAdvice::BiasCached => self.insert(Self::CACHED_MEMORY),
            MemAdvice::BiasUncached => self.remove(Self::CACHED_MEMORY),
            MemAdvice::SetSystemMemoryPreferredLocation => {
                self.insert(Self::SYSTEM_PREFERRED_LOCATION);
                self.remove(Self::DEVICE_PREFERRED_LOCATION);
            }
            MemAdvice::ClearSystemMemoryPreferredLocation => {
                self.remove(Self::SYSTEM_PREFERRED_LOCATION)
            }
        }
    }
}

bitflags::bitflags! {
    /// Atomic access attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AtomicAccessFlags: u32 {
        /// Atomics from the device
        const DEVICE = 1 << 0;
        /// Atomics from the host
        const HOST = 1 << 1;
        /// Atomics from host and device concurrently
        const SYSTEM = 1 << 2;
    }
}

// =============================================================================
// USM ALLOCATION
// =============================================================================

/// One registered USM allocation
#[derive(Debug)]
pub struct UsmAllocation {
    base: GpuAddr,
    size: ByteSize,
    kind: UsmKind,
    device_bitfield: DeviceBitfield,
    /// One backing allocation per root device
    gpu_allocations: ArrayVec<Arc<GraphicsAllocation>, MAX_ROOT_DEVICES>,
    /// CPU-side allocation of a shared allocation without KMD migration
    cpu_allocation: Option<Arc<GraphicsAllocation>>,
    kmd_migrated: bool,
    advice: Mutex<MemAdviseFlags>,
    atomic_access: Mutex<AtomicAccessFlags>,
    in_flight: AtomicU32,
}

impl UsmAllocation {
    /// Build a record
    pub fn new(
        base: GpuAddr,
        size: ByteSize,
        kind: UsmKind,
        device_bitfield: DeviceBitfield,
        gpu_allocations: ArrayVec<Arc<GraphicsAllocation>, MAX_ROOT_DEVICES>,
        cpu_allocation: Option<Arc<GraphicsAllocation>>,
        kmd_migrated: bool,
    ) -> Self {
        Self {
            base,
            size,
            kind,
            device_bitfield,
            gpu_allocations,
            cpu_allocation,
            kmd_migrated,
            advice: Mutex::new(MemAdviseFlags::empty()),
            atomic_access: Mutex::new(AtomicAccessFlags::empty()),
            in_flight: AtomicU32::new(0),
        }
    }

    /// Base address
    #[inline]
    pub fn base(&self) -> GpuAddr {
        self.base
    }

    /// Size
    #[inline]
    pub fn size(&self) -> ByteSize {
        self.size
    }

    /// End address (exclusive)
    #[inline]
    pub fn end(&self) -> GpuAddr {
        self.base + self.size.as_bytes()
    }

    /// Allocation kind
    #[inline]
    pub fn kind(&self) -> UsmKind {
        self.kind
    }

    /// Sub-devices the allocation was made for
    #[inline]
    pub fn device_bitfield(&self) -> DeviceBitfield {
        self.device_bitfield
    }

    /// Check if the KMD migrates this allocation
    #[inline]
    pub fn is_kmd_migrated(&self) -> bool {
        self.kmd_migrated
    }

    /// Check if `ptr` falls inside the allocation
    #[inline]
    pub fn contains(&self, ptr: GpuAddr) -> bool {
        ptr >= self.base && ptr < self.end()
    }

    /// Check if `[ptr, ptr + size)` falls inside the allocation
    pub fn contains_range(&self, ptr: GpuAddr, size: u64) -> bool {
        self.contains(ptr)
            && ptr
                .raw()
                .checked_add(size)
                .is_some_and(|end| end <= self.end().raw())
    }

    /// Backing allocation for a root device
    pub fn gpu_allocation(&self, root_device_index: u32) -> Option<&Arc<GraphicsAllocation>> {
        self.gpu_allocations
            .iter()
            .find(|a| a.root_device_index == root_device_index)
    }

    /// Every backing allocation
    pub fn gpu_allocations(&self) -> &[Arc<GraphicsAllocation>] {
        &self.gpu_allocations
    }

    /// CPU-side allocation, if any
    pub fn cpu_allocation(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.cpu_allocation.as_ref()
    }

    /// Check if a device accesses this allocation in host-visible memory
    ///
    /// Host allocations always are. Shared allocations are when their
    /// backing allocation for that device sits in a system memory pool.
    pub fn is_system_memory_for(&self, root_device_index: u32) -> bool {
        match self.kind {
            UsmKind::Host | UsmKind::System => true,
            UsmKind::Device => false,
            UsmKind::Shared => self
                .gpu_allocation(root_device_index)
                .is_some_and(|a| a.is_system_memory()),
        }
    }

    /// Current advice flags
    pub fn advice(&self) -> MemAdviseFlags {
        *self.advice.lock()
    }

    /// Apply advice; returns the new flags
    pub fn apply_advice(&self, advice: MemAdvice) -> MemAdviseFlags {
        let mut flags = self.advice.lock();
        flags.apply(advice);
        *flags
    }

    /// Current atomic-access flags
    pub fn atomic_access(&self) -> AtomicAccessFlags {
        *self.atomic_access.lock()
    }

    /// Replace atomic-access flags
    pub fn set_atomic_access(&self, flags: AtomicAccessFlags) {
        *self.atomic_access.lock() = flags;
    }

    /// Mark one more submission as using the allocation
    pub fn acquire(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a submission's use
    pub fn release(&self) -> Result<()> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| Error::InvalidState)
    }

    /// Number of in-flight submissions using the allocation
    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: UsmKind) -> UsmAllocation {
        UsmAllocation::new(
            GpuAddr::new(0x1000_0000),
            ByteSize::KIB_4,
            kind,
            DeviceBitfield::new(1),
            ArrayVec::new(),
            None,
            false,
        )
    }

    #[test]
    fn test_contains_range() {
        let a = record(UsmKind::Device);
        assert!(a.contains_range(GpuAddr::new(0x1000_0000), 4096));
        assert!(a.contains_range(GpuAddr::new(0x1000_0800), 0x800));
        assert!(!a.contains_range(GpuAddr::new(0x1000_0800), 0x801));
        assert!(!a.contains_range(GpuAddr::new(0x0fff_ffff), 1));
    }

    #[test]
    fn test_advice_flags() {
        let a = record(UsmKind::Shared);
        a.apply_advice(MemAdvice::SetPreferredLocation);
        assert!(a.advice().contains(MemAdviseFlags::DEVICE_PREFERRED_LOCATION));

        let flags = a.apply_advice(MemAdvice::SetSystemMemoryPreferredLocation);
        assert!(flags.contains(MemAdviseFlags::SYSTEM_PREFERRED_LOCATION));
        assert!(!flags.contains(MemAdviseFlags::DEVICE_PREFERRED_LOCATION));

        a.apply_advice(MemAdvice::SetNonAtomicMostly);
        a.apply_advice(MemAdvice::BiasCached);
        assert!(a.advice().contains(MemAdviseFlags::NON_ATOMIC | MemAdviseFlags::CACHED_MEMORY));
    }

    #[test]
    fn test_in_flight_counting() {
        let a = record(UsmKind::Host);
        a.acquire();
        a.acquire();
        assert_eq!(a.in_flight_count(), 2);
        a.release().unwrap();
        a.release().unwrap();
        assert_eq!(a.release().unwrap_err(), Error::InvalidState);
    }

    #[test]
    fn test_system_memory_classification() {
        assert!(record(UsmKind::Host).is_system_memory_for(0));
        assert!(!record(UsmKind::Device).is_system_memory_for(0));
        // No backing allocation for the device: not host-visible to it
        assert!(!record(UsmKind::Shared).is_system_memory_for(0));
    }
}
