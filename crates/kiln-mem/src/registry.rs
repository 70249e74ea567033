//! # Unified Memory Allocation Registry
//!
//! Authoritative address → allocation index for every USM allocation.
//!
//! Records are keyed by base address in an ordered map. An interior pointer
//! resolves to the record with the greatest base `<= ptr`, provided `ptr`
//! is below that record's end. Ranges never overlap, so this is the only
//! candidate.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use kiln_core::{Error, GpuAddr, Result};

use crate::usm::{UsmAllocation, UsmKind};

// =============================================================================
// REGISTRY
// =============================================================================

/// Registry statistics
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Total records inserted
    pub inserted: u64,
    /// Total records removed
    pub removed: u64,
    /// Rejected overlapping inserts
    pub duplicates: u64,
}

/// Process-wide USM allocation registry
#[derive(Debug, Default)]
pub struct UnifiedMemoryAllocationRegistry {
    records: RwLock<BTreeMap<GpuAddr, Arc<UsmAllocation>>>,
    stats: RwLock<RegistryStats>,
}

impl UnifiedMemoryAllocationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new allocation
    pub fn insert(&self, allocation: Arc<UsmAllocation>) -> Result<Arc<UsmAllocation>> {
        if allocation.size().as_bytes() == 0 || allocation.kind() == UsmKind::System {
            return Err(Error::InvalidArgument);
        }

        let mut records = self.records.write();
        let base = allocation.base();
        let end = allocation.end();

        // Predecessor reaching into us, or a successor starting before our end
        let overlaps_prev = records
            .range(..=base)
            .next_back()
            .is_some_and(|(_, prev)| prev.end() > base);
        let overlaps_next = records
            .range(base..)
            .next()
            .is_some_and(|(start, _)| *start < end);

        if overlaps_prev || overlaps_next {
            self.stats.write().duplicates += 1;
            log::warn!(
                "usm insert {}..{} overlaps a live allocation",
                base,
                end
            );
            return Err(Error::DuplicateAllocation);
        }

        records.insert(base, allocation.clone());
        self.stats.write().inserted += 1;

        #[cfg(feature = "debug-alloc")]
        log::trace!("usm insert {:?} {}..{}", allocation.kind(), base, end);

        Ok(allocation)
    }

    /// Resolve any pointer, including interior pointers
    pub fn lookup(&self, ptr: GpuAddr) -> Result<Arc<UsmAllocation>> {
        self.records
            .read()
            .range(..=ptr)
            .next_back()
            .filter(|(_, record)| record.contains(ptr))
            .map(|(_, record)| record.clone())
            .ok_or(Error::NotFound)
    }

    /// Resolve a range; the whole range must lie inside one allocation
    pub fn lookup_range(&self, ptr: GpuAddr, size: u64) -> Result<Arc<UsmAllocation>> {
        let record = self.lookup(ptr)?;
        if record.contains_range(ptr, size) {
            Ok(record)
        } else {
            Err(Error::InvalidArgument)
        }
    }

    /// Remove the allocation whose base address is `ptr`
    pub fn remove(&self, ptr: GpuAddr) -> Result<Arc<UsmAllocation>> {
        let mut records = self.records.write();

        let Some(record) = records.get(&ptr) else {
            // An interior pointer names a live allocation but is not a valid free target
            let interior = records
                .range(..=ptr)
                .next_back()
                .is_some_and(|(_, r)| r.contains(ptr));
            return Err(if interior {
                Error::InvalidArgument
            } else {
                Error::NotFound
            });
        };

        if record.in_flight_count() > 0 {
            log::error!(
                "usm free {} while {} submission(s) still reference it",
                ptr,
                record.in_flight_count()
            );
            return Err(Error::AllocationStillReferenced);
        }

        let record = records.remove(&ptr).ok_or(Error::NotFound)?;
        self.stats.write().removed += 1;

        #[cfg(feature = "debug-alloc")]
        log::trace!("usm remove {:?} {}", record.kind(), ptr);

        Ok(record)
    }

    /// Number of live allocations
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Live allocations of a kind, in address order
    pub fn allocations_of_kind(&self, kind: UsmKind) -> Vec<Arc<UsmAllocation>> {
        self.records
            .read()
            .values()
            .filter(|r| r.kind() == kind)
            .cloned()
            .collect()
    }

    /// Get statistics
    pub fn stats(&self) -> RegistryStats {
        self.stats.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrayvec::ArrayVec;
    use kiln_core::{ByteSize, DeviceBitfield};

    fn record(base: u64, size: u64, kind: UsmKind) -> Arc<UsmAllocation> {
        Arc::new(UsmAllocation::new(
            GpuAddr::new(base),
            ByteSize::from_bytes(size),
            kind,
            DeviceBitfield::new(1),
            ArrayVec::new(),
            None,
            false,
        ))
    }

    #[test]
    fn test_interior_pointer_resolves_to_owner() {
        let registry = UnifiedMemoryAllocationRegistry::new();
        let a = registry.insert(record(0x10000, 0x1000, UsmKind::Device)).unwrap();
        let b = registry.insert(record(0x11000, 0x2000, UsmKind::Shared)).unwrap();

        for offset in [0u64, 1, 0x7ff, 0xfff] {
            let found = registry.lookup(GpuAddr::new(0x10000 + offset)).unwrap();
            assert!(Arc::ptr_eq(&found, &a));
        }
        for offset in [0u64, 0x1000, 0x1fff] {
            let found = registry.lookup(GpuAddr::new(0x11000 + offset)).unwrap();
            assert!(Arc::ptr_eq(&found, &b));
        }

        assert_eq!(registry.lookup(GpuAddr::new(0xffff)).unwrap_err(), Error::NotFound);
        assert_eq!(registry.lookup(GpuAddr::new(0x13000)).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn test_overlap_is_duplicate() {
        let registry = UnifiedMemoryAllocationRegistry::new();
        registry.insert(record(0x10000, 0x2000, UsmKind::Host)).unwrap();

        // Starts inside
        assert_eq!(
            registry.insert(record(0x11000, 0x1000, UsmKind::Host)).unwrap_err(),
            Error::DuplicateAllocation
        );
        // Ends inside
        assert_eq!(
            registry.insert(record(0xf000, 0x2000, UsmKind::Host)).unwrap_err(),
            Error::DuplicateAllocation
        );
        // Same base
        assert_eq!(
            registry.insert(record(0x10000, 0x10, UsmKind::Host)).unwrap_err(),
            Error::DuplicateAllocation
        );
        // Adjacent ranges are fine
        registry.insert(record(0x12000, 0x1000, UsmKind::Host)).unwrap();
        registry.insert(record(0xf000, 0x1000, UsmKind::Host)).unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.stats().duplicates, 3);
    }

    #[test]
    fn test_remove_requires_base_and_no_references() {
        let registry = UnifiedMemoryAllocationRegistry::new();
        let a = registry.insert(record(0x20000, 0x1000, UsmKind::Shared)).unwrap();

        assert_eq!(
            registry.remove(GpuAddr::new(0x20010)).unwrap_err(),
            Error::InvalidArgument
        );
        assert_eq!(registry.remove(GpuAddr::new(0x30000)).unwrap_err(), Error::NotFound);

        a.acquire();
        assert_eq!(
            registry.remove(GpuAddr::new(0x20000)).unwrap_err(),
            Error::AllocationStillReferenced
        );
        assert_eq!(registry.len(), 1);

        a.release().unwrap();
        registry.remove(GpuAddr::new(0x20000)).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.lookup(GpuAddr::new(0x20000)).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn test_lookup_range() {
        let registry = UnifiedMemoryAllocationRegistry::new();
        registry.insert(record(0x40000, 0x1000, UsmKind::Device)).unwrap();
        assert!(registry.lookup_range(GpuAddr::new(0x40100), 0x100).is_ok());
        assert_eq!(
            registry.lookup_range(GpuAddr::new(0x40f00), 0x200).unwrap_err(),
            Error::InvalidArgument
        );
    }

    #[test]
    fn test_rejects_system_and_empty_records() {
        let registry = UnifiedMemoryAllocationRegistry::new();
        assert_eq!(
            registry.insert(record(0x1000, 0x1000, UsmKind::System)).unwrap_err(),
            Error::InvalidArgument
        );
        assert_eq!(
            registry.insert(record(0x1000, 0, UsmKind::Host)).unwrap_err(),
            Error::InvalidArgument
        );
        assert_eq!(registry.allocations_of_kind(UsmKind::Host).len(), 0);
    }
}
