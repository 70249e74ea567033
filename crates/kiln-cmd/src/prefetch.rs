//! # Memory Prefetch
//!
//! A [`PrefetchContext`] collects the shared allocations a command list
//! asked to prefetch. Entries name the allocation object, not just its base
//! address, so a range freed and handed out again is never migrated on
//! behalf of the old request. The [`PrefetchManager`] migrates them to the device
//! a stream executes on, at most once until the context is cleared.
//!
//! ```text
//!   append_memory_prefetch ──► PrefetchContext::add (shared only)
//!                                      │
//!   execute / immediate flush ──► migrate_allocations_to_gpu
//!                                      │   per allocation, per sub-device:
//!                                      │     advise(preferred = device(sub))
//!                                      │     prefetch(device(sub))
//!                                      ▼
//!   reset / destroy ──────────► remove_allocations
//! ```
//!
//! Prefetching is a hint. A failed KMD call is logged and counted, the
//! remaining allocations are still attempted, and execution goes on.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use spin::Mutex;

use kiln_core::{Error, GpuAddr, Result};
use kiln_mem::{
    AdviseAttribute, KmdMemory, MemoryRegion, UnifiedMemoryAllocationRegistry, UsmAllocation,
    UsmKind,
};

use crate::stream::GraphicsCommandStream;

// =============================================================================
// PREFETCH CONTEXT
// =============================================================================

/// Shared allocations marked for prefetch by one command list
#[derive(Debug, Default)]
pub struct PrefetchContext {
    allocations: HashMap<GpuAddr, Weak<UsmAllocation>>,
    migrated: bool,
}

impl PrefetchContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an allocation; returns true if it was added
    ///
    /// Only shared allocations are tracked. Adding a new allocation re-arms
    /// migration. A stale entry left by a freed allocation at the same base
    /// is replaced.
    pub fn add(&mut self, allocation: &Arc<UsmAllocation>) -> bool {
        if allocation.kind() != UsmKind::Shared {
            return false;
        }
        let current = Arc::downgrade(allocation);
        if let Some(tracked) = self.allocations.get(&allocation.base()) {
            if Weak::ptr_eq(tracked, &current) {
                return false;
            }
        }
        self.allocations.insert(allocation.base(), current);
        self.migrated = false;
        true
    }

    /// Number of tracked allocations
    #[inline]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    /// Check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Check if the current entries were already migrated
    #[inline]
    pub fn is_migrated(&self) -> bool {
        self.migrated
    }

    /// Tracked base addresses in ascending order
    pub fn allocations(&self) -> Vec<GpuAddr> {
        let mut bases: Vec<_> = self.allocations.keys().copied().collect();
        bases.sort_unstable();
        bases
    }

    fn entries(&self) -> Vec<(GpuAddr, Weak<UsmAllocation>)> {
        let mut entries: Vec<_> = self
            .allocations
            .iter()
            .map(|(base, tracked)| (*base, tracked.clone()))
            .collect();
        entries.sort_unstable_by_key(|(base, _)| *base);
        entries
    }

    fn clear(&mut self) {
        self.allocations.clear();
        self.migrated = false;
    }
}

// =============================================================================
// PREFETCH MANAGER
// =============================================================================

/// Prefetch statistics
#[derive(Debug, Clone, Default)]
pub struct PrefetchStats {
    /// Migration passes that issued KMD calls
    pub passes: u64,
    /// Passes skipped because the context was already migrated
    pub repeated: u64,
    /// Allocations migrated without error
    pub migrated: u64,
    /// Failed KMD calls
    pub failures: u64,
    /// Entries skipped because the allocation is gone or not migratable
    pub skipped: u64,
}

/// Issues migrations for prefetch contexts
pub struct PrefetchManager {
    registry: Arc<UnifiedMemoryAllocationRegistry>,
    kmd: Arc<dyn KmdMemory>,
    stats: Mutex<PrefetchStats>,
}

impl PrefetchManager {
    /// Create a manager
    pub fn new(registry: Arc<UnifiedMemoryAllocationRegistry>, kmd: Arc<dyn KmdMemory>) -> Self {
        Self {
            registry,
            kmd,
            stats: Mutex::new(PrefetchStats::default()),
        }
    }

    /// Migrate every tracked allocation to the device `stream` executes on
    ///
    /// A context that was already migrated is left alone. All entries are
    /// attempted; the first KMD failure is returned once every entry had its
    /// turn.
    pub fn migrate_allocations_to_gpu(
        &self,
        context: &mut PrefetchContext,
        stream: &GraphicsCommandStream,
    ) -> Result<()> {
        if context.migrated {
            self.stats.lock().repeated += 1;
            return Ok(());
        }
        context.migrated = true;
        if context.is_empty() {
            return Ok(());
        }

        let target = stream.target();
        let sub_devices = target.device_bitfield.sub_device_ids();
        let mut first_failure = None;
        let mut stats = PrefetchStats {
            passes: 1,
            ..PrefetchStats::default()
        };

        for (base, tracked) in context.entries() {
            // The allocation may have been freed, and its range reused, since
            // it was recorded
            let Ok(usm) = self.registry.lookup(base) else {
                stats.skipped += 1;
                continue;
            };
            if !core::ptr::eq(tracked.as_ptr(), Arc::as_ptr(&usm)) {
                log::trace!("prefetch entry {} now names another allocation", base);
                stats.skipped += 1;
                continue;
            }
            if usm.kind() != UsmKind::Shared || !usm.is_kmd_migrated() {
                stats.skipped += 1;
                continue;
            }
            let Some(gpu) = usm.gpu_allocation(target.root_device_index) else {
                stats.skipped += 1;
                continue;
            };

            let mut ok = true;
            for &sub in &sub_devices {
                let region = MemoryRegion::device(sub);
                let advised = self.kmd.advise(
                    gpu.handle,
                    gpu.gpu_address,
                    gpu.size,
                    AdviseAttribute::PreferredLocation(region),
                );
                if let Err(e) = advised {
                    log::warn!(
                        "preferred-location advise for {} on sub-device {} failed: {}",
                        base,
                        sub,
                        e
                    );
                    stats.failures += 1;
                    first_failure.get_or_insert(e.code());
                    ok = false;
                }

                if let Err(e) = self.kmd.prefetch(gpu.handle, gpu.gpu_address, gpu.size, region) {
                    log::warn!("prefetch of {} to sub-device {} failed: {}", base, sub, e);
                    stats.failures += 1;
                    first_failure.get_or_insert(e.code());
                    ok = false;
                }
            }
            if ok {
                stats.migrated += 1;
            }
        }

        log::debug!(
            "prefetch pass on root device {}: {} migrated, {} skipped, {} failed calls",
            target.root_device_index,
            stats.migrated,
            stats.skipped,
            stats.failures
        );
        {
            let mut total = self.stats.lock();
            total.passes += stats.passes;
            total.migrated += stats.migrated;
            total.failures += stats.failures;
            total.skipped += stats.skipped;
        }

        match first_failure {
            Some(os_code) => Err(Error::KmdCallFailed { os_code }),
            None => Ok(()),
        }
    }

    /// Drop every tracked allocation without touching the KMD
    pub fn remove_allocations(&self, context: &mut PrefetchContext) {
        if !context.is_empty() {
            log::trace!("dropping {} prefetch entries", context.len());
        }
        context.clear();
    }

    /// Migrate then drop, as immediate lists do on every flush
    pub fn flush(&self, context: &mut PrefetchContext, stream: &GraphicsCommandStream) -> Result<()> {
        let result = self.migrate_allocations_to_gpu(context, stream);
        self.remove_allocations(context);
        result
    }

    /// Get statistics
    pub fn stats(&self) -> PrefetchStats {
        self.stats.lock().clone()
    }
}

impl fmt::Debug for PrefetchManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefetchManager")
            .field("registry", &self.registry)
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamTarget;
    use arrayvec::ArrayVec;
    use kiln_core::{ByteSize, DeviceBitfield, EngineGroupType};
    use kiln_mem::{
        AllocationId, AllocationType, BoHandle, GraphicsAllocation, KmdCall, MemoryPool,
        SimulatedKmd,
    };

    struct Fixture {
        kmd: Arc<SimulatedKmd>,
        registry: Arc<UnifiedMemoryAllocationRegistry>,
        manager: PrefetchManager,
    }

    fn fixture() -> Fixture {
        let kmd = Arc::new(SimulatedKmd::new());
        let registry = Arc::new(UnifiedMemoryAllocationRegistry::new());
        let manager = PrefetchManager::new(registry.clone(), kmd.clone());
        Fixture {
            kmd,
            registry,
            manager,
        }
    }

    fn stream(bitfield: u32) -> GraphicsCommandStream {
        GraphicsCommandStream::new(
            StreamTarget {
                root_device_index: 0,
                device_bitfield: DeviceBitfield::new(bitfield),
                engine: EngineGroupType::Compute,
            },
            ByteSize::KIB_4,
        )
    }

    fn usm(id: u64, kind: UsmKind) -> Arc<UsmAllocation> {
        let base = GpuAddr::new(id * 0x10_0000);
        let mut gpu = ArrayVec::new();
        gpu.push(Arc::new(GraphicsAllocation {
            id: AllocationId::new(id),
            handle: BoHandle(id as u32),
            gpu_address: base,
            size: ByteSize::KIB_4,
            pool: MemoryPool::System4K,
            allocation_type: AllocationType::UnifiedShared,
            root_device_index: 0,
            device_bitfield: DeviceBitfield::new(1),
        }));
        Arc::new(UsmAllocation::new(
            base,
            ByteSize::KIB_4,
            kind,
            DeviceBitfield::new(1),
            gpu,
            None,
            true,
        ))
    }

    #[test]
    fn test_only_shared_allocations_are_tracked() {
        let mut ctx = PrefetchContext::new();
        assert!(!ctx.add(&usm(1, UsmKind::Device)));
        assert!(!ctx.add(&usm(2, UsmKind::Host)));
        assert!(ctx.add(&usm(3, UsmKind::Shared)));
        assert!(!ctx.add(&usm(3, UsmKind::Shared)));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_migration_is_at_most_once() {
        let f = fixture();
        let shared = f.registry.insert(usm(1, UsmKind::Shared)).unwrap();
        let mut ctx = PrefetchContext::new();
        ctx.add(&shared);
        let s = stream(0b1);

        f.manager.migrate_allocations_to_gpu(&mut ctx, &s).unwrap();
        f.manager.migrate_allocations_to_gpu(&mut ctx, &s).unwrap();
        assert_eq!(f.kmd.prefetches().len(), 1);
        assert_eq!(f.kmd.advises().len(), 1);
        assert_eq!(
            f.kmd.advises()[0].1,
            AdviseAttribute::PreferredLocation(MemoryRegion::device(0))
        );

        let stats = f.manager.stats();
        assert_eq!(stats.passes, 1);
        assert_eq!(stats.repeated, 1);
        assert_eq!(stats.migrated, 1);
        assert_eq!(ctx.len(), 1);

        f.manager.remove_allocations(&mut ctx);
        assert!(ctx.is_empty());
        ctx.add(&shared);
        f.manager.migrate_allocations_to_gpu(&mut ctx, &s).unwrap();
        assert_eq!(f.kmd.prefetches().len(), 2);
    }

    #[test]
    fn test_advise_precedes_prefetch_per_sub_device() {
        let f = fixture();
        let shared = f.registry.insert(usm(1, UsmKind::Shared)).unwrap();
        let mut ctx = PrefetchContext::new();
        ctx.add(&shared);

        f.manager
            .migrate_allocations_to_gpu(&mut ctx, &stream(0b1010))
            .unwrap();

        let regions: Vec<_> = f.kmd.prefetches().into_iter().map(|(_, r)| r).collect();
        assert_eq!(regions, [MemoryRegion::device(1), MemoryRegion::device(3)]);

        let calls: Vec<_> = f
            .kmd
            .calls()
            .into_iter()
            .filter(|c| matches!(c, KmdCall::Advise { .. } | KmdCall::Prefetch { .. }))
            .collect();
        assert!(matches!(calls[0], KmdCall::Advise { .. }));
        assert!(matches!(calls[1], KmdCall::Prefetch { .. }));
        assert_eq!(calls.len(), 4);
    }

    #[test]
    fn test_partial_failure_attempts_every_entry() {
        let f = fixture();
        let mut ctx = PrefetchContext::new();
        for id in 1..=3 {
            let shared = f.registry.insert(usm(id, UsmKind::Shared)).unwrap();
            ctx.add(&shared);
        }
        f.kmd.fail_prefetch(SimulatedKmd::EINVAL, 1);

        let err = f
            .manager
            .migrate_allocations_to_gpu(&mut ctx, &stream(0b1))
            .unwrap_err();
        assert_eq!(
            err,
            Error::KmdCallFailed {
                os_code: SimulatedKmd::EINVAL
            }
        );
        assert_eq!(f.kmd.prefetches().len(), 2);

        let stats = f.manager.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.migrated, 2);
        assert!(ctx.is_migrated());
    }

    #[test]
    fn test_freed_allocations_are_skipped() {
        let f = fixture();
        let shared = f.registry.insert(usm(1, UsmKind::Shared)).unwrap();
        let mut ctx = PrefetchContext::new();
        ctx.add(&shared);
        f.registry.remove(shared.base()).unwrap();

        f.manager
            .migrate_allocations_to_gpu(&mut ctx, &stream(0b1))
            .unwrap();
        assert!(f.kmd.prefetches().is_empty());
        assert_eq!(f.manager.stats().skipped, 1);
    }

    #[test]
    fn test_reused_range_is_not_migrated() {
        let f = fixture();
        let old = f.registry.insert(usm(1, UsmKind::Shared)).unwrap();
        let mut ctx = PrefetchContext::new();
        ctx.add(&old);
        f.registry.remove(old.base()).unwrap();
        let new = f.registry.insert(usm(1, UsmKind::Shared)).unwrap();
        assert_eq!(new.base(), old.base());

        f.manager
            .migrate_allocations_to_gpu(&mut ctx, &stream(0b1))
            .unwrap();
        assert!(f.kmd.prefetches().is_empty());
        assert_eq!(f.manager.stats().skipped, 1);

        // Asking for the new allocation replaces the stale entry
        f.manager.remove_allocations(&mut ctx);
        ctx.add(&old);
        assert!(ctx.add(&new));
        assert!(!ctx.add(&new));
        assert_eq!(ctx.len(), 1);
        f.manager
            .migrate_allocations_to_gpu(&mut ctx, &stream(0b1))
            .unwrap();
        assert_eq!(f.kmd.prefetches().len(), 1);
    }

    #[test]
    fn test_flush_migrates_and_drops() {
        let f = fixture();
        let shared = f.registry.insert(usm(1, UsmKind::Shared)).unwrap();
        let mut ctx = PrefetchContext::new();
        ctx.add(&shared);

        f.manager.flush(&mut ctx, &stream(0b1)).unwrap();
        assert!(ctx.is_empty());
        assert!(!ctx.is_migrated());
        assert_eq!(f.kmd.prefetches().len(), 1);
    }
}
