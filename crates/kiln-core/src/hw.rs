//! # Hardware Capabilities
//!
//! Per-generation capability data. Everything that differs between GPU
//! generations and steppings (system fences, compute-mode programming,
//! cooperative dispatch, workarounds) is expressed here as data so the
//! command-list state machine never branches on a generation directly.
//!
//! ```text
//! ┌──────────────┬─────────┬──────────────┬──────────┬──────────────┐
//! │ Family       │ Walker  │ System fence │ SCM GRF  │ Arbitration  │
//! ├──────────────┼─────────┼──────────────┼──────────┼──────────────┤
//! │ Gen9         │ legacy  │      -       │    -     │ LRI          │
//! │ Gen11        │ legacy  │      -       │ yes + PC │ LRI          │
//! │ Gen12Lp      │ legacy  │      -       │    -     │ LRI          │
//! │ XeHpg        │ postsync│      -       │   yes    │ SCM          │
//! │ XeHpc        │ postsync│  rev >= B    │   yes    │ SCM          │
//! └──────────────┴─────────┴──────────────┴──────────┴──────────────┘
//! ```

use crate::engine::EngineGroupSet;

// =============================================================================
// GFX CORE FAMILY
// =============================================================================

/// GPU core family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum GfxCoreFamily {
    /// Gen9 (Skylake..Coffee Lake)
    Gen9 = 9,
    /// Gen11 (Ice Lake)
    Gen11 = 11,
    /// Gen12 low power (Tiger Lake, DG1)
    Gen12Lp = 12,
    /// Xe-HPG (DG2)
    XeHpg = 0x1207,
    /// Xe-HPC (Ponte Vecchio)
    XeHpc = 0x1208,
}

impl GfxCoreFamily {
    /// Check if kernels are dispatched with a walker carrying inline post-sync data
    #[inline]
    pub const fn has_walker_post_sync(self) -> bool {
        matches!(self, Self::XeHpg | Self::XeHpc)
    }
}

/// Stepping revision IDs
pub mod revision {
    /// A0 stepping
    pub const A0: u16 = 0x00;
    /// B stepping; first XeHpc stepping with system-memory fences
    pub const B: u16 = 0x03;
    /// C stepping
    pub const C: u16 = 0x05;
}

// =============================================================================
// COMPUTE MODE
// =============================================================================

/// EU thread arbitration policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ThreadArbitrationPolicy {
    /// Oldest thread first
    AgeBased = 0,
    /// Round robin
    RoundRobin = 1,
    /// Round robin after dependency
    RoundRobinAfterDependency = 2,
}

/// Which compute-mode properties the STATE_COMPUTE_MODE command can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateComputeModeSupport {
    /// Coherency (force non-coherent) is programmable
    pub coherency_required: bool,
    /// Large GRF mode is programmable
    pub large_grf_mode: bool,
    /// Thread arbitration policy is programmable
    pub thread_arbitration_policy: bool,
}

// =============================================================================
// POLICY TABLES
// =============================================================================

/// System-memory fence truth table for one generation/stepping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemFencePolicy {
    /// Hardware can request a system-memory fence from post-sync
    pub supported: bool,
    /// Fence is also required for device-only memory signaled to host scope
    pub device_memory_with_host_scope: bool,
}

/// Cooperative-kernel dispatch ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CooperativeDispatchLimits {
    /// Max total groups on the cooperative engine group (0 = unsupported)
    pub max_group_count: u32,
    /// Max total groups on non-cooperative compute engines (0 = rejected)
    pub fallback_max_group_count: u32,
}

// =============================================================================
// HARDWARE CAPABILITIES
// =============================================================================

/// Capability data for one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareCapabilities {
    /// Core family
    pub family: GfxCoreFamily,
    /// Stepping revision
    pub revision_id: u16,
    /// Max thread-group count per dimension
    pub max_group_count: [u32; 3],
    /// Engine groups the device exposes
    pub engine_groups: EngineGroupSet,
    /// System fence behavior
    pub system_fence: SystemFencePolicy,
    /// Cooperative dispatch ceilings
    pub cooperative: CooperativeDispatchLimits,
    /// STATE_COMPUTE_MODE property support
    pub scm: StateComputeModeSupport,
    /// Thread arbitration is programmed with MI_LOAD_REGISTER_IMM
    pub thread_arbitration_via_register: bool,
    /// Default arbitration policy
    pub default_thread_arbitration: ThreadArbitrationPolicy,
    /// GRF size changes need a preceding PIPE_CONTROL
    pub pipe_control_before_grf_change: bool,
    /// MI_MEM_FENCE required after event signal writes
    pub mem_fence_after_signal: bool,
    /// KMD migration of shared allocations is on by default
    pub kmd_migration_default: bool,
    /// Device supports demand paging
    pub page_fault_support: bool,
    /// Device can access system allocations made outside the driver
    pub shared_system_memory_access: bool,
}

impl HardwareCapabilities {
    /// Max group count per dimension shared by every family
    pub const MAX_GROUP_COUNT: [u32; 3] = [u32::MAX, 65535, 65535];

    /// Capability table entry for a family and stepping
    pub const fn for_family(family: GfxCoreFamily, revision_id: u16) -> Self {
        match family {
            GfxCoreFamily::Gen9 => Self {
                family,
                revision_id,
                max_group_count: Self::MAX_GROUP_COUNT,
                engine_groups: EngineGroupSet::COMPUTE.union(EngineGroupSet::COPY),
                system_fence: SystemFencePolicy {
                    supported: false,
                    device_memory_with_host_scope: false,
                },
                cooperative: CooperativeDispatchLimits {
                    max_group_count: 0,
                    fallback_max_group_count: 0,
                },
                scm: StateComputeModeSupport {
                    coherency_required: true,
                    large_grf_mode: false,
                    thread_arbitration_policy: false,
                },
                thread_arbitration_via_register: true,
                default_thread_arbitration: ThreadArbitrationPolicy::RoundRobin,
                pipe_control_before_grf_change: false,
                mem_fence_after_signal: false,
                kmd_migration_default: false,
                page_fault_support: false,
                shared_system_memory_access: false,
            },
            GfxCoreFamily::Gen11 => Self {
                family,
                revision_id,
                max_group_count: Self::MAX_GROUP_COUNT,
                engine_groups: EngineGroupSet::COMPUTE.union(EngineGroupSet::COPY),
                system_fence: SystemFencePolicy {
                    supported: false,
                    device_memory_with_host_scope: false,
                },
                cooperative: CooperativeDispatchLimits {
                    max_group_count: 0,
                    fallback_max_group_count: 0,
                },
                scm: StateComputeModeSupport {
                    coherency_required: true,
                    large_grf_mode: true,
                    thread_arbitration_policy: false,
                },
                thread_arbitration_via_register: true,
                default_thread_arbitration: ThreadArbitrationPolicy::RoundRobinAfterDependency,
                pipe_control_before_grf_change: true,
                mem_fence_after_signal: false,
                kmd_migration_default: false,
                page_fault_support: false,
                shared_system_memory_access: false,
            },
            GfxCoreFamily::Gen12Lp => Self {
                family,
                revision_id,
                max_group_count: Self::MAX_GROUP_COUNT,
                engine_groups: EngineGroupSet::COMPUTE
                    .union(EngineGroupSet::RENDER_COMPUTE)
                    .union(EngineGroupSet::COPY),
                system_fence: SystemFencePolicy {
                    supported: false,
                    device_memory_with_host_scope: false,
                },
                cooperative: CooperativeDispatchLimits {
                    max_group_count: 0,
                    fallback_max_group_count: 16,
                },
                scm: StateComputeModeSupport {
                    coherency_required: true,
                    large_grf_mode: false,
                    thread_arbitration_policy: false,
                },
                thread_arbitration_via_register: true,
                default_thread_arbitration: ThreadArbitrationPolicy::AgeBased,
                pipe_control_before_grf_change: false,
                mem_fence_after_signal: false,
                kmd_migration_default: false,
                page_fault_support: false,
                shared_system_memory_access: false,
            },
            GfxCoreFamily::XeHpg => Self {
                family,
                revision_id,
                max_group_count: Self::MAX_GROUP_COUNT,
                engine_groups: EngineGroupSet::COMPUTE
                    .union(EngineGroupSet::RENDER_COMPUTE)
                    .union(EngineGroupSet::COOPERATIVE_COMPUTE)
                    .union(EngineGroupSet::COPY),
                system_fence: SystemFencePolicy {
                    supported: false,
                    device_memory_with_host_scope: false,
                },
                cooperative: CooperativeDispatchLimits {
                    max_group_count: 32,
                    fallback_max_group_count: 32,
                },
                scm: StateComputeModeSupport {
                    coherency_required: true,
                    large_grf_mode: true,
                    thread_arbitration_policy: true,
                },
                thread_arbitration_via_register: false,
                default_thread_arbitration: ThreadArbitrationPolicy::AgeBased,
                pipe_control_before_grf_change: false,
                mem_fence_after_signal: false,
                kmd_migration_default: false,
                page_fault_support: false,
                shared_system_memory_access: false,
            },
            GfxCoreFamily::XeHpc => Self {
                family,
                revision_id,
                max_group_count: Self::MAX_GROUP_COUNT,
                engine_groups: EngineGroupSet::COMPUTE
                    .union(EngineGroupSet::RENDER_COMPUTE)
                    .union(EngineGroupSet::COOPERATIVE_COMPUTE)
                    .union(EngineGroupSet::COPY),
                system_fence: SystemFencePolicy {
                    supported: revision_id >= revision::B,
                    device_memory_with_host_scope: false,
                },
                cooperative: CooperativeDispatchLimits {
                    max_group_count: 64,
                    fallback_max_group_count: 1,
                },
                scm: StateComputeModeSupport {
                    coherency_required: false,
                    large_grf_mode: true,
                    thread_arbitration_policy: true,
                },
                thread_arbitration_via_register: false,
                default_thread_arbitration: ThreadArbitrationPolicy::RoundRobinAfterDependency,
                pipe_control_before_grf_change: false,
                mem_fence_after_signal: revision_id == revision::B,
                kmd_migration_default: true,
                page_fault_support: true,
                shared_system_memory_access: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xe_hpc_system_fence_is_stepping_gated() {
        let a0 = HardwareCapabilities::for_family(GfxCoreFamily::XeHpc, revision::A0);
        let b = HardwareCapabilities::for_family(GfxCoreFamily::XeHpc, revision::B);
        assert!(!a0.system_fence.supported);
        assert!(b.system_fence.supported);
        assert!(!b.system_fence.device_memory_with_host_scope);
        assert!(b.mem_fence_after_signal);
        assert!(!a0.mem_fence_after_signal);
    }

    #[test]
    fn test_legacy_families_program_arbitration_by_register() {
        for family in [GfxCoreFamily::Gen9, GfxCoreFamily::Gen11, GfxCoreFamily::Gen12Lp] {
            let caps = HardwareCapabilities::for_family(family, 0);
            assert!(caps.thread_arbitration_via_register);
            assert!(!caps.family.has_walker_post_sync());
            assert!(!caps.system_fence.supported);
        }
    }

    #[test]
    fn test_cooperative_limits() {
        let pvc = HardwareCapabilities::for_family(GfxCoreFamily::XeHpc, revision::B);
        assert_eq!(pvc.cooperative.fallback_max_group_count, 1);
        assert!(pvc.cooperative.max_group_count > 1);

        let skl = HardwareCapabilities::for_family(GfxCoreFamily::Gen9, 0);
        assert_eq!(skl.cooperative.max_group_count, 0);
    }
}
