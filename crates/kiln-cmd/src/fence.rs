//! # System Memory Fence
//!
//! Decides whether a completion signal must carry a system-memory fence.

use kiln_core::{EventScopeFlags, ResolvedConfiguration};

/// Memory classes referenced by one append
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryUsage {
    /// Some referenced allocation is host-visible system memory
    pub system_memory: bool,
    /// Some referenced allocation is device-private memory
    pub device_memory: bool,
}

impl MemoryUsage {
    /// No memory referenced
    pub const NONE: Self = Self {
        system_memory: false,
        device_memory: false,
    };

    /// Merge two usages
    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self {
            system_memory: self.system_memory || other.system_memory,
            device_memory: self.device_memory || other.device_memory,
        }
    }
}

/// Check if a signal needs a system-memory fence
///
/// `signal_scope` is `None` when the append signals no event.
pub fn system_fence_required(
    config: &ResolvedConfiguration,
    usage: MemoryUsage,
    signal_scope: Option<EventScopeFlags>,
) -> bool {
    if !config.system_fence {
        return false;
    }
    let Some(scope) = signal_scope else {
        return false;
    };
    if !scope.is_host_visible() {
        return false;
    }
    usage.system_memory || (usage.device_memory && config.fence_device_memory_for_host_scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::hw::revision;
    use kiln_core::{DriverConfiguration, GfxCoreFamily, HardwareCapabilities};

    fn config(family: GfxCoreFamily, rev: u16) -> ResolvedConfiguration {
        DriverConfiguration::new().resolve(&HardwareCapabilities::for_family(family, rev))
    }

    const HOST: MemoryUsage = MemoryUsage {
        system_memory: true,
        device_memory: false,
    };
    const DEVICE: MemoryUsage = MemoryUsage {
        system_memory: false,
        device_memory: true,
    };

    #[test]
    fn test_truth_table_on_fence_capable_hardware() {
        let cfg = config(GfxCoreFamily::XeHpc, revision::B);
        let host = Some(EventScopeFlags::HOST);
        let device = Some(EventScopeFlags::DEVICE);

        assert!(system_fence_required(&cfg, HOST, host));
        assert!(!system_fence_required(&cfg, HOST, device));
        assert!(!system_fence_required(&cfg, DEVICE, device));
        assert!(!system_fence_required(&cfg, DEVICE, host));
        assert!(!system_fence_required(&cfg, HOST, None));
        assert!(system_fence_required(&cfg, HOST.union(DEVICE), host));
    }

    #[test]
    fn test_no_fence_without_hardware_support() {
        let cfg = config(GfxCoreFamily::XeHpc, revision::A0);
        assert!(!system_fence_required(&cfg, HOST, Some(EventScopeFlags::HOST)));
        let cfg = config(GfxCoreFamily::Gen12Lp, revision::A0);
        assert!(!system_fence_required(&cfg, HOST, Some(EventScopeFlags::HOST)));
    }

    #[test]
    fn test_device_memory_fence_is_generation_data() {
        let mut cfg = config(GfxCoreFamily::XeHpc, revision::B);
        cfg.fence_device_memory_for_host_scope = true;
        assert!(system_fence_required(&cfg, DEVICE, Some(EventScopeFlags::HOST)));
        assert!(!system_fence_required(&cfg, DEVICE, Some(EventScopeFlags::DEVICE)));
    }

    #[test]
    fn test_result_is_stable() {
        let cfg = config(GfxCoreFamily::XeHpc, revision::B);
        let first = system_fence_required(&cfg, HOST, Some(EventScopeFlags::HOST));
        for _ in 0..8 {
            assert_eq!(first, system_fence_required(&cfg, HOST, Some(EventScopeFlags::HOST)));
        }
    }
}
