//! # Driver Configuration
//!
//! Named switches that alter prefetch, fence and compute-mode behavior.
//! A [`DriverConfiguration`] is handed to the driver context once and
//! resolved per device against its [`HardwareCapabilities`]; nothing reads
//! configuration from global state afterwards.

use crate::hw::{HardwareCapabilities, ThreadArbitrationPolicy};
use crate::types::ByteSize;

// =============================================================================
// DRIVER CONFIGURATION
// =============================================================================

/// User-facing driver configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfiguration {
    /// Let the KMD migrate shared allocations (`None` = hardware default)
    pub use_kmd_migration: Option<bool>,
    /// Let the device reach system memory the driver did not allocate
    /// (`None` = hardware default)
    pub shared_system_memory_access: Option<bool>,
    /// Override hardware system-fence support
    pub force_system_fence: Option<bool>,
    /// Override the default thread arbitration policy
    pub thread_arbitration_policy_override: Option<ThreadArbitrationPolicy>,
    /// Force every kernel into (or out of) large GRF mode
    pub large_grf_override: Option<bool>,
    /// Initial command stream capacity
    pub command_buffer_size: ByteSize,
    /// Max command buffers parked in the reuse pool per device
    pub max_reused_command_buffers: usize,
    /// Return command buffers of destroyed immediate lists to the reuse pool
    pub enable_command_buffer_reuse: bool,
    /// Treat every queue submission as blocking
    pub make_each_enqueue_blocking: bool,
}

impl DriverConfiguration {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            use_kmd_migration: None,
            shared_system_memory_access: None,
            force_system_fence: None,
            thread_arbitration_policy_override: None,
            large_grf_override: None,
            command_buffer_size: ByteSize::KIB_64,
            max_reused_command_buffers: 8,
            enable_command_buffer_reuse: true,
            make_each_enqueue_blocking: false,
        }
    }

    /// Resolve against a device's capabilities
    pub fn resolve(&self, caps: &HardwareCapabilities) -> ResolvedConfiguration {
        let kmd_migration = self.use_kmd_migration.unwrap_or(caps.kmd_migration_default);
        let system_fence = self.force_system_fence.unwrap_or(caps.system_fence.supported);
        log::debug!(
            "config resolved for {:?} rev {:#x}: kmd_migration={} system_fence={}",
            caps.family,
            caps.revision_id,
            kmd_migration,
            system_fence
        );

        ResolvedConfiguration {
            kmd_migration,
            shared_system_memory_access: self
                .shared_system_memory_access
                .unwrap_or(caps.shared_system_memory_access),
            system_fence,
            fence_device_memory_for_host_scope: system_fence
                && caps.system_fence.device_memory_with_host_scope,
            thread_arbitration_policy: self
                .thread_arbitration_policy_override
                .unwrap_or(caps.default_thread_arbitration),
            large_grf_override: self.large_grf_override,
            command_buffer_size: self.command_buffer_size,
            max_reused_command_buffers: if self.enable_command_buffer_reuse {
                self.max_reused_command_buffers
            } else {
                0
            },
            make_each_enqueue_blocking: self.make_each_enqueue_blocking,
        }
    }
}

impl Default for DriverConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// RESOLVED CONFIGURATION
// =============================================================================

/// Configuration after resolution against one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedConfiguration {
    /// KMD migrates shared allocations
    pub kmd_migration: bool,
    /// Pointers the driver does not own are treated as system memory
    pub shared_system_memory_access: bool,
    /// System fences may be requested
    pub system_fence: bool,
    /// Device-only memory signaled to host scope also needs a fence
    pub fence_device_memory_for_host_scope: bool,
    /// Thread arbitration policy kernels default to
    pub thread_arbitration_policy: ThreadArbitrationPolicy,
    /// Large GRF override
    pub large_grf_override: Option<bool>,
    /// Initial command stream capacity
    pub command_buffer_size: ByteSize,
    /// Reuse pool capacity (0 disables reuse)
    pub max_reused_command_buffers: usize,
    /// Every submission blocks
    pub make_each_enqueue_blocking: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::{revision, GfxCoreFamily};

    #[test]
    fn test_defaults_follow_hardware() {
        let caps = HardwareCapabilities::for_family(GfxCoreFamily::XeHpc, revision::B);
        let resolved = DriverConfiguration::default().resolve(&caps);
        assert!(resolved.kmd_migration);
        assert!(resolved.system_fence);
        assert!(!resolved.fence_device_memory_for_host_scope);
        assert!(!resolved.shared_system_memory_access);
        assert_eq!(
            resolved.thread_arbitration_policy,
            ThreadArbitrationPolicy::RoundRobinAfterDependency
        );
    }

    #[test]
    fn test_overrides_win() {
        let caps = HardwareCapabilities::for_family(GfxCoreFamily::Gen12Lp, 0);
        let config = DriverConfiguration {
            use_kmd_migration: Some(true),
            force_system_fence: Some(true),
            thread_arbitration_policy_override: Some(ThreadArbitrationPolicy::RoundRobin),
            shared_system_memory_access: Some(true),
            enable_command_buffer_reuse: false,
            ..DriverConfiguration::default()
        };
        let resolved = config.resolve(&caps);
        assert!(resolved.kmd_migration);
        assert!(resolved.shared_system_memory_access);
        assert!(resolved.system_fence);
        assert_eq!(resolved.thread_arbitration_policy, ThreadArbitrationPolicy::RoundRobin);
        assert_eq!(resolved.max_reused_command_buffers, 0);
    }
}
