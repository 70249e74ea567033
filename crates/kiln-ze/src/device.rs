//! # Device
//!
//! One root device: its capability data, resolved configuration, encoding
//! policy and the per-device pools command lists draw from.

use alloc::sync::Arc;
use core::fmt;

use kiln_cmd::{HardwareEncodingPolicy, PrefetchManager};
use kiln_core::{
    ByteSize, DeviceBitfield, DeviceHandle, EngineGroupType, Error, GfxCoreFamily, GpuAddr,
    HardwareCapabilities, ResolvedConfiguration, Result,
};
use kiln_mem::{
    AllocationProperties, AllocationType, CommandBufferReusePool, GraphicsAllocation, KmdMemory,
    KmdSubmit, MemoryManager, MemoryPool, UnifiedMemoryAllocationRegistry, UsmAllocation,
};

/// Size of the built-in kernel ISA heap
const BUILTIN_ISA_SIZE: ByteSize = ByteSize::KIB_64;

/// Built-in kernel entry points inside the ISA heap
pub mod builtin {
    /// Buffer-to-buffer copy
    pub const COPY_BUFFER: u64 = 0x0000;
    /// Copy of an unaligned head or tail
    pub const COPY_BUFFER_BYTES: u64 = 0x1000;
    /// Pattern fill
    pub const FILL_BUFFER: u64 = 0x2000;
    /// Page-fault migration copy
    pub const PAGE_FAULT_COPY: u64 = 0x3000;
}

// =============================================================================
// DEVICE DESCRIPTOR
// =============================================================================

/// Description of a device to bring up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDesc {
    /// Core family
    pub family: GfxCoreFamily,
    /// Stepping revision
    pub revision_id: u16,
    /// Sub-devices (tiles) exposed
    pub device_bitfield: DeviceBitfield,
}

impl DeviceDesc {
    /// Single-tile device
    pub const fn new(family: GfxCoreFamily, revision_id: u16) -> Self {
        Self {
            family,
            revision_id,
            device_bitfield: DeviceBitfield::first(1),
        }
    }

    /// Replace the sub-device bitfield
    pub const fn with_bitfield(mut self, device_bitfield: DeviceBitfield) -> Self {
        self.device_bitfield = device_bitfield;
        self
    }
}

// =============================================================================
// DEVICE
// =============================================================================

/// A root device
pub struct Device {
    handle: DeviceHandle,
    root_device_index: u32,
    device_bitfield: DeviceBitfield,
    caps: HardwareCapabilities,
    config: ResolvedConfiguration,
    policy: &'static HardwareEncodingPolicy,
    registry: Arc<UnifiedMemoryAllocationRegistry>,
    memory: Arc<MemoryManager>,
    submitter: Arc<dyn KmdSubmit>,
    prefetch: PrefetchManager,
    reuse_pool: CommandBufferReusePool,
    builtin_isa: Arc<GraphicsAllocation>,
}

/// Shared driver state a device is built from
pub(crate) struct DeviceResources {
    pub(crate) registry: Arc<UnifiedMemoryAllocationRegistry>,
    pub(crate) memory: Arc<MemoryManager>,
    pub(crate) kmd_memory: Arc<dyn KmdMemory>,
    pub(crate) submitter: Arc<dyn KmdSubmit>,
}

impl Device {
    pub(crate) fn new(
        handle: DeviceHandle,
        root_device_index: u32,
        desc: &DeviceDesc,
        config: ResolvedConfiguration,
        resources: DeviceResources,
    ) -> Result<Self> {
        if desc.device_bitfield.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let caps = HardwareCapabilities::for_family(desc.family, desc.revision_id);
        let policy = HardwareEncodingPolicy::for_family(desc.family);

        let builtin_isa = resources.memory.allocate(&AllocationProperties {
            size: BUILTIN_ISA_SIZE,
            pool: MemoryPool::LocalMemory,
            allocation_type: AllocationType::KernelIsa,
            root_device_index,
            device_bitfield: desc.device_bitfield,
        })?;

        log::info!(
            "device {} up: {:?} rev {:#x}, sub-devices {:?}, {} encoding",
            root_device_index,
            desc.family,
            desc.revision_id,
            desc.device_bitfield,
            policy.name
        );

        Ok(Self {
            handle,
            root_device_index,
            device_bitfield: desc.device_bitfield,
            caps,
            config,
            policy,
            prefetch: PrefetchManager::new(resources.registry.clone(), resources.kmd_memory),
            registry: resources.registry,
            memory: resources.memory,
            submitter: resources.submitter,
            reuse_pool: CommandBufferReusePool::new(config.max_reused_command_buffers),
            builtin_isa,
        })
    }

    /// Get handle
    #[inline]
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// Get root device index
    #[inline]
    pub fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    /// Get sub-device bitfield
    #[inline]
    pub fn device_bitfield(&self) -> DeviceBitfield {
        self.device_bitfield
    }

    /// Get capability data
    #[inline]
    pub fn caps(&self) -> &HardwareCapabilities {
        &self.caps
    }

    /// Get resolved configuration
    #[inline]
    pub fn config(&self) -> &ResolvedConfiguration {
        &self.config
    }

    /// Get encoding policy
    #[inline]
    pub fn policy(&self) -> &'static HardwareEncodingPolicy {
        self.policy
    }

    /// Get allocation registry
    #[inline]
    pub fn registry(&self) -> &Arc<UnifiedMemoryAllocationRegistry> {
        &self.registry
    }

    /// Get memory manager
    #[inline]
    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Get submission interface
    #[inline]
    pub fn submitter(&self) -> &Arc<dyn KmdSubmit> {
        &self.submitter
    }

    /// Get prefetch manager
    #[inline]
    pub fn prefetch_manager(&self) -> &PrefetchManager {
        &self.prefetch
    }

    /// Get command buffer reuse pool
    #[inline]
    pub fn reuse_pool(&self) -> &CommandBufferReusePool {
        &self.reuse_pool
    }

    /// Check if an engine group is exposed
    pub fn supports_engine(&self, engine: EngineGroupType) -> bool {
        self.caps.engine_groups.supports(engine)
    }

    /// Address of a built-in kernel
    pub fn builtin_kernel(&self, entry: u64) -> GpuAddr {
        self.builtin_isa.gpu_address.offset(entry)
    }

    /// Built-in kernel ISA heap
    pub fn builtin_isa(&self) -> &Arc<GraphicsAllocation> {
        &self.builtin_isa
    }

    /// Resolve a pointer to its allocation record
    ///
    /// `None` means the pointer is system memory the driver does not own;
    /// that is only accepted when the device can access such memory.
    pub fn resolve(&self, ptr: GpuAddr, size: u64) -> Result<Option<Arc<UsmAllocation>>> {
        match self.registry.lookup_range(ptr, size) {
            Ok(usm) => Ok(Some(usm)),
            Err(Error::NotFound) if self.config.shared_system_memory_access => Ok(None),
            Err(Error::NotFound) => Err(Error::InvalidArgument),
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------------
    // Command buffers
    // -------------------------------------------------------------------------

    /// Get a command buffer of the configured size, preferring a parked one
    pub fn obtain_command_buffer(&self) -> Result<Arc<GraphicsAllocation>> {
        self.obtain_command_buffer_for(self.config.command_buffer_size)
    }

    /// Get a command buffer holding at least `min_size` bytes
    ///
    /// Anything above the configured size is rounded up to a power of two.
    pub fn obtain_command_buffer_for(&self, min_size: ByteSize) -> Result<Arc<GraphicsAllocation>> {
        let size = if min_size <= self.config.command_buffer_size {
            self.config.command_buffer_size
        } else {
            ByteSize::from_bytes(min_size.as_bytes().next_power_of_two())
        };
        if let Some(buffer) = self.reuse_pool.obtain(size) {
            log::trace!("reusing command buffer {:?}", buffer.id);
            return Ok(buffer);
        }
        self.memory.allocate(&AllocationProperties {
            size,
            pool: MemoryPool::System4K,
            allocation_type: AllocationType::CommandBuffer,
            root_device_index: self.root_device_index,
            device_bitfield: self.device_bitfield,
        })
    }

    /// Park a command buffer for reuse, or free it when the pool is full
    pub fn recycle_command_buffer(&self, buffer: Arc<GraphicsAllocation>) {
        if let Err(buffer) = self.reuse_pool.store(buffer) {
            self.free_command_buffer(&buffer);
        }
    }

    /// Free a command buffer
    pub fn free_command_buffer(&self, buffer: &GraphicsAllocation) {
        if let Err(e) = self.memory.free(buffer) {
            log::warn!("freeing command buffer {:?} failed: {}", buffer.id, e);
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle)
            .field("root_device_index", &self.root_device_index)
            .field("device_bitfield", &self.device_bitfield)
            .field("family", &self.caps.family)
            .field("revision_id", &self.caps.revision_id)
            .field("policy", &self.policy.name)
            .finish_non_exhaustive()
    }
}
