//! # Driver Context
//!
//! The explicit owner of everything process-wide: the USM registry, the
//! GPU address space, the KMD, and the handle tables for devices, event
//! pools and queues. Every device and command list is built from it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use arrayvec::ArrayVec;

use kiln_core::{
    ByteSize, CommandQueueHandle, CommandQueueMarker, DeviceHandle, DeviceMarker,
    DriverConfiguration, Error, EventPoolHandle, EventPoolMarker, GpuAddr, HandleTable,
    HardwareCapabilities, Result,
};
use kiln_mem::usm::MAX_ROOT_DEVICES;
use kiln_mem::{
    AdviseAttribute, AllocationProperties, AllocationType, AtomicAccessFlags, GraphicsAllocation,
    Kmd, KmdMemory, KmdSubmit, MemAdvice, MemoryManager, MemoryPool, MemoryRegion,
    UnifiedMemoryAllocationRegistry, UsmAllocation, UsmKind, VaRange,
};

use crate::cmdlist::{CommandList, CommandListDesc};
use crate::device::{Device, DeviceDesc, DeviceResources};
use crate::event::{EventPool, EventPoolDesc};
use crate::queue::{CommandQueue, CommandQueueDesc};
use crate::result::ResultCode;

/// Alignment used when the caller passes zero
const DEFAULT_ALIGNMENT: u64 = ByteSize::KIB_4.as_bytes();

/// Properties of a USM allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAllocProperties {
    /// Kind
    pub kind: UsmKind,
    /// Base address
    pub base: GpuAddr,
    /// Requested size
    pub size: ByteSize,
}

type Backing = ArrayVec<Arc<GraphicsAllocation>, MAX_ROOT_DEVICES>;

// =============================================================================
// DRIVER CONTEXT
// =============================================================================

/// Process-wide driver state
pub struct DriverContext {
    config: DriverConfiguration,
    registry: Arc<UnifiedMemoryAllocationRegistry>,
    memory: Arc<MemoryManager>,
    kmd_memory: Arc<dyn KmdMemory>,
    submitter: Arc<dyn KmdSubmit>,
    devices: HandleTable<DeviceMarker, Device>,
    event_pools: HandleTable<EventPoolMarker, EventPool>,
    queues: HandleTable<CommandQueueMarker, CommandQueue>,
}

impl DriverContext {
    /// Create a driver context on top of a KMD
    pub fn new<K: Kmd + 'static>(kmd: Arc<K>, config: DriverConfiguration) -> Self {
        let kmd_memory: Arc<dyn KmdMemory> = kmd.clone();
        let submitter: Arc<dyn KmdSubmit> = kmd;
        log::info!("driver context created: {:?}", config);

        Self {
            config,
            registry: Arc::new(UnifiedMemoryAllocationRegistry::new()),
            memory: Arc::new(MemoryManager::new(kmd_memory.clone())),
            kmd_memory,
            submitter,
            devices: HandleTable::new(),
            event_pools: HandleTable::new(),
            queues: HandleTable::new(),
        }
    }

    /// Get the unresolved configuration
    #[inline]
    pub fn config(&self) -> &DriverConfiguration {
        &self.config
    }

    /// Get the USM registry
    #[inline]
    pub fn registry(&self) -> &Arc<UnifiedMemoryAllocationRegistry> {
        &self.registry
    }

    /// Get the memory manager
    #[inline]
    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    // -------------------------------------------------------------------------
    // Devices
    // -------------------------------------------------------------------------

    /// Bring up the next root device
    pub fn add_device(&self, desc: &DeviceDesc) -> Result<Arc<Device>> {
        let root_device_index = self.devices.len();
        if root_device_index >= MAX_ROOT_DEVICES {
            return Err(Error::InvalidArgument);
        }
        let caps = HardwareCapabilities::for_family(desc.family, desc.revision_id);
        let config = self.config.resolve(&caps);

        self.devices.insert_with(|handle| {
            Device::new(
                handle,
                root_device_index as u32,
                desc,
                config,
                DeviceResources {
                    registry: self.registry.clone(),
                    memory: self.memory.clone(),
                    kmd_memory: self.kmd_memory.clone(),
                    submitter: self.submitter.clone(),
                },
            )
        })
    }

    /// Resolve a device handle
    pub fn device(&self, handle: DeviceHandle) -> Result<Arc<Device>> {
        self.devices.get(handle)
    }

    /// All devices in root-index order
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.values()
    }

    // -------------------------------------------------------------------------
    // Event pools
    // -------------------------------------------------------------------------

    /// Create an event pool shared by `devices`
    pub fn create_event_pool(
        &self,
        devices: &[DeviceHandle],
        desc: &EventPoolDesc,
    ) -> Result<Arc<EventPool>> {
        let devices = devices
            .iter()
            .map(|&handle| self.device(handle))
            .collect::<Result<Vec<_>>>()?;
        self.event_pools
            .insert_with(|handle| EventPool::create(handle, &devices, desc))
    }

    /// ABI wrapper for [`Self::create_event_pool`]
    pub fn ze_create_event_pool(
        &self,
        devices: &[DeviceHandle],
        desc: &EventPoolDesc,
        pool: &mut Option<Arc<EventPool>>,
    ) -> ResultCode {
        match self.create_event_pool(devices, desc) {
            Ok(created) => {
                *pool = Some(created);
                ResultCode::Success
            }
            Err(e) => e.into(),
        }
    }

    /// Resolve an event pool handle
    pub fn event_pool(&self, handle: EventPoolHandle) -> Result<Arc<EventPool>> {
        self.event_pools.get(handle)
    }

    /// Destroy an event pool; fails while events are alive
    pub fn destroy_event_pool(&self, handle: EventPoolHandle) -> Result<()> {
        self.event_pools.get(handle)?.destroy()?;
        self.event_pools.remove(handle).map(drop)
    }

    // -------------------------------------------------------------------------
    // Queues and lists
    // -------------------------------------------------------------------------

    /// Create a command queue on a device
    pub fn create_command_queue(
        &self,
        device: DeviceHandle,
        desc: CommandQueueDesc,
    ) -> Result<Arc<CommandQueue>> {
        let device = self.device(device)?;
        self.queues
            .insert_with(|handle| CommandQueue::new(handle, &device, desc))
    }

    /// Resolve a command queue handle
    pub fn command_queue(&self, handle: CommandQueueHandle) -> Result<Arc<CommandQueue>> {
        self.queues.get(handle)
    }

    /// Wait idle and destroy a command queue
    pub fn destroy_command_queue(&self, handle: CommandQueueHandle) -> Result<()> {
        self.queues.get(handle)?.destroy()?;
        self.queues.remove(handle).map(drop)
    }

    /// Create a command list on a device
    pub fn create_command_list(
        &self,
        device: DeviceHandle,
        desc: CommandListDesc,
    ) -> Result<Arc<CommandList>> {
        CommandList::create(&self.device(device)?, desc)
    }

    // -------------------------------------------------------------------------
    // USM allocation
    // -------------------------------------------------------------------------

    fn reserve(&self, size: u64, alignment: u64) -> Result<VaRange> {
        if size == 0 || (alignment != 0 && !alignment.is_power_of_two()) {
            return Err(Error::InvalidArgument);
        }
        self.memory
            .reserve(ByteSize::from_bytes(size), alignment.max(DEFAULT_ALIGNMENT))
    }

    /// Create one buffer object per placement at `range`; all or nothing
    fn back(
        &self,
        range: VaRange,
        placements: &[(&Device, MemoryPool, AllocationType)],
    ) -> Result<Backing> {
        let mut backing = Backing::new();
        for &(device, pool, allocation_type) in placements {
            let props = AllocationProperties {
                size: range.size(),
                pool,
                allocation_type,
                root_device_index: device.root_device_index(),
                device_bitfield: device.device_bitfield(),
            };
            match self.memory.create_at(range, &props) {
                Ok(allocation) => backing.push(allocation),
                Err(e) => {
                    for allocation in &backing {
                        self.memory.release(allocation);
                    }
                    return Err(e);
                }
            }
        }
        Ok(backing)
    }

    fn register(&self, range: VaRange, usm: UsmAllocation) -> Result<GpuAddr> {
        match self.registry.insert(Arc::new(usm)) {
            Ok(usm) => {
                log::trace!("usm {:?} at {} ({})", usm.kind(), usm.base(), usm.size());
                Ok(usm.base())
            }
            Err(e) => {
                let _ = self.memory.unreserve(range);
                Err(e)
            }
        }
    }

    /// Allocate host memory visible to every device
    pub fn alloc_host_mem(&self, size: u64, alignment: u64) -> Result<GpuAddr> {
        let devices = self.devices();
        let Some(first) = devices.first() else {
            return Err(Error::InvalidArgument);
        };
        let range = self.reserve(size, alignment)?;
        let placements: Vec<_> = devices
            .iter()
            .map(|d| (&**d, MemoryPool::System4K, AllocationType::BufferHostMemory))
            .collect();
        let backing = self.back(range, &placements).inspect_err(|_| {
            let _ = self.memory.unreserve(range);
        })?;

        let usm = UsmAllocation::new(
            range.start,
            ByteSize::from_bytes(size),
            UsmKind::Host,
            first.device_bitfield(),
            backing,
            None,
            false,
        );
        self.register(range, usm)
    }

    /// Allocate device-local memory
    pub fn alloc_device_mem(&self, device: &Device, size: u64, alignment: u64) -> Result<GpuAddr> {
        let range = self.reserve(size, alignment)?;
        let backing = self
            .back(range, &[(device, MemoryPool::LocalMemory, AllocationType::Buffer)])
            .inspect_err(|_| {
                let _ = self.memory.unreserve(range);
            })?;

        let usm = UsmAllocation::new(
            range.start,
            ByteSize::from_bytes(size),
            UsmKind::Device,
            device.device_bitfield(),
            backing,
            None,
            false,
        );
        self.register(range, usm)
    }

    /// Allocate shared memory that migrates between host and `device`
    ///
    /// With KMD migration the KMD moves a single system-memory object on
    /// demand. Otherwise the allocation has a CPU side in system memory and
    /// a GPU side in device memory.
    pub fn alloc_shared_mem(&self, device: &Device, size: u64, alignment: u64) -> Result<GpuAddr> {
        let range = self.reserve(size, alignment)?;
        let kmd_migrated = device.config().kmd_migration;

        let backed = if kmd_migrated {
            self.back(
                range,
                &[(device, MemoryPool::System4K, AllocationType::UnifiedShared)],
            )
            .map(|gpu| (gpu, None))
        } else {
            self.back(
                range,
                &[
                    (device, MemoryPool::System4K, AllocationType::SvmCpu),
                    (device, MemoryPool::LocalMemory, AllocationType::SvmGpu),
                ],
            )
            .map(|mut backing| {
                let gpu = backing.pop();
                let cpu = backing.pop();
                (gpu.into_iter().collect(), cpu)
            })
        };
        let (gpu, cpu) = backed.inspect_err(|_| {
            let _ = self.memory.unreserve(range);
        })?;

        let usm = UsmAllocation::new(
            range.start,
            ByteSize::from_bytes(size),
            UsmKind::Shared,
            device.device_bitfield(),
            gpu,
            cpu,
            kmd_migrated,
        );
        self.register(range, usm)
    }

    /// Free a USM allocation by its base pointer
    pub fn free_mem(&self, ptr: GpuAddr) -> Result<()> {
        let usm = self.registry.remove(ptr)?;
        let mut reserved = None;
        for allocation in usm.gpu_allocations().iter().chain(usm.cpu_allocation()) {
            self.memory.release(allocation);
            reserved = Some(VaRange::new(allocation.gpu_address, allocation.size));
        }
        if let Some(range) = reserved {
            self.memory.unreserve(range)?;
        }
        log::trace!("usm free {}", ptr);
        Ok(())
    }

    /// Look up kind, base and size of the allocation holding `ptr`
    pub fn get_mem_alloc_properties(&self, ptr: GpuAddr) -> Option<MemAllocProperties> {
        let usm = self.registry.lookup(ptr).ok()?;
        Some(MemAllocProperties {
            kind: usm.kind(),
            base: usm.base(),
            size: usm.size(),
        })
    }

    // -------------------------------------------------------------------------
    // Advice
    // -------------------------------------------------------------------------

    fn advise_kmd(
        &self,
        usm: &UsmAllocation,
        device: &Device,
        attribute: AdviseAttribute,
    ) -> Result<()> {
        let Some(gpu) = usm.gpu_allocation(device.root_device_index()) else {
            return Err(Error::InvalidArgument);
        };
        self.kmd_memory
            .advise(gpu.handle, gpu.gpu_address, gpu.size, attribute)
            .map_err(|e| {
                log::warn!("advise {:?} on {} failed: {}", attribute, usm.base(), e);
                e.into()
            })
    }

    /// Give the driver a placement or access hint for a range
    pub fn mem_advise(
        &self,
        device: &Device,
        ptr: GpuAddr,
        size: u64,
        advice: MemAdvice,
    ) -> Result<()> {
        let usm = self.registry.lookup_range(ptr, size)?;
        let attribute = match advice {
            MemAdvice::SetPreferredLocation => {
                let sub_device = device
                    .device_bitfield()
                    .sub_device_ids()
                    .first()
                    .copied()
                    .unwrap_or(0);
                Some(AdviseAttribute::PreferredLocation(MemoryRegion::device(sub_device)))
            }
            MemAdvice::SetSystemMemoryPreferredLocation => {
                Some(AdviseAttribute::SystemPreferredLocation)
            }
            MemAdvice::ClearPreferredLocation | MemAdvice::ClearSystemMemoryPreferredLocation => {
                Some(AdviseAttribute::None)
            }
            MemAdvice::SetNonAtomicMostly => Some(AdviseAttribute::NonAtomic),
            MemAdvice::ClearNonAtomicMostly => Some(AdviseAttribute::Atomic),
            MemAdvice::SetReadMostly
            | MemAdvice::ClearReadMostly
            | MemAdvice::BiasCached
            | MemAdvice::BiasUncached => None,
        };

        if usm.kind() == UsmKind::Shared {
            if let Some(attribute) = attribute {
                self.advise_kmd(&usm, device, attribute)?;
            }
        }
        let flags = usm.apply_advice(advice);
        log::trace!("advice {:?} on {}: {:?}", advice, usm.base(), flags);
        Ok(())
    }

    /// Set the atomic access attributes of a range
    pub fn set_atomic_access(
        &self,
        device: &Device,
        ptr: GpuAddr,
        size: u64,
        flags: AtomicAccessFlags,
    ) -> Result<()> {
        let usm = self.registry.lookup_range(ptr, size)?;
        if usm.kind() != UsmKind::Shared {
            if !flags.is_empty() {
                return Err(Error::InvalidArgument);
            }
        } else {
            let attribute = if flags.is_empty() {
                AdviseAttribute::NonAtomic
            } else {
                AdviseAttribute::Atomic
            };
            self.advise_kmd(&usm, device, attribute)?;
        }
        usm.set_atomic_access(flags);
        Ok(())
    }
}

impl fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverContext")
            .field("devices", &self.devices.len())
            .field("event_pools", &self.event_pools.len())
            .field("queues", &self.queues.len())
            .field("allocations", &self.registry.len())
            .finish_non_exhaustive()
    }
}
