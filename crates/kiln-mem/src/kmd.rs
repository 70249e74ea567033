//! # Kernel-Mode Driver Interface
//!
//! The opaque boundary to the kernel-mode driver. Requests are keyed the way
//! the KMD keys them (buffer-object handle, address range, memory region,
//! engine class/instance, context id) and every call returns either success
//! or a raw [`OsError`]. No ioctl numbering is assumed.

use alloc::sync::Arc;

use kiln_core::{ByteSize, EngineInstance, GpuAddr, OsError};

use crate::allocation::GraphicsAllocation;

/// Result of a KMD call
pub type KmdResult<T> = core::result::Result<T, OsError>;

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// KMD buffer-object handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoHandle(pub u32);

/// Memory class of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MemoryClass {
    /// System memory
    System = 0,
    /// Device-local memory
    Device = 1,
}

/// Memory region descriptor (class + instance)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    /// Memory class
    pub class: MemoryClass,
    /// Instance within the class (sub-device id for device memory)
    pub instance: u16,
}

impl MemoryRegion {
    /// System memory region
    pub const SYSTEM: Self = Self {
        class: MemoryClass::System,
        instance: 0,
    };

    /// Device-local region of a sub-device
    #[inline]
    pub const fn device(sub_device_id: u32) -> Self {
        Self {
            class: MemoryClass::Device,
            instance: sub_device_id as u16,
        }
    }
}

/// Buffer-object creation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoCreateRequest {
    /// Size
    pub size: ByteSize,
    /// Placement region
    pub region: MemoryRegion,
    /// Root device index
    pub root_device_index: u32,
}

/// Memory advise attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdviseAttribute {
    /// Preferred placement region
    PreferredLocation(MemoryRegion),
    /// Prefer system memory
    SystemPreferredLocation,
    /// Access is atomic
    Atomic,
    /// Access is non-atomic
    NonAtomic,
    /// Clear any placement or atomic hint
    None,
}

/// Command-buffer submission keyed by engine and context
#[derive(Debug, Clone, Copy)]
pub struct ExecBuffer<'a> {
    /// Target engine
    pub engine: EngineInstance,
    /// KMD context id
    pub context_id: u32,
    /// Batch-buffer address
    pub batch_address: GpuAddr,
    /// Encoded commands
    pub commands: &'a [u8],
    /// Allocations that must be resident
    pub residency: &'a [Arc<GraphicsAllocation>],
}

// =============================================================================
// KMD TRAITS
// =============================================================================

/// Memory-management calls into the KMD
pub trait KmdMemory: Send + Sync {
    /// Create a buffer object in a region
    fn create_buffer_object(&self, request: &BoCreateRequest) -> KmdResult<BoHandle>;

    /// Bind a buffer object at a GPU virtual address
    fn bind(&self, handle: BoHandle, address: GpuAddr, size: ByteSize) -> KmdResult<()>;

    /// Unbind and close a buffer object
    fn close_buffer_object(&self, handle: BoHandle) -> KmdResult<()>;

    /// Set a memory advise attribute on a range of a buffer object
    fn advise(
        &self,
        handle: BoHandle,
        address: GpuAddr,
        size: ByteSize,
        attribute: AdviseAttribute,
    ) -> KmdResult<()>;

    /// Migrate a range of a buffer object to a region
    fn prefetch(
        &self,
        handle: BoHandle,
        address: GpuAddr,
        size: ByteSize,
        region: MemoryRegion,
    ) -> KmdResult<()>;
}

/// Command submission calls into the KMD
pub trait KmdSubmit: Send + Sync {
    /// Create an execution context on an engine
    fn create_context(&self, engine: EngineInstance) -> KmdResult<u32>;

    /// Destroy an execution context
    fn destroy_context(&self, context_id: u32) -> KmdResult<()>;

    /// Submit a batch; returns the task count that completes it
    fn submit(&self, exec: &ExecBuffer<'_>) -> KmdResult<u64>;

    /// Last task count the context has completed
    fn completed_task_count(&self, context_id: u32) -> u64;

    /// Wait for a task count; returns false on timeout
    fn wait(&self, context_id: u32, task_count: u64, timeout_ns: u64) -> KmdResult<bool>;
}

/// Full KMD surface used by the driver core
pub trait Kmd: KmdMemory + KmdSubmit {}

impl<T: KmdMemory + KmdSubmit> Kmd for T {}
