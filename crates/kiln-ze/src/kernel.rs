//! # Kernels
//!
//! A kernel is an ISA allocation plus its argument slots and the execution
//! properties that feed compute-mode programming.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use kiln_cmd::ComputeModeProperties;
use kiln_core::{ByteSize, Error, GpuAddr, ResolvedConfiguration, Result, ThreadArbitrationPolicy};
use kiln_mem::{AllocationProperties, AllocationType, GraphicsAllocation, MemoryPool};

use crate::device::Device;

bitflags::bitflags! {
    /// Memory kinds a kernel may reach through pointers it was not given
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IndirectAccessFlags: u32 {
        /// Host allocations
        const HOST = 1 << 0;
        /// Device allocations
        const DEVICE = 1 << 1;
        /// Shared allocations
        const SHARED = 1 << 2;
    }
}

/// Kernel creation parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDesc {
    /// Entry point name
    pub name: String,
    /// ISA size
    pub isa_size: ByteSize,
    /// Number of arguments
    pub num_args: u32,
    /// Kernel was compiled for the large GRF
    pub large_grf: bool,
    /// Kernel needs host coherency
    pub requires_coherency: bool,
    /// Arbitration policy the kernel asks for
    pub thread_arbitration: Option<ThreadArbitrationPolicy>,
}

impl KernelDesc {
    /// Small-GRF kernel with default properties
    pub fn new(name: &str, num_args: u32) -> Self {
        Self {
            name: String::from(name),
            isa_size: ByteSize::KIB_4,
            num_args,
            large_grf: false,
            requires_coherency: false,
            thread_arbitration: None,
        }
    }
}

/// Value bound to a kernel argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    /// USM pointer
    Pointer(GpuAddr),
    /// Plain value
    Value(u64),
}

/// A compiled kernel
pub struct Kernel {
    desc: KernelDesc,
    root_device_index: u32,
    isa: Arc<GraphicsAllocation>,
    device: Arc<Device>,
    args: Mutex<Vec<Option<KernelArg>>>,
    indirect_access: Mutex<IndirectAccessFlags>,
}

impl Kernel {
    /// Upload a kernel to `device`
    pub fn create(device: &Arc<Device>, desc: KernelDesc) -> Result<Arc<Self>> {
        if desc.isa_size.as_bytes() == 0 {
            return Err(Error::InvalidArgument);
        }
        let isa = device.memory_manager().allocate(&AllocationProperties {
            size: desc.isa_size,
            pool: MemoryPool::LocalMemory,
            allocation_type: AllocationType::KernelIsa,
            root_device_index: device.root_device_index(),
            device_bitfield: device.device_bitfield(),
        })?;
        log::trace!("kernel {} isa at {}", desc.name, isa.gpu_address);

        Ok(Arc::new(Self {
            args: Mutex::new(vec![None; desc.num_args as usize]),
            root_device_index: device.root_device_index(),
            device: device.clone(),
            desc,
            isa,
            indirect_access: Mutex::new(IndirectAccessFlags::empty()),
        }))
    }

    /// Get name
    #[inline]
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    /// Get root device index
    #[inline]
    pub fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    /// Get ISA allocation
    #[inline]
    pub fn isa(&self) -> &Arc<GraphicsAllocation> {
        &self.isa
    }

    /// Bind a pointer argument
    pub fn set_arg_pointer(&self, index: u32, ptr: GpuAddr) -> Result<()> {
        self.set_arg(index, KernelArg::Pointer(ptr))
    }

    /// Bind a value argument
    pub fn set_arg_value(&self, index: u32, value: u64) -> Result<()> {
        self.set_arg(index, KernelArg::Value(value))
    }

    fn set_arg(&self, index: u32, arg: KernelArg) -> Result<()> {
        let mut args = self.args.lock();
        let slot = args.get_mut(index as usize).ok_or(Error::InvalidArgument)?;
        *slot = Some(arg);
        Ok(())
    }

    /// Declare indirect access
    pub fn set_indirect_access(&self, flags: IndirectAccessFlags) {
        *self.indirect_access.lock() = flags;
    }

    /// Get indirect access flags
    pub fn indirect_access(&self) -> IndirectAccessFlags {
        *self.indirect_access.lock()
    }

    /// Non-null pointer arguments; fails if any argument is unbound
    pub fn pointer_args(&self) -> Result<Vec<GpuAddr>> {
        let args = self.args.lock();
        let mut pointers = Vec::new();
        for arg in args.iter() {
            match arg {
                Some(KernelArg::Pointer(ptr)) if !ptr.is_null() => pointers.push(*ptr),
                Some(_) => {}
                None => return Err(Error::InvalidArgument),
            }
        }
        Ok(pointers)
    }

    /// Argument block as the dispatch reads it: one little-endian qword per slot
    ///
    /// Unbound slots read as zero.
    pub fn argument_data(&self) -> Vec<u8> {
        let args = self.args.lock();
        let mut data = Vec::with_capacity(args.len() * 8);
        for arg in args.iter() {
            let value = match arg {
                Some(KernelArg::Pointer(ptr)) => ptr.raw(),
                Some(KernelArg::Value(value)) => *value,
                None => 0,
            };
            data.extend_from_slice(&value.to_le_bytes());
        }
        data
    }

    /// Compute-mode properties a dispatch of this kernel requires
    pub fn compute_mode(&self, config: &ResolvedConfiguration) -> ComputeModeProperties {
        ComputeModeProperties {
            coherency_required: self.desc.requires_coherency,
            large_grf: config.large_grf_override.unwrap_or(self.desc.large_grf),
            thread_arbitration: self
                .desc
                .thread_arbitration
                .unwrap_or(config.thread_arbitration_policy),
        }
    }

    /// Free the ISA
    pub fn destroy(&self) -> Result<()> {
        self.device.memory_manager().free(&self.isa)
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.desc.name)
            .field("isa", &self.isa.gpu_address)
            .field("num_args", &self.desc.num_args)
            .field("indirect_access", &self.indirect_access())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceDesc;
    use crate::driver::DriverContext;
    use kiln_core::{DriverConfiguration, GfxCoreFamily};
    use kiln_mem::SimulatedKmd;

    fn device(config: DriverConfiguration) -> Arc<Device> {
        let driver = DriverContext::new(Arc::new(SimulatedKmd::new()), config);
        driver
            .add_device(&DeviceDesc::new(GfxCoreFamily::XeHpg, 0))
            .unwrap()
    }

    #[test]
    fn test_unbound_argument_is_rejected() {
        let kernel = Kernel::create(&device(DriverConfiguration::new()), KernelDesc::new("k", 2))
            .unwrap();
        kernel.set_arg_pointer(0, GpuAddr::new(0x1000)).unwrap();
        assert_eq!(kernel.pointer_args(), Err(Error::InvalidArgument));
        kernel.set_arg_value(1, 7).unwrap();
        assert_eq!(kernel.pointer_args().unwrap(), vec![GpuAddr::new(0x1000)]);
        assert_eq!(kernel.set_arg_value(2, 0), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_null_pointer_args_are_skipped() {
        let kernel = Kernel::create(&device(DriverConfiguration::new()), KernelDesc::new("k", 1))
            .unwrap();
        kernel.set_arg_pointer(0, GpuAddr::null()).unwrap();
        assert!(kernel.pointer_args().unwrap().is_empty());
    }

    #[test]
    fn test_argument_data_layout() {
        let kernel = Kernel::create(&device(DriverConfiguration::new()), KernelDesc::new("k", 3))
            .unwrap();
        kernel.set_arg_pointer(0, GpuAddr::new(0x1_0000)).unwrap();
        kernel.set_arg_value(2, 42).unwrap();
        let data = kernel.argument_data();
        assert_eq!(data.len(), 24);
        assert_eq!(&data[0..8], &0x1_0000u64.to_le_bytes());
        assert_eq!(&data[8..16], &[0; 8]);
        assert_eq!(&data[16..24], &42u64.to_le_bytes());
    }

    #[test]
    fn test_large_grf_override() {
        let mut desc = KernelDesc::new("k", 0);
        desc.large_grf = true;
        let config = DriverConfiguration {
            large_grf_override: Some(false),
            ..DriverConfiguration::new()
        };
        let device = device(config);
        let kernel = Kernel::create(&device, desc).unwrap();
        assert!(!kernel.compute_mode(device.config()).large_grf);
    }
}
