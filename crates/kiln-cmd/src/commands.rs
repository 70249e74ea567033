//! # Hardware Command Layouts
//!
//! Dword layouts of every command the driver core emits.
//!
//! Every command starts with a header dword:
//!
//! ```text
//!  31            16 15         8 7           0
//! ┌────────────────┬────────────┬─────────────┐
//! │     opcode     │  reserved  │ length - 1  │
//! └────────────────┴────────────┴─────────────┘
//! ```
//!
//! where `length` is the total command length in dwords, header included.

use bytemuck::{Pod, Zeroable};

use kiln_core::GpuAddr;

// =============================================================================
// OPCODES
// =============================================================================

/// Command opcodes
pub mod opcode {
    /// End of batch
    pub const MI_BATCH_BUFFER_END: u16 = 0x0500;
    /// Memory fence
    pub const MI_MEM_FENCE: u16 = 0x0900;
    /// Register write
    pub const MI_LOAD_REGISTER_IMM: u16 = 0x1100;
    /// Wait on a memory value
    pub const MI_SEMAPHORE_WAIT: u16 = 0x1C00;
    /// Write an immediate to memory
    pub const MI_STORE_DATA_IMM: u16 = 0x2000;
    /// Blitter linear copy
    pub const XY_COPY_BLT: u16 = 0x5042;
    /// Heap base addresses
    pub const STATE_BASE_ADDRESS: u16 = 0x6101;
    /// Compute mode
    pub const STATE_COMPUTE_MODE: u16 = 0x6105;
    /// Media state flush
    pub const MEDIA_STATE_FLUSH: u16 = 0x7004;
    /// Legacy GPGPU walker
    pub const GPGPU_WALKER: u16 = 0x7105;
    /// Compute walker with inline post-sync
    pub const COMPUTE_WALKER: u16 = 0x7202;
    /// Pipe control
    pub const PIPE_CONTROL: u16 = 0x7A00;
}

/// Registers written with MI_LOAD_REGISTER_IMM
pub mod register {
    /// EU thread arbitration control
    pub const THREAD_ARBITRATION: u32 = 0xE404;
}

/// Build a header dword
#[inline]
pub const fn header(opcode: u16, length_dwords: usize) -> u32 {
    ((opcode as u32) << 16) | ((length_dwords as u32 - 1) & 0xFF)
}

/// Decode a header into (opcode, length in dwords)
#[inline]
pub const fn decode_header(dword: u32) -> (u16, usize) {
    ((dword >> 16) as u16, (dword & 0xFF) as usize + 1)
}

/// Length of a command layout in dwords
#[inline]
pub const fn dwords_of<T>() -> usize {
    core::mem::size_of::<T>() / 4
}

// =============================================================================
// FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Post-sync operation flags of a compute walker
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PostSyncFlags: u32 {
        /// Write the immediate data
        const WRITE_IMMEDIATE = 1 << 0;
        /// Write a timestamp
        const WRITE_TIMESTAMP = 1 << 1;
        /// Flush the dataport before the write
        const DATAPORT_PIPELINE_FLUSH = 1 << 2;
        /// Make prior writes visible to system memory observers
        const SYSTEM_MEMORY_FENCE_REQUEST = 1 << 3;
    }
}

bitflags::bitflags! {
    /// PIPE_CONTROL flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PipeControlFlags: u32 {
        /// Stall the command streamer
        const CS_STALL = 1 << 0;
        /// Flush the data cache
        const DC_FLUSH = 1 << 1;
        /// Flush the HDC pipeline
        const HDC_PIPELINE_FLUSH = 1 << 2;
        /// Post-sync immediate write
        const WRITE_IMMEDIATE = 1 << 3;
        /// Post-sync timestamp write
        const WRITE_TIMESTAMP = 1 << 4;
        /// Invalidate the TLB
        const TLB_INVALIDATE = 1 << 5;
    }
}

/// STATE_COMPUTE_MODE property identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ScmProperty {
    /// Force non-coherent
    Coherency = 1,
    /// Large GRF mode
    LargeGrf = 2,
    /// Thread arbitration policy
    ThreadArbitration = 3,
}

/// Mask bit present in every property dword
pub const SCM_PROPERTY_MASK: u32 = 1 << 16;

/// Encode one STATE_COMPUTE_MODE property dword
#[inline]
pub const fn scm_property(property: ScmProperty, value: u32) -> u32 {
    ((property as u32) << 24) | SCM_PROPERTY_MASK | (value & 0xFFFF)
}

// =============================================================================
// COMMAND LAYOUTS
// =============================================================================

/// MI_BATCH_BUFFER_END
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MiBatchBufferEnd {
    /// Header
    pub header: u32,
}

impl MiBatchBufferEnd {
    /// Build
    pub const fn new() -> Self {
        Self {
            header: header(opcode::MI_BATCH_BUFFER_END, dwords_of::<Self>()),
        }
    }
}

/// MI_MEM_FENCE
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MiMemFence {
    /// Header
    pub header: u32,
}

impl MiMemFence {
    /// Build
    pub const fn new() -> Self {
        Self {
            header: header(opcode::MI_MEM_FENCE, dwords_of::<Self>()),
        }
    }
}

/// MI_LOAD_REGISTER_IMM
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MiLoadRegisterImm {
    /// Header
    pub header: u32,
    /// Register offset
    pub register: u32,
    /// Value
    pub value: u32,
}

impl MiLoadRegisterImm {
    /// Build
    pub const fn new(register: u32, value: u32) -> Self {
        Self {
            header: header(opcode::MI_LOAD_REGISTER_IMM, dwords_of::<Self>()),
            register,
            value,
        }
    }
}

/// MI_SEMAPHORE_WAIT (wait until `*address == data`)
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MiSemaphoreWait {
    /// Header
    pub header: u32,
    /// Compare value
    pub data: u32,
    /// Address low
    pub address_lo: u32,
    /// Address high
    pub address_hi: u32,
}

impl MiSemaphoreWait {
    /// Build
    pub const fn new(address: GpuAddr, data: u32) -> Self {
        Self {
            header: header(opcode::MI_SEMAPHORE_WAIT, dwords_of::<Self>()),
            data,
            address_lo: address.low(),
            address_hi: address.high(),
        }
    }
}

/// MI_STORE_DATA_IMM
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MiStoreDataImm {
    /// Header
    pub header: u32,
    /// Address low
    pub address_lo: u32,
    /// Address high
    pub address_hi: u32,
    /// Data
    pub data: u32,
}

impl MiStoreDataImm {
    /// Build
    pub const fn new(address: GpuAddr, data: u32) -> Self {
        Self {
            header: header(opcode::MI_STORE_DATA_IMM, dwords_of::<Self>()),
            address_lo: address.low(),
            address_hi: address.high(),
            data,
        }
    }
}

/// PIPE_CONTROL
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PipeControl {
    /// Header
    pub header: u32,
    /// [`PipeControlFlags`]
    pub flags: u32,
    /// Post-sync address low
    pub address_lo: u32,
    /// Post-sync address high
    pub address_hi: u32,
    /// Immediate data low
    pub data_lo: u32,
    /// Immediate data high
    pub data_hi: u32,
}

impl PipeControl {
    /// Build a flush without post-sync
    pub const fn new(flags: PipeControlFlags) -> Self {
        Self::with_post_sync(flags, GpuAddr::null(), 0)
    }

    /// Build with a post-sync write
    pub const fn with_post_sync(flags: PipeControlFlags, address: GpuAddr, data: u64) -> Self {
        Self {
            header: header(opcode::PIPE_CONTROL, dwords_of::<Self>()),
            flags: flags.bits(),
            address_lo: address.low(),
            address_hi: address.high(),
            data_lo: data as u32,
            data_hi: (data >> 32) as u32,
        }
    }

    /// Decoded flags
    pub fn flags(&self) -> PipeControlFlags {
        PipeControlFlags::from_bits_truncate(self.flags)
    }
}

/// MEDIA_STATE_FLUSH
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MediaStateFlush {
    /// Header
    pub header: u32,
    /// Reserved
    pub reserved: u32,
}

impl MediaStateFlush {
    /// Build
    pub const fn new() -> Self {
        Self {
            header: header(opcode::MEDIA_STATE_FLUSH, dwords_of::<Self>()),
            reserved: 0,
        }
    }
}

/// GPGPU_WALKER
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpgpuWalker {
    /// Header
    pub header: u32,
    /// Kernel start address low
    pub kernel_lo: u32,
    /// Kernel start address high
    pub kernel_hi: u32,
    /// Thread groups X
    pub group_x: u32,
    /// Thread groups Y
    pub group_y: u32,
    /// Thread groups Z
    pub group_z: u32,
}

/// Post-sync block inlined in a compute walker
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PostSyncData {
    /// [`PostSyncFlags`]
    pub flags: u32,
    /// Destination address low
    pub address_lo: u32,
    /// Destination address high
    pub address_hi: u32,
    /// Immediate data low
    pub data_lo: u32,
    /// Immediate data high
    pub data_hi: u32,
}

impl PostSyncData {
    /// Decoded flags
    pub fn flags(&self) -> PostSyncFlags {
        PostSyncFlags::from_bits_truncate(self.flags)
    }
}

/// COMPUTE_WALKER
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ComputeWalker {
    /// Header
    pub header: u32,
    /// Kernel start address low
    pub kernel_lo: u32,
    /// Kernel start address high
    pub kernel_hi: u32,
    /// Thread groups X
    pub group_x: u32,
    /// Thread groups Y
    pub group_y: u32,
    /// Thread groups Z
    pub group_z: u32,
    /// Indirect data address low
    pub indirect_lo: u32,
    /// Indirect data address high
    pub indirect_hi: u32,
    /// Inline post-sync
    pub post_sync: PostSyncData,
}

/// XY_COPY_BLT (linear byte copy)
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct XyCopyBlt {
    /// Header
    pub header: u32,
    /// Size low
    pub size_lo: u32,
    /// Size high
    pub size_hi: u32,
    /// Source low
    pub src_lo: u32,
    /// Source high
    pub src_hi: u32,
    /// Destination low
    pub dst_lo: u32,
    /// Destination high
    pub dst_hi: u32,
}

impl XyCopyBlt {
    /// Build
    pub const fn new(dst: GpuAddr, src: GpuAddr, size: u64) -> Self {
        Self {
            header: header(opcode::XY_COPY_BLT, dwords_of::<Self>()),
            size_lo: size as u32,
            size_hi: (size >> 32) as u32,
            src_lo: src.low(),
            src_hi: src.high(),
            dst_lo: dst.low(),
            dst_hi: dst.high(),
        }
    }
}

/// STATE_BASE_ADDRESS
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct StateBaseAddress {
    /// Header
    pub header: u32,
    /// General state base low
    pub general_lo: u32,
    /// General state base high
    pub general_hi: u32,
    /// Surface state base low
    pub surface_lo: u32,
    /// Surface state base high
    pub surface_hi: u32,
    /// Instruction base low
    pub instruction_lo: u32,
    /// Instruction base high
    pub instruction_hi: u32,
}

impl StateBaseAddress {
    /// Build
    pub const fn new(general: GpuAddr, surface: GpuAddr, instruction: GpuAddr) -> Self {
        Self {
            header: header(opcode::STATE_BASE_ADDRESS, dwords_of::<Self>()),
            general_lo: general.low(),
            general_hi: general.high(),
            surface_lo: surface.low(),
            surface_hi: surface.high(),
            instruction_lo: instruction.low(),
            instruction_hi: instruction.high(),
        }
    }
}

static_assertions::const_assert_eq!(core::mem::size_of::<PipeControl>(), 24);
static_assertions::const_assert_eq!(core::mem::size_of::<PostSyncData>(), 20);
static_assertions::const_assert_eq!(core::mem::size_of::<ComputeWalker>(), 52);
static_assertions::const_assert_eq!(core::mem::size_of::<MiLoadRegisterImm>(), 12);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let h = header(opcode::COMPUTE_WALKER, dwords_of::<ComputeWalker>());
        assert_eq!(decode_header(h), (opcode::COMPUTE_WALKER, 13));

        let h = MiMemFence::new().header;
        assert_eq!(decode_header(h), (opcode::MI_MEM_FENCE, 1));
    }

    #[test]
    fn test_scm_property_dword() {
        let dw = scm_property(ScmProperty::LargeGrf, 1);
        assert_eq!(dw >> 24, ScmProperty::LargeGrf as u32);
        assert_ne!(dw & SCM_PROPERTY_MASK, 0);
        assert_eq!(dw & 0xFFFF, 1);
    }

    #[test]
    fn test_pipe_control_post_sync() {
        let pc = PipeControl::with_post_sync(
            PipeControlFlags::CS_STALL | PipeControlFlags::WRITE_IMMEDIATE,
            GpuAddr::new(0x1_2345_6000),
            0x1_0000_0002,
        );
        assert_eq!(pc.address_lo, 0x2345_6000);
        assert_eq!(pc.address_hi, 0x1);
        assert_eq!(pc.data_lo, 2);
        assert_eq!(pc.data_hi, 1);
        assert!(pc.flags().contains(PipeControlFlags::WRITE_IMMEDIATE));
    }
}
