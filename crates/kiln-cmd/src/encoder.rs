//! # Hardware Encoding Policy
//!
//! Per-generation encode routines selected once per device. The command
//! list state machine calls through a [`HardwareEncodingPolicy`] and never
//! inspects the generation itself.
//!
//! | Routine        | walker-postsync               | legacy                              |
//! |----------------|-------------------------------|-------------------------------------|
//! | dispatch       | COMPUTE_WALKER + post-sync    | GPGPU_WALKER, MEDIA_STATE_FLUSH, PC |
//! | signal         | PIPE_CONTROL [+ MI_MEM_FENCE] | PIPE_CONTROL                        |
//! | wait           | MI_SEMAPHORE_WAIT             | MI_SEMAPHORE_WAIT                   |
//! | copy (blitter) | XY_COPY_BLT                   | XY_COPY_BLT                         |

use core::mem::size_of;

use kiln_core::{GfxCoreFamily, GpuAddr, HardwareCapabilities};

use crate::commands::{
    dwords_of, header, opcode, ComputeWalker, GpgpuWalker, MediaStateFlush, MiMemFence,
    MiSemaphoreWait, MiStoreDataImm, PipeControl, PipeControlFlags, PostSyncData, PostSyncFlags,
    StateBaseAddress, XyCopyBlt,
};
use crate::compute_mode::{compute_mode_size, ComputeModeDirty};
use crate::stream::{GraphicsCommandStream, StreamDirty};

// =============================================================================
// ARGUMENTS
// =============================================================================

/// What a post-sync write stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostSyncKind {
    /// Immediate value
    Immediate,
    /// GPU timestamp
    Timestamp,
}

/// Completion write attached to a dispatch or signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostSync {
    /// Destination
    pub address: GpuAddr,
    /// Immediate data
    pub data: u64,
    /// Write kind
    pub kind: PostSyncKind,
    /// Request a system-memory fence before the write
    pub system_fence: bool,
    /// Follow the write with MI_MEM_FENCE
    pub mem_fence_after: bool,
}

/// Kernel dispatch arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchArgs {
    /// Kernel ISA address
    pub kernel_address: GpuAddr,
    /// Indirect (argument) data address
    pub indirect_data: GpuAddr,
    /// Thread groups per dimension
    pub group_count: [u32; 3],
    /// Completion write
    pub post_sync: Option<PostSync>,
}

/// Heap base addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapBases {
    /// General state
    pub general: GpuAddr,
    /// Surface state
    pub surface: GpuAddr,
    /// Instructions
    pub instruction: GpuAddr,
}

// =============================================================================
// POLICY
// =============================================================================

/// Encode routines for one hardware family
#[derive(Debug, Clone, Copy)]
pub struct HardwareEncodingPolicy {
    /// Policy name
    pub name: &'static str,
    /// Encode a kernel dispatch
    pub encode_dispatch: fn(&mut GraphicsCommandStream, &DispatchArgs),
    /// Size of [`Self::encode_dispatch`] output
    pub dispatch_size: fn(&DispatchArgs) -> usize,
    /// Encode a standalone signal on a compute engine
    pub encode_signal: fn(&mut GraphicsCommandStream, &PostSync),
    /// Encode an execution barrier
    pub encode_barrier: fn(&mut GraphicsCommandStream),
}

impl HardwareEncodingPolicy {
    /// COMPUTE_WALKER family (Xe-HP and later)
    pub const WALKER_POST_SYNC: Self = Self {
        name: "walker-postsync",
        encode_dispatch: walker::encode_dispatch,
        dispatch_size: walker::dispatch_size,
        encode_signal: encode_pipe_control_signal,
        encode_barrier,
    };

    /// GPGPU_WALKER family (Gen9 to Gen12LP)
    pub const LEGACY: Self = Self {
        name: "legacy",
        encode_dispatch: legacy::encode_dispatch,
        dispatch_size: legacy::dispatch_size,
        encode_signal: encode_pipe_control_signal,
        encode_barrier,
    };

    /// Policy for a core family
    pub const fn for_family(family: GfxCoreFamily) -> &'static Self {
        if family.has_walker_post_sync() {
            &Self::WALKER_POST_SYNC
        } else {
            &Self::LEGACY
        }
    }

    /// Encode a wait until the event at `address` holds `value`
    pub fn encode_wait(&self, stream: &mut GraphicsCommandStream, address: GpuAddr, value: u32) {
        stream.emit(&MiSemaphoreWait::new(address, value));
    }

    /// Encode a linear copy on the blitter
    pub fn encode_copy_blit(
        &self,
        stream: &mut GraphicsCommandStream,
        dst: GpuAddr,
        src: GpuAddr,
        size: u64,
    ) {
        stream.emit(&XyCopyBlt::new(dst, src, size));
    }

    /// Encode a signal on the blitter
    pub fn encode_copy_signal(&self, stream: &mut GraphicsCommandStream, post_sync: &PostSync) {
        stream.emit(&MiStoreDataImm::new(post_sync.address, post_sync.data as u32));
        if post_sync.mem_fence_after {
            stream.emit(&MiMemFence::new());
        }
    }

    /// Emit STATE_BASE_ADDRESS if the heap bases are dirty
    pub fn program_heap_bases(&self, stream: &mut GraphicsCommandStream, bases: &HeapBases) -> bool {
        if !stream.is_dirty(StreamDirty::HEAP_BASES) {
            return false;
        }
        stream.emit(&StateBaseAddress::new(
            bases.general,
            bases.surface,
            bases.instruction,
        ));
        stream.clear_dirty(StreamDirty::HEAP_BASES);
        true
    }

    /// Terminate a batch
    pub fn encode_batch_end(&self, stream: &mut GraphicsCommandStream) {
        stream.emit(&crate::commands::MiBatchBufferEnd::new());
    }

    /// Upper bound of the bytes one append emits
    ///
    /// Covers `waits` semaphore waits, `dispatches` walkers each preceded by
    /// heap bases and a full compute-mode program, the trailing barrier and
    /// signal, a blit, and the batch end `close` adds later.
    pub fn max_append_size(
        &self,
        caps: &HardwareCapabilities,
        waits: usize,
        dispatches: usize,
    ) -> usize {
        let fenced = PostSync {
            address: GpuAddr::null(),
            data: 0,
            kind: PostSyncKind::Immediate,
            system_fence: true,
            mem_fence_after: true,
        };
        let dispatch = size_of::<StateBaseAddress>()
            + compute_mode_size(ComputeModeDirty::supported(caps), caps)
            + (self.dispatch_size)(&DispatchArgs {
                kernel_address: GpuAddr::null(),
                indirect_data: GpuAddr::null(),
                group_count: [1; 3],
                post_sync: Some(fenced),
            });
        let tail = 2 * size_of::<PipeControl>()
            + size_of::<XyCopyBlt>()
            + size_of::<MiStoreDataImm>()
            + 2 * size_of::<MiMemFence>()
            + size_of::<crate::commands::MiBatchBufferEnd>();
        waits * size_of::<MiSemaphoreWait>() + dispatches * dispatch + tail
    }
}

// =============================================================================
// SHARED ROUTINES
// =============================================================================

fn pipe_control_post_sync_flags(kind: PostSyncKind) -> PipeControlFlags {
    let write = match kind {
        PostSyncKind::Immediate => PipeControlFlags::WRITE_IMMEDIATE,
        PostSyncKind::Timestamp => PipeControlFlags::WRITE_TIMESTAMP,
    };
    PipeControlFlags::CS_STALL | PipeControlFlags::DC_FLUSH | write
}

fn encode_pipe_control_signal(stream: &mut GraphicsCommandStream, post_sync: &PostSync) {
    stream.emit(&PipeControl::with_post_sync(
        pipe_control_post_sync_flags(post_sync.kind),
        post_sync.address,
        post_sync.data,
    ));
    if post_sync.mem_fence_after {
        stream.emit(&MiMemFence::new());
    }
}

fn encode_barrier(stream: &mut GraphicsCommandStream) {
    stream.emit(&PipeControl::new(
        PipeControlFlags::CS_STALL | PipeControlFlags::DC_FLUSH | PipeControlFlags::HDC_PIPELINE_FLUSH,
    ));
}

fn mem_fence_size(post_sync: Option<&PostSync>) -> usize {
    match post_sync {
        Some(ps) if ps.mem_fence_after => core::mem::size_of::<MiMemFence>(),
        _ => 0,
    }
}

// =============================================================================
// WALKER POST-SYNC
// =============================================================================

mod walker {
    use super::*;

    fn post_sync_data(post_sync: Option<&PostSync>) -> PostSyncData {
        let Some(ps) = post_sync else {
            return PostSyncData {
                flags: 0,
                address_lo: 0,
                address_hi: 0,
                data_lo: 0,
                data_hi: 0,
            };
        };

        let mut flags = PostSyncFlags::DATAPORT_PIPELINE_FLUSH;
        flags |= match ps.kind {
            PostSyncKind::Immediate => PostSyncFlags::WRITE_IMMEDIATE,
            PostSyncKind::Timestamp => PostSyncFlags::WRITE_TIMESTAMP,
        };
        flags.set(PostSyncFlags::SYSTEM_MEMORY_FENCE_REQUEST, ps.system_fence);

        PostSyncData {
            flags: flags.bits(),
            address_lo: ps.address.low(),
            address_hi: ps.address.high(),
            data_lo: ps.data as u32,
            data_hi: (ps.data >> 32) as u32,
        }
    }

    pub(super) fn encode_dispatch(stream: &mut GraphicsCommandStream, args: &DispatchArgs) {
        let walker = ComputeWalker {
            header: header(opcode::COMPUTE_WALKER, dwords_of::<ComputeWalker>()),
            kernel_lo: args.kernel_address.low(),
            kernel_hi: args.kernel_address.high(),
            group_x: args.group_count[0],
            group_y: args.group_count[1],
            group_z: args.group_count[2],
            indirect_lo: args.indirect_data.low(),
            indirect_hi: args.indirect_data.high(),
            post_sync: post_sync_data(args.post_sync.as_ref()),
        };
        stream.emit(&walker);
        if args.post_sync.is_some_and(|ps| ps.mem_fence_after) {
            stream.emit(&MiMemFence::new());
        }
    }

    pub(super) fn dispatch_size(args: &DispatchArgs) -> usize {
        core::mem::size_of::<ComputeWalker>() + mem_fence_size(args.post_sync.as_ref())
    }
}

// =============================================================================
// LEGACY
// =============================================================================

mod legacy {
    use super::*;

    pub(super) fn encode_dispatch(stream: &mut GraphicsCommandStream, args: &DispatchArgs) {
        stream.emit(&GpgpuWalker {
            header: header(opcode::GPGPU_WALKER, dwords_of::<GpgpuWalker>()),
            kernel_lo: args.kernel_address.low(),
            kernel_hi: args.kernel_address.high(),
            group_x: args.group_count[0],
            group_y: args.group_count[1],
            group_z: args.group_count[2],
        });
        stream.emit(&MediaStateFlush::new());
        if let Some(ps) = &args.post_sync {
            // No fence bit on this family
            encode_pipe_control_signal(stream, ps);
        }
    }

    pub(super) fn dispatch_size(args: &DispatchArgs) -> usize {
        let mut size =
            core::mem::size_of::<GpgpuWalker>() + core::mem::size_of::<MediaStateFlush>();
        if args.post_sync.is_some() {
            size += core::mem::size_of::<PipeControl>();
        }
        size + mem_fence_size(args.post_sync.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamTarget;
    use alloc::vec::Vec;
    use kiln_core::{ByteSize, DeviceBitfield, EngineGroupType};

    fn stream() -> GraphicsCommandStream {
        GraphicsCommandStream::new(
            StreamTarget {
                root_device_index: 0,
                device_bitfield: DeviceBitfield::new(1),
                engine: EngineGroupType::Compute,
            },
            ByteSize::KIB_4,
        )
    }

    fn args(system_fence: bool, mem_fence_after: bool) -> DispatchArgs {
        DispatchArgs {
            kernel_address: GpuAddr::new(0x4000),
            indirect_data: GpuAddr::new(0x8000),
            group_count: [4, 2, 1],
            post_sync: Some(PostSync {
                address: GpuAddr::new(0x1_0000_0040),
                data: 0,
                kind: PostSyncKind::Immediate,
                system_fence,
                mem_fence_after,
            }),
        }
    }

    #[test]
    fn test_walker_carries_fence_bit() {
        let policy = HardwareEncodingPolicy::for_family(GfxCoreFamily::XeHpc);
        let mut s = stream();
        (policy.encode_dispatch)(&mut s, &args(true, false));

        let walker = s.reader().next().unwrap().read::<ComputeWalker>().unwrap();
        assert_eq!(walker.group_x, 4);
        let flags = walker.post_sync.flags();
        assert!(flags.contains(PostSyncFlags::SYSTEM_MEMORY_FENCE_REQUEST));
        assert!(flags.contains(PostSyncFlags::WRITE_IMMEDIATE));
        assert_eq!(walker.post_sync.address_hi, 1);
    }

    #[test]
    fn test_dispatch_size_matches_output() {
        for family in [GfxCoreFamily::Gen9, GfxCoreFamily::XeHpg, GfxCoreFamily::XeHpc] {
            let policy = HardwareEncodingPolicy::for_family(family);
            for a in [args(false, false), args(true, true), DispatchArgs { post_sync: None, ..args(false, false) }] {
                let mut s = stream();
                (policy.encode_dispatch)(&mut s, &a);
                assert_eq!(s.used(), (policy.dispatch_size)(&a), "{}", policy.name);
            }
        }
    }

    #[test]
    fn test_mem_fence_follows_walker() {
        let policy = HardwareEncodingPolicy::for_family(GfxCoreFamily::XeHpc);
        let mut s = stream();
        (policy.encode_dispatch)(&mut s, &args(false, true));
        let opcodes: Vec<_> = s.reader().map(|p| p.opcode).collect();
        assert_eq!(opcodes, [opcode::COMPUTE_WALKER, opcode::MI_MEM_FENCE]);
    }

    #[test]
    fn test_legacy_dispatch_sequence() {
        let policy = HardwareEncodingPolicy::for_family(GfxCoreFamily::Gen12Lp);
        assert_eq!(policy.name, "legacy");
        let mut s = stream();
        (policy.encode_dispatch)(&mut s, &args(true, false));
        let opcodes: Vec<_> = s.reader().map(|p| p.opcode).collect();
        assert_eq!(
            opcodes,
            [opcode::GPGPU_WALKER, opcode::MEDIA_STATE_FLUSH, opcode::PIPE_CONTROL]
        );
    }

    #[test]
    fn test_append_bound_covers_worst_case() {
        use crate::compute_mode::{program_compute_mode, ComputeModeProperties, ComputeModeState};

        for family in [GfxCoreFamily::Gen11, GfxCoreFamily::Gen12Lp, GfxCoreFamily::XeHpc] {
            let caps = HardwareCapabilities::for_family(family, kiln_core::hw::revision::B);
            let policy = HardwareEncodingPolicy::for_family(family);

            // A fresh stream has every state group dirty
            let mut dispatch = stream();
            let mut state = ComputeModeState::new(ComputeModeProperties::new(
                caps.default_thread_arbitration,
            ));
            policy.program_heap_bases(&mut dispatch, &HeapBases::default());
            program_compute_mode(&mut dispatch, &mut state, &caps);
            (policy.encode_dispatch)(&mut dispatch, &args(true, true));

            let mut rest = stream();
            policy.encode_wait(&mut rest, GpuAddr::new(0x1000), 1);
            policy.encode_wait(&mut rest, GpuAddr::new(0x1040), 1);
            (policy.encode_barrier)(&mut rest);
            (policy.encode_signal)(&mut rest, &args(true, true).post_sync.unwrap());
            policy.encode_batch_end(&mut rest);

            let worst = 3 * dispatch.used() + rest.used();
            assert!(worst <= policy.max_append_size(&caps, 2, 3), "{:?}", family);
        }

        let caps = HardwareCapabilities::for_family(GfxCoreFamily::XeHpc, 0);
        let policy = HardwareEncodingPolicy::for_family(GfxCoreFamily::XeHpc);
        assert_eq!(
            policy.max_append_size(&caps, 1, 0) - policy.max_append_size(&caps, 0, 0),
            size_of::<MiSemaphoreWait>()
        );
    }

    #[test]
    fn test_heap_bases_only_when_dirty() {
        let policy = HardwareEncodingPolicy::for_family(GfxCoreFamily::XeHpc);
        let mut s = stream();
        let bases = HeapBases::default();
        assert!(policy.program_heap_bases(&mut s, &bases));
        assert!(!policy.program_heap_bases(&mut s, &bases));
        s.reset();
        assert!(policy.program_heap_bases(&mut s, &bases));
    }
}
