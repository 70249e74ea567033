//! # Command List
//!
//! Records kernel launches, copies, fills, barriers and prefetches into a
//! [`GraphicsCommandStream`], tracking everything the recorded commands
//! touch: the residency set, the USM allocations a submission must hold,
//! the events it signals and the shared allocations to migrate.
//!
//! ## States
//!
//! ```text
//!              create                 close               execute
//!   Initial ─────────► Recording ─────────────► Closed ─────────────► Submitted
//!                          ▲                      │                      │
//!                          └──────────── reset ───┴──────────────────────┘
//!
//!   immediate:  Recording ──append──► (submitted on the internal queue) ──► Recording
//! ```
//!
//! Every append validates fully before it writes anything; a failed append
//! leaves the list exactly as it was.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use arrayvec::ArrayVec;
use hashbrown::HashMap;
use spin::{Mutex, MutexGuard};

use kiln_cmd::{
    program_compute_mode, system_fence_required, ComputeModeProperties, ComputeModeState,
    DispatchArgs, GraphicsCommandStream, HeapBases, IndirectHeap, MemoryUsage, PostSync,
    PrefetchContext, StreamTarget, INDIRECT_DATA_ALIGNMENT,
};
use kiln_core::{
    ByteSize, EngineGroupType, Error, EventStatus, GpuAddr, ResolvedConfiguration, Result,
};
use kiln_mem::{GraphicsAllocation, UsmAllocation, UsmKind};

use crate::device::{builtin, Device};
use crate::event::Event;
use crate::kernel::{IndirectAccessFlags, Kernel};
use crate::queue::{CommandQueue, CommandQueueDesc};
use crate::result::ResultCode;

/// SIMD width the built-in kernels are compiled for
const BUILTIN_SIMD_SIZE: u64 = 32;

/// Destination alignment of the bulk segment of a split copy
const COPY_MIDDLE_ALIGNMENT: u64 = 64;

/// Element size of the bulk copy kernel
const COPY_MIDDLE_ELEMENT_SIZE: u64 = 16;

/// Source alignment the bulk copy kernel needs
const COPY_SOURCE_ALIGNMENT: u64 = 4;

/// Largest fill pattern
pub const MAX_FILL_PATTERN_SIZE: usize = 16;

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// Command list state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandListState {
    /// Not bound to a device yet
    Initial,
    /// Accepting appends
    Recording,
    /// Ready for execution
    Closed,
    /// Executed at least once since the last reset
    Submitted,
}

/// Command list creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandListDesc {
    /// Engine group the list records for
    pub engine: EngineGroupType,
    /// Appends execute right away on an internal queue
    pub immediate: bool,
    /// Immediate appends wait for completion
    pub synchronous: bool,
}

impl CommandListDesc {
    /// Regular list on `engine`
    pub const fn regular(engine: EngineGroupType) -> Self {
        Self {
            engine,
            immediate: false,
            synchronous: false,
        }
    }

    /// Asynchronous immediate list on `engine`
    pub const fn immediate(engine: EngineGroupType) -> Self {
        Self {
            engine,
            immediate: true,
            synchronous: false,
        }
    }
}

/// Launch parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LaunchParams {
    /// Cooperative dispatch
    pub is_cooperative: bool,
    /// Dispatch of a driver built-in kernel
    pub is_builtin_kernel: bool,
    /// Part of an operation split over several dispatches
    pub is_kernel_split_operation: bool,
    /// Destination lives in host-visible system memory
    pub is_destination_allocation_in_system_memory: bool,
    /// Host caches must be flushed after the operation
    pub host_pointer_needs_flush: bool,
}

/// Memory copy parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryCopyParams {
    /// Mark the copy as split even when it is one dispatch
    pub force_split: bool,
}

// =============================================================================
// RECORDING STATE
// =============================================================================

/// Everything a command list accumulates while recording
pub(crate) struct Recording {
    state: CommandListState,
    pub(crate) stream: GraphicsCommandStream,
    pub(crate) prefetch: PrefetchContext,
    pub(crate) referenced: HashMap<GpuAddr, Arc<UsmAllocation>>,
    pub(crate) signal_events: Vec<Arc<Event>>,
    compute_mode: ComputeModeState,
    heap: IndirectHeap,
    prefetch_requested: bool,
    last_launch: Option<LaunchParams>,
}

impl Recording {
    pub(crate) fn is_executable(&self) -> bool {
        matches!(self.state, CommandListState::Closed | CommandListState::Submitted)
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.state = CommandListState::Submitted;
    }

    fn encode_waits(&mut self, device: &Device, waits: &[Arc<Event>]) {
        let root = device.root_device_index();
        for event in waits {
            if let Some(allocation) = event.allocation_for(root) {
                self.stream.make_resident(allocation);
            }
            device.policy().encode_wait(
                &mut self.stream,
                event.completion_address(),
                EventStatus::Signaled.raw() as u32,
            );
        }
    }

    fn commit(&mut self, root_device_index: u32, touched: &Touched) {
        for usm in &touched.allocations {
            if let Some(gpu) = usm.gpu_allocation(root_device_index) {
                self.stream.make_resident(gpu);
            }
            self.referenced
                .entry(usm.base())
                .or_insert_with(|| usm.clone());
        }
    }

    fn track_signal(&mut self, root_device_index: u32, event: &Arc<Event>) {
        if let Some(allocation) = event.allocation_for(root_device_index) {
            self.stream.make_resident(allocation);
        }
        if !self.signal_events.iter().any(|e| Arc::ptr_eq(e, event)) {
            self.signal_events.push(event.clone());
        }
    }

    /// Make room for the worst case of one append
    ///
    /// Moves the stream into a larger command buffer when the current one
    /// could overflow. Nothing is written, so a failure leaves the list as
    /// it was.
    fn ensure_space(&mut self, device: &Device, waits: usize, dispatches: usize) -> Result<()> {
        let needed = device.policy().max_append_size(device.caps(), waits, dispatches);
        if self.stream.remaining() >= needed {
            return Ok(());
        }
        let size = ByteSize::from_bytes((self.stream.used() + needed) as u64);
        let buffer = device.obtain_command_buffer_for(size)?;
        if let Some(old) = self.stream.replace_buffer(buffer) {
            device.recycle_command_buffer(old);
        }
        Ok(())
    }

    /// Heap bases, compute mode, arguments, then the walker
    fn encode_dispatch(&mut self, device: &Device, dispatch: &Dispatch<'_>) -> Result<()> {
        let policy = device.policy();
        policy.program_heap_bases(&mut self.stream, &HeapBases::default());

        self.compute_mode.require(dispatch.compute_mode);
        program_compute_mode(&mut self.stream, &mut self.compute_mode, device.caps());

        let indirect_data = self.heap.push(dispatch.arguments)?;
        for allocation in self.heap.allocations() {
            self.stream.make_resident(allocation);
        }

        (policy.encode_dispatch)(
            &mut self.stream,
            &DispatchArgs {
                kernel_address: dispatch.kernel_address,
                indirect_data,
                group_count: dispatch.group_count,
                post_sync: dispatch.post_sync,
            },
        );
        Ok(())
    }
}

/// One walker to encode
struct Dispatch<'a> {
    kernel_address: GpuAddr,
    arguments: &'a [u8],
    group_count: [u32; 3],
    compute_mode: ComputeModeProperties,
    post_sync: Option<PostSync>,
}

/// Allocations one append references, gathered before anything is recorded
#[derive(Default)]
struct Touched {
    allocations: Vec<Arc<UsmAllocation>>,
    usage: MemoryUsage,
}

impl Touched {
    fn add_pointer(&mut self, device: &Device, ptr: GpuAddr, size: u64) -> Result<()> {
        match device.resolve(ptr, size)? {
            Some(usm) => self.add(device.root_device_index(), usm),
            None => {
                self.usage.system_memory = true;
                Ok(())
            }
        }
    }

    fn add(&mut self, root_device_index: u32, usm: Arc<UsmAllocation>) -> Result<()> {
        if usm.gpu_allocation(root_device_index).is_none() {
            return Err(Error::InvalidArgument);
        }
        let system = usm.is_system_memory_for(root_device_index);
        self.usage = self.usage.union(MemoryUsage {
            system_memory: system,
            device_memory: !system,
        });
        if !self.allocations.iter().any(|a| Arc::ptr_eq(a, &usm)) {
            self.allocations.push(usm);
        }
        Ok(())
    }
}

// =============================================================================
// COPY SPLITTING
// =============================================================================

/// One built-in copy dispatch of a split copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CopySegment {
    offset: u64,
    size: u64,
    element_size: u64,
}

impl CopySegment {
    fn entry(&self) -> u64 {
        if self.element_size == 1 {
            builtin::COPY_BUFFER_BYTES
        } else {
            builtin::COPY_BUFFER
        }
    }
}

/// Split a copy into an unaligned head, an aligned bulk and a tail
fn split_copy(dst: GpuAddr, src: GpuAddr, size: u64) -> ArrayVec<CopySegment, 3> {
    let mut segments = ArrayVec::new();
    let left = ((COPY_MIDDLE_ALIGNMENT - dst.raw() % COPY_MIDDLE_ALIGNMENT) % COPY_MIDDLE_ALIGNMENT)
        .min(size);
    let right = ((dst.raw() + size) % COPY_MIDDLE_ALIGNMENT).min(size - left);
    let middle = size - left - right;

    if middle == 0 || (src.raw() + left) % COPY_SOURCE_ALIGNMENT != 0 {
        segments.push(CopySegment {
            offset: 0,
            size,
            element_size: 1,
        });
        return segments;
    }

    let parts = [
        (0, left, 1),
        (left, middle, COPY_MIDDLE_ELEMENT_SIZE),
        (left + middle, right, 1),
    ];
    for (offset, size, element_size) in parts {
        if size > 0 {
            segments.push(CopySegment {
                offset,
                size,
                element_size,
            });
        }
    }
    segments
}

fn group_count_for(size: u64, element_size: u64) -> Result<[u32; 3]> {
    let per_group = BUILTIN_SIMD_SIZE * element_size;
    let groups = size.div_ceil(per_group).max(1);
    let groups = u32::try_from(groups).map_err(|_| Error::InvalidArgument)?;
    Ok([groups, 1, 1])
}

fn slot_bytes(len: usize) -> usize {
    ByteSize::from_bytes(len as u64)
        .align_up(INDIRECT_DATA_ALIGNMENT)
        .as_bytes() as usize
}

fn qwords(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn builtin_compute_mode(config: &ResolvedConfiguration) -> ComputeModeProperties {
    ComputeModeProperties {
        large_grf: config.large_grf_override.unwrap_or(false),
        ..ComputeModeProperties::new(config.thread_arbitration_policy)
    }
}

fn builtin_launch() -> LaunchParams {
    LaunchParams {
        is_builtin_kernel: true,
        ..LaunchParams::default()
    }
}

// =============================================================================
// COMMAND LIST
// =============================================================================

/// A list of GPU commands for one device and engine group
pub struct CommandList {
    device: Arc<Device>,
    desc: CommandListDesc,
    queue: Option<Arc<CommandQueue>>,
    recording: Mutex<Recording>,
    destroyed: AtomicBool,
}

impl CommandList {
    /// Bind a new list to `device` and an engine group
    pub fn create(device: &Arc<Device>, desc: CommandListDesc) -> Result<Arc<Self>> {
        if !device.supports_engine(desc.engine) {
            return Err(Error::UnsupportedEngine);
        }
        let config = device.config();
        let mut stream = GraphicsCommandStream::new(
            StreamTarget {
                root_device_index: device.root_device_index(),
                device_bitfield: device.device_bitfield(),
                engine: desc.engine,
            },
            config.command_buffer_size,
        );
        stream.attach_buffer(device.obtain_command_buffer()?);

        let queue = if desc.immediate {
            let queue_desc = CommandQueueDesc {
                engine: desc.engine,
                synchronous: desc.synchronous,
            };
            match CommandQueue::create(device, queue_desc) {
                Ok(queue) => Some(queue),
                Err(e) => {
                    if let Some(buffer) = stream.take_buffer() {
                        device.recycle_command_buffer(buffer);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::debug!(
            "{} command list on device {}, {} engine",
            if desc.immediate { "immediate" } else { "regular" },
            device.root_device_index(),
            desc.engine
        );

        Ok(Arc::new(Self {
            recording: Mutex::new(Recording {
                state: CommandListState::Recording,
                stream,
                prefetch: PrefetchContext::new(),
                referenced: HashMap::new(),
                signal_events: Vec::new(),
                compute_mode: ComputeModeState::new(builtin_compute_mode(config)),
                heap: IndirectHeap::new(
                    device.memory_manager().clone(),
                    device.root_device_index(),
                    device.device_bitfield(),
                ),
                prefetch_requested: false,
                last_launch: None,
            }),
            device: device.clone(),
            desc,
            queue,
            destroyed: AtomicBool::new(false),
        }))
    }

    /// Get device
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Get engine group
    #[inline]
    pub fn engine(&self) -> EngineGroupType {
        self.desc.engine
    }

    /// Check if appends execute right away
    #[inline]
    pub fn is_immediate(&self) -> bool {
        self.desc.immediate
    }

    /// Get state
    pub fn state(&self) -> CommandListState {
        self.recording.lock().state
    }

    /// Check if a prefetch was appended since the last reset
    pub fn is_memory_prefetch_requested(&self) -> bool {
        self.recording.lock().prefetch_requested
    }

    /// Number of shared allocations waiting for migration
    pub fn prefetch_context_len(&self) -> usize {
        self.recording.lock().prefetch.len()
    }

    /// Launch parameters of the last dispatch-producing append
    pub fn launch_params(&self) -> Option<LaunchParams> {
        self.recording.lock().last_launch
    }

    /// Run `f` on the recorded stream
    pub fn inspect<R>(&self, f: impl FnOnce(&GraphicsCommandStream) -> R) -> R {
        f(&self.recording.lock().stream)
    }

    /// Read kernel argument data back from the list's heap
    pub fn read_indirect(&self, address: GpuAddr, len: usize) -> Option<Vec<u8>> {
        self.recording
            .lock()
            .heap
            .read(address, len)
            .map(<[u8]>::to_vec)
    }

    pub(crate) fn lock_recording(&self) -> MutexGuard<'_, Recording> {
        self.recording.lock()
    }

    fn check_recording(&self, recording: &Recording) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::InvalidState);
        }
        if recording.state != CommandListState::Recording {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    fn validate_events(&self, signal: Option<&Arc<Event>>, waits: &[Arc<Event>]) -> Result<()> {
        let root = self.device.root_device_index();
        if let Some(event) = signal {
            event.validate_for(root)?;
        }
        for event in waits {
            event.validate_for(root)?;
        }
        Ok(())
    }

    fn post_sync(&self, event: &Event, usage: MemoryUsage) -> PostSync {
        PostSync {
            address: event.completion_address(),
            data: EventStatus::Signaled.raw(),
            kind: event.post_sync_kind(),
            system_fence: system_fence_required(
                self.device.config(),
                usage,
                Some(event.signal_scope()),
            ),
            mem_fence_after: self.device.caps().mem_fence_after_signal,
        }
    }

    fn check_group_count(&self, group_count: [u32; 3], params: &LaunchParams) -> Result<()> {
        let caps = self.device.caps();
        let out_of_range = group_count
            .iter()
            .zip(caps.max_group_count.iter())
            .any(|(&count, &max)| count == 0 || count > max);
        if out_of_range {
            return Err(Error::InvalidArgument);
        }

        if params.is_cooperative {
            let limit = match self.desc.engine {
                EngineGroupType::CooperativeCompute => caps.cooperative.max_group_count,
                EngineGroupType::Compute | EngineGroupType::RenderCompute => {
                    caps.cooperative.fallback_max_group_count
                }
                EngineGroupType::Copy => 0,
            };
            let total: u64 = group_count.iter().map(|&c| u64::from(c)).product();
            if limit == 0 || total > u64::from(limit) {
                return Err(Error::InvalidArgument);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Appends
    // -------------------------------------------------------------------------

    /// Append a kernel dispatch
    pub fn append_launch_kernel(
        &self,
        kernel: &Kernel,
        group_count: [u32; 3],
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
        params: &LaunchParams,
    ) -> Result<()> {
        {
            let mut recording = self.recording.lock();
            self.check_recording(&recording)?;
            let root = self.device.root_device_index();
            if !self.desc.engine.supports_dispatch() || kernel.root_device_index() != root {
                return Err(Error::InvalidArgument);
            }
            self.check_group_count(group_count, params)?;
            self.validate_events(signal, waits)?;

            let mut touched = Touched::default();
            for ptr in kernel.pointer_args()? {
                touched.add_pointer(&self.device, ptr, 0)?;
            }
            let indirect = kernel.indirect_access();
            let kinds = [
                (IndirectAccessFlags::HOST, UsmKind::Host),
                (IndirectAccessFlags::DEVICE, UsmKind::Device),
                (IndirectAccessFlags::SHARED, UsmKind::Shared),
            ];
            for (flag, kind) in kinds {
                if !indirect.contains(flag) {
                    continue;
                }
                for usm in self.device.registry().allocations_of_kind(kind) {
                    if usm.gpu_allocation(root).is_some() {
                        touched.add(root, usm)?;
                    }
                }
            }

            let arguments = kernel.argument_data();
            recording.heap.reserve(arguments.len())?;

            let config = self.device.config();
            let compute_mode = if params.is_builtin_kernel {
                builtin_compute_mode(config)
            } else {
                kernel.compute_mode(config)
            };
            let post_sync = signal.map(|e| self.post_sync(e, touched.usage));
            recording.ensure_space(&self.device, waits.len(), 1)?;

            let recording = &mut *recording;
            recording.encode_waits(&self.device, waits);
            recording.commit(root, &touched);
            recording.stream.make_resident(kernel.isa());
            recording.encode_dispatch(
                &self.device,
                &Dispatch {
                    kernel_address: kernel.isa().gpu_address,
                    arguments: &arguments,
                    group_count,
                    compute_mode,
                    post_sync,
                },
            )?;
            if let Some(event) = signal {
                recording.track_signal(root, event);
            }
            recording.last_launch = Some(*params);

            log::trace!(
                "launch {} {:?}: {} allocation(s), fence={}",
                kernel.name(),
                group_count,
                touched.allocations.len(),
                post_sync.is_some_and(|p| p.system_fence)
            );
        }
        self.flush_if_immediate()
    }

    /// Append a linear copy
    ///
    /// Copy engines use the blitter. Compute engines dispatch the built-in
    /// copy kernels, splitting the copy into an unaligned head, a bulk part
    /// and a tail.
    pub fn append_memory_copy(
        &self,
        dst: GpuAddr,
        src: GpuAddr,
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
        params: &MemoryCopyParams,
    ) -> Result<()> {
        {
            let mut recording = self.recording.lock();
            self.check_recording(&recording)?;
            if size == 0 || dst.is_null() || src.is_null() {
                return Err(Error::InvalidArgument);
            }
            self.validate_events(signal, waits)?;

            let root = self.device.root_device_index();
            let mut touched = Touched::default();
            let dst_usm = self.device.resolve(dst, size)?;
            let host_pointer_needs_flush = dst_usm.is_none();
            let dst_in_system = dst_usm
                .as_ref()
                .is_none_or(|usm| usm.is_system_memory_for(root));
            match dst_usm {
                Some(usm) => touched.add(root, usm)?,
                None => touched.usage.system_memory = true,
            }
            touched.add_pointer(&self.device, src, size)?;
            let post_sync = signal.map(|e| self.post_sync(e, touched.usage));
            let policy = self.device.policy();
            let segments = split_copy(dst, src, size);
            recording.ensure_space(&self.device, waits.len(), segments.len())?;

            if self.desc.engine.is_copy() {
                let recording = &mut *recording;
                recording.encode_waits(&self.device, waits);
                recording.commit(root, &touched);
                policy.encode_copy_blit(&mut recording.stream, dst, src, size);
                if let (Some(event), Some(post_sync)) = (signal, post_sync) {
                    // The blitter has no fence bit; a memory fence stands in for it
                    let post_sync = PostSync {
                        mem_fence_after: post_sync.mem_fence_after || post_sync.system_fence,
                        ..post_sync
                    };
                    policy.encode_copy_signal(&mut recording.stream, &post_sync);
                    recording.track_signal(root, event);
                }
                log::trace!("blit {} <- {} ({} bytes)", dst, src, size);
            } else {
                let mut arguments = Vec::with_capacity(segments.len());
                let mut reserve = 0;
                for segment in &segments {
                    let data = qwords(&[
                        dst.raw() + segment.offset,
                        src.raw() + segment.offset,
                        segment.size / segment.element_size,
                    ]);
                    reserve += slot_bytes(data.len());
                    arguments.push((group_count_for(segment.size, segment.element_size)?, data));
                }
                recording.heap.reserve(reserve)?;

                let compute_mode = builtin_compute_mode(self.device.config());
                let recording = &mut *recording;
                recording.encode_waits(&self.device, waits);
                recording.commit(root, &touched);
                recording.stream.make_resident(self.device.builtin_isa());
                let last = segments.len() - 1;
                for (i, (segment, (group_count, data))) in
                    segments.iter().zip(arguments.iter()).enumerate()
                {
                    recording.encode_dispatch(
                        &self.device,
                        &Dispatch {
                            kernel_address: self.device.builtin_kernel(segment.entry()),
                            arguments: data,
                            group_count: *group_count,
                            compute_mode,
                            post_sync: if i == last { post_sync } else { None },
                        },
                    )?;
                }
                if host_pointer_needs_flush {
                    (policy.encode_barrier)(&mut recording.stream);
                }
                if let Some(event) = signal {
                    recording.track_signal(root, event);
                }
                recording.last_launch = Some(LaunchParams {
                    is_kernel_split_operation: params.force_split || segments.len() > 1,
                    is_destination_allocation_in_system_memory: dst_in_system,
                    host_pointer_needs_flush,
                    ..builtin_launch()
                });
                log::trace!(
                    "copy {} <- {} ({} bytes) in {} dispatch(es)",
                    dst,
                    src,
                    size,
                    segments.len()
                );
            }
        }
        self.flush_if_immediate()
    }

    /// Append a pattern fill of `size` bytes at `dst`
    pub fn append_memory_fill(
        &self,
        dst: GpuAddr,
        pattern: &[u8],
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> Result<()> {
        {
            let mut recording = self.recording.lock();
            self.check_recording(&recording)?;
            if self.desc.engine.is_copy() {
                return Err(Error::UnsupportedFeature);
            }
            if size == 0
                || pattern.is_empty()
                || !pattern.len().is_power_of_two()
                || pattern.len() > MAX_FILL_PATTERN_SIZE
            {
                return Err(Error::InvalidArgument);
            }
            self.validate_events(signal, waits)?;

            let root = self.device.root_device_index();
            let usm = self
                .device
                .registry()
                .lookup_range(dst, size)
                .map_err(|_| Error::InvalidArgument)?;
            let host_pointer_needs_flush = matches!(usm.kind(), UsmKind::Host | UsmKind::Shared);
            let dst_in_system = usm.is_system_memory_for(root);
            let mut touched = Touched::default();
            touched.add(root, usm)?;

            let pattern_size = pattern.len() as u64;
            let mut data = qwords(&[dst.raw(), size, pattern_size]);
            data.extend_from_slice(pattern);
            let group_count = group_count_for(size, pattern_size)?;
            recording.heap.reserve(data.len())?;
            let post_sync = signal.map(|e| self.post_sync(e, touched.usage));
            recording.ensure_space(&self.device, waits.len(), 1)?;

            let recording = &mut *recording;
            recording.encode_waits(&self.device, waits);
            recording.commit(root, &touched);
            recording.stream.make_resident(self.device.builtin_isa());
            recording.encode_dispatch(
                &self.device,
                &Dispatch {
                    kernel_address: self.device.builtin_kernel(builtin::FILL_BUFFER),
                    arguments: &data,
                    group_count,
                    compute_mode: builtin_compute_mode(self.device.config()),
                    post_sync,
                },
            )?;
            if host_pointer_needs_flush {
                (self.device.policy().encode_barrier)(&mut recording.stream);
            }
            if let Some(event) = signal {
                recording.track_signal(root, event);
            }
            recording.last_launch = Some(LaunchParams {
                is_destination_allocation_in_system_memory: dst_in_system,
                host_pointer_needs_flush,
                ..builtin_launch()
            });
        }
        self.flush_if_immediate()
    }

    /// Ask for `ptr` to be migrated to the device before the list runs
    ///
    /// Records nothing in the stream. Shared allocations join the prefetch
    /// context; whether they are migrated is decided at execution. Pointers
    /// the driver does not own are accepted only on devices that can reach
    /// arbitrary system memory.
    pub fn append_memory_prefetch(&self, ptr: GpuAddr, size: u64) -> Result<()> {
        {
            let mut recording = self.recording.lock();
            self.check_recording(&recording)?;
            let resolved = self.device.resolve(ptr, size)?;
            recording.prefetch_requested = true;
            match resolved {
                Some(usm) => {
                    if recording.prefetch.add(&usm) {
                        log::trace!("prefetch of {} recorded", usm.base());
                    }
                }
                None => log::trace!("prefetch of unmanaged {} left to the KMD", ptr),
            }
        }
        self.flush_if_immediate()
    }

    /// Append an execution and memory barrier
    pub fn append_barrier(&self, signal: Option<&Arc<Event>>, waits: &[Arc<Event>]) -> Result<()> {
        {
            let mut recording = self.recording.lock();
            self.check_recording(&recording)?;
            self.validate_events(signal, waits)?;

            let root = self.device.root_device_index();
            let policy = self.device.policy();
            let post_sync = signal.map(|e| self.post_sync(e, MemoryUsage::NONE));
            recording.ensure_space(&self.device, waits.len(), 0)?;
            let recording = &mut *recording;
            recording.encode_waits(&self.device, waits);
            if self.desc.engine.is_copy() {
                if let Some(post_sync) = &post_sync {
                    policy.encode_copy_signal(&mut recording.stream, post_sync);
                }
            } else {
                (policy.encode_barrier)(&mut recording.stream);
                if let Some(post_sync) = &post_sync {
                    (policy.encode_signal)(&mut recording.stream, post_sync);
                }
            }
            if let Some(event) = signal {
                recording.track_signal(root, event);
            }
        }
        self.flush_if_immediate()
    }

    /// Copy between two graphics allocations on behalf of page-fault migration
    ///
    /// Always a single split built-in dispatch on compute engines; it signals
    /// no event and therefore never requests a system fence.
    pub fn append_page_fault_copy(
        &self,
        dst: &Arc<GraphicsAllocation>,
        src: &Arc<GraphicsAllocation>,
        size: u64,
        flush_host: bool,
    ) -> Result<()> {
        {
            let mut recording = self.recording.lock();
            self.check_recording(&recording)?;
            let root = self.device.root_device_index();
            if size == 0
                || size > dst.size.as_bytes()
                || size > src.size.as_bytes()
                || dst.root_device_index != root
                || src.root_device_index != root
            {
                return Err(Error::InvalidArgument);
            }

            let policy = self.device.policy();
            recording.ensure_space(&self.device, 0, 1)?;
            if self.desc.engine.is_copy() {
                let recording = &mut *recording;
                recording.stream.make_resident(dst);
                recording.stream.make_resident(src);
                policy.encode_copy_blit(&mut recording.stream, dst.gpu_address, src.gpu_address, size);
            } else {
                let data = qwords(&[dst.gpu_address.raw(), src.gpu_address.raw(), size]);
                let group_count = group_count_for(size, 1)?;
                recording.heap.reserve(data.len())?;

                let recording = &mut *recording;
                recording.stream.make_resident(dst);
                recording.stream.make_resident(src);
                recording.stream.make_resident(self.device.builtin_isa());
                recording.encode_dispatch(
                    &self.device,
                    &Dispatch {
                        kernel_address: self.device.builtin_kernel(builtin::PAGE_FAULT_COPY),
                        arguments: &data,
                        group_count,
                        compute_mode: builtin_compute_mode(self.device.config()),
                        post_sync: None,
                    },
                )?;
                if flush_host {
                    (policy.encode_barrier)(&mut recording.stream);
                }
                recording.last_launch = Some(LaunchParams {
                    is_kernel_split_operation: true,
                    is_destination_allocation_in_system_memory: dst.is_system_memory(),
                    host_pointer_needs_flush: flush_host,
                    ..builtin_launch()
                });
            }
            log::trace!(
                "page-fault copy {} <- {} ({} bytes)",
                dst.gpu_address,
                src.gpu_address,
                size
            );
        }
        self.flush_if_immediate()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Finish recording
    ///
    /// Immediate lists have nothing to close.
    pub fn close(&self) -> Result<()> {
        let mut recording = self.recording.lock();
        if self.is_immediate() {
            return if self.destroyed.load(Ordering::Acquire) {
                Err(Error::InvalidState)
            } else {
                Ok(())
            };
        }
        self.check_recording(&recording)?;
        recording.ensure_space(&self.device, 0, 0)?;
        self.device.policy().encode_batch_end(&mut recording.stream);
        recording.state = CommandListState::Closed;
        log::debug!(
            "command list closed: {} bytes, {} resident, {} prefetch entries",
            recording.stream.used(),
            recording.stream.residency().len(),
            recording.prefetch.len()
        );
        Ok(())
    }

    /// Drop everything recorded and start over
    pub fn reset(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::InvalidState);
        }
        let mut recording = self.recording.lock();
        let recording = &mut *recording;
        recording.stream.reset();
        self.device
            .prefetch_manager()
            .remove_allocations(&mut recording.prefetch);
        recording.referenced.clear();
        recording.signal_events.clear();
        recording
            .compute_mode
            .reset(builtin_compute_mode(self.device.config()));
        recording.heap.reset();
        recording.prefetch_requested = false;
        recording.last_launch = None;
        recording.state = CommandListState::Recording;
        log::debug!("command list reset");
        Ok(())
    }

    /// Release the list's buffers
    ///
    /// Immediate lists wait for their internal queue and park the command
    /// buffer in the device's reuse pool.
    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState);
        }
        if let Some(queue) = &self.queue {
            if let Err(e) = queue.destroy() {
                log::warn!("destroying internal queue failed: {}", e);
            }
        }
        let mut recording = self.recording.lock();
        self.release(&mut recording);
        Ok(())
    }

    fn release(&self, recording: &mut Recording) {
        self.device
            .prefetch_manager()
            .remove_allocations(&mut recording.prefetch);
        recording.referenced.clear();
        recording.signal_events.clear();
        recording.heap.release();
        if let Some(buffer) = recording.stream.take_buffer() {
            if self.is_immediate() {
                self.device.recycle_command_buffer(buffer);
            } else {
                self.device.free_command_buffer(&buffer);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Immediate execution
    // -------------------------------------------------------------------------

    fn flush_if_immediate(&self) -> Result<()> {
        let Some(queue) = &self.queue else {
            return Ok(());
        };
        let mut recording = self.recording.lock();
        let recording = &mut *recording;

        if !recording.prefetch.is_empty() {
            let prefetch = self.device.prefetch_manager();
            if self.device.config().kmd_migration {
                if let Err(e) = prefetch.flush(&mut recording.prefetch, &recording.stream) {
                    log::warn!("prefetch on immediate flush failed: {}", e);
                }
            } else {
                prefetch.remove_allocations(&mut recording.prefetch);
            }
        }
        if recording.stream.is_empty() {
            return Ok(());
        }

        let referenced: Vec<_> = recording.referenced.values().cloned().collect();
        let submitted = queue.submit(
            &[&recording.stream],
            &[],
            &referenced,
            &recording.signal_events,
        );
        // The batch is gone either way; a failed one is not replayed
        recording.stream.reset();
        recording.referenced.clear();
        recording.signal_events.clear();
        submitted?;

        if self.desc.synchronous {
            queue.synchronize(u64::MAX)?;
        }
        if queue.is_idle() {
            recording.heap.reset();
        }
        Ok(())
    }

    /// Wait for everything an immediate list submitted
    pub fn host_synchronize(&self, timeout_ns: u64) -> Result<()> {
        match &self.queue {
            Some(queue) => queue.synchronize(timeout_ns),
            None => Err(Error::InvalidState),
        }
    }

    // -------------------------------------------------------------------------
    // ABI wrappers
    // -------------------------------------------------------------------------

    /// ABI wrapper for [`Self::create`]
    pub fn ze_create(
        device: &Arc<Device>,
        desc: CommandListDesc,
        list: &mut Option<Arc<Self>>,
    ) -> ResultCode {
        match Self::create(device, desc) {
            Ok(created) => {
                *list = Some(created);
                ResultCode::Success
            }
            Err(e) => e.into(),
        }
    }

    /// ABI wrapper for [`Self::append_launch_kernel`]
    pub fn ze_append_launch_kernel(
        &self,
        kernel: &Kernel,
        group_count: [u32; 3],
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> ResultCode {
        let params = LaunchParams::default();
        ResultCode::from_result(self.append_launch_kernel(kernel, group_count, signal, waits, &params))
    }

    /// ABI wrapper for [`Self::append_memory_copy`]
    pub fn ze_append_memory_copy(
        &self,
        dst: GpuAddr,
        src: GpuAddr,
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> ResultCode {
        let params = MemoryCopyParams::default();
        ResultCode::from_result(self.append_memory_copy(dst, src, size, signal, waits, &params))
    }

    /// ABI wrapper for [`Self::append_memory_fill`]
    pub fn ze_append_memory_fill(
        &self,
        dst: GpuAddr,
        pattern: &[u8],
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[Arc<Event>],
    ) -> ResultCode {
        ResultCode::from_result(self.append_memory_fill(dst, pattern, size, signal, waits))
    }

    /// ABI wrapper for [`Self::append_memory_prefetch`]
    pub fn ze_append_memory_prefetch(&self, ptr: GpuAddr, size: u64) -> ResultCode {
        ResultCode::from_result(self.append_memory_prefetch(ptr, size))
    }

    /// ABI wrapper for [`Self::append_barrier`]
    pub fn ze_append_barrier(&self, signal: Option<&Arc<Event>>, waits: &[Arc<Event>]) -> ResultCode {
        ResultCode::from_result(self.append_barrier(signal, waits))
    }

    /// ABI wrapper for [`Self::close`]
    pub fn ze_close(&self) -> ResultCode {
        ResultCode::from_result(self.close())
    }

    /// ABI wrapper for [`Self::reset`]
    pub fn ze_reset(&self) -> ResultCode {
        ResultCode::from_result(self.reset())
    }

    /// ABI wrapper for [`Self::destroy`]
    pub fn ze_destroy(&self) -> ResultCode {
        ResultCode::from_result(self.destroy())
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let recording = self.recording.get_mut();
        self.device
            .prefetch_manager()
            .remove_allocations(&mut recording.prefetch);
        recording.heap.release();
        if let Some(buffer) = recording.stream.take_buffer() {
            self.device.free_command_buffer(&buffer);
        }
    }
}

impl fmt::Debug for CommandList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let recording = self.recording.lock();
        f.debug_struct("CommandList")
            .field("engine", &self.desc.engine)
            .field("immediate", &self.desc.immediate)
            .field("state", &recording.state)
            .field("used", &recording.stream.used())
            .field("prefetch", &recording.prefetch.len())
            .finish_non_exhaustive()
    }
}
