//! # Events
//!
//! An [`EventPool`] owns a block of fixed-size completion slots; each
//! [`Event`] binds one slot. Command lists write the slot from the GPU
//! (post-sync or MI_STORE_DATA_IMM) and wait on it with MI_SEMAPHORE_WAIT.
//!
//! ```text
//!   EventPool allocation (one VA, one BO per device)
//!   ┌──────────┬──────────┬──────────┬─────
//!   │ slot 0   │ slot 1   │ slot 2   │ ...      64 bytes each
//!   └──────────┴──────────┴──────────┴─────
//!     +0  status        (EventStatus)
//!     +8  timestamp packet (kernel timestamp pools only)
//! ```
//!
//! Signal and wait scopes are fixed at creation. The signal scope is what
//! decides whether a signal needs a system-memory fence.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use arrayvec::ArrayVec;
use spin::Mutex;

use kiln_cmd::PostSyncKind;
use kiln_core::{
    ByteSize, Error, EventPoolFlags, EventPoolHandle, EventScopeFlags, EventStatus, GpuAddr,
    Result,
};
use kiln_mem::usm::MAX_ROOT_DEVICES;
use kiln_mem::{
    AllocationProperties, AllocationType, GraphicsAllocation, KmdSubmit, MemoryManager, MemoryPool,
    VaRange,
};

use crate::device::Device;
use crate::result::ResultCode;

/// Bytes per event slot
pub const EVENT_SLOT_SIZE: u64 = 64;

/// Offset of the timestamp packet inside a slot
pub const TIMESTAMP_PACKET_OFFSET: u64 = 8;

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// Event pool creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPoolDesc {
    /// Pool flags
    pub flags: EventPoolFlags,
    /// Number of event slots
    pub count: u32,
}

/// Event creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDesc {
    /// Slot index inside the pool
    pub index: u32,
    /// Scope made visible when the event is signaled
    pub signal: EventScopeFlags,
    /// Scope made visible when a wait on the event completes
    pub wait: EventScopeFlags,
}

impl EventDesc {
    /// Event at `index` with the given signal scope and device wait scope
    pub const fn new(index: u32, signal: EventScopeFlags) -> Self {
        Self {
            index,
            signal,
            wait: EventScopeFlags::DEVICE,
        }
    }
}

/// Layout of the timestamp data an event carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimestampPacketType {
    /// Raw GPU ticks
    Kernel,
    /// Ticks mapped to host time
    KernelMapped,
}

/// Kernel execution timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelTimestamp {
    /// Start on the global clock
    pub global_start: u64,
    /// End on the global clock
    pub global_end: u64,
    /// Start on the context clock
    pub context_start: u64,
    /// End on the context clock
    pub context_end: u64,
}

// =============================================================================
// EVENT POOL
// =============================================================================

/// Block of event slots shared by one or more devices
pub struct EventPool {
    handle: EventPoolHandle,
    flags: EventPoolFlags,
    count: u32,
    range: VaRange,
    allocations: ArrayVec<Arc<GraphicsAllocation>, MAX_ROOT_DEVICES>,
    memory: Arc<MemoryManager>,
    slots: Mutex<Vec<bool>>,
    live: AtomicU32,
    destroyed: AtomicBool,
}

impl EventPool {
    /// Create a pool usable by `devices`
    pub fn create(
        handle: EventPoolHandle,
        devices: &[Arc<Device>],
        desc: &EventPoolDesc,
    ) -> Result<Self> {
        let Some(first) = devices.first() else {
            return Err(Error::InvalidArgument);
        };
        if desc.count == 0 || devices.len() > MAX_ROOT_DEVICES {
            return Err(Error::InvalidArgument);
        }

        let timestamps = EventPoolFlags::KERNEL_TIMESTAMP | EventPoolFlags::KERNEL_MAPPED_TIMESTAMP;
        let allocation_type = if desc.flags.intersects(timestamps) {
            AllocationType::TimestampPacket
        } else {
            AllocationType::BufferHostMemory
        };
        let memory = first.memory_manager().clone();
        let size = ByteSize::from_bytes(u64::from(desc.count) * EVENT_SLOT_SIZE)
            .align_up(ByteSize::KIB_4.as_bytes());
        let range = memory.reserve(size, ByteSize::KIB_4.as_bytes())?;

        let mut allocations = ArrayVec::new();
        for device in devices {
            let props = AllocationProperties {
                size: range.size(),
                pool: MemoryPool::System4K,
                allocation_type,
                root_device_index: device.root_device_index(),
                device_bitfield: device.device_bitfield(),
            };
            match memory.create_at(range, &props) {
                Ok(allocation) => allocations.push(allocation),
                Err(e) => {
                    for allocation in &allocations {
                        memory.release(allocation);
                    }
                    let _ = memory.unreserve(range);
                    return Err(e);
                }
            }
        }

        log::debug!(
            "event pool {:?}: {} slots at {} for {} device(s), {:?}",
            handle,
            desc.count,
            range.start,
            devices.len(),
            desc.flags
        );

        Ok(Self {
            handle,
            flags: desc.flags,
            count: desc.count,
            range,
            allocations,
            memory,
            slots: Mutex::new(vec![false; desc.count as usize]),
            live: AtomicU32::new(0),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Get handle
    #[inline]
    pub fn handle(&self) -> EventPoolHandle {
        self.handle
    }

    /// Get flags
    #[inline]
    pub fn flags(&self) -> EventPoolFlags {
        self.flags
    }

    /// Number of slots
    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Number of live events
    #[inline]
    pub fn live_events(&self) -> u32 {
        self.live.load(Ordering::Acquire)
    }

    /// Base address of the slot block
    #[inline]
    pub fn gpu_address(&self) -> GpuAddr {
        self.range.start
    }

    /// Backing allocation for a root device
    pub fn allocation_for(&self, root_device_index: u32) -> Option<&Arc<GraphicsAllocation>> {
        self.allocations
            .iter()
            .find(|a| a.root_device_index == root_device_index)
    }

    /// Timestamp layout of the pool's events
    pub fn timestamp_packet_type(&self) -> Option<TimestampPacketType> {
        if self.flags.contains(EventPoolFlags::KERNEL_MAPPED_TIMESTAMP) {
            Some(TimestampPacketType::KernelMapped)
        } else if self.flags.contains(EventPoolFlags::KERNEL_TIMESTAMP) {
            Some(TimestampPacketType::Kernel)
        } else {
            None
        }
    }

    fn claim(&self, index: u32) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::InvalidState);
        }
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index as usize).ok_or(Error::InvalidArgument)?;
        if *slot {
            return Err(Error::InvalidArgument);
        }
        *slot = true;
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn unclaim(&self, index: u32) {
        if let Some(slot) = self.slots.lock().get_mut(index as usize) {
            if core::mem::take(slot) {
                self.live.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Free the slot block
    ///
    /// Fails while any event created from the pool is alive.
    pub fn destroy(&self) -> Result<()> {
        if self.live_events() > 0 {
            log::warn!(
                "event pool {:?} destroyed with {} live event(s)",
                self.handle,
                self.live_events()
            );
            return Err(Error::AllocationStillReferenced);
        }
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState);
        }
        for allocation in &self.allocations {
            self.memory.release(allocation);
        }
        self.memory.unreserve(self.range)
    }

    /// ABI wrapper for [`Self::destroy`]
    pub fn ze_destroy(&self) -> ResultCode {
        ResultCode::from_result(self.destroy())
    }
}

impl fmt::Debug for EventPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPool")
            .field("handle", &self.handle)
            .field("flags", &self.flags)
            .field("count", &self.count)
            .field("gpu_address", &self.range.start)
            .field("live", &self.live_events())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// EVENT
// =============================================================================

/// GPU work that will signal an event when it retires
struct PendingSignal {
    submitter: Arc<dyn KmdSubmit>,
    context_id: u32,
    task_count: u64,
    timestamp: KernelTimestamp,
}

struct EventState {
    status: EventStatus,
    pending: Option<PendingSignal>,
    timestamp: Option<KernelTimestamp>,
}

impl EventState {
    /// Fold a pending signal in once its task count completed
    fn observe(&mut self) {
        let done = self.pending.as_ref().is_some_and(|p| {
            p.submitter.completed_task_count(p.context_id) >= p.task_count
        });
        if done {
            self.complete();
        }
    }

    fn complete(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.status = EventStatus::Signaled;
            self.timestamp = Some(pending.timestamp);
        }
    }
}

/// One completion slot
pub struct Event {
    pool: Arc<EventPool>,
    index: u32,
    signal_scope: EventScopeFlags,
    wait_scope: EventScopeFlags,
    root_device_index: u32,
    state: Mutex<EventState>,
    destroyed: AtomicBool,
}

impl Event {
    /// Bind slot `desc.index` of `pool` for `device`
    pub fn create(pool: &Arc<EventPool>, desc: &EventDesc, device: &Device) -> Result<Arc<Self>> {
        if pool.allocation_for(device.root_device_index()).is_none() {
            return Err(Error::InvalidArgument);
        }
        pool.claim(desc.index)?;

        log::trace!(
            "event {} of pool {:?}: signal {:?}, wait {:?}",
            desc.index,
            pool.handle(),
            desc.signal,
            desc.wait
        );

        Ok(Arc::new(Self {
            pool: pool.clone(),
            index: desc.index,
            signal_scope: desc.signal,
            wait_scope: desc.wait,
            root_device_index: device.root_device_index(),
            state: Mutex::new(EventState {
                status: EventStatus::Clear,
                pending: None,
                timestamp: None,
            }),
            destroyed: AtomicBool::new(false),
        }))
    }

    /// ABI wrapper for [`Self::create`]
    pub fn ze_create(
        pool: &Arc<EventPool>,
        desc: &EventDesc,
        device: &Device,
        event: &mut Option<Arc<Self>>,
    ) -> ResultCode {
        match Self::create(pool, desc, device) {
            Ok(created) => {
                *event = Some(created);
                ResultCode::Success
            }
            Err(e) => e.into(),
        }
    }

    /// Get slot index
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Get owning pool
    #[inline]
    pub fn pool(&self) -> &Arc<EventPool> {
        &self.pool
    }

    /// Get signal scope
    #[inline]
    pub fn signal_scope(&self) -> EventScopeFlags {
        self.signal_scope
    }

    /// Get wait scope
    #[inline]
    pub fn wait_scope(&self) -> EventScopeFlags {
        self.wait_scope
    }

    /// Address of the status word
    pub fn gpu_address(&self) -> GpuAddr {
        self.pool
            .gpu_address()
            .offset(u64::from(self.index) * EVENT_SLOT_SIZE)
    }

    /// Address a completion write targets
    pub fn completion_address(&self) -> GpuAddr {
        match self.timestamp_packet_type() {
            Some(_) => self.gpu_address().offset(TIMESTAMP_PACKET_OFFSET),
            None => self.gpu_address(),
        }
    }

    /// Slot allocation that must be resident for the given device
    pub fn allocation_for(&self, root_device_index: u32) -> Option<&Arc<GraphicsAllocation>> {
        self.pool.allocation_for(root_device_index)
    }

    /// Timestamp layout, for kernel-timestamp pools
    pub fn timestamp_packet_type(&self) -> Option<TimestampPacketType> {
        self.pool.timestamp_packet_type()
    }

    /// What a GPU completion write stores
    pub fn post_sync_kind(&self) -> PostSyncKind {
        match self.timestamp_packet_type() {
            Some(_) => PostSyncKind::Timestamp,
            None => PostSyncKind::Immediate,
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::InvalidSynchronizationObject);
        }
        Ok(())
    }

    fn check_host_access(&self) -> Result<()> {
        self.check_alive()?;
        if !self.pool.flags().contains(EventPoolFlags::HOST_VISIBLE) {
            return Err(Error::InvalidSynchronizationObject);
        }
        Ok(())
    }

    /// Check if the event can be appended to a command list of `root_device_index`
    pub(crate) fn validate_for(&self, root_device_index: u32) -> Result<()> {
        self.check_alive()?;
        if self.allocation_for(root_device_index).is_none() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Host operations
    // -------------------------------------------------------------------------

    /// Signal from the host
    pub fn host_signal(&self) -> Result<()> {
        self.check_host_access()?;
        let mut state = self.state.lock();
        state.pending = None;
        state.status = EventStatus::Signaled;
        Ok(())
    }

    /// Reset to the clear state
    pub fn host_reset(&self) -> Result<()> {
        self.check_alive()?;
        let mut state = self.state.lock();
        state.pending = None;
        state.status = EventStatus::Clear;
        state.timestamp = None;
        Ok(())
    }

    /// `Ok` when signaled, [`Error::NotReady`] otherwise
    pub fn query_status(&self) -> Result<()> {
        self.check_alive()?;
        let mut state = self.state.lock();
        state.observe();
        match state.status {
            EventStatus::Signaled => Ok(()),
            EventStatus::Clear => Err(Error::NotReady),
        }
    }

    /// Wait until signaled; a zero timeout polls
    pub fn host_synchronize(&self, timeout_ns: u64) -> Result<()> {
        self.check_host_access()?;

        let pending = {
            let mut state = self.state.lock();
            state.observe();
            if state.status == EventStatus::Signaled {
                return Ok(());
            }
            state
                .pending
                .as_ref()
                .map(|p| (p.submitter.clone(), p.context_id, p.task_count))
        };

        match pending {
            Some((submitter, context_id, task_count)) => {
                let done = submitter
                    .wait(context_id, task_count, timeout_ns)
                    .map_err(|e| {
                        log::error!("event wait on context {} failed: {}", context_id, e);
                        Error::DeviceLost
                    })?;
                if !done {
                    return Err(Error::NotReady);
                }
                self.state.lock().observe();
                self.query_status()
            }
            None => {
                // Only another host thread can signal it now
                let mut budget = timeout_ns;
                loop {
                    if self.state.lock().status == EventStatus::Signaled {
                        return Ok(());
                    }
                    if budget == 0 {
                        return Err(Error::NotReady);
                    }
                    budget -= 1;
                    core::hint::spin_loop();
                }
            }
        }
    }

    /// Kernel timestamps of the last completed signal
    pub fn query_kernel_timestamp(&self) -> Result<KernelTimestamp> {
        self.check_alive()?;
        if self.timestamp_packet_type().is_none() {
            return Err(Error::InvalidSynchronizationObject);
        }
        let mut state = self.state.lock();
        state.observe();
        match state.status {
            EventStatus::Signaled => Ok(state.timestamp.unwrap_or_default()),
            EventStatus::Clear => Err(Error::NotReady),
        }
    }

    /// ABI wrapper for [`Self::host_synchronize`]
    pub fn ze_host_synchronize(&self, timeout_ns: u64) -> ResultCode {
        ResultCode::from_result(self.host_synchronize(timeout_ns))
    }

    /// ABI wrapper for [`Self::query_status`]
    pub fn ze_query_status(&self) -> ResultCode {
        ResultCode::from_result(self.query_status())
    }

    // -------------------------------------------------------------------------
    // Device side
    // -------------------------------------------------------------------------

    /// Record the submission that signals the event
    pub(crate) fn track_submission(
        &self,
        submitter: Arc<dyn KmdSubmit>,
        context_id: u32,
        task_count: u64,
        timestamp: KernelTimestamp,
    ) {
        let mut state = self.state.lock();
        state.status = EventStatus::Clear;
        state.pending = Some(PendingSignal {
            submitter,
            context_id,
            task_count,
            timestamp,
        });
    }

    /// Mark signaled if the tracked submission on `context_id` retired
    pub(crate) fn retire(&self, context_id: u32, completed: u64) {
        let mut state = self.state.lock();
        let matches = state
            .pending
            .as_ref()
            .is_some_and(|p| p.context_id == context_id && p.task_count <= completed);
        if matches {
            state.complete();
        }
    }

    /// Check if GPU work that signals the event is still outstanding
    pub fn has_pending_signal(&self) -> bool {
        let mut state = self.state.lock();
        state.observe();
        state.pending.is_some()
    }

    /// Release the slot
    ///
    /// Fails while submitted work that signals the event is outstanding.
    pub fn destroy(&self) -> Result<()> {
        if self.has_pending_signal() {
            return Err(Error::AllocationStillReferenced);
        }
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidSynchronizationObject);
        }
        self.pool.unclaim(self.index);
        Ok(())
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("pool", &self.pool.handle())
            .field("index", &self.index)
            .field("signal_scope", &self.signal_scope)
            .field("wait_scope", &self.wait_scope)
            .field("root_device_index", &self.root_device_index)
            .field("status", &self.state.lock().status)
            .finish_non_exhaustive()
    }
}
