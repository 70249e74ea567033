//! # Command Queue
//!
//! A queue owns one KMD context on one engine. Executing command lists
//! chains their streams into a batch, copies it into a command buffer of
//! its own and submits it together with the union of their residency. The
//! buffer stays with the submission until it retires.
//!
//! ```text
//!   execute_command_lists(lists, fence, blocking, waits)
//!        │
//!        ├─ validate (engine, state, fence, events)     nothing mutated on error
//!        ├─ retire completed submissions
//!        ├─ migrate prefetch contexts                   KMD migration only, best effort
//!        ├─ batch: MI_SEMAPHORE_WAIT* ─ list streams ─ MI_BATCH_BUFFER_END
//!        ├─ submit ──► task count
//!        └─ in-flight record: allocations held, events to signal
//! ```

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use kiln_cmd::{GraphicsCommandStream, StreamTarget};
use kiln_core::{
    ByteSize, CommandQueueHandle, EngineGroupType, EngineInstance, Error, EventStatus, GpuAddr,
    Result,
};
use kiln_mem::{ExecBuffer, GraphicsAllocation, KmdSubmit, UsmAllocation};

use crate::cmdlist::CommandList;
use crate::device::Device;
use crate::event::{Event, KernelTimestamp};
use crate::result::ResultCode;

// =============================================================================
// DESCRIPTOR
// =============================================================================

/// Queue creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandQueueDesc {
    /// Engine group the queue submits to
    pub engine: EngineGroupType,
    /// Every execution waits for completion
    pub synchronous: bool,
}

impl CommandQueueDesc {
    /// Asynchronous queue on `engine`
    pub const fn new(engine: EngineGroupType) -> Self {
        Self {
            engine,
            synchronous: false,
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Batches accepted by the KMD
    pub submissions: u64,
    /// Batches rejected by the KMD
    pub failed_submissions: u64,
    /// Submissions retired
    pub retired: u64,
    /// Prefetch passes that reported a failure
    pub prefetch_failures: u64,
}

/// A submission the GPU may still be executing
struct InFlight {
    task_count: u64,
    batch_buffer: Arc<GraphicsAllocation>,
    allocations: Vec<Arc<UsmAllocation>>,
    events: Vec<Arc<Event>>,
}

// =============================================================================
// COMMAND QUEUE
// =============================================================================

/// Submission endpoint bound to one engine
pub struct CommandQueue {
    handle: CommandQueueHandle,
    device: Arc<Device>,
    desc: CommandQueueDesc,
    engine: EngineInstance,
    context_id: u32,
    in_flight: Mutex<VecDeque<InFlight>>,
    last_task: AtomicU64,
    clock: AtomicU64,
    destroyed: AtomicBool,
    stats: Mutex<QueueStats>,
}

impl CommandQueue {
    pub(crate) fn new(
        handle: CommandQueueHandle,
        device: &Arc<Device>,
        desc: CommandQueueDesc,
    ) -> Result<Self> {
        if !device.supports_engine(desc.engine) {
            return Err(Error::UnsupportedEngine);
        }
        let engine = EngineInstance::new(desc.engine.engine_class(), 0);
        let context_id = device.submitter().create_context(engine).map_err(|e| {
            log::error!("context creation on {:?} failed: {}", engine, e);
            Error::from(e)
        })?;

        log::info!(
            "command queue {:?} on device {}: {} engine, context {}",
            handle,
            device.root_device_index(),
            desc.engine,
            context_id
        );

        Ok(Self {
            handle,
            device: device.clone(),
            desc,
            engine,
            context_id,
            in_flight: Mutex::new(VecDeque::new()),
            last_task: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            stats: Mutex::new(QueueStats::default()),
        })
    }

    /// Queue without a handle, owned by an immediate command list
    pub(crate) fn create(device: &Arc<Device>, desc: CommandQueueDesc) -> Result<Arc<Self>> {
        Self::new(CommandQueueHandle::null(), device, desc).map(Arc::new)
    }

    /// Get handle
    #[inline]
    pub fn handle(&self) -> CommandQueueHandle {
        self.handle
    }

    /// Get engine group
    #[inline]
    pub fn engine(&self) -> EngineGroupType {
        self.desc.engine
    }

    /// Get KMD context id
    #[inline]
    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    /// Task count of the last accepted submission
    #[inline]
    pub fn last_task_count(&self) -> u64 {
        self.last_task.load(Ordering::Acquire)
    }

    /// Get statistics
    pub fn stats(&self) -> QueueStats {
        self.stats.lock().clone()
    }

    /// Create a fence signaled by executions on this queue
    pub fn create_fence(&self) -> Arc<Fence> {
        Arc::new(Fence {
            submitter: self.device.submitter().clone(),
            context_id: self.context_id,
            task: Mutex::new(None),
        })
    }

    fn check_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Submit closed command lists
    pub fn execute_command_lists(
        &self,
        lists: &[Arc<CommandList>],
        fence: Option<&Fence>,
        blocking: bool,
        wait_events: &[Arc<Event>],
    ) -> Result<()> {
        self.check_alive()?;
        if lists.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let root = self.device.root_device_index();
        for (i, list) in lists.iter().enumerate() {
            if list.is_immediate()
                || list.engine().is_copy() != self.desc.engine.is_copy()
                || list.device().root_device_index() != root
            {
                return Err(Error::InvalidArgument);
            }
            // Each list is locked below; a duplicate would lock twice
            if lists[..i].iter().any(|other| Arc::ptr_eq(other, list)) {
                return Err(Error::InvalidArgument);
            }
        }
        if fence.is_some_and(|f| f.context_id != self.context_id) {
            return Err(Error::InvalidSynchronizationObject);
        }
        for event in wait_events {
            event.validate_for(root)?;
        }

        self.retire();

        let mut recordings = Vec::with_capacity(lists.len());
        for list in lists {
            let recording = list.lock_recording();
            if !recording.is_executable() {
                return Err(Error::InvalidState);
            }
            recordings.push(recording);
        }

        if self.device.config().kmd_migration {
            let prefetch = self.device.prefetch_manager();
            for recording in recordings.iter_mut() {
                if recording.prefetch.is_empty() {
                    continue;
                }
                let recording = &mut **recording;
                if let Err(e) =
                    prefetch.migrate_allocations_to_gpu(&mut recording.prefetch, &recording.stream)
                {
                    log::warn!("prefetch before execution on queue {:?}: {}", self.handle, e);
                    self.stats.lock().prefetch_failures += 1;
                }
            }
        }

        let mut allocations: HashMap<GpuAddr, Arc<UsmAllocation>> = HashMap::new();
        let mut events: Vec<Arc<Event>> = Vec::new();
        for recording in &recordings {
            for (base, usm) in &recording.referenced {
                allocations.entry(*base).or_insert_with(|| usm.clone());
            }
            for event in &recording.signal_events {
                if !events.iter().any(|e| Arc::ptr_eq(e, event)) {
                    events.push(event.clone());
                }
            }
        }
        let allocations: Vec<_> = allocations.into_values().collect();
        let streams: Vec<&GraphicsCommandStream> = recordings.iter().map(|r| &r.stream).collect();

        let task_count = self.submit(&streams, wait_events, &allocations, &events)?;

        for recording in recordings.iter_mut() {
            recording.mark_submitted();
        }
        drop(recordings);

        if let Some(fence) = fence {
            *fence.task.lock() = Some(task_count);
        }

        if blocking || self.desc.synchronous || self.device.config().make_each_enqueue_blocking {
            self.synchronize(u64::MAX)?;
        }
        Ok(())
    }

    /// Build a batch from `streams` and hand it to the KMD
    pub(crate) fn submit(
        &self,
        streams: &[&GraphicsCommandStream],
        wait_events: &[Arc<Event>],
        allocations: &[Arc<UsmAllocation>],
        events: &[Arc<Event>],
    ) -> Result<u64> {
        self.check_alive()?;
        let root = self.device.root_device_index();
        let policy = self.device.policy();

        let mut batch = GraphicsCommandStream::new(
            StreamTarget {
                root_device_index: root,
                device_bitfield: self.device.device_bitfield(),
                engine: self.desc.engine,
            },
            ByteSize::from_bytes(streams.iter().map(|s| s.used() as u64).sum()),
        );

        for event in wait_events {
            if let Some(allocation) = event.allocation_for(root) {
                batch.make_resident(allocation);
            }
            policy.encode_wait(
                &mut batch,
                event.completion_address(),
                EventStatus::Signaled.raw() as u32,
            );
        }
        for stream in streams {
            batch.append_stream(stream);
        }
        policy.encode_batch_end(&mut batch);
        let batch_buffer = self
            .device
            .obtain_command_buffer_for(ByteSize::from_bytes(batch.used() as u64))?;
        batch.attach_buffer(batch_buffer.clone());

        let exec = ExecBuffer {
            engine: self.engine,
            context_id: self.context_id,
            batch_address: batch.gpu_address(),
            commands: batch.as_bytes(),
            residency: batch.residency(),
        };
        let task_count = match self.device.submitter().submit(&exec) {
            Ok(task_count) => task_count,
            Err(e) => {
                log::error!(
                    "submission of {} bytes on context {} failed: {}",
                    batch.used(),
                    self.context_id,
                    e
                );
                self.stats.lock().failed_submissions += 1;
                self.device.recycle_command_buffer(batch_buffer);
                return Err(e.into_submission_error());
            }
        };

        log::debug!(
            "queue {:?}: task {} ({} bytes, {} resident, {} event(s))",
            self.handle,
            task_count,
            batch.used(),
            batch.residency().len(),
            events.len()
        );

        for usm in allocations {
            usm.acquire();
        }
        let ticks = batch.used() as u64;
        let start = self.clock.fetch_add(ticks + 1, Ordering::Relaxed);
        let timestamp = KernelTimestamp {
            global_start: start,
            global_end: start + ticks,
            // Context counter is 32 bits wide
            context_start: start & 0xFFFF_FFFF,
            context_end: (start + ticks) & 0xFFFF_FFFF,
        };
        for event in events {
            event.track_submission(
                self.device.submitter().clone(),
                self.context_id,
                task_count,
                timestamp,
            );
        }

        self.in_flight.lock().push_back(InFlight {
            task_count,
            batch_buffer,
            allocations: allocations.to_vec(),
            events: events.to_vec(),
        });
        self.last_task.store(task_count, Ordering::Release);
        self.stats.lock().submissions += 1;
        Ok(task_count)
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    /// Release everything held by completed submissions
    pub fn retire(&self) -> usize {
        let completed = self.device.submitter().completed_task_count(self.context_id);
        let mut retired = 0;
        let mut in_flight = self.in_flight.lock();
        while in_flight.front().is_some_and(|f| f.task_count <= completed) {
            let Some(done) = in_flight.pop_front() else {
                break;
            };
            for usm in &done.allocations {
                if let Err(e) = usm.release() {
                    log::warn!("release of {} after task {}: {}", usm.base(), done.task_count, e);
                }
            }
            for event in &done.events {
                event.retire(self.context_id, completed);
            }
            self.device.recycle_command_buffer(done.batch_buffer);
            retired += 1;
        }
        drop(in_flight);

        if retired > 0 {
            self.stats.lock().retired += retired as u64;
        }
        retired
    }

    /// Check if every submission completed
    pub fn is_idle(&self) -> bool {
        self.retire();
        self.in_flight.lock().is_empty()
    }

    /// Wait for the last submission; a zero timeout polls
    pub fn synchronize(&self, timeout_ns: u64) -> Result<()> {
        let last = self.last_task_count();
        if last > 0 {
            let done = self
                .device
                .submitter()
                .wait(self.context_id, last, timeout_ns)
                .map_err(|e| {
                    log::error!("wait on context {} failed: {}", self.context_id, e);
                    Error::DeviceLost
                })?;
            if !done {
                return Err(Error::NotReady);
            }
        }
        self.retire();
        Ok(())
    }

    /// Wait idle, then release the context
    pub fn destroy(&self) -> Result<()> {
        self.check_alive()?;
        self.synchronize(u64::MAX)?;
        self.destroyed.store(true, Ordering::Release);

        if let Err(e) = self.device.submitter().destroy_context(self.context_id) {
            log::warn!("destroying context {} failed: {}", self.context_id, e);
        }
        log::debug!("command queue {:?} destroyed", self.handle);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // ABI wrappers
    // -------------------------------------------------------------------------

    /// ABI wrapper for [`Self::execute_command_lists`]
    pub fn ze_execute_command_lists(
        &self,
        lists: &[Arc<CommandList>],
        fence: Option<&Fence>,
    ) -> ResultCode {
        ResultCode::from_result(self.execute_command_lists(lists, fence, false, &[]))
    }

    /// ABI wrapper for [`Self::synchronize`]
    pub fn ze_synchronize(&self, timeout_ns: u64) -> ResultCode {
        ResultCode::from_result(self.synchronize(timeout_ns))
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        // No waiting here; the KMD tears down outstanding work with the context
        let _ = self.device.submitter().destroy_context(self.context_id);
        for done in self.in_flight.get_mut().drain(..) {
            self.device.free_command_buffer(&done.batch_buffer);
        }
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("handle", &self.handle)
            .field("engine", &self.desc.engine)
            .field("context_id", &self.context_id)
            .field("last_task", &self.last_task_count())
            .field("in_flight", &self.in_flight.lock().len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// FENCE
// =============================================================================

/// Host-visible completion marker of one queue
pub struct Fence {
    submitter: Arc<dyn KmdSubmit>,
    context_id: u32,
    task: Mutex<Option<u64>>,
}

impl Fence {
    /// Wait until the execution the fence was passed to completes
    ///
    /// A fence that was never passed to an execution is not ready.
    pub fn host_synchronize(&self, timeout_ns: u64) -> Result<()> {
        let Some(task) = *self.task.lock() else {
            return Err(Error::NotReady);
        };
        match self.submitter.wait(self.context_id, task, timeout_ns) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::NotReady),
            Err(e) => {
                log::error!("fence wait on context {} failed: {}", self.context_id, e);
                Err(Error::DeviceLost)
            }
        }
    }

    /// `Ok` once signaled, [`Error::NotReady`] otherwise
    pub fn query_status(&self) -> Result<()> {
        self.host_synchronize(0)
    }

    /// Disarm
    pub fn reset(&self) {
        *self.task.lock() = None;
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("context_id", &self.context_id)
            .field("task", &*self.task.lock())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdlist::{CommandListDesc, CommandListState, LaunchParams};
    use crate::device::DeviceDesc;
    use crate::driver::DriverContext;
    use crate::event::{EventDesc, EventPoolDesc};
    use crate::kernel::{Kernel, KernelDesc};
    use kiln_core::hw::revision;
    use kiln_core::{DriverConfiguration, EventPoolFlags, EventScopeFlags, GfxCoreFamily};
    use kiln_mem::SimulatedKmd;

    struct Fixture {
        kmd: Arc<SimulatedKmd>,
        driver: DriverContext,
        device: Arc<Device>,
        queue: Arc<CommandQueue>,
    }

    fn fixture_with(config: DriverConfiguration) -> Fixture {
        let kmd = Arc::new(SimulatedKmd::new());
        let driver = DriverContext::new(kmd.clone(), config);
        let device = driver
            .add_device(&DeviceDesc::new(GfxCoreFamily::XeHpc, revision::B))
            .unwrap();
        let queue = driver
            .create_command_queue(device.handle(), CommandQueueDesc::new(EngineGroupType::Compute))
            .unwrap();
        Fixture {
            kmd,
            driver,
            device,
            queue,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(DriverConfiguration::new())
    }

    fn closed_list(f: &Fixture) -> Arc<CommandList> {
        let list = f
            .driver
            .create_command_list(f.device.handle(), CommandListDesc::regular(EngineGroupType::Compute))
            .unwrap();
        list.append_barrier(None, &[]).unwrap();
        list.close().unwrap();
        list
    }

    #[test]
    fn test_execution_validation() {
        let f = fixture();
        let closed = closed_list(&f);
        assert_eq!(
            f.queue.execute_command_lists(&[], None, false, &[]),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            f.queue
                .execute_command_lists(&[closed.clone(), closed.clone()], None, false, &[]),
            Err(Error::InvalidArgument)
        );

        let open = f
            .driver
            .create_command_list(f.device.handle(), CommandListDesc::regular(EngineGroupType::Compute))
            .unwrap();
        assert_eq!(
            f.queue.execute_command_lists(&[open], None, false, &[]),
            Err(Error::InvalidState)
        );

        let copy = f
            .driver
            .create_command_list(f.device.handle(), CommandListDesc::regular(EngineGroupType::Copy))
            .unwrap();
        copy.close().unwrap();
        assert_eq!(
            f.queue.execute_command_lists(&[copy], None, false, &[]),
            Err(Error::InvalidArgument)
        );

        let immediate = f
            .driver
            .create_command_list(f.device.handle(), CommandListDesc::immediate(EngineGroupType::Compute))
            .unwrap();
        assert_eq!(
            f.queue.execute_command_lists(&[immediate], None, false, &[]),
            Err(Error::InvalidArgument)
        );

        let other = f
            .driver
            .create_command_queue(f.device.handle(), CommandQueueDesc::new(EngineGroupType::Compute))
            .unwrap();
        let foreign = other.create_fence();
        assert_eq!(
            f.queue.execute_command_lists(&[closed.clone()], Some(&foreign), false, &[]),
            Err(Error::InvalidSynchronizationObject)
        );

        assert_eq!(f.kmd.submission_count(), 0);
        assert_eq!(closed.state(), CommandListState::Closed);
    }

    #[test]
    fn test_submission_holds_allocations_until_retired() {
        let f = fixture();
        f.kmd.set_auto_complete(false);
        let ptr = f.driver.alloc_device_mem(&f.device, 4096, 0).unwrap();
        let kernel = Kernel::create(&f.device, KernelDesc::new("k", 1)).unwrap();
        kernel.set_arg_pointer(0, ptr).unwrap();

        let pool = f
            .driver
            .create_event_pool(
                &[f.device.handle()],
                &EventPoolDesc {
                    flags: EventPoolFlags::HOST_VISIBLE,
                    count: 1,
                },
            )
            .unwrap();
        let event = Event::create(&pool, &EventDesc::new(0, EventScopeFlags::HOST), &f.device)
            .unwrap();

        let list = f
            .driver
            .create_command_list(f.device.handle(), CommandListDesc::regular(EngineGroupType::Compute))
            .unwrap();
        list.append_launch_kernel(&kernel, [4, 1, 1], Some(&event), &[], &LaunchParams::default())
            .unwrap();
        list.close().unwrap();
        f.queue
            .execute_command_lists(&[list.clone()], None, false, &[])
            .unwrap();

        let usm = f.driver.registry().lookup(ptr).unwrap();
        assert_eq!(list.state(), CommandListState::Submitted);
        assert_eq!(usm.in_flight_count(), 1);
        assert_eq!(event.query_status(), Err(Error::NotReady));
        assert!(!f.queue.is_idle());
        assert_eq!(f.queue.synchronize(0), Err(Error::NotReady));

        f.kmd.complete_all();
        f.queue.synchronize(0).unwrap();
        assert!(f.queue.is_idle());
        assert_eq!(usm.in_flight_count(), 0);
        event.query_status().unwrap();

        let stats = f.queue.stats();
        assert_eq!(stats.submissions, 1);
        assert_eq!(stats.retired, 1);
    }

    #[test]
    fn test_fence() {
        let f = fixture();
        f.kmd.set_auto_complete(false);
        let fence = f.queue.create_fence();
        assert_eq!(fence.query_status(), Err(Error::NotReady));

        let list = closed_list(&f);
        f.queue
            .execute_command_lists(&[list], Some(&fence), false, &[])
            .unwrap();
        assert_eq!(fence.query_status(), Err(Error::NotReady));

        f.kmd.complete_all();
        fence.host_synchronize(0).unwrap();
        fence.reset();
        assert_eq!(fence.query_status(), Err(Error::NotReady));
    }

    #[test]
    fn test_prefetch_migrates_once_per_recording() {
        let f = fixture_with(DriverConfiguration {
            use_kmd_migration: Some(true),
            ..DriverConfiguration::new()
        });
        let a = f.driver.alloc_shared_mem(&f.device, 4096, 0).unwrap();
        let b = f.driver.alloc_shared_mem(&f.device, 8192, 0).unwrap();
        let list = f
            .driver
            .create_command_list(f.device.handle(), CommandListDesc::regular(EngineGroupType::Compute))
            .unwrap();
        list.append_memory_prefetch(a, 4096).unwrap();
        list.append_memory_prefetch(b, 8192).unwrap();
        assert_eq!(list.prefetch_context_len(), 2);
        list.close().unwrap();

        f.queue
            .execute_command_lists(&[list.clone()], None, false, &[])
            .unwrap();
        assert_eq!(f.kmd.prefetches().len(), 2);
        f.queue
            .execute_command_lists(&[list.clone()], None, false, &[])
            .unwrap();
        assert_eq!(f.kmd.prefetches().len(), 2);

        list.reset().unwrap();
        assert_eq!(list.prefetch_context_len(), 0);
        assert!(!list.is_memory_prefetch_requested());
        list.append_memory_prefetch(a, 4096).unwrap();
        list.close().unwrap();
        f.queue
            .execute_command_lists(&[list], None, false, &[])
            .unwrap();
        assert_eq!(f.kmd.prefetches().len(), 3);
    }

    #[test]
    fn test_repeated_prefetch_execute_then_reset() {
        let f = fixture_with(DriverConfiguration {
            use_kmd_migration: Some(true),
            ..DriverConfiguration::new()
        });
        let ptr = f.driver.alloc_shared_mem(&f.device, 4096, 0).unwrap();
        let list = f
            .driver
            .create_command_list(f.device.handle(), CommandListDesc::regular(EngineGroupType::Compute))
            .unwrap();
        list.append_memory_prefetch(ptr, 4096).unwrap();
        list.append_memory_prefetch(ptr, 4096).unwrap();
        assert_eq!(list.prefetch_context_len(), 1);
        list.close().unwrap();
        f.queue
            .execute_command_lists(&[list.clone()], None, false, &[])
            .unwrap();
        assert_eq!(f.kmd.prefetches().len(), 1);

        list.reset().unwrap();
        assert_eq!(list.prefetch_context_len(), 0);
        list.append_memory_prefetch(ptr, 4096).unwrap();
        assert_eq!(list.prefetch_context_len(), 1);
        assert!(list.is_memory_prefetch_requested());
    }

    #[test]
    fn test_prefetch_failure_does_not_fail_execution() {
        let f = fixture_with(DriverConfiguration {
            use_kmd_migration: Some(true),
            ..DriverConfiguration::new()
        });
        let ptr = f.driver.alloc_shared_mem(&f.device, 4096, 0).unwrap();
        let list = f
            .driver
            .create_command_list(f.device.handle(), CommandListDesc::regular(EngineGroupType::Compute))
            .unwrap();
        list.append_memory_prefetch(ptr, 4096).unwrap();
        list.close().unwrap();

        f.kmd.fail_prefetch(SimulatedKmd::ENOMEM, 1);
        f.queue
            .execute_command_lists(&[list], None, false, &[])
            .unwrap();
        assert_eq!(f.queue.stats().prefetch_failures, 1);
        assert_eq!(f.kmd.submission_count(), 1);
    }

    #[test]
    fn test_submission_failure_keeps_lists_executable() {
        let f = fixture();
        let list = closed_list(&f);
        f.kmd.fail_submit(SimulatedKmd::EIO);
        assert_eq!(
            f.queue.execute_command_lists(&[list.clone()], None, false, &[]),
            Err(Error::SubmissionFailed {
                os_code: SimulatedKmd::EIO
            })
        );
        assert_eq!(
            f.queue.ze_execute_command_lists(&[list.clone()], None),
            ResultCode::ErrorDeviceLost
        );
        assert_eq!(list.state(), CommandListState::Closed);
        assert_eq!(f.queue.stats().failed_submissions, 2);
        assert_eq!(f.queue.last_task_count(), 0);

        f.kmd.clear_failures();
        f.queue
            .execute_command_lists(&[list.clone()], None, true, &[])
            .unwrap();
        assert_eq!(list.state(), CommandListState::Submitted);
    }

    #[test]
    fn test_large_batch_gets_a_buffer_that_fits() {
        let f = fixture();
        let list = f
            .driver
            .create_command_list(f.device.handle(), CommandListDesc::regular(EngineGroupType::Compute))
            .unwrap();
        for _ in 0..4000 {
            list.append_barrier(None, &[]).unwrap();
        }
        list.close().unwrap();
        let used = list.inspect(|s| s.used());
        assert!(used > ByteSize::KIB_64.as_bytes() as usize);

        f.queue
            .execute_command_lists(&[list.clone(), closed_list(&f)], None, true, &[])
            .unwrap();
        let submissions = f.kmd.submissions();
        assert_eq!(submissions.len(), 1);
        assert!(submissions[0].1 >= used);
        assert_eq!(f.queue.stats().failed_submissions, 0);
    }

    #[test]
    fn test_in_flight_batches_do_not_share_a_buffer() {
        let f = fixture();
        f.kmd.set_auto_complete(false);
        let first = closed_list(&f);
        let second = closed_list(&f);

        f.queue
            .execute_command_lists(&[first], None, false, &[])
            .unwrap();
        f.queue
            .execute_command_lists(&[second.clone()], None, false, &[])
            .unwrap();
        let submissions = f.kmd.submissions();
        assert_eq!(submissions.len(), 2);
        assert_ne!(submissions[0].0, submissions[1].0);

        let parked = f.device.reuse_pool().len();
        f.kmd.complete_all();
        f.queue.synchronize(0).unwrap();
        assert_eq!(f.device.reuse_pool().len(), parked + 2);

        // A retired batch buffer is handed out again
        f.queue
            .execute_command_lists(&[second], None, false, &[])
            .unwrap();
        let reused = f.kmd.submissions()[2].0;
        assert!(reused == submissions[0].0 || reused == submissions[1].0);
        assert_eq!(f.device.reuse_pool().len(), parked + 1);
    }

    #[test]
    fn test_destroyed_queue_rejects_work() {
        let f = fixture();
        let list = closed_list(&f);
        f.queue.destroy().unwrap();
        assert_eq!(
            f.queue.execute_command_lists(&[list], None, false, &[]),
            Err(Error::InvalidState)
        );
        assert_eq!(f.queue.destroy(), Err(Error::InvalidState));
    }
}
