//! # Simulated KMD
//!
//! In-process KMD backend. Buffer objects, contexts and submissions are
//! bookkept in memory and every call is recorded, so the layers above can be
//! driven without a kernel driver. Failures can be injected per call class.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use kiln_core::{ByteSize, EngineInstance, GpuAddr, OsError};

use crate::allocation::AllocationId;
use crate::kmd::{
    AdviseAttribute, BoCreateRequest, BoHandle, ExecBuffer, KmdMemory, KmdResult, KmdSubmit,
    MemoryRegion,
};

// =============================================================================
// CALL LOG
// =============================================================================

/// A recorded KMD call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KmdCall {
    /// Buffer object created
    CreateBo {
        /// Handle
        handle: BoHandle,
        /// Size
        size: ByteSize,
        /// Region
        region: MemoryRegion,
    },
    /// Buffer object bound
    Bind {
        /// Handle
        handle: BoHandle,
        /// Address
        address: GpuAddr,
    },
    /// Buffer object closed
    CloseBo {
        /// Handle
        handle: BoHandle,
    },
    /// Advise issued
    Advise {
        /// Handle
        handle: BoHandle,
        /// Range start
        address: GpuAddr,
        /// Range size
        size: ByteSize,
        /// Attribute
        attribute: AdviseAttribute,
    },
    /// Prefetch issued
    Prefetch {
        /// Handle
        handle: BoHandle,
        /// Range start
        address: GpuAddr,
        /// Range size
        size: ByteSize,
        /// Target region
        region: MemoryRegion,
    },
    /// Context created
    CreateContext {
        /// Context id
        context_id: u32,
        /// Engine
        engine: EngineInstance,
    },
    /// Context destroyed
    DestroyContext {
        /// Context id
        context_id: u32,
    },
    /// Batch submitted
    Submit {
        /// Context id
        context_id: u32,
        /// Batch-buffer address
        batch_address: GpuAddr,
        /// Command bytes
        batch_len: usize,
        /// Resident allocations
        residency: Vec<AllocationId>,
        /// Task count assigned
        task_count: u64,
    },
}

// =============================================================================
// FAILURE INJECTION
// =============================================================================

#[derive(Debug, Default)]
struct Failures {
    create_bo: Option<i32>,
    /// (os code, remaining failures)
    prefetch: Option<(i32, u32)>,
    advise: Option<i32>,
    submit: Option<i32>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ContextState {
    submitted: u64,
    completed: u64,
}

// =============================================================================
// SIMULATED KMD
// =============================================================================

/// In-process KMD backend
#[derive(Debug)]
pub struct SimulatedKmd {
    calls: Mutex<Vec<KmdCall>>,
    contexts: Mutex<BTreeMap<u32, ContextState>>,
    failures: Mutex<Failures>,
    next_handle: AtomicU32,
    next_context: AtomicU32,
    auto_complete: AtomicBool,
}

impl SimulatedKmd {
    /// ENOMEM
    pub const ENOMEM: i32 = -12;
    /// EINVAL
    pub const EINVAL: i32 = -22;
    /// EIO
    pub const EIO: i32 = -5;

    /// Create a backend that completes work as soon as it is submitted
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            contexts: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(Failures::default()),
            next_handle: AtomicU32::new(1),
            next_context: AtomicU32::new(1),
            auto_complete: AtomicBool::new(true),
        }
    }

    /// Keep submissions pending until [`complete_all`](Self::complete_all)
    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::Release);
    }

    /// Complete every submitted task on every context
    pub fn complete_all(&self) {
        for state in self.contexts.lock().values_mut() {
            state.completed = state.submitted;
        }
    }

    /// Fail buffer-object creation until cleared
    pub fn fail_create(&self, os_code: i32) {
        self.failures.lock().create_bo = Some(os_code);
    }

    /// Fail the next `times` prefetch calls
    pub fn fail_prefetch(&self, os_code: i32, times: u32) {
        self.failures.lock().prefetch = Some((os_code, times));
    }

    /// Fail advise calls until cleared
    pub fn fail_advise(&self, os_code: i32) {
        self.failures.lock().advise = Some(os_code);
    }

    /// Fail submissions until cleared
    pub fn fail_submit(&self, os_code: i32) {
        self.failures.lock().submit = Some(os_code);
    }

    /// Clear every injected failure
    pub fn clear_failures(&self) {
        *self.failures.lock() = Failures::default();
    }

    /// Snapshot of the call log
    pub fn calls(&self) -> Vec<KmdCall> {
        self.calls.lock().clone()
    }

    /// Clear the call log
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Recorded prefetch calls as (handle, region)
    pub fn prefetches(&self) -> Vec<(BoHandle, MemoryRegion)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                KmdCall::Prefetch { handle, region, .. } => Some((*handle, *region)),
                _ => None,
            })
            .collect()
    }

    /// Recorded advise calls as (handle, attribute)
    pub fn advises(&self) -> Vec<(BoHandle, AdviseAttribute)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                KmdCall::Advise {
                    handle, attribute, ..
                } => Some((*handle, *attribute)),
                _ => None,
            })
            .collect()
    }

    /// Number of submissions
    pub fn submission_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, KmdCall::Submit { .. }))
            .count()
    }

    /// Recorded submissions as (batch address, batch length)
    pub fn submissions(&self) -> Vec<(GpuAddr, usize)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                KmdCall::Submit {
                    batch_address,
                    batch_len,
                    ..
                } => Some((*batch_address, *batch_len)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: KmdCall) {
        self.calls.lock().push(call);
    }
}

impl Default for SimulatedKmd {
    fn default() -> Self {
        Self::new()
    }
}

impl KmdMemory for SimulatedKmd {
    fn create_buffer_object(&self, request: &BoCreateRequest) -> KmdResult<BoHandle> {
        if let Some(code) = self.failures.lock().create_bo {
            return Err(OsError(code));
        }
        let handle = BoHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.record(KmdCall::CreateBo {
            handle,
            size: request.size,
            region: request.region,
        });
        Ok(handle)
    }

    fn bind(&self, handle: BoHandle, address: GpuAddr, _size: ByteSize) -> KmdResult<()> {
        self.record(KmdCall::Bind { handle, address });
        Ok(())
    }

    fn close_buffer_object(&self, handle: BoHandle) -> KmdResult<()> {
        self.record(KmdCall::CloseBo { handle });
        Ok(())
    }

    fn advise(
        &self,
        handle: BoHandle,
        address: GpuAddr,
        size: ByteSize,
        attribute: AdviseAttribute,
    ) -> KmdResult<()> {
        if let Some(code) = self.failures.lock().advise {
            return Err(OsError(code));
        }
        self.record(KmdCall::Advise {
            handle,
            address,
            size,
            attribute,
        });
        Ok(())
    }

    fn prefetch(
        &self,
        handle: BoHandle,
        address: GpuAddr,
        size: ByteSize,
        region: MemoryRegion,
    ) -> KmdResult<()> {
        {
            let mut failures = self.failures.lock();
            if let Some((code, remaining)) = failures.prefetch {
                failures.prefetch = if remaining > 1 {
                    Some((code, remaining - 1))
                } else {
                    None
                };
                return Err(OsError(code));
            }
        }
        self.record(KmdCall::Prefetch {
            handle,
            address,
            size,
            region,
        });
        Ok(())
    }
}

impl KmdSubmit for SimulatedKmd {
    fn create_context(&self, engine: EngineInstance) -> KmdResult<u32> {
        let context_id = self.next_context.fetch_add(1, Ordering::Relaxed);
        self.contexts.lock().insert(context_id, ContextState::default());
        self.record(KmdCall::CreateContext { context_id, engine });
        Ok(context_id)
    }

    fn destroy_context(&self, context_id: u32) -> KmdResult<()> {
        self.contexts
            .lock()
            .remove(&context_id)
            .ok_or(OsError(Self::EINVAL))?;
        self.record(KmdCall::DestroyContext { context_id });
        Ok(())
    }

    fn submit(&self, exec: &ExecBuffer<'_>) -> KmdResult<u64> {
        if let Some(code) = self.failures.lock().submit {
            return Err(OsError(code));
        }
        // The batch must fit the resident buffer it is submitted from
        let overflows = exec
            .residency
            .iter()
            .find(|a| a.gpu_address == exec.batch_address)
            .is_some_and(|buffer| exec.commands.len() as u64 > buffer.size.as_bytes());
        if overflows {
            return Err(OsError(Self::EINVAL));
        }
        let task_count = {
            let mut contexts = self.contexts.lock();
            let state = contexts
                .get_mut(&exec.context_id)
                .ok_or(OsError(Self::EINVAL))?;
            state.submitted += 1;
            if self.auto_complete.load(Ordering::Acquire) {
                state.completed = state.submitted;
            }
            state.submitted
        };
        self.record(KmdCall::Submit {
            context_id: exec.context_id,
            batch_address: exec.batch_address,
            batch_len: exec.commands.len(),
            residency: exec.residency.iter().map(|a| a.id).collect(),
            task_count,
        });
        Ok(task_count)
    }

    fn completed_task_count(&self, context_id: u32) -> u64 {
        self.contexts
            .lock()
            .get(&context_id)
            .map(|s| s.completed)
            .unwrap_or(0)
    }

    fn wait(&self, context_id: u32, task_count: u64, timeout_ns: u64) -> KmdResult<bool> {
        let mut budget = timeout_ns;
        loop {
            if self.completed_task_count(context_id) >= task_count {
                return Ok(true);
            }
            if budget == 0 {
                return Ok(false);
            }
            budget = budget.saturating_sub(1);
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::EngineClass;

    #[test]
    fn test_prefetch_failure_injection_counts_down() {
        let kmd = SimulatedKmd::new();
        kmd.fail_prefetch(SimulatedKmd::EIO, 2);

        let region = MemoryRegion::device(0);
        let size = ByteSize::KIB_4;
        assert!(kmd.prefetch(BoHandle(1), GpuAddr::new(0x1000), size, region).is_err());
        assert!(kmd.prefetch(BoHandle(1), GpuAddr::new(0x1000), size, region).is_err());
        assert!(kmd.prefetch(BoHandle(1), GpuAddr::new(0x1000), size, region).is_ok());
        assert_eq!(kmd.prefetches().len(), 1);
    }

    #[test]
    fn test_manual_completion() {
        let kmd = SimulatedKmd::new();
        kmd.set_auto_complete(false);
        let ctx = kmd
            .create_context(EngineInstance::new(EngineClass::Compute, 0))
            .unwrap();

        let exec = ExecBuffer {
            engine: EngineInstance::new(EngineClass::Compute, 0),
            context_id: ctx,
            batch_address: GpuAddr::new(0x1000),
            commands: &[0u8; 8],
            residency: &[],
        };
        let task = kmd.submit(&exec).unwrap();
        assert_eq!(task, 1);
        assert_eq!(kmd.wait(ctx, task, 0), Ok(false));

        kmd.complete_all();
        assert_eq!(kmd.wait(ctx, task, 0), Ok(true));
    }

    #[test]
    fn test_batch_larger_than_its_buffer_is_rejected() {
        use crate::allocation::{AllocationId, AllocationType, GraphicsAllocation, MemoryPool};
        use alloc::sync::Arc;
        use kiln_core::DeviceBitfield;

        let kmd = SimulatedKmd::new();
        let engine = EngineInstance::new(EngineClass::Compute, 0);
        let ctx = kmd.create_context(engine).unwrap();
        let buffer = Arc::new(GraphicsAllocation {
            id: AllocationId::new(1),
            handle: BoHandle(1),
            gpu_address: GpuAddr::new(0x10000),
            size: ByteSize::KIB_4,
            pool: MemoryPool::System4K,
            allocation_type: AllocationType::CommandBuffer,
            root_device_index: 0,
            device_bitfield: DeviceBitfield::new(1),
        });
        let residency = [buffer];
        let commands = [0u8; 4100];

        let exec = ExecBuffer {
            engine,
            context_id: ctx,
            batch_address: GpuAddr::new(0x10000),
            commands: &commands,
            residency: &residency,
        };
        assert_eq!(kmd.submit(&exec), Err(OsError(SimulatedKmd::EINVAL)));

        let exec = ExecBuffer {
            commands: &commands[..4096],
            ..exec
        };
        assert_eq!(kmd.submit(&exec), Ok(1));
        assert_eq!(kmd.submissions(), [(GpuAddr::new(0x10000), 4096)]);
    }

    #[test]
    fn test_submit_to_unknown_context() {
        let kmd = SimulatedKmd::new();
        let exec = ExecBuffer {
            engine: EngineInstance::new(EngineClass::Copy, 0),
            context_id: 42,
            batch_address: GpuAddr::null(),
            commands: &[],
            residency: &[],
        };
        assert_eq!(kmd.submit(&exec), Err(OsError(SimulatedKmd::EINVAL)));
    }
}
