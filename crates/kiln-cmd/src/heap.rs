//! # Indirect Heap
//!
//! Kernel argument blocks the dispatch commands point at. The heap is a
//! chain of system-memory blocks; the driver writes argument data through a
//! host shadow of each block and hands out the GPU address of every slot.
//!
//! ```text
//!   block 0                          block 1
//!   ┌──────┬──────┬──────┬─────┐     ┌──────┬─────
//!   │ args │ args │ args │ ... │ ──► │ args │ ...
//!   └──────┴──────┴──────┴─────┘     └──────┴─────
//!    64-byte aligned slots
//! ```

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use kiln_core::{ByteSize, DeviceBitfield, GpuAddr, Result};
use kiln_mem::{AllocationProperties, AllocationType, GraphicsAllocation, MemoryManager, MemoryPool};

/// Alignment of every argument slot
pub const INDIRECT_DATA_ALIGNMENT: u64 = 64;

/// Default block size
pub const INDIRECT_HEAP_BLOCK_SIZE: ByteSize = ByteSize::KIB_64;

struct HeapBlock {
    allocation: Arc<GraphicsAllocation>,
    shadow: Vec<u8>,
    used: usize,
}

impl HeapBlock {
    fn available(&self) -> usize {
        self.shadow.len() - self.used
    }
}

/// Linear heap of kernel argument data
pub struct IndirectHeap {
    memory: Arc<MemoryManager>,
    root_device_index: u32,
    device_bitfield: DeviceBitfield,
    block_size: ByteSize,
    blocks: Vec<HeapBlock>,
    current: usize,
}

impl IndirectHeap {
    /// Create an empty heap; blocks are allocated on first use
    pub fn new(memory: Arc<MemoryManager>, root_device_index: u32, device_bitfield: DeviceBitfield) -> Self {
        Self {
            memory,
            root_device_index,
            device_bitfield,
            block_size: INDIRECT_HEAP_BLOCK_SIZE,
            blocks: Vec::new(),
            current: 0,
        }
    }

    fn slot_size(bytes: usize) -> usize {
        ByteSize::from_bytes(bytes as u64)
            .align_up(INDIRECT_DATA_ALIGNMENT)
            .as_bytes() as usize
    }

    /// Make sure the next push of `bytes` will not fail
    ///
    /// Allocates a new block when the current one is too small. Nothing
    /// already pushed moves.
    pub fn reserve(&mut self, bytes: usize) -> Result<()> {
        let needed = Self::slot_size(bytes);
        while self.current < self.blocks.len() {
            if self.blocks[self.current].available() >= needed {
                return Ok(());
            }
            self.current += 1;
        }

        let size = ByteSize::from_bytes(needed as u64)
            .align_up(ByteSize::KIB_4.as_bytes())
            .as_bytes()
            .max(self.block_size.as_bytes());
        let allocation = self.memory.allocate(&AllocationProperties {
            size: ByteSize::from_bytes(size),
            pool: MemoryPool::System4K,
            allocation_type: AllocationType::IndirectHeap,
            root_device_index: self.root_device_index,
            device_bitfield: self.device_bitfield,
        })?;
        log::trace!(
            "indirect heap block {} at {} ({})",
            self.blocks.len(),
            allocation.gpu_address,
            allocation.size
        );
        self.blocks.push(HeapBlock {
            shadow: vec![0; allocation.size.as_bytes() as usize],
            allocation,
            used: 0,
        });
        self.current = self.blocks.len() - 1;
        Ok(())
    }

    /// Copy `data` into a fresh slot; returns its GPU address
    pub fn push(&mut self, data: &[u8]) -> Result<GpuAddr> {
        self.reserve(data.len())?;
        let slot = Self::slot_size(data.len());
        let block = &mut self.blocks[self.current];
        let offset = block.used;
        block.shadow[offset..offset + data.len()].copy_from_slice(data);
        block.used += slot;
        Ok(block.allocation.gpu_address.offset(offset as u64))
    }

    /// Block the next push lands in
    pub fn current_allocation(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.blocks.get(self.current).map(|b| &b.allocation)
    }

    /// Every block
    pub fn allocations(&self) -> impl Iterator<Item = &Arc<GraphicsAllocation>> {
        self.blocks.iter().map(|b| &b.allocation)
    }

    /// Bytes handed out since the last reset
    pub fn used(&self) -> usize {
        self.blocks.iter().map(|b| b.used).sum()
    }

    /// Read back data written at `address`
    pub fn read(&self, address: GpuAddr, len: usize) -> Option<&[u8]> {
        let block = self
            .blocks
            .iter()
            .find(|b| b.allocation.contains(address))?;
        let offset = (address - block.allocation.gpu_address) as usize;
        block.shadow.get(offset..offset.checked_add(len)?)
    }

    /// Rewind every block; allocations are kept
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            block.used = 0;
        }
        self.current = 0;
    }

    /// Free every block
    pub fn release(&mut self) {
        for block in self.blocks.drain(..) {
            if let Err(e) = self.memory.free(&block.allocation) {
                log::warn!("freeing indirect heap block {:?} failed: {}", block.allocation.id, e);
            }
        }
        self.current = 0;
    }
}

impl fmt::Debug for IndirectHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndirectHeap")
            .field("root_device_index", &self.root_device_index)
            .field("blocks", &self.blocks.len())
            .field("used", &self.used())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_mem::SimulatedKmd;

    fn heap() -> IndirectHeap {
        let memory = Arc::new(MemoryManager::new(Arc::new(SimulatedKmd::new())));
        IndirectHeap::new(memory, 0, DeviceBitfield::new(1))
    }

    #[test]
    fn test_slots_are_aligned_and_readable() {
        let mut heap = heap();
        let a = heap.push(&[1, 2, 3]).unwrap();
        let b = heap.push(&7u64.to_le_bytes()).unwrap();
        assert_eq!(b - a, INDIRECT_DATA_ALIGNMENT);
        assert!(a.is_aligned(INDIRECT_DATA_ALIGNMENT));
        assert_eq!(heap.read(a, 3).unwrap(), &[1, 2, 3]);
        assert_eq!(heap.read(b, 8).unwrap(), &7u64.to_le_bytes());
        assert_eq!(heap.used(), 128);
    }

    #[test]
    fn test_full_block_chains_a_new_one() {
        let mut heap = heap();
        let big = vec![0xAB; INDIRECT_HEAP_BLOCK_SIZE.as_bytes() as usize - 64];
        heap.push(&big).unwrap();
        let first = heap.current_allocation().unwrap().id;
        heap.push(&[0; 128]).unwrap();
        assert_ne!(heap.current_allocation().unwrap().id, first);
        assert_eq!(heap.allocations().count(), 2);
    }

    #[test]
    fn test_reset_reuses_blocks() {
        let mut heap = heap();
        let a = heap.push(&[9; 16]).unwrap();
        heap.reset();
        assert_eq!(heap.used(), 0);
        assert_eq!(heap.push(&[5; 16]).unwrap(), a);
        assert_eq!(heap.allocations().count(), 1);

        heap.release();
        assert!(heap.current_allocation().is_none());
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        let kmd = Arc::new(SimulatedKmd::new());
        let memory = Arc::new(MemoryManager::new(kmd.clone()));
        let mut heap = IndirectHeap::new(memory, 0, DeviceBitfield::new(1));
        kmd.fail_create(SimulatedKmd::ENOMEM);
        assert_eq!(heap.reserve(8), Err(kiln_core::Error::OutOfHostMemory));
        assert_eq!(heap.used(), 0);
    }
}
