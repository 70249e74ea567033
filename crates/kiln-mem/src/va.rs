//! # GPU Virtual Address Space
//!
//! Hands out the virtual ranges USM allocations and command buffers are
//! bound at. USM pointers are these addresses, so a range must never be
//! handed out twice while live.

use alloc::vec::Vec;

use kiln_core::{ByteSize, Error, GpuAddr, Result};

// =============================================================================
// VA RANGE
// =============================================================================

/// A virtual address range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VaRange {
    /// Start address
    pub start: GpuAddr,
    /// End address (exclusive)
    pub end: GpuAddr,
}

impl VaRange {
    /// Create a range from start and size
    #[inline]
    pub const fn new(start: GpuAddr, size: ByteSize) -> Self {
        Self {
            start,
            end: GpuAddr::new(start.raw() + size.as_bytes()),
        }
    }

    /// Size of the range
    #[inline]
    pub fn size(&self) -> ByteSize {
        ByteSize::from_bytes(self.end - self.start)
    }

    /// Check if an address is inside the range
    #[inline]
    pub fn contains(&self, addr: GpuAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if two ranges overlap
    #[inline]
    pub fn overlaps(&self, other: &VaRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// =============================================================================
// ADDRESS SPACE
// =============================================================================

/// First-fit block list over one managed range
#[derive(Debug, Clone)]
struct VaBlock {
    range: VaRange,
    free: bool,
}

/// Address space statistics
#[derive(Debug, Clone, Default)]
pub struct AddressSpaceStats {
    /// Number of allocations
    pub allocs: u64,
    /// Number of frees
    pub frees: u64,
    /// Current allocated bytes
    pub allocated: u64,
}

/// GPU virtual address space
#[derive(Debug)]
pub struct AddressSpace {
    range: VaRange,
    blocks: Vec<VaBlock>,
    stats: AddressSpaceStats,
}

impl AddressSpace {
    /// Minimum alignment of any range
    pub const PAGE_SIZE: u64 = 4096;

    /// Default managed range for USM (starts above the null page region)
    pub const DEFAULT_RANGE: VaRange = VaRange {
        start: GpuAddr::new(0x0000_0001_0000_0000),
        end: GpuAddr::new(0x0000_8000_0000_0000),
    };

    /// Create a new address space over `range`
    pub fn new(range: VaRange) -> Self {
        Self {
            range,
            blocks: alloc::vec![VaBlock { range, free: true }],
            stats: AddressSpaceStats::default(),
        }
    }

    /// Managed range
    pub fn range(&self) -> VaRange {
        self.range
    }

    /// Allocate a virtual range
    pub fn allocate(&mut self, size: ByteSize, alignment: u64) -> Result<VaRange> {
        if size.as_bytes() == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        let alignment = alignment.max(Self::PAGE_SIZE);
        let size = size.align_up(Self::PAGE_SIZE).as_bytes();

        for i in 0..self.blocks.len() {
            if !self.blocks[i].free {
                continue;
            }

            let block = self.blocks[i].range;
            let aligned_start = block.start.align_up(alignment);
            let Some(aligned_end) = aligned_start.raw().checked_add(size) else {
                continue;
            };

            if aligned_start >= block.start && aligned_end <= block.end.raw() {
                let range = VaRange {
                    start: aligned_start,
                    end: GpuAddr::new(aligned_end),
                };
                self.split_block(i, range);
                self.stats.allocs += 1;
                self.stats.allocated += size;
                return Ok(range);
            }
        }

        Err(Error::OutOfDeviceMemory)
    }

    fn split_block(&mut self, index: usize, alloc: VaRange) {
        let block = self.blocks.remove(index);
        let mut at = index;

        if alloc.start > block.range.start {
            self.blocks.insert(
                at,
                VaBlock {
                    range: VaRange {
                        start: block.range.start,
                        end: alloc.start,
                    },
                    free: true,
                },
            );
            at += 1;
        }

        self.blocks.insert(
            at,
            VaBlock {
                range: alloc,
                free: false,
            },
        );

        if alloc.end < block.range.end {
            self.blocks.insert(
                at + 1,
                VaBlock {
                    range: VaRange {
                        start: alloc.end,
                        end: block.range.end,
                    },
                    free: true,
                },
            );
        }
    }

    /// Free a previously allocated range
    pub fn free(&mut self, range: VaRange) -> Result<()> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.range == range && !b.free)
            .ok_or(Error::NotFound)?;

        self.blocks[index].free = true;
        self.stats.frees += 1;
        self.stats.allocated -= range.size().as_bytes();
        self.merge_free_blocks();
        Ok(())
    }

    fn merge_free_blocks(&mut self) {
        let mut i = 0;
        while i + 1 < self.blocks.len() {
            if self.blocks[i].free && self.blocks[i + 1].free {
                self.blocks[i].range.end = self.blocks[i + 1].range.end;
                self.blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Get statistics
    pub fn stats(&self) -> &AddressSpaceStats {
        &self.stats
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RANGE)
    }
}
