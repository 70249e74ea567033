//! # Graphics Command Stream
//!
//! Append-only buffer of encoded hardware commands with the residency set
//! the buffer needs when it executes.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use bytemuck::Pod;
use hashbrown::HashSet;

use kiln_core::{ByteSize, DeviceBitfield, EngineGroupType, GpuAddr};
use kiln_mem::{AllocationId, GraphicsAllocation};

use crate::commands::{decode_header, MiBatchBufferEnd};

// =============================================================================
// STREAM TARGET
// =============================================================================

/// Device and engine a stream is recorded for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTarget {
    /// Root device index
    pub root_device_index: u32,
    /// Sub-devices the stream executes on
    pub device_bitfield: DeviceBitfield,
    /// Engine group
    pub engine: EngineGroupType,
}

bitflags::bitflags! {
    /// State groups whose setup commands must be re-emitted
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamDirty: u32 {
        /// STATE_COMPUTE_MODE
        const COMPUTE_MODE = 1 << 0;
        /// STATE_BASE_ADDRESS
        const HEAP_BASES = 1 << 1;
    }
}

/// Stream statistics
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    /// Bytes emitted since creation
    pub bytes_emitted: u64,
    /// Commands emitted since creation
    pub commands_emitted: u64,
    /// Times the buffer had to grow
    pub grow_count: u64,
    /// Times the stream was reset
    pub resets: u64,
}

// =============================================================================
// GRAPHICS COMMAND STREAM
// =============================================================================

/// Command buffer plus cursor and residency
pub struct GraphicsCommandStream {
    target: StreamTarget,
    bytes: Vec<u8>,
    capacity: usize,
    buffer: Option<Arc<GraphicsAllocation>>,
    residency: Vec<Arc<GraphicsAllocation>>,
    resident_ids: HashSet<AllocationId>,
    dirty: StreamDirty,
    stats: StreamStats,
}

impl GraphicsCommandStream {
    /// Create an empty stream
    pub fn new(target: StreamTarget, capacity: ByteSize) -> Self {
        let capacity = capacity.as_bytes() as usize;
        Self {
            target,
            bytes: Vec::with_capacity(capacity),
            capacity,
            buffer: None,
            residency: Vec::new(),
            resident_ids: HashSet::new(),
            dirty: StreamDirty::all(),
            stats: StreamStats::default(),
        }
    }

    /// Get target
    #[inline]
    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    /// Bytes used
    #[inline]
    pub fn used(&self) -> usize {
        self.bytes.len()
    }

    /// Check if nothing has been emitted
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Current capacity in bytes
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Encoded bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Emit one command; returns its byte offset
    pub fn emit<T: Pod>(&mut self, command: &T) -> usize {
        let bytes = bytemuck::bytes_of(command);
        #[cfg(feature = "validation")]
        self.validate_packet(bytes);
        self.append(bytes)
    }

    /// Emit a variable-length command given as dwords; returns its byte offset
    pub fn emit_dwords(&mut self, dwords: &[u32]) -> usize {
        let bytes: &[u8] = bytemuck::cast_slice(dwords);
        #[cfg(feature = "validation")]
        self.validate_packet(bytes);
        self.append(bytes)
    }

    fn append(&mut self, bytes: &[u8]) -> usize {
        let offset = self.bytes.len();
        let needed = offset + bytes.len();
        if needed > self.capacity {
            let mut capacity = self.capacity.max(ByteSize::KIB_4.as_bytes() as usize);
            while capacity < needed {
                capacity *= 2;
            }
            log::trace!("command stream grows {} -> {} bytes", self.capacity, capacity);
            self.bytes.reserve(capacity - self.bytes.len());
            self.capacity = capacity;
            self.stats.grow_count += 1;
        }
        self.bytes.extend_from_slice(bytes);
        self.stats.bytes_emitted += bytes.len() as u64;
        self.stats.commands_emitted += 1;
        offset
    }

    #[cfg(feature = "validation")]
    fn validate_packet(&self, bytes: &[u8]) {
        let first = bytes
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
        if let Some(header) = first {
            let (opcode, dwords) = decode_header(header);
            if dwords * 4 != bytes.len() {
                log::error!(
                    "opcode {:#06x} header says {} dwords, emitting {} bytes",
                    opcode,
                    dwords,
                    bytes.len()
                );
                debug_assert!(false, "malformed command header");
            }
        }
    }

    /// Chain another stream's commands and residency onto this one
    ///
    /// A trailing MI_BATCH_BUFFER_END in `other` is dropped so execution
    /// falls through to whatever is chained next.
    pub fn append_stream(&mut self, other: &GraphicsCommandStream) -> usize {
        let end = MiBatchBufferEnd::new();
        let end = bytemuck::bytes_of(&end);
        let bytes = other.bytes.strip_suffix(end).unwrap_or(&other.bytes);
        let offset = if bytes.is_empty() {
            self.bytes.len()
        } else {
            self.append(bytes)
        };
        for allocation in &other.residency {
            self.make_resident(allocation);
        }
        offset
    }

    // -------------------------------------------------------------------------
    // Residency
    // -------------------------------------------------------------------------

    /// Add an allocation to the residency set; returns true if it was new
    pub fn make_resident(&mut self, allocation: &Arc<GraphicsAllocation>) -> bool {
        if !self.resident_ids.insert(allocation.id) {
            return false;
        }
        self.residency.push(allocation.clone());
        true
    }

    /// Check residency
    #[inline]
    pub fn is_resident(&self, id: AllocationId) -> bool {
        self.resident_ids.contains(&id)
    }

    /// Resident allocations
    #[inline]
    pub fn residency(&self) -> &[Arc<GraphicsAllocation>] {
        &self.residency
    }

    // -------------------------------------------------------------------------
    // Backing buffer
    // -------------------------------------------------------------------------

    /// Attach the command buffer allocation the stream executes from
    pub fn attach_buffer(&mut self, buffer: Arc<GraphicsAllocation>) {
        let size = buffer.size.as_bytes() as usize;
        if size > self.capacity {
            self.bytes.reserve(size - self.bytes.len());
            self.capacity = size;
        }
        self.make_resident(&buffer);
        self.buffer = Some(buffer);
    }

    /// Move the stream into a larger command buffer; returns the old one
    ///
    /// The encoded commands are kept as they are and execute from `buffer`
    /// from now on.
    pub fn replace_buffer(
        &mut self,
        buffer: Arc<GraphicsAllocation>,
    ) -> Option<Arc<GraphicsAllocation>> {
        let old = self.take_buffer();
        log::debug!(
            "command stream moves to {:?} ({}), {} bytes used",
            buffer.id,
            buffer.size,
            self.bytes.len()
        );
        self.attach_buffer(buffer);
        old
    }

    /// Attached command buffer
    #[inline]
    pub fn buffer(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.buffer.as_ref()
    }

    /// Bytes left in the attached command buffer; zero without one
    pub fn remaining(&self) -> usize {
        self.buffer
            .as_ref()
            .map_or(0, |b| (b.size.as_bytes() as usize).saturating_sub(self.bytes.len()))
    }

    /// Detach the command buffer allocation
    pub fn take_buffer(&mut self) -> Option<Arc<GraphicsAllocation>> {
        let buffer = self.buffer.take()?;
        if self.resident_ids.remove(&buffer.id) {
            self.residency.retain(|a| a.id != buffer.id);
        }
        Some(buffer)
    }

    /// Batch-buffer address
    pub fn gpu_address(&self) -> GpuAddr {
        self.buffer
            .as_ref()
            .map(|b| b.gpu_address)
            .unwrap_or(GpuAddr::null())
    }

    // -------------------------------------------------------------------------
    // Dirty state
    // -------------------------------------------------------------------------

    /// Get dirty groups
    #[inline]
    pub fn dirty(&self) -> StreamDirty {
        self.dirty
    }

    /// Check one group
    #[inline]
    pub fn is_dirty(&self, group: StreamDirty) -> bool {
        self.dirty.intersects(group)
    }

    /// Mark a group re-emitted
    #[inline]
    pub fn clear_dirty(&mut self, group: StreamDirty) {
        self.dirty.remove(group);
    }

    /// Rewind the stream for a new recording
    ///
    /// Drops every command and resident allocation except the attached
    /// command buffer, and marks all state groups dirty.
    pub fn reset(&mut self) {
        self.bytes.clear();
        self.residency.clear();
        self.resident_ids.clear();
        if let Some(buffer) = self.buffer.clone() {
            self.make_resident(&buffer);
        }
        self.dirty = StreamDirty::all();
        self.stats.resets += 1;
    }

    /// Get statistics
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Decode the stream into packets
    pub fn reader(&self) -> CommandReader<'_> {
        CommandReader {
            bytes: &self.bytes,
            offset: 0,
        }
    }
}

impl fmt::Debug for GraphicsCommandStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsCommandStream")
            .field("target", &self.target)
            .field("used", &self.bytes.len())
            .field("capacity", &self.capacity)
            .field("residency", &self.residency.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

// =============================================================================
// COMMAND READER
// =============================================================================

/// One decoded command
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    /// Byte offset in the stream
    pub offset: usize,
    /// Opcode
    pub opcode: u16,
    bytes: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Length in dwords
    #[inline]
    pub fn len_dwords(&self) -> usize {
        self.bytes.len() / 4
    }

    /// Length in bytes
    #[inline]
    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    /// Read dword `index`
    pub fn dword(&self, index: usize) -> Option<u32> {
        let b = self.bytes.get(index * 4..index * 4 + 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reinterpret as a fixed layout
    pub fn read<T: Pod>(&self) -> Option<T> {
        bytemuck::try_pod_read_unaligned(self.bytes).ok()
    }

    /// Raw bytes
    #[inline]
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Iterator over the packets of a stream
#[derive(Debug, Clone)]
pub struct CommandReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for CommandReader<'a> {
    type Item = Packet<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let head = self.bytes.get(self.offset..self.offset + 4)?;
        let (opcode, dwords) = decode_header(u32::from_le_bytes([head[0], head[1], head[2], head[3]]));
        let end = self.offset + dwords * 4;
        // Truncated packet ends the walk
        let bytes = self.bytes.get(self.offset..end)?;
        let packet = Packet {
            offset: self.offset,
            opcode,
            bytes,
        };
        self.offset = end;
        Some(packet)
    }
}
