//! # KILN Command System
//!
//! Command streams, hardware command encoding, compute-mode tracking,
//! kernel argument heaps and memory prefetch.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                      Command Recording Path                       │
//! │                                                                   │
//! │  ┌──────────────┐   ┌──────────────┐   ┌────────────────────┐    │
//! │  │ Compute Mode │   │   Encoding   │   │   System Fence     │    │
//! │  │    State     │   │    Policy    │   │   Requirement      │    │
//! │  └──────┬───────┘   └──────┬───────┘   └─────────┬──────────┘    │
//! │         └──────────────────┼─────────────────────┘               │
//! │                   ┌────────▼─────────┐                           │
//! │                   │ Graphics Command │ ◄── residency set         │
//! │                   │      Stream      │                           │
//! │                   └────────┬─────────┘                           │
//! │                            │ target device / engine              │
//! │                   ┌────────▼─────────┐   ┌──────────────────┐    │
//! │                   │ Prefetch Manager │ ◄─│ Prefetch Context │    │
//! │                   └──────────────────┘   └──────────────────┘    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod commands;
pub mod compute_mode;
pub mod encoder;
pub mod fence;
pub mod heap;
pub mod prefetch;
pub mod stream;

// Re-exports
pub use compute_mode::{
    compute_mode_size, program_compute_mode, ComputeModeDirty, ComputeModeProperties,
    ComputeModeState,
};
pub use encoder::{DispatchArgs, HardwareEncodingPolicy, HeapBases, PostSync, PostSyncKind};
pub use fence::{system_fence_required, MemoryUsage};
pub use heap::{IndirectHeap, INDIRECT_DATA_ALIGNMENT};
pub use prefetch::{PrefetchContext, PrefetchManager, PrefetchStats};
pub use stream::{
    CommandReader, GraphicsCommandStream, Packet, StreamDirty, StreamStats, StreamTarget,
};

static_assertions::assert_impl_all!(GraphicsCommandStream: Send, Sync);
static_assertions::assert_impl_all!(PrefetchManager: Send, Sync);
static_assertions::assert_impl_all!(PrefetchContext: Send, Sync);
static_assertions::assert_impl_all!(IndirectHeap: Send, Sync);
