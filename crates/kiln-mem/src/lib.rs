//! # KILN Memory Management
//!
//! Unified-memory bookkeeping and the memory half of the KMD boundary.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      KILN Memory System                         │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │          Unified Memory Allocation Registry               │  │
//! │  │      (pointer → host / device / shared record)            │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                  │
//! │  ┌─────────────────┐  ┌─────┴─────┐  ┌────────────────────┐    │
//! │  │  Address Space  │  │  Memory   │  │  Command Buffer    │    │
//! │  │   (GPU VA)      │  │  Manager  │  │   Reuse Pool       │    │
//! │  └─────────────────┘  └───────────┘  └────────────────────┘    │
//! │                              │                                  │
//! │  ┌───────────────────────────┴───────────────────────────────┐  │
//! │  │        KMD interface (buffer objects, advise, prefetch,   │  │
//! │  │        contexts, submission)                              │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod allocation;
pub mod kmd;
pub mod manager;
pub mod registry;
pub mod reuse;
pub mod sim;
pub mod usm;
pub mod va;

// Re-exports
pub use allocation::{AllocationId, AllocationType, GraphicsAllocation, MemoryPool};
pub use kmd::{
    AdviseAttribute, BoCreateRequest, BoHandle, ExecBuffer, Kmd, KmdMemory, KmdResult,
    KmdSubmit, MemoryClass, MemoryRegion,
};
pub use manager::{AllocationProperties, MemoryManager};
pub use registry::UnifiedMemoryAllocationRegistry;
pub use reuse::CommandBufferReusePool;
pub use sim::{KmdCall, SimulatedKmd};
pub use usm::{AtomicAccessFlags, MemAdvice, MemAdviseFlags, UsmAllocation, UsmKind};
pub use va::{AddressSpace, VaRange};

static_assertions::assert_impl_all!(UnifiedMemoryAllocationRegistry: Send, Sync);
static_assertions::assert_impl_all!(CommandBufferReusePool: Send, Sync);
static_assertions::assert_impl_all!(UsmAllocation: Send, Sync);
static_assertions::assert_impl_all!(SimulatedKmd: Kmd);
