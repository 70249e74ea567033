//! # KILN Level-Zero Core
//!
//! The object model applications drive: driver context, devices, USM
//! allocation, kernels, command lists, command queues and events.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          DriverContext                            │
//! │   USM registry · address space · KMD · handle tables              │
//! └──────┬──────────────────────┬────────────────────────┬────────────┘
//!        │                      │                        │
//! ┌──────▼───────┐      ┌───────▼────────┐      ┌────────▼────────┐
//! │    Device    │      │   Event Pool   │      │  Command Queue  │
//! │ caps, config │      │    ┌───────┐   │      │ batch, context  │
//! │ prefetch mgr │      │    │ Event │   │      │  in-flight list │
//! └──────┬───────┘      │    └───────┘   │      └────────▲────────┘
//!        │              └───────┬────────┘               │ execute
//! ┌──────▼───────────────────────▼────────────────────────┴────────┐
//! │                         Command List                           │
//! │  Initial ─► Recording ─► Closed ─► Submitted ─► (reset)         │
//! │  stream · prefetch context · compute mode · argument heap      │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation returns [`kiln_core::Result`]; the `ze_*` wrappers map
//! it onto a [`ResultCode`].

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod cmdlist;
pub mod device;
pub mod driver;
pub mod event;
pub mod kernel;
pub mod queue;
pub mod result;

// Re-exports
pub use cmdlist::{
    CommandList, CommandListDesc, CommandListState, LaunchParams, MemoryCopyParams,
    MAX_FILL_PATTERN_SIZE,
};
pub use device::{Device, DeviceDesc};
pub use driver::{DriverContext, MemAllocProperties};
pub use event::{
    Event, EventDesc, EventPool, EventPoolDesc, KernelTimestamp, TimestampPacketType,
};
pub use kernel::{IndirectAccessFlags, Kernel, KernelArg, KernelDesc};
pub use queue::{CommandQueue, CommandQueueDesc, Fence, QueueStats};
pub use result::ResultCode;

static_assertions::assert_impl_all!(DriverContext: Send, Sync);
static_assertions::assert_impl_all!(Device: Send, Sync);
static_assertions::assert_impl_all!(CommandList: Send, Sync);
static_assertions::assert_impl_all!(CommandQueue: Send, Sync);
static_assertions::assert_impl_all!(EventPool: Send, Sync);
static_assertions::assert_impl_all!(Event: Send, Sync);
static_assertions::assert_impl_all!(Kernel: Send, Sync);
