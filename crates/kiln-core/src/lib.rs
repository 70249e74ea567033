//! # KILN Core
//!
//! Foundational types for the KILN GPU compute driver core.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       kiln-core                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Types     │  │   Error     │  │   Configuration     │  │
//! │  │ (GpuAddr,   │  │  Handling   │  │  (resolved per      │  │
//! │  │  Handle)    │  │             │  │   device)           │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │  ┌─────────────┐  ┌─────────────────────────────────────┐   │
//! │  │   Arenas    │  │   Hardware capability tables        │   │
//! │  │ (handle →   │  │   (fences, compute mode,            │   │
//! │  │  object)    │  │    cooperative dispatch)            │   │
//! │  └─────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod arena;
pub mod config;
pub mod engine;
pub mod error;
pub mod hw;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use arena::HandleTable;
pub use config::{DriverConfiguration, ResolvedConfiguration};
pub use engine::{EngineClass, EngineGroupSet, EngineGroupType, EngineInstance};
pub use error::{Error, OsError, Result};
pub use hw::{
    CooperativeDispatchLimits, GfxCoreFamily, HardwareCapabilities, StateComputeModeSupport,
    SystemFencePolicy, ThreadArbitrationPolicy,
};
pub use sync::{EventPoolFlags, EventScopeFlags, EventStatus};
pub use types::*;

static_assertions::assert_impl_all!(HandleTable<DeviceMarker, u32>: Send, Sync);
static_assertions::assert_impl_all!(HardwareCapabilities: Send, Sync, Copy);
