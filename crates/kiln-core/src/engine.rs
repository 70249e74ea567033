//! # Engine Groups
//!
//! Engine-group types a command list or queue binds to, and the KMD engine
//! class/instance they resolve to.

use core::fmt;

// =============================================================================
// ENGINE GROUP TYPE
// =============================================================================

/// Engine group a command list or queue is created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EngineGroupType {
    /// Compute command streamer
    Compute,
    /// Render command streamer used for compute
    RenderCompute,
    /// Compute streamer with cooperative dispatch enabled
    CooperativeCompute,
    /// Blitter (copy) engine
    Copy,
}

impl EngineGroupType {
    /// Check if kernels can be dispatched on this group
    #[inline]
    pub const fn supports_dispatch(self) -> bool {
        !matches!(self, Self::Copy)
    }

    /// Check if this is a copy-only group
    #[inline]
    pub const fn is_copy(self) -> bool {
        matches!(self, Self::Copy)
    }

    /// Check if cooperative kernels run natively on this group
    #[inline]
    pub const fn is_cooperative(self) -> bool {
        matches!(self, Self::CooperativeCompute)
    }

    /// KMD engine class backing this group
    pub const fn engine_class(self) -> EngineClass {
        match self {
            Self::Compute | Self::CooperativeCompute => EngineClass::Compute,
            Self::RenderCompute => EngineClass::Render,
            Self::Copy => EngineClass::Copy,
        }
    }

    /// Membership flag in an [`EngineGroupSet`]
    pub const fn flag(self) -> EngineGroupSet {
        match self {
            Self::Compute => EngineGroupSet::COMPUTE,
            Self::RenderCompute => EngineGroupSet::RENDER_COMPUTE,
            Self::CooperativeCompute => EngineGroupSet::COOPERATIVE_COMPUTE,
            Self::Copy => EngineGroupSet::COPY,
        }
    }
}

impl fmt::Display for EngineGroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compute => write!(f, "compute"),
            Self::RenderCompute => write!(f, "render-compute"),
            Self::CooperativeCompute => write!(f, "cooperative-compute"),
            Self::Copy => write!(f, "copy"),
        }
    }
}

bitflags::bitflags! {
    /// Engine groups exposed by a device
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EngineGroupSet: u32 {
        /// Compute group
        const COMPUTE = 1 << 0;
        /// Render-compute group
        const RENDER_COMPUTE = 1 << 1;
        /// Cooperative compute group
        const COOPERATIVE_COMPUTE = 1 << 2;
        /// Copy group
        const COPY = 1 << 3;
    }
}

impl EngineGroupSet {
    /// Check if the group is exposed
    #[inline]
    pub fn supports(self, group: EngineGroupType) -> bool {
        self.contains(group.flag())
    }
}

// =============================================================================
// KMD ENGINE IDENTIFICATION
// =============================================================================

/// Engine class as understood by the kernel-mode driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EngineClass {
    /// Render command streamer
    Render = 0,
    /// Blitter
    Copy = 1,
    /// Compute command streamer
    Compute = 4,
}

/// Engine class + instance pair used to key a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineInstance {
    /// Engine class
    pub class: EngineClass,
    /// Instance within the class
    pub instance: u16,
}

impl EngineInstance {
    /// Create a new engine instance
    #[inline]
    pub const fn new(class: EngineClass, instance: u16) -> Self {
        Self { class, instance }
    }
}
