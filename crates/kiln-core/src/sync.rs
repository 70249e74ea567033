//! # Synchronization Flags
//!
//! Event scope and event pool flags shared by the command and API layers.

// =============================================================================
// EVENT SCOPE
// =============================================================================

bitflags::bitflags! {
    /// Visibility scope of an event signal or wait
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventScopeFlags: u32 {
        /// Cache coherent with the sub-device
        const SUBDEVICE = 1 << 0;
        /// Cache coherent with all sub-devices of the device
        const DEVICE = 1 << 1;
        /// Cache coherent with the host
        const HOST = 1 << 2;
    }
}

impl EventScopeFlags {
    /// Check if the scope makes results visible to the host
    #[inline]
    pub fn is_host_visible(self) -> bool {
        self.contains(Self::HOST)
    }
}

// =============================================================================
// EVENT POOL FLAGS
// =============================================================================

bitflags::bitflags! {
    /// Event pool creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventPoolFlags: u32 {
        /// Events can be signaled and queried from the host
        const HOST_VISIBLE = 1 << 0;
        /// Pool can be shared across processes
        const IPC = 1 << 1;
        /// Events record kernel start/end timestamps
        const KERNEL_TIMESTAMP = 1 << 2;
        /// Timestamps are mapped to host time
        const KERNEL_MAPPED_TIMESTAMP = 1 << 3;
    }
}

// =============================================================================
// EVENT STATUS
// =============================================================================

/// Value stored in an event slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventStatus {
    /// Not signaled
    Clear = 1,
    /// Signaled
    Signaled = 0,
}

impl EventStatus {
    /// Raw slot value
    #[inline]
    pub const fn raw(self) -> u64 {
        self as u32 as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_visibility() {
        assert!(EventScopeFlags::HOST.is_host_visible());
        assert!((EventScopeFlags::DEVICE | EventScopeFlags::HOST).is_host_visible());
        assert!(!EventScopeFlags::DEVICE.is_host_visible());
        assert!(!EventScopeFlags::empty().is_host_visible());
    }
}
