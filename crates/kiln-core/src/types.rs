//! # KILN Core Types
//!
//! Fundamental type definitions used across the driver core.
//!
//! These types provide:
//! - Strong typing for GPU virtual addresses and sizes
//! - Typed opaque handles for API objects
//! - Sub-device bitfields used for placement and prefetch

use core::fmt;
use core::ops::{Add, Sub};

use arrayvec::ArrayVec;

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// USM allocations share one address space between host and device, so this
/// is also the value handed to the application as the allocation pointer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null GPU address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Align up to boundary
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Low dword, as programmed into command address fields
    #[inline]
    pub const fn low(self) -> u32 {
        self.0 as u32
    }

    /// High dword
    #[inline]
    pub const fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<GpuAddr> for GpuAddr {
    type Output = u64;

    fn sub(self, rhs: GpuAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);
    /// 4 KiB
    pub const KIB_4: Self = Self(4 * 1024);
    /// 64 KiB
    pub const KIB_64: Self = Self(64 * 1024);
    /// 2 MiB (huge page)
    pub const MIB_2: Self = Self(2 * 1024 * 1024);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from KiB
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Align up
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 * 1024 {
            write!(f, "{} GiB", self.0 / (1024 * 1024 * 1024))
        } else if self.0 >= 1024 * 1024 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Opaque handle to an API object
///
/// Handles are what crosses the API boundary; the object itself lives in a
/// [`HandleTable`](crate::arena::HandleTable) owned by the driver context.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: core::marker::PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a new handle
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _marker: core::marker::PhantomData,
        }
    }

    /// Create a null handle
    #[inline]
    pub const fn null() -> Self {
        Self::new(0)
    }

    /// Get the raw ID
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.id == 0
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> core::hash::Hash for Handle<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handle<{}>(0x{:x})",
            core::any::type_name::<T>(),
            self.id
        )
    }
}

// Marker types for handles
/// Marker for device handle
#[derive(Debug)]
pub struct DeviceMarker;
/// Marker for event pool handle
#[derive(Debug)]
pub struct EventPoolMarker;
/// Marker for event handle
#[derive(Debug)]
pub struct EventMarker;
/// Marker for command list handle
#[derive(Debug)]
pub struct CommandListMarker;
/// Marker for command queue handle
#[derive(Debug)]
pub struct CommandQueueMarker;
/// Marker for kernel handle
#[derive(Debug)]
pub struct KernelMarker;

/// Handle to a device
pub type DeviceHandle = Handle<DeviceMarker>;
/// Handle to an event pool
pub type EventPoolHandle = Handle<EventPoolMarker>;
/// Handle to an event
pub type EventHandle = Handle<EventMarker>;
/// Handle to a command list
pub type CommandListHandle = Handle<CommandListMarker>;
/// Handle to a command queue
pub type CommandQueueHandle = Handle<CommandQueueMarker>;
/// Handle to a kernel
pub type KernelHandle = Handle<KernelMarker>;

// =============================================================================
// DEVICE BITFIELD
// =============================================================================

/// Maximum number of sub-devices (tiles) per root device
pub const MAX_SUB_DEVICES: usize = 4;

/// Set of sub-devices a device or allocation spans
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct DeviceBitfield(u32);

impl DeviceBitfield {
    /// Create from raw bits
    #[inline]
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    /// Bitfield covering the first `count` sub-devices
    #[inline]
    pub const fn first(count: u32) -> Self {
        if count >= 32 {
            Self(u32::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    /// Raw bits
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Number of sub-devices set
    #[inline]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Check if no sub-device is set
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Check if a sub-device is set
    #[inline]
    pub const fn contains(self, sub_device_id: u32) -> bool {
        sub_device_id < 32 && self.0 & (1 << sub_device_id) != 0
    }

    /// Sub-device ids in ascending order (the bit index of each set bit)
    pub fn sub_device_ids(self) -> ArrayVec<u32, MAX_SUB_DEVICES> {
        let mut ids = ArrayVec::new();
        let mut bits = self.0;
        while bits != 0 && !ids.is_full() {
            let id = bits.trailing_zeros();
            ids.push(id);
            bits &= bits - 1;
        }
        ids
    }
}

impl fmt::Debug for DeviceBitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceBitfield(0b{:b})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_addr() {
        let addr = GpuAddr::new(0x1_0000_1000);
        assert!(addr.is_aligned(0x1000));
        assert!(!addr.is_aligned(0x10000));
        assert_eq!(addr.low(), 0x1000);
        assert_eq!(addr.high(), 0x1);
        assert_eq!(addr.offset(0x10) - addr, 0x10);
        assert_eq!(GpuAddr::new(0x1001).align_up(0x1000), GpuAddr::new(0x2000));
    }

    #[test]
    fn test_handle_identity() {
        let a = EventHandle::new(3);
        let b = a;
        assert_eq!(a, b);
        assert!(!a.is_null());
        assert!(DeviceHandle::null().is_null());
    }

    #[test]
    fn test_sub_device_ids() {
        assert_eq!(DeviceBitfield::new(0b0010).sub_device_ids().as_slice(), &[1]);
        assert_eq!(DeviceBitfield::new(0b1000).sub_device_ids().as_slice(), &[3]);
        assert_eq!(
            DeviceBitfield::new(0b1011).sub_device_ids().as_slice(),
            &[0, 1, 3]
        );
        assert!(DeviceBitfield::new(0).sub_device_ids().is_empty());
        assert_eq!(DeviceBitfield::first(2).bits(), 0b11);
        assert!(DeviceBitfield::new(0b100).contains(2));
    }
}
