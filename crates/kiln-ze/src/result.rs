//! # Result Codes
//!
//! `ze_result_t` definition and conversion from driver errors.

use core::fmt;

use kiln_core::Error;

// =============================================================================
// ZE RESULT
// =============================================================================

/// Level-Zero result code
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultCode {
    // Success codes
    /// Success
    Success = 0,
    /// Synchronization primitive not signaled
    NotReady = 1,

    // Error codes
    /// Device hung, reset or removed
    ErrorDeviceLost = 0x7000_0001,
    /// Insufficient host memory
    ErrorOutOfHostMemory = 0x7000_0002,
    /// Insufficient device memory
    ErrorOutOfDeviceMemory = 0x7000_0003,
    /// Feature not supported
    ErrorUnsupportedFeature = 0x7800_0003,
    /// Invalid argument
    ErrorInvalidArgument = 0x7800_0004,
    /// Object still in use
    ErrorHandleObjectInUse = 0x7800_0006,
    /// Invalid synchronization object
    ErrorInvalidSynchronizationObject = 0x7800_000b,
    /// Unknown or internal error
    ErrorUnknown = 0x7fff_fffe,
}

impl ResultCode {
    /// Check if result is a success code
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::NotReady)
    }

    /// Check if result is an error code
    pub fn is_error(&self) -> bool {
        !self.is_success()
    }

    /// Convert to raw i32
    pub fn as_raw(&self) -> i32 {
        *self as i32
    }

    /// Create from raw i32
    pub fn from_raw(value: i32) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::NotReady,
            0x7000_0001 => Self::ErrorDeviceLost,
            0x7000_0002 => Self::ErrorOutOfHostMemory,
            0x7000_0003 => Self::ErrorOutOfDeviceMemory,
            0x7800_0003 => Self::ErrorUnsupportedFeature,
            0x7800_0004 => Self::ErrorInvalidArgument,
            0x7800_0006 => Self::ErrorHandleObjectInUse,
            0x7800_000b => Self::ErrorInvalidSynchronizationObject,
            _ => Self::ErrorUnknown,
        }
    }

    /// Collapse a driver result
    pub fn from_result<T>(result: kiln_core::Result<T>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) => e.into(),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "ZE_RESULT_SUCCESS",
            Self::NotReady => "ZE_RESULT_NOT_READY",
            Self::ErrorDeviceLost => "ZE_RESULT_ERROR_DEVICE_LOST",
            Self::ErrorOutOfHostMemory => "ZE_RESULT_ERROR_OUT_OF_HOST_MEMORY",
            Self::ErrorOutOfDeviceMemory => "ZE_RESULT_ERROR_OUT_OF_DEVICE_MEMORY",
            Self::ErrorUnsupportedFeature => "ZE_RESULT_ERROR_UNSUPPORTED_FEATURE",
            Self::ErrorInvalidArgument => "ZE_RESULT_ERROR_INVALID_ARGUMENT",
            Self::ErrorHandleObjectInUse => "ZE_RESULT_ERROR_HANDLE_OBJECT_IN_USE",
            Self::ErrorInvalidSynchronizationObject => {
                "ZE_RESULT_ERROR_INVALID_SYNCHRONIZATION_OBJECT"
            }
            Self::ErrorUnknown => "ZE_RESULT_ERROR_UNKNOWN",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// CONVERSIONS
// =============================================================================

impl From<Error> for ResultCode {
    fn from(e: Error) -> Self {
        match e {
            Error::InvalidArgument | Error::InvalidState | Error::NotFound => {
                Self::ErrorInvalidArgument
            }
            Error::InvalidSynchronizationObject => Self::ErrorInvalidSynchronizationObject,
            Error::UnsupportedEngine | Error::UnsupportedFeature => Self::ErrorUnsupportedFeature,
            Error::NotReady => Self::NotReady,
            Error::OutOfHostMemory => Self::ErrorOutOfHostMemory,
            Error::OutOfDeviceMemory => Self::ErrorOutOfDeviceMemory,
            Error::DeviceLost | Error::SubmissionFailed { .. } => Self::ErrorDeviceLost,
            Error::DuplicateAllocation | Error::AllocationStillReferenced => {
                Self::ErrorHandleObjectInUse
            }
            Error::KmdCallFailed { .. } => Self::ErrorUnknown,
            _ => Self::ErrorUnknown,
        }
    }
}
