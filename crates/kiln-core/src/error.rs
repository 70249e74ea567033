//! # KILN Error Handling
//!
//! Error types shared by every layer of the driver core.
//!
//! Errors are grouped the way callers are expected to react to them:
//! - Usage errors: the caller broke a precondition, nothing was mutated
//! - Resource exhaustion: the object stays valid for other operations
//! - Driver/OS failures: carry the OS error code returned by the KMD
//! - Invariant violations: lifetime bugs, always surfaced on their own

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// KILN Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// KILN unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Usage Errors
    // =========================================================================
    /// Invalid argument (bad pointer, size, group count, ...)
    InvalidArgument,
    /// Event or fence used in a way its flags do not allow
    InvalidSynchronizationObject,
    /// Engine group is not available on the device
    UnsupportedEngine,
    /// Feature not supported by the device or configuration
    UnsupportedFeature,
    /// Operation is not valid in the object's current state
    InvalidState,
    /// Object or allocation not found
    NotFound,
    /// Completion has not been observed yet
    NotReady,

    // =========================================================================
    // Resource Exhaustion
    // =========================================================================
    /// Host allocation failed
    OutOfHostMemory,
    /// Device allocation or GPU VA space exhausted
    OutOfDeviceMemory,

    // =========================================================================
    // Driver / OS Failures
    // =========================================================================
    /// Device is lost
    DeviceLost,
    /// Command buffer submission was rejected by the KMD
    SubmissionFailed {
        /// OS error code
        os_code: i32,
    },
    /// A memory-management call into the KMD failed
    KmdCallFailed {
        /// OS error code
        os_code: i32,
    },

    // =========================================================================
    // Invariant Violations
    // =========================================================================
    /// Address range overlaps an existing allocation
    DuplicateAllocation,
    /// Allocation is still referenced by in-flight work
    AllocationStillReferenced,
}

impl Error {
    /// Check if this is a usage error
    pub const fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument
                | Self::InvalidSynchronizationObject
                | Self::UnsupportedEngine
                | Self::UnsupportedFeature
                | Self::InvalidState
                | Self::NotFound
        )
    }

    /// Check if this is an invariant violation
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::DuplicateAllocation | Self::AllocationStillReferenced)
    }

    /// OS error code carried by driver failures
    pub const fn os_code(&self) -> Option<i32> {
        match self {
            Self::SubmissionFailed { os_code } | Self::KmdCallFailed { os_code } => Some(*os_code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Usage
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidSynchronizationObject => write!(f, "invalid synchronization object"),
            Self::UnsupportedEngine => write!(f, "engine group not supported by device"),
            Self::UnsupportedFeature => write!(f, "feature not supported"),
            Self::InvalidState => write!(f, "invalid object state"),
            Self::NotFound => write!(f, "not found"),
            Self::NotReady => write!(f, "not ready"),

            // Resources
            Self::OutOfHostMemory => write!(f, "out of host memory"),
            Self::OutOfDeviceMemory => write!(f, "out of device memory"),

            // Driver
            Self::DeviceLost => write!(f, "device lost"),
            Self::SubmissionFailed { os_code } => {
                write!(f, "submission failed (os error {})", os_code)
            }
            Self::KmdCallFailed { os_code } => write!(f, "KMD call failed (os error {})", os_code),

            // Invariants
            Self::DuplicateAllocation => write!(f, "allocation overlaps an existing range"),
            Self::AllocationStillReferenced => {
                write!(f, "allocation still referenced by in-flight work")
            }
        }
    }
}

// =============================================================================
// OS ERROR
// =============================================================================

/// Raw failure reported by the kernel-mode driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsError(pub i32);

impl OsError {
    /// Get the raw OS error code
    #[inline]
    pub const fn code(self) -> i32 {
        self.0
    }

    /// Interpret as a submission failure
    #[inline]
    pub const fn into_submission_error(self) -> Error {
        Error::SubmissionFailed { os_code: self.0 }
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "os error {}", self.0)
    }
}

impl From<OsError> for Error {
    fn from(e: OsError) -> Self {
        Error::KmdCallFailed { os_code: e.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert!(Error::InvalidArgument.is_usage_error());
        assert!(Error::UnsupportedEngine.is_usage_error());
        assert!(!Error::OutOfHostMemory.is_usage_error());

        assert!(Error::DuplicateAllocation.is_invariant_violation());
        assert!(Error::AllocationStillReferenced.is_invariant_violation());
        assert!(!Error::InvalidArgument.is_invariant_violation());
    }

    #[test]
    fn test_os_error_conversion() {
        let e: Error = OsError(-22).into();
        assert_eq!(e, Error::KmdCallFailed { os_code: -22 });
        assert_eq!(e.os_code(), Some(-22));

        let s = OsError(-5).into_submission_error();
        assert_eq!(s, Error::SubmissionFailed { os_code: -5 });
        assert_eq!(Error::NotFound.os_code(), None);
    }
}
