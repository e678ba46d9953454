//! Status codes returned by the executive
//!
//! Two kinds of outcome leave these primitives:
//!
//! - [`WaitStatus`]: how a blocking wait ended. Being interrupted is a
//!   normal outcome, not an error, and only becomes `EINTR` at the
//!   syscall boundary.
//! - [`KeError`]: a request that could not be carried out.
//!
//! Broken invariants (corrupted queues, a timer interrupt with nothing
//! armed) are never reported here; they panic where they are detected.

use core::fmt;

/// Interrupted system call
pub const EINTR: i32 = 4;
/// Out of memory
pub const ENOMEM: i32 = 12;
/// Device or resource busy
pub const EBUSY: i32 = 16;
/// Invalid argument
pub const EINVAL: i32 = 22;

/// Outcome of a blocking wait
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The wait was satisfied
    Success,
    /// An external signal aborted the wait
    Interrupted,
}

impl WaitStatus {
    /// Check if the wait was aborted
    #[inline]
    pub fn is_interrupted(self) -> bool {
        self == WaitStatus::Interrupted
    }

    /// Syscall return value: `0` or `-EINTR`
    pub fn errno(self) -> i32 {
        match self {
            WaitStatus::Success => 0,
            WaitStatus::Interrupted => -EINTR,
        }
    }
}

/// Failure of an executive request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeError {
    /// A queue could not grow
    NoMemory,
    /// No interrupt vector left at the requested level
    NoInterruptVector,
    /// A configuration key or value was not understood
    InvalidParameter,
}

impl KeError {
    /// Syscall return value for this error (negative errno)
    pub fn errno(self) -> i32 {
        match self {
            KeError::NoMemory => -ENOMEM,
            KeError::NoInterruptVector => -EBUSY,
            KeError::InvalidParameter => -EINVAL,
        }
    }
}

impl fmt::Display for KeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeError::NoMemory => f.write_str("insufficient memory"),
            KeError::NoInterruptVector => f.write_str("no free interrupt vector"),
            KeError::InvalidParameter => f.write_str("invalid parameter"),
        }
    }
}
