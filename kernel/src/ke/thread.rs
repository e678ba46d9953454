//! Thread identity as seen by the executive
//!
//! Threads (KTHREAD) belong to the scheduler. The synchronization
//! primitives never hold a thread object; they queue its [`ThreadId`]
//! and hand that id back to the scheduler when it is time to wake it.

use core::fmt;

/// Logical processor number
pub type CpuId = u32;

/// The boot processor
pub const BOOT_PROCESSOR: CpuId = 0;

/// Scheduler-assigned thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl ThreadId {
    /// Pack the id into a DPC/timer context word
    #[inline]
    pub const fn as_context(self) -> usize {
        self.0 as usize
    }

    /// Recover an id packed with [`ThreadId::as_context`]
    #[inline]
    pub const fn from_context(context: usize) -> Self {
        ThreadId(context as u32)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

/// Why a sleeping thread was made runnable again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WakeupReason {
    /// The object it waited for was signaled
    Normal = 0,
    /// An external signal aborted an interruptible sleep
    Interrupted = 1,
}
