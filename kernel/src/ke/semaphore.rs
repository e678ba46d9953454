//! Kernel Semaphore Implementation (KSEMAPHORE)
//!
//! A semaphore is a synchronization object that maintains a count.
//! Threads acquire it by decrementing the count; when the count drops
//! below zero the caller blocks until another thread signals. A negative
//! count is the number of blocked threads.
//!
//! Waiters are woken strictly in the order they blocked: a new waiter is
//! pushed at the head of the wait list and `signal` takes the tail.
//!
//! # Usage
//! ```ignore
//! static SEM: KSemaphore = KSemaphore::new(3);
//!
//! // Thread acquires (decrements count)
//! SEM.wait(&platform, false);  // count: 3 -> 2
//!
//! // Thread releases (increments count)
//! SEM.signal(&platform);       // count: 2 -> 3
//! ```
//!
//! # NT Compatibility
//! Equivalent to NT's KSEMAPHORE / KeWaitForSingleObject / KeReleaseSemaphore

use core::fmt;

use super::list::KList;
use super::platform::Platform;
use super::spinlock::SpinLock;
use super::status::WaitStatus;
use super::thread::{ThreadId, WakeupReason};
use crate::hal::InterruptGuard;

struct SemaphoreState {
    /// Available units; negative means that many waiters
    count: i32,

    /// Blocked threads, most recent at the head
    waiters: KList<ThreadId>,
}

/// Kernel Semaphore
///
/// Equivalent to NT's KSEMAPHORE
pub struct KSemaphore {
    inner: SpinLock<SemaphoreState>,
}

impl KSemaphore {
    /// Create a semaphore holding `count` units
    pub const fn new(count: i32) -> Self {
        Self {
            inner: SpinLock::new(SemaphoreState {
                count,
                waiters: KList::new(),
            }),
        }
    }

    /// Get the current count
    pub fn count(&self, platform: &Platform<'_>) -> i32 {
        let _interrupts = InterruptGuard::disable(platform.hal);
        self.inner.lock().count
    }

    /// Number of blocked threads
    pub fn waiter_count(&self, platform: &Platform<'_>) -> usize {
        let _interrupts = InterruptGuard::disable(platform.hal);
        self.inner.lock().waiters.len()
    }

    /// Wait (acquire) the semaphore
    ///
    /// Decrements the count; if no unit was available, blocks until a
    /// [`signal`](Self::signal) hands one over. An interruptible wait can
    /// be aborted by an external signal, in which case the decrement is
    /// undone and [`WaitStatus::Interrupted`] is returned.
    ///
    /// Before threading is up there is nobody to sleep, so the caller
    /// spins on [`test`](Self::test) instead.
    pub fn wait(&self, platform: &Platform<'_>, interruptible: bool) -> WaitStatus {
        let Some(thread) = platform.scheduler.current_thread() else {
            while !self.test(platform) {
                core::hint::spin_loop();
            }
            return WaitStatus::Success;
        };

        let interrupts = InterruptGuard::disable(platform.hal);
        let mut inner = self.inner.lock();
        inner.count -= 1;
        if inner.count >= 0 {
            return WaitStatus::Success;
        }

        let handle = inner.waiters.insert_head(thread);
        platform.scheduler.prepare_sleep(interruptible);
        drop(inner);
        drop(interrupts);

        match platform.scheduler.yield_thread() {
            WakeupReason::Normal => WaitStatus::Success,
            WakeupReason::Interrupted => {
                let _interrupts = InterruptGuard::disable(platform.hal);
                let mut inner = self.inner.lock();
                inner.count += 1;
                // A signal that already dequeued us left its unit in count
                inner.waiters.remove_entry(handle);
                log::trace!("ke: {} interrupted in semaphore wait", thread);
                WaitStatus::Interrupted
            }
        }
    }

    /// Try to acquire the semaphore without blocking
    ///
    /// Returns true if a unit was taken, false if none was available.
    /// Safe against a [`signal`](Self::signal) from interrupt context on
    /// the same processor.
    pub fn test(&self, platform: &Platform<'_>) -> bool {
        let _interrupts = InterruptGuard::disable(platform.hal);
        let mut inner = self.inner.lock();
        if inner.count > 0 {
            inner.count -= 1;
            true
        } else {
            false
        }
    }

    /// Release one unit, waking the longest-waiting thread if any
    pub fn signal(&self, platform: &Platform<'_>) {
        let _interrupts = InterruptGuard::disable(platform.hal);
        let mut inner = self.inner.lock();
        inner.count += 1;
        if let Some(thread) = inner.waiters.remove_tail() {
            platform.scheduler.wakeup(thread, WakeupReason::Normal);
        }
    }

    /// Release `release_count` units
    ///
    /// Equivalent to KeReleaseSemaphore
    ///
    /// # Returns
    /// The previous count
    pub fn release(&self, platform: &Platform<'_>, release_count: u32) -> i32 {
        let _interrupts = InterruptGuard::disable(platform.hal);
        let mut inner = self.inner.lock();
        let previous = inner.count;
        for _ in 0..release_count {
            inner.count += 1;
            if let Some(thread) = inner.waiters.remove_tail() {
                platform.scheduler.wakeup(thread, WakeupReason::Normal);
            }
        }
        previous
    }
}

impl Default for KSemaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for KSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(inner) = self.inner.try_lock() else {
            return f.write_str("KSemaphore { <locked> }");
        };
        f.debug_struct("KSemaphore")
            .field("count", &inner.count)
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}
