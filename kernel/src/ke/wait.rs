//! Timed Wait Support
//!
//! Puts the calling thread to sleep for a fixed interval using a one-shot
//! [`KTimer`] whose DPC wakes it. This is the kernel half of nanosleep.
//!
//! The sleep is interruptible: an external signal ends it early and the
//! unslept part of the interval is reported back. The thread stays
//! pinned to its processor for the duration of the sleep.
//!
//! # NT Compatibility
//! - `ke_delay_execution` - Equivalent to KeDelayExecutionThread (alertable)
//!
//! # Usage
//! ```ignore
//! match ke_delay_execution(&platform, &timers, 100_000) {
//!     DelayStatus::Elapsed => {}
//!     DelayStatus::Interrupted { remaining_us } => restart_later(remaining_us),
//! }
//! ```

use alloc::sync::Arc;

use super::platform::Platform;
use super::status::EINTR;
use super::thread::{ThreadId, WakeupReason};
use super::timer::{KTimer, KTimerQueue};
use crate::hal::CountdownTimer;

/// Outcome of [`ke_delay_execution`]
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayStatus {
    /// The whole interval passed
    Elapsed,
    /// A signal ended the sleep early
    Interrupted {
        /// Unslept part of the interval, rounded up
        remaining_us: u64,
    },
}

impl DelayStatus {
    /// Unslept microseconds (0 once elapsed)
    pub fn remaining_us(self) -> u64 {
        match self {
            DelayStatus::Elapsed => 0,
            DelayStatus::Interrupted { remaining_us } => remaining_us,
        }
    }

    /// Syscall return value: `0` or `-EINTR`
    pub fn errno(self) -> i32 {
        match self {
            DelayStatus::Elapsed => 0,
            DelayStatus::Interrupted { .. } => -EINTR,
        }
    }
}

/// Timer DPC: the sleeper's interval is over
fn ki_wake_sleeper(platform: &Platform<'_>, context: usize) {
    platform
        .scheduler
        .wakeup(ThreadId::from_context(context), WakeupReason::Normal);
}

/// Delay execution of the current thread
///
/// Sleeps for `interval_us` microseconds on `timers`. If a signal
/// arrives first, the timer is cancelled and the remaining time is
/// returned. A signal that races with the expiry counts as elapsed.
///
/// Must be called from thread context.
pub fn ke_delay_execution<H: CountdownTimer>(
    platform: &Platform<'_>,
    timers: &KTimerQueue<H>,
    interval_us: u64,
) -> DelayStatus {
    let Some(thread) = platform.scheduler.current_thread() else {
        panic!("ke_delay_execution without a thread context");
    };

    platform.scheduler.pin(platform.scheduler.current_cpu());

    // Armed only after we are marked asleep, so an expiry that beats the
    // yield is not lost.
    let timer = Arc::new(KTimer::new());
    platform.scheduler.prepare_sleep(true);
    timers.insert(platform, &timer, ki_wake_sleeper, thread.as_context(), interval_us, false);

    let reason = platform.scheduler.yield_thread();

    // Also withdraws an expiry DPC that has not run yet
    let remaining = timers.remove(platform, &timer);
    let status = match (reason, remaining) {
        (WakeupReason::Interrupted, Some(remaining_us)) => {
            log::trace!("ke: {} sleep interrupted, {}us left", thread, remaining_us);
            DelayStatus::Interrupted { remaining_us }
        }
        _ => DelayStatus::Elapsed,
    };

    platform.scheduler.unpin();
    status
}
