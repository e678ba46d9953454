//! Scheduler interface consumed by the executive
//!
//! Run queues and context switching live in the scheduler proper. The
//! primitives in `ke` only need the narrow set of operations below to
//! put the calling thread to sleep and to make other threads runnable.
//!
//! # Sleep protocol
//!
//! Blocking is always a two-step sequence:
//!
//! 1. [`Scheduler::prepare_sleep`] while still holding the lock that
//!    protects the wait queue the thread was just put on;
//! 2. drop the lock, then [`Scheduler::yield_thread`].
//!
//! A [`Scheduler::wakeup`] that lands between the two steps must not be
//! lost: the following `yield_thread` returns immediately with the
//! reason passed to `wakeup`. A `wakeup` for a thread that is not
//! preparing to sleep or sleeping is ignored.

use super::prcb::KPrcb;
use super::thread::{CpuId, ThreadId, WakeupReason};

/// Operations the executive needs from the scheduler
pub trait Scheduler: Sync {
    /// Thread running on this CPU, or `None` before threading is up
    fn current_thread(&self) -> Option<ThreadId>;

    /// Control block of the CPU executing the caller
    fn current_processor(&self) -> &KPrcb;

    /// Control block of processor `number`, if it exists
    fn processor(&self, number: CpuId) -> Option<&KPrcb>;

    /// Whether this CPU is running its idle thread
    fn is_idle(&self) -> bool;

    /// Mark the current thread as going to sleep
    fn prepare_sleep(&self, interruptible: bool);

    /// Give up the CPU
    ///
    /// After [`prepare_sleep`](Scheduler::prepare_sleep) this suspends
    /// until the thread is woken and returns why. Without it, this is a
    /// plain voluntary yield and returns [`WakeupReason::Normal`].
    fn yield_thread(&self) -> WakeupReason;

    /// Make a sleeping thread runnable
    fn wakeup(&self, thread: ThreadId, reason: WakeupReason);

    /// Keep the current thread on processor `cpu` until [`unpin`](Scheduler::unpin)
    fn pin(&self, cpu: CpuId);

    /// Undo [`pin`](Scheduler::pin)
    fn unpin(&self);

    /// Number of the CPU executing the caller
    fn current_cpu(&self) -> CpuId {
        self.current_processor().number()
    }
}
