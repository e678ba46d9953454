//! I/O readiness notification (poll)
//!
//! A file-like object embeds an [`IoPoll`] and calls [`IoPoll::event`]
//! whenever it becomes readable, writable, fails or hangs up. Threads
//! that want to block until that happens register an [`IoPollWaiter`]
//! with one or more polls and sleep in [`IoPollWaiter::wait`].
//!
//! # Waiter states
//!
//! Each waiter carries a small atomic state machine so that a producer,
//! possibly running in interrupt context, never blocks on a waiter that
//! another CPU is busy with:
//!
//! ```text
//! Idle --add--> Queued --wait--> Waiting --notify--> Claimed --> Woken
//!                  |                                               |
//!                  +---------------notify (not asleep yet)---------+
//! ```
//!
//! A notifier that finds the waiter `Claimed` or `Woken` skips it; the
//! first notifier wins. The waiter moves back to `Queued` once it has
//! consumed the notification.
//!
//! # Usage
//! ```ignore
//! // Reader side
//! let ready = pipe.poll.wait_for_events(&platform, PollEvents::READABLE, || pipe.ready())?;
//!
//! // Producer side, e.g. from the receive interrupt
//! pipe.poll.event(&platform, PollEvents::READABLE);
//! ```

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::hal::InterruptGuard;
use crate::ke::irql::DISPATCH_LEVEL;
use crate::ke::list::KList;
use crate::ke::platform::Platform;
use crate::ke::spinlock::SpinLock;
use crate::ke::status::{KeError, WaitStatus};
use crate::ke::thread::{ThreadId, WakeupReason};

bitflags::bitflags! {
    /// Readiness conditions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollEvents: u32 {
        /// Data can be read without blocking
        const READABLE = 0x001;
        /// Data can be written without blocking
        const WRITABLE = 0x004;
        /// Error condition
        const ERROR = 0x008;
        /// Peer hung up
        const HANGUP = 0x010;
    }
}

impl PollEvents {
    /// Conditions reported to a waiter that asked for `self`
    ///
    /// Errors and hangups are always of interest.
    #[inline]
    pub fn interest(self) -> PollEvents {
        self | PollEvents::ERROR | PollEvents::HANGUP
    }
}

/// Not registered with any poll
const IDLE: u8 = 0;
/// Registered, thread not asleep
const QUEUED: u8 = 1;
/// Thread is asleep waiting for a notification
const WAITING: u8 = 2;
/// A notifier is waking the thread
const CLAIMED: u8 = 3;
/// Notification delivered, not yet consumed
const WOKEN: u8 = 4;

fn state_name(state: u8) -> &'static str {
    match state {
        IDLE => "idle",
        QUEUED => "queued",
        WAITING => "waiting",
        CLAIMED => "claimed",
        WOKEN => "woken",
        _ => "invalid",
    }
}

/// One thread's registration for readiness events
pub struct IoPollWaiter {
    thread: ThreadId,
    requested: PollEvents,
    state: AtomicU8,
    /// Events observed since the last [`take_events`](Self::take_events)
    revents: AtomicU32,
    /// Number of polls this waiter is linked on
    registrations: AtomicU32,
}

impl IoPollWaiter {
    /// Waiter for `thread`, interested in `requested`
    pub fn new(thread: ThreadId, requested: PollEvents) -> Self {
        Self {
            thread,
            requested,
            state: AtomicU8::new(IDLE),
            revents: AtomicU32::new(0),
            registrations: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    #[inline]
    pub fn requested(&self) -> PollEvents {
        self.requested
    }

    /// Events observed so far
    pub fn events(&self) -> PollEvents {
        PollEvents::from_bits_truncate(self.revents.load(Ordering::Acquire))
    }

    /// Events observed so far, clearing them
    pub fn take_events(&self) -> PollEvents {
        PollEvents::from_bits_truncate(self.revents.swap(0, Ordering::AcqRel))
    }

    /// Whether a notification is waiting to be consumed
    pub fn is_notified(&self) -> bool {
        self.state.load(Ordering::Acquire) == WOKEN
    }

    /// Sleep until a registered poll notifies this waiter
    ///
    /// Returns at once if a notification arrived since the last wait.
    /// The sleep is interruptible. Must be called by the waiter's own
    /// thread while it is registered with at least one poll.
    pub fn wait(&self, platform: &Platform<'_>) -> WaitStatus {
        assert_eq!(
            platform.scheduler.current_thread(),
            Some(self.thread),
            "poll wait from a thread that does not own the waiter"
        );

        platform.scheduler.prepare_sleep(true);
        match self
            .state
            .compare_exchange(QUEUED, WAITING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(WOKEN) => {
                // Already notified: cancel the prepared sleep
                platform.scheduler.wakeup(self.thread, WakeupReason::Normal);
                let _ = platform.scheduler.yield_thread();
                self.settle();
                return WaitStatus::Success;
            }
            Err(state) => panic!("poll wait on a {} waiter", state_name(state)),
        }

        let reason = platform.scheduler.yield_thread();
        self.settle();
        match reason {
            WakeupReason::Normal => WaitStatus::Success,
            WakeupReason::Interrupted => WaitStatus::Interrupted,
        }
    }

    /// Deliver a notification; false if another notifier got here first
    fn notify(&self, platform: &Platform<'_>) -> bool {
        loop {
            match self.state.load(Ordering::Acquire) {
                QUEUED => {
                    if self
                        .state
                        .compare_exchange(QUEUED, WOKEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                }
                WAITING => {
                    if self
                        .state
                        .compare_exchange(WAITING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        platform.scheduler.wakeup(self.thread, WakeupReason::Normal);
                        self.state.store(WOKEN, Ordering::Release);
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }

    /// Return to `Queued`, letting a notifier that claimed us finish first
    fn settle(&self) {
        loop {
            match self.state.load(Ordering::Acquire) {
                CLAIMED => core::hint::spin_loop(),
                IDLE | QUEUED => return,
                state => {
                    if self
                        .state
                        .compare_exchange(state, QUEUED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
            }
        }
    }
}

impl fmt::Debug for IoPollWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoPollWaiter")
            .field("thread", &self.thread)
            .field("requested", &self.requested)
            .field("state", &state_name(self.state.load(Ordering::Relaxed)))
            .field("revents", &self.events())
            .finish()
    }
}

/// How [`IoPoll::wait_for_events`] ended
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// These requested conditions hold
    Ready(PollEvents),
    /// An external signal aborted the wait
    Interrupted,
}

/// Notification source embedded in a file-like object
pub struct IoPoll {
    waiters: SpinLock<KList<Arc<IoPollWaiter>>>,
}

impl IoPoll {
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(KList::new()),
        }
    }

    /// Number of registered waiters
    pub fn waiter_count(&self, platform: &Platform<'_>) -> usize {
        let _interrupts = InterruptGuard::disable(platform.hal);
        self.waiters.lock().len()
    }

    /// Register `waiter` for notifications from this poll
    ///
    /// Fails with [`KeError::NoMemory`] if the waiter list cannot grow.
    pub fn add(&self, platform: &Platform<'_>, waiter: &Arc<IoPollWaiter>) -> Result<(), KeError> {
        let _interrupts = InterruptGuard::disable(platform.hal);
        let mut waiters = self.waiters.lock();
        waiters.try_reserve(1).map_err(|_| KeError::NoMemory)?;
        waiters.insert_tail(Arc::clone(waiter));

        waiter.registrations.fetch_add(1, Ordering::AcqRel);
        let _ = waiter
            .state
            .compare_exchange(IDLE, QUEUED, Ordering::AcqRel, Ordering::Acquire);
        Ok(())
    }

    /// Unregister `waiter`
    ///
    /// Returns false if it was not registered here.
    pub fn remove(&self, platform: &Platform<'_>, waiter: &Arc<IoPollWaiter>) -> bool {
        let _interrupts = InterruptGuard::disable(platform.hal);
        let removed = self
            .waiters
            .lock()
            .remove_first(|queued| Arc::ptr_eq(queued, waiter))
            .is_some();

        if removed && waiter.registrations.fetch_sub(1, Ordering::AcqRel) == 1 {
            // No poll can reach it any more
            waiter.state.store(IDLE, Ordering::Release);
        }
        removed
    }

    /// Report `events` to every interested waiter
    ///
    /// Safe from interrupt context: a waiter that another notifier is
    /// already waking is skipped, never waited for. When the calling
    /// thread notified itself from thread context (interrupts enabled,
    /// below DISPATCH_LEVEL) it yields afterwards so the other woken
    /// waiters get to run. A DPC or an interrupt routine never yields.
    pub fn event(&self, platform: &Platform<'_>, events: PollEvents) {
        let interrupts = InterruptGuard::disable(platform.hal);
        let current = platform.scheduler.current_thread();
        let mut notified = 0;
        let mut self_notified = false;

        for waiter in self.waiters.lock().iter() {
            let matched = waiter.requested.interest() & events;
            if matched.is_empty() {
                continue;
            }
            waiter.revents.fetch_or(matched.bits(), Ordering::AcqRel);
            if waiter.notify(platform) {
                notified += 1;
                self_notified |= current == Some(waiter.thread);
            }
        }

        let thread_context =
            interrupts.were_enabled() && platform.hal.current_irql() < DISPATCH_LEVEL;
        drop(interrupts);

        if notified != 0 {
            log::trace!("io: {:?} delivered to {} waiters", events, notified);
        }
        if self_notified && thread_context {
            let _ = platform.scheduler.yield_thread();
        }
    }

    /// Block until `check` reports one of `requested` (or an error or
    /// hangup)
    ///
    /// `check` samples the object's current readiness. It is evaluated
    /// after registering, so an event racing with the check is not lost.
    pub fn wait_for_events<F>(
        &self,
        platform: &Platform<'_>,
        requested: PollEvents,
        mut check: F,
    ) -> Result<PollOutcome, KeError>
    where
        F: FnMut() -> PollEvents,
    {
        let Some(thread) = platform.scheduler.current_thread() else {
            panic!("poll wait without a thread context");
        };

        let waiter = Arc::new(IoPollWaiter::new(thread, requested));
        self.add(platform, &waiter)?;

        let outcome = loop {
            let ready = check() & requested.interest();
            if !ready.is_empty() {
                break PollOutcome::Ready(ready);
            }
            if waiter.wait(platform).is_interrupted() {
                break PollOutcome::Interrupted;
            }
        };

        self.remove(platform, &waiter);
        Ok(outcome)
    }
}

impl Default for IoPoll {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IoPoll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.waiters.try_lock() {
            Some(waiters) => f.debug_struct("IoPoll").field("waiters", &waiters.len()).finish(),
            None => f.write_str("IoPoll { <locked> }"),
        }
    }
}
