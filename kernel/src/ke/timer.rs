//! Kernel Timer Implementation (KTIMER)
//!
//! A [`KTimerQueue`] is a deadline queue bound to one hardware
//! [`CountdownTimer`]. Timers ([`KTimer`]) are kept sorted by their
//! absolute due tick, and the countdown is always armed for the earliest
//! one. When it fires, the timer interrupt pops that entry and queues
//! the entry's DPC; timer routines never run in the interrupt itself.
//!
//! Time is kept in hardware ticks. `current_tick` only advances at two
//! points: when a queue operation stops the countdown and folds in the
//! elapsed ticks, and when the timer interrupt jumps it to the due tick
//! of the entry that just expired. Periodic timers are rescheduled from
//! their own due tick, so interrupt latency never accumulates as drift.
//!
//! # Usage
//! ```ignore
//! let timer = Arc::new(KTimer::new());
//!
//! // One-shot, 1000us from now
//! queue.insert(&platform, &timer, my_routine, context, 1000, false);
//!
//! // Periodic, every 500us
//! queue.insert(&platform, &timer, my_routine, context, 500, true);
//! ```
//!
//! # NT Compatibility
//! Equivalent to NT's KTIMER / KeSetTimerEx / KeCancelTimer

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::dpc::{ke_insert_queue_dpc, ke_remove_queue_dpc, DpcRoutine, KDpc};
use super::irql::CLOCK_LEVEL;
use super::list::{KList, ListHandle};
use super::platform::Platform;
use super::spinlock::SpinLock;
use crate::hal::{CountdownTimer, IrqlGuard};

/// Mutable part of a timer, guarded by its lock
struct TimerState {
    /// Absolute expiration time in ticks
    due_tick: u64,

    /// Period for periodic timers (0 = one-shot)
    period_us: u64,

    /// Routine queued as a DPC on expiration
    routine: Option<DpcRoutine>,

    /// Context passed to the routine
    context: usize,

    /// Owning queue and entry, while inserted
    queued: Option<(usize, ListHandle)>,

    /// One-shot timer has expired
    fired: bool,
}

/// Kernel Timer object
///
/// Equivalent to NT's KTIMER. Belongs to at most one [`KTimerQueue`] at
/// a time.
pub struct KTimer {
    state: SpinLock<TimerState>,

    /// DPC queued when the timer expires
    dpc: Arc<KDpc>,
}

impl KTimer {
    /// Create a new idle timer
    pub fn new() -> Self {
        Self {
            state: SpinLock::new(TimerState {
                due_tick: 0,
                period_us: 0,
                routine: None,
                context: 0,
                queued: None,
                fired: false,
            }),
            dpc: Arc::new(KDpc::new()),
        }
    }

    /// Get the due time (absolute tick)
    pub fn due_tick(&self, platform: &Platform<'_>) -> u64 {
        let _irql = IrqlGuard::raise(platform.hal, CLOCK_LEVEL);
        self.state.lock().due_tick
    }

    /// Get the period (0 = one-shot)
    pub fn period_us(&self, platform: &Platform<'_>) -> u64 {
        let _irql = IrqlGuard::raise(platform.hal, CLOCK_LEVEL);
        self.state.lock().period_us
    }

    /// Check if the timer is currently in a queue
    pub fn is_set(&self, platform: &Platform<'_>) -> bool {
        let _irql = IrqlGuard::raise(platform.hal, CLOCK_LEVEL);
        self.state.lock().queued.is_some()
    }

    /// Check if a one-shot timer has expired
    pub fn has_fired(&self, platform: &Platform<'_>) -> bool {
        let _irql = IrqlGuard::raise(platform.hal, CLOCK_LEVEL);
        self.state.lock().fired
    }

    /// DPC that delivers this timer's expirations
    #[inline]
    pub fn dpc(&self) -> &Arc<KDpc> {
        &self.dpc
    }
}

impl Default for KTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(state) = self.state.try_lock() else {
            return f.write_str("KTimer { <locked> }");
        };
        f.debug_struct("KTimer")
            .field("due_tick", &state.due_tick)
            .field("period_us", &state.period_us)
            .field("set", &state.queued.is_some())
            .field("fired", &state.fired)
            .finish()
    }
}

/// Timer queue statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerQueueStats {
    /// Number of queued timers
    pub active_count: usize,
    /// Number of periodic timers
    pub periodic_count: usize,
    /// Number of one-shot timers
    pub oneshot_count: usize,
    /// Earliest expiration, in microseconds after `current_tick`
    pub next_expiration_us: Option<u64>,
    /// Tick count as of the last queue update
    pub current_tick: u64,
    /// Whether the countdown is armed
    pub running: bool,
}

/// Source of [`KTimerQueue`] identities
static NEXT_QUEUE_ID: AtomicUsize = AtomicUsize::new(1);

/// Queue state, guarded by the queue lock
///
/// Timer states are only locked with this lock held, at CLOCK_LEVEL.
struct TimerQueueState {
    current_tick: u64,
    running: bool,
    timers: KList<Arc<KTimer>>,
}

impl TimerQueueState {
    /// Pause the countdown and account for the ticks it consumed
    fn sync_with_hardware<H: CountdownTimer>(&mut self, hardware: &H) {
        if self.running {
            self.current_tick += hardware.stop();
            self.running = false;
        }
    }

    /// Arm the countdown for the earliest timer, or go idle
    fn rearm<H: CountdownTimer>(&mut self, hardware: &H) {
        match self.timers.head() {
            Some(head) => {
                let due_tick = head.state.lock().due_tick;
                hardware.arm(due_tick.saturating_sub(self.current_tick));
                self.running = true;
            }
            None => self.running = false,
        }
    }

    /// Sorted insert; equal deadlines keep arrival order
    fn enqueue(&mut self, owner: usize, timer: &Arc<KTimer>, due_tick: u64) {
        let handle = self
            .timers
            .insert_before_first(Arc::clone(timer), |queued| queued.state.lock().due_tick > due_tick);
        timer.state.lock().queued = Some((owner, handle));
    }

    /// Unlink `timer` if it is queued here
    fn detach(&mut self, owner: usize, timer: &KTimer) -> bool {
        let Some((queue, handle)) = timer.state.lock().queued.take() else {
            return false;
        };
        assert_eq!(queue, owner, "timer belongs to another timer queue");
        let removed = self.timers.remove_entry(handle);
        assert!(removed.is_some(), "set timer missing from its queue");
        true
    }
}

/// Deadline queue bound to a hardware countdown
pub struct KTimerQueue<H> {
    /// Stamped on queued timers; stays put when the queue is moved
    id: usize,
    ticks_per_us: u64,
    hardware: H,
    inner: SpinLock<TimerQueueState>,
}

impl<H: CountdownTimer> KTimerQueue<H> {
    /// Create an idle queue for a countdown running at `ticks_per_us`
    pub fn new(ticks_per_us: u64, hardware: H) -> Self {
        assert!(ticks_per_us > 0, "timer tick rate must be non-zero");
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            ticks_per_us,
            hardware,
            inner: SpinLock::new(TimerQueueState {
                current_tick: 0,
                running: false,
                timers: KList::new(),
            }),
        }
    }

    /// The countdown this queue drives
    #[inline]
    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    /// Countdown ticks per microsecond
    #[inline]
    pub fn ticks_per_us(&self) -> u64 {
        self.ticks_per_us
    }

    /// Tick count as of the last queue update
    pub fn current_tick(&self, platform: &Platform<'_>) -> u64 {
        let _irql = IrqlGuard::raise(platform.hal, CLOCK_LEVEL);
        self.inner.lock().current_tick
    }

    /// Number of queued timers
    pub fn len(&self, platform: &Platform<'_>) -> usize {
        let _irql = IrqlGuard::raise(platform.hal, CLOCK_LEVEL);
        self.inner.lock().timers.len()
    }

    /// Whether no timer is queued
    pub fn is_empty(&self, platform: &Platform<'_>) -> bool {
        self.len(platform) == 0
    }

    /// Set a timer to expire `delay_us` from now
    ///
    /// Equivalent to KeSetTimerEx. A repeating timer is rescheduled every
    /// `delay_us` after each expiration; a zero delay is always one-shot.
    /// On expiration `routine(context)` is queued as a DPC.
    ///
    /// # Returns
    /// true if the timer was already in the queue (was reset)
    pub fn insert(
        &self,
        platform: &Platform<'_>,
        timer: &Arc<KTimer>,
        routine: DpcRoutine,
        context: usize,
        delay_us: u64,
        repeating: bool,
    ) -> bool {
        let _irql = IrqlGuard::raise(platform.hal, CLOCK_LEVEL);
        let mut inner = self.inner.lock();
        inner.sync_with_hardware(&self.hardware);

        let was_set = inner.detach(self.key(), timer);
        let due_tick = inner.current_tick.saturating_add(self.us_to_ticks(delay_us));
        {
            let mut state = timer.state.lock();
            state.due_tick = due_tick;
            state.period_us = if repeating { delay_us } else { 0 };
            if repeating && delay_us == 0 {
                log::warn!("ke: zero-period timer set as one-shot");
            }
            state.routine = Some(routine);
            state.context = context;
            state.fired = false;
        }
        inner.enqueue(self.key(), timer, due_tick);
        inner.rearm(&self.hardware);

        log::trace!(
            "ke: timer set for tick {} (now {}, {} queued)",
            due_tick,
            inner.current_tick,
            inner.timers.len()
        );
        was_set
    }

    /// Cancel a pending timer
    ///
    /// Equivalent to KeCancelTimer. Detaches the timer if it has not
    /// expired yet and returns the microseconds that were left, rounded
    /// up. Returns `None` when the timer already fired or was never set.
    /// In both cases an expiration DPC that is still pending is
    /// withdrawn, so the routine does not run after this returns unless
    /// it was already running.
    pub fn remove(&self, platform: &Platform<'_>, timer: &KTimer) -> Option<u64> {
        let remaining = {
            let _irql = IrqlGuard::raise(platform.hal, CLOCK_LEVEL);
            let mut inner = self.inner.lock();
            let queued = timer.state.lock().queued.is_some();
            if queued {
                inner.sync_with_hardware(&self.hardware);
                inner.detach(self.key(), timer);
                let due_tick = timer.state.lock().due_tick;
                let remaining_ticks = due_tick.saturating_sub(inner.current_tick);
                inner.rearm(&self.hardware);
                Some(remaining_ticks.div_ceil(self.ticks_per_us))
            } else {
                None
            }
        };

        if ke_remove_queue_dpc(platform, &timer.dpc) {
            log::debug!("ke: cancelled timer had an undelivered expiration");
        }
        remaining
    }

    /// Timer interrupt service routine
    ///
    /// Runs at CLOCK_LEVEL when the countdown reaches zero. Expires the
    /// earliest timer, queues its DPC and re-arms for the next one.
    pub fn ki_timer_interrupt(&self, platform: &Platform<'_>) {
        let mut inner = self.inner.lock();
        // One-shot countdown: it is idle now that it fired
        inner.running = false;

        let Some(timer) = inner.timers.remove_head() else {
            panic!("timer interrupt with an empty timer queue");
        };

        let (routine, context, due_tick, period_us) = {
            let mut state = timer.state.lock();
            state.queued = None;
            state.fired = state.period_us == 0;
            (state.routine, state.context, state.due_tick, state.period_us)
        };

        // Advance to the deadline itself, not to a sampled counter value
        inner.current_tick = inner.current_tick.max(due_tick);

        if period_us != 0 {
            let next_tick = due_tick.saturating_add(self.us_to_ticks(period_us));
            timer.state.lock().due_tick = next_tick;
            inner.enqueue(self.key(), &timer, next_tick);
        }

        if let Some(routine) = routine {
            ke_insert_queue_dpc(platform, &timer.dpc, routine, context);
        }

        inner.rearm(&self.hardware);
    }

    /// Get timer queue statistics
    pub fn stats(&self, platform: &Platform<'_>) -> TimerQueueStats {
        let _irql = IrqlGuard::raise(platform.hal, CLOCK_LEVEL);
        let inner = self.inner.lock();

        let mut periodic_count = 0;
        let mut oneshot_count = 0;
        for timer in inner.timers.iter() {
            if timer.state.lock().period_us > 0 {
                periodic_count += 1;
            } else {
                oneshot_count += 1;
            }
        }

        // First timer is the next to expire (list is sorted)
        let next_expiration_us = inner.timers.head().map(|timer| {
            let due_tick = timer.state.lock().due_tick;
            due_tick
                .saturating_sub(inner.current_tick)
                .div_ceil(self.ticks_per_us)
        });

        TimerQueueStats {
            active_count: inner.timers.len(),
            periodic_count,
            oneshot_count,
            next_expiration_us,
            current_tick: inner.current_tick,
            running: inner.running,
        }
    }

    #[inline]
    fn us_to_ticks(&self, us: u64) -> u64 {
        us.saturating_mul(self.ticks_per_us)
    }

    /// Identity stamped on timers queued here
    #[inline]
    fn key(&self) -> usize {
        self.id
    }
}
