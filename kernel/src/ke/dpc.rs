//! Deferred Procedure Call (DPC) Implementation
//!
//! DPCs allow code running at high IRQL (interrupt handlers) to defer
//! work to a lower IRQL (DISPATCH_LEVEL). This is essential because
//! interrupt handlers should complete quickly and not do extensive processing.
//!
//! Each processor owns a DPC queue in its [`KPrcb`](super::prcb::KPrcb).
//! Queuing a DPC pushes it at the head of the current processor's queue
//! and requests that processor's DPC software interrupt. The interrupt
//! drains the whole queue, most recently queued first, running each
//! routine with hardware interrupts enabled.
//!
//! The queue links live inside the DPC objects themselves, like NT's
//! `DpcListEntry`, so queuing never allocates. That keeps
//! [`ke_insert_queue_dpc`] usable from the timer interrupt.
//!
//! # Usage
//! ```ignore
//! let dpc = Arc::new(KDpc::new());
//!
//! // Queue from interrupt handler
//! ke_insert_queue_dpc(&platform, &dpc, my_dpc_routine, context);
//! ```
//!
//! # NT Compatibility
//! Equivalent to NT's KDPC / KeInsertQueueDpc / KeRemoveQueueDpc

use alloc::sync::{Arc, Weak};
use core::fmt;
use core::sync::atomic::Ordering;

use super::platform::Platform;
use super::prcb::KPrcb;
use super::spinlock::SpinLock;
use super::thread::CpuId;
use crate::hal::InterruptGuard;

/// DPC routine function signature
///
/// # Arguments
/// * `platform` - Services of the processor running the DPC
/// * `context` - Context word given when the DPC was queued
pub type DpcRoutine = fn(platform: &Platform<'_>, context: usize);

/// Mutable part of a DPC, guarded by its lock
struct DpcState {
    /// The routine to call when DPC fires
    routine: Option<DpcRoutine>,

    /// Context passed to routine
    context: usize,

    /// Processor whose queue holds this DPC, while queued
    queued_on: Option<CpuId>,
}

/// Queue links of a DPC (DpcListEntry)
///
/// Only touched with the owning processor's queue lock held.
struct DpcLinks {
    /// Next (older) entry; the queue owns its entries through these
    flink: Option<Arc<KDpc>>,
    /// Previous (newer) entry, `None` at the head
    blink: Option<Weak<KDpc>>,
}

/// Kernel Deferred Procedure Call object
///
/// Equivalent to NT's KDPC structure. A queued DPC is kept alive by its
/// processor queue, so dropping the caller's `Arc` while it is pending
/// is harmless.
pub struct KDpc {
    state: SpinLock<DpcState>,
    links: SpinLock<DpcLinks>,
}

impl KDpc {
    /// Create a new, unqueued DPC
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(DpcState {
                routine: None,
                context: 0,
                queued_on: None,
            }),
            links: SpinLock::new(DpcLinks {
                flink: None,
                blink: None,
            }),
        }
    }

    /// Check if this DPC is currently queued
    pub fn is_queued(&self, platform: &Platform<'_>) -> bool {
        self.queued_processor(platform).is_some()
    }

    /// Processor whose queue holds this DPC
    pub fn queued_processor(&self, platform: &Platform<'_>) -> Option<CpuId> {
        let _interrupts = InterruptGuard::disable(platform.hal);
        self.state.lock().queued_on
    }
}

impl Default for KDpc {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KDpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_lock() {
            Some(state) => f
                .debug_struct("KDpc")
                .field("context", &state.context)
                .field("queued_on", &state.queued_on)
                .finish(),
            None => f.write_str("KDpc { <locked> }"),
        }
    }
}

/// Per-processor DPC list, threaded through the queued DPCs
pub(crate) struct DpcQueue {
    head: Option<Arc<KDpc>>,
    depth: usize,
}

impl DpcQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            depth: 0,
        }
    }

    #[inline]
    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    fn push_head(&mut self, dpc: Arc<KDpc>) {
        if let Some(head) = &self.head {
            head.links.lock().blink = Some(Arc::downgrade(&dpc));
        }
        {
            let mut links = dpc.links.lock();
            links.flink = self.head.take();
            links.blink = None;
        }
        self.head = Some(dpc);
        self.depth += 1;
    }

    fn pop_head(&mut self) -> Option<Arc<KDpc>> {
        let dpc = self.head.take()?;
        let flink = dpc.links.lock().flink.take();
        if let Some(next) = &flink {
            next.links.lock().blink = None;
        }
        self.head = flink;
        self.depth -= 1;
        Some(dpc)
    }

    /// Unlink `dpc`, which must be on this queue
    fn unlink(&mut self, dpc: &KDpc) {
        let (flink, blink) = {
            let mut links = dpc.links.lock();
            (links.flink.take(), links.blink.take())
        };
        if let Some(next) = &flink {
            next.links.lock().blink = blink.clone();
        }

        let this = match blink {
            None => core::mem::replace(&mut self.head, flink),
            Some(prev) => {
                let Some(prev) = prev.upgrade() else {
                    panic!("queued DPC linked behind a freed DPC");
                };
                let mut links = prev.links.lock();
                core::mem::replace(&mut links.flink, flink)
            }
        };
        assert!(
            this.is_some_and(|this| core::ptr::eq(Arc::as_ptr(&this), dpc)),
            "DPC queue links corrupted"
        );
        self.depth -= 1;
    }
}

/// Queue the DPC on the current processor
///
/// Equivalent to KeInsertQueueDpc. Never allocates.
///
/// # Returns
/// true if the DPC was queued, false if it was already queued (in which
/// case the routine and context of the pending request are kept)
pub fn ke_insert_queue_dpc(
    platform: &Platform<'_>,
    dpc: &Arc<KDpc>,
    routine: DpcRoutine,
    context: usize,
) -> bool {
    let _interrupts = InterruptGuard::disable(platform.hal);
    let prcb = platform.prcb();

    {
        let mut queue = prcb.dpc_queue.lock();
        let mut state = dpc.state.lock();
        if state.queued_on.is_some() {
            return false;
        }

        state.routine = Some(routine);
        state.context = context;
        state.queued_on = Some(prcb.number());
        queue.push_head(Arc::clone(dpc));
    }

    match prcb.dpc_vector() {
        Some(vector) => platform.hal.request_software_interrupt(vector),
        // Early boot: stays queued until the processor is initialized
        // and something drains it.
        None => log::trace!("ke: DPC queued on cpu {} before DPC interrupt setup", prcb.number()),
    }
    true
}

/// Remove DPC from queue (cancel pending DPC)
///
/// Equivalent to KeRemoveQueueDpc. Works from any processor.
///
/// # Returns
/// true if the DPC was removed, false if it wasn't queued
pub fn ke_remove_queue_dpc(platform: &Platform<'_>, dpc: &KDpc) -> bool {
    let _interrupts = InterruptGuard::disable(platform.hal);

    let Some(cpu) = dpc.state.lock().queued_on else {
        return false;
    };
    let Some(prcb) = platform.scheduler.processor(cpu) else {
        panic!("DPC queued on unknown processor {}", cpu);
    };

    let mut queue = prcb.dpc_queue.lock();
    let mut state = dpc.state.lock();

    // The drain may have taken it between the two lookups
    if state.queued_on != Some(cpu) {
        return false;
    }
    queue.unlink(dpc);
    state.queued_on = None;
    true
}

/// Dequeue the next DPC of `prcb`
///
/// The DPC is marked unqueued before the queue lock is dropped, so a
/// concurrent [`ke_remove_queue_dpc`] either unlinks it first or finds
/// it gone. Interrupts must be disabled.
fn ki_next_dpc(prcb: &KPrcb) -> Option<(Option<DpcRoutine>, usize)> {
    let mut queue = prcb.dpc_queue.lock();
    let dpc = queue.pop_head()?;
    let mut state = dpc.state.lock();
    assert!(
        state.queued_on.take().is_some(),
        "retiring a DPC that is not marked queued"
    );
    Some((state.routine, state.context))
}

/// Retire (execute) all pending DPCs on the current processor
///
/// Equivalent to KiRetireDpcList. This is the routine behind the DPC
/// software interrupt. Entries are popped from the head, so within one
/// drain the most recently queued DPC runs first. Interrupts are enabled
/// around each routine and disabled again between entries; a drain that
/// finds another drain already active on this processor returns at once
/// and leaves the work to the outer one.
pub fn ki_retire_dpc_list(platform: &Platform<'_>) {
    let prcb = platform.prcb();
    let _interrupts = InterruptGuard::disable(platform.hal);

    if prcb.dpc_routine_active.swap(true, Ordering::Acquire) {
        return;
    }

    while let Some((routine, context)) = ki_next_dpc(prcb) {
        prcb.dpc_count.fetch_add(1, Ordering::Relaxed);

        if let Some(routine) = routine {
            platform.hal.set_interrupts(true);
            routine(platform, context);
            platform.hal.set_interrupts(false);
        }
    }

    prcb.dpc_routine_active.store(false, Ordering::Release);
}

/// Check if there are pending DPCs on the current processor
#[inline]
pub fn ki_check_dpc_pending(platform: &Platform<'_>) -> bool {
    platform.prcb().dpc_queue_depth(platform) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::Hal;
    use crate::ke::prcb::ki_initialize_processor;
    use crate::ke::scheduler::Scheduler;
    use crate::testing::{FakeHal, FakeScheduler};
    use core::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;
    use std::thread;
    use std::vec::Vec;

    static ONCE_RUNS: AtomicUsize = AtomicUsize::new(0);
    static ORDER: Mutex<Vec<usize>> = Mutex::new(Vec::new());
    static MIDDLE_ORDER: Mutex<Vec<usize>> = Mutex::new(Vec::new());
    static INTERRUPTS_DURING_ROUTINE: AtomicUsize = AtomicUsize::new(0);
    static REMOVED_RUNS: AtomicUsize = AtomicUsize::new(0);
    static RACED_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn count_once(_platform: &Platform<'_>, _context: usize) {
        ONCE_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    fn record_order(_platform: &Platform<'_>, context: usize) {
        ORDER.lock().unwrap().push(context);
    }

    fn record_middle(_platform: &Platform<'_>, context: usize) {
        MIDDLE_ORDER.lock().unwrap().push(context);
    }

    fn check_interrupts(platform: &Platform<'_>, _context: usize) {
        // Re-enabled for the routine: set_interrupts(true) reports
        // the previous (enabled) state.
        if platform.hal.set_interrupts(true) {
            INTERRUPTS_DURING_ROUTINE.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn count_removed(_platform: &Platform<'_>, _context: usize) {
        REMOVED_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    fn count_raced(_platform: &Platform<'_>, _context: usize) {
        RACED_RUNS.fetch_add(1, Ordering::SeqCst);
    }

    fn ignore(_platform: &Platform<'_>, _context: usize) {}

    #[test]
    fn test_double_queue_runs_once() {
        let hal = FakeHal::new();
        let scheduler = FakeScheduler::new(1);
        let platform = Platform::new(&hal, &scheduler);
        ki_initialize_processor(&platform, platform.prcb()).unwrap();

        let dpc = Arc::new(KDpc::new());
        assert!(ke_insert_queue_dpc(&platform, &dpc, count_once, 1));
        assert!(!ke_insert_queue_dpc(&platform, &dpc, count_once, 2));
        assert!(dpc.is_queued(&platform));
        assert_eq!(platform.prcb().dpc_queue_depth(&platform), 1);

        hal.deliver_pending(&platform);
        assert_eq!(ONCE_RUNS.load(Ordering::SeqCst), 1);
        assert!(!dpc.is_queued(&platform));
        assert_eq!(platform.prcb().dpc_count(), 1);

        // Draining again finds nothing
        hal.deliver_pending(&platform);
        ki_retire_dpc_list(&platform);
        assert_eq!(ONCE_RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queue_state_is_read_with_interrupts_masked() {
        let hal = FakeHal::new();
        let scheduler = FakeScheduler::new(1);
        let platform = Platform::new(&hal, &scheduler);

        let dpc = Arc::new(KDpc::new());
        ke_insert_queue_dpc(&platform, &dpc, ignore, 0);

        let before = hal.masks();
        assert!(dpc.is_queued(&platform));
        assert_eq!(dpc.queued_processor(&platform), Some(0));
        assert!(ki_check_dpc_pending(&platform));
        assert_eq!(hal.masks(), before + 3);
        assert!(hal.interrupts_enabled());
        assert!(ke_remove_queue_dpc(&platform, &dpc));
    }

    #[test]
    fn test_drain_is_lifo_within_one_trigger() {
        let hal = FakeHal::new();
        let scheduler = FakeScheduler::new(1);
        let platform = Platform::new(&hal, &scheduler);
        ki_initialize_processor(&platform, platform.prcb()).unwrap();

        let dpcs: Vec<_> = (0..4).map(|_| Arc::new(KDpc::new())).collect();
        for (index, dpc) in dpcs.iter().enumerate() {
            assert!(ke_insert_queue_dpc(&platform, dpc, record_order, index));
        }
        assert!(ki_check_dpc_pending(&platform));

        ki_retire_dpc_list(&platform);
        assert_eq!(*ORDER.lock().unwrap(), [3, 2, 1, 0]);
        assert!(!ki_check_dpc_pending(&platform));
    }

    #[test]
    fn test_remove_from_middle_keeps_queue_linked() {
        let hal = FakeHal::new();
        let scheduler = FakeScheduler::new(1);
        let platform = Platform::new(&hal, &scheduler);
        ki_initialize_processor(&platform, platform.prcb()).unwrap();

        let dpcs: Vec<_> = (0..5).map(|_| Arc::new(KDpc::new())).collect();
        for (index, dpc) in dpcs.iter().enumerate() {
            ke_insert_queue_dpc(&platform, dpc, record_middle, index);
        }

        // Head, an inner entry and the tail
        assert!(ke_remove_queue_dpc(&platform, &dpcs[4]));
        assert!(ke_remove_queue_dpc(&platform, &dpcs[2]));
        assert!(ke_remove_queue_dpc(&platform, &dpcs[0]));
        assert_eq!(platform.prcb().dpc_queue_depth(&platform), 2);

        // Requeued entries go back to the head
        ke_insert_queue_dpc(&platform, &dpcs[2], record_middle, 2);
        ki_retire_dpc_list(&platform);
        assert_eq!(*MIDDLE_ORDER.lock().unwrap(), [2, 3, 1]);
        assert!(dpcs.iter().all(|dpc| !dpc.is_queued(&platform)));
    }

    #[test]
    fn test_routine_runs_with_interrupts_enabled() {
        let hal = FakeHal::new();
        let scheduler = FakeScheduler::new(1);
        let platform = Platform::new(&hal, &scheduler);
        ki_initialize_processor(&platform, platform.prcb()).unwrap();

        let dpc = Arc::new(KDpc::new());
        ke_insert_queue_dpc(&platform, &dpc, check_interrupts, 0);
        hal.set_interrupts(false);
        ki_retire_dpc_list(&platform);

        assert_eq!(INTERRUPTS_DURING_ROUTINE.load(Ordering::SeqCst), 1);
        // The caller's interrupt state is restored afterwards
        assert!(!hal.interrupts_enabled());
    }

    #[test]
    fn test_queue_requests_software_interrupt() {
        let hal = FakeHal::new();
        let scheduler = FakeScheduler::new(1);
        let platform = Platform::new(&hal, &scheduler);
        ki_initialize_processor(&platform, platform.prcb()).unwrap();
        let vector = platform.prcb().dpc_vector().unwrap();

        let dpc = Arc::new(KDpc::new());
        ke_insert_queue_dpc(&platform, &dpc, ignore, 0);
        assert_eq!(hal.pending_interrupts(), [vector]);
        // Queuing restores the interrupt flag
        assert!(hal.interrupts_enabled());
    }

    #[test]
    fn test_remove_cancels_pending_dpc() {
        let hal = FakeHal::new();
        let scheduler = FakeScheduler::new(2);
        let platform = Platform::new(&hal, &scheduler);
        ki_initialize_processor(&platform, platform.prcb()).unwrap();

        let dpc = Arc::new(KDpc::new());
        assert!(!ke_remove_queue_dpc(&platform, &dpc));

        ke_insert_queue_dpc(&platform, &dpc, count_removed, 0);
        assert_eq!(dpc.queued_processor(&platform), Some(0));

        // Cancelled from the other processor
        scheduler.enter_cpu(1);
        assert!(ke_remove_queue_dpc(&platform, &dpc));
        assert!(!ke_remove_queue_dpc(&platform, &dpc));
        scheduler.enter_cpu(0);

        hal.deliver_pending(&platform);
        assert_eq!(REMOVED_RUNS.load(Ordering::SeqCst), 0);
        assert_eq!(platform.prcb().dpc_queue_depth(&platform), 0);

        // A cancelled DPC can be queued again
        assert!(ke_insert_queue_dpc(&platform, &dpc, count_removed, 0));
        hal.deliver_pending(&platform);
        assert_eq!(REMOVED_RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dequeued_dpc_cannot_be_cancelled_from_another_cpu() {
        let hal = FakeHal::new();
        let scheduler = FakeScheduler::new(2);
        let platform = Platform::new(&hal, &scheduler);
        ki_initialize_processor(&platform, platform.prcb()).unwrap();

        let dpc = Arc::new(KDpc::new());
        ke_insert_queue_dpc(&platform, &dpc, ignore, 7);

        // The drain on cpu 0 has taken the entry but not run it yet
        let next = {
            let _interrupts = InterruptGuard::disable(&hal);
            ki_next_dpc(platform.prcb())
        };
        assert_eq!(next.map(|(_, context)| context), Some(7));

        scheduler.enter_cpu(1);
        assert!(!ke_remove_queue_dpc(&platform, &dpc));
        assert!(!dpc.is_queued(&platform));
        assert_eq!(scheduler.processor(0).unwrap().dpc_queue_depth(&platform), 0);
    }

    #[test]
    fn test_cancel_races_with_drain() {
        const ROUNDS: usize = 5_000;

        let hal = FakeHal::new();
        let scheduler = FakeScheduler::new(2);
        let platform = Platform::new(&hal, &scheduler);
        ki_initialize_processor(&platform, platform.prcb()).unwrap();

        let dpc = Arc::new(KDpc::new());
        let done = AtomicBool::new(false);

        let cancelled = thread::scope(|s| {
            let canceller = s.spawn(|| {
                scheduler.enter_cpu(1);
                let mut cancelled = 0;
                while !done.load(Ordering::Acquire) {
                    if ke_remove_queue_dpc(&platform, &dpc) {
                        cancelled += 1;
                    }
                }
                cancelled
            });

            for _ in 0..ROUNDS {
                assert!(ke_insert_queue_dpc(&platform, &dpc, count_raced, 0));
                ki_retire_dpc_list(&platform);
            }
            done.store(true, Ordering::Release);
            canceller.join().unwrap()
        });

        // Every queued instance either ran or was cancelled, never both
        assert_eq!(RACED_RUNS.load(Ordering::SeqCst) + cancelled, ROUNDS);
        assert!(!dpc.is_queued(&platform));
    }

    #[test]
    fn test_queue_before_initialization_waits_for_drain() {
        let hal = FakeHal::new();
        let scheduler = FakeScheduler::new(1);
        let platform = Platform::new(&hal, &scheduler);

        let dpc = Arc::new(KDpc::new());
        assert!(ke_insert_queue_dpc(&platform, &dpc, record_order, 99));
        assert!(hal.pending_interrupts().is_empty());
        assert!(dpc.is_queued(&platform));

        assert!(ke_remove_queue_dpc(&platform, &dpc));
    }
}
