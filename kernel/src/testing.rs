//! Host-side fakes for the executive's platform interfaces
//!
//! Each OS thread of the test harness plays one kernel thread. The fake
//! HAL keeps an interrupt flag and IRQL per OS thread; the fake
//! scheduler maps OS threads to a current CPU and kernel thread, and
//! implements sleep/wakeup with a condition variable. The test build
//! also counts heap allocations per host thread.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use std::vec::Vec;

use crate::hal::{CountdownTimer, EndOfInterrupt, Hal, InterruptRoutine, InterruptVector, IrqlGuard};
use crate::ke::irql::{Kirql, CLOCK_LEVEL, PASSIVE_LEVEL};
use crate::ke::platform::Platform;
use crate::ke::prcb::KPrcb;
use crate::ke::scheduler::Scheduler;
use crate::ke::status::KeError;
use crate::ke::thread::{CpuId, ThreadId, WakeupReason};
use crate::ke::timer::KTimerQueue;

/// First vector handed out by [`FakeHal`]
pub(crate) const FIRST_VECTOR: u8 = 0x30;

/// How long a test may block before it is considered hung
const HANG_TIMEOUT: Duration = Duration::from_secs(10);

/// System allocator that counts allocations made by each host thread
struct CountingAllocator;

thread_local! {
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

fn count_allocation() {
    let _ = ALLOCATIONS.try_with(|count| count.set(count.get() + 1));
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        count_allocation();
        unsafe { System.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        count_allocation();
        unsafe { System.alloc_zeroed(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        count_allocation();
        unsafe { System.realloc(ptr, layout, new_size) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

/// Run `f` and count the heap allocations it made on this thread
pub(crate) fn count_allocations<R>(f: impl FnOnce() -> R) -> (R, usize) {
    let before = ALLOCATIONS.with(Cell::get);
    let result = f();
    (result, ALLOCATIONS.with(Cell::get) - before)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Copy)]
struct CpuState {
    interrupts: bool,
    irql: Kirql,
}

impl Default for CpuState {
    fn default() -> Self {
        Self {
            interrupts: true,
            irql: PASSIVE_LEVEL,
        }
    }
}

struct VectorEntry {
    routine: InterruptRoutine,
    irql: Kirql,
}

/// Interrupt layer with per-thread interrupt flag and IRQL
pub(crate) struct FakeHal {
    cpus: Mutex<HashMap<thread::ThreadId, CpuState>>,
    vectors: Mutex<Vec<VectorEntry>>,
    pending: Mutex<Vec<InterruptVector>>,
    vector_limit: usize,
    /// Transitions from interrupts enabled to disabled
    masks: AtomicUsize,
    /// Raises that reached CLOCK_LEVEL from below it
    clock_raises: AtomicUsize,
}

impl FakeHal {
    pub(crate) fn new() -> Self {
        Self::with_vector_limit(16)
    }

    /// A HAL that runs out of vectors after `limit` allocations
    pub(crate) fn with_vector_limit(limit: usize) -> Self {
        Self {
            cpus: Mutex::new(HashMap::new()),
            vectors: Mutex::new(Vec::new()),
            // Requesting a software interrupt must not allocate
            pending: Mutex::new(Vec::with_capacity(limit)),
            vector_limit: limit,
            masks: AtomicUsize::new(0),
            clock_raises: AtomicUsize::new(0),
        }
    }

    fn with_cpu<R>(&self, f: impl FnOnce(&mut CpuState) -> R) -> R {
        let mut cpus = lock(&self.cpus);
        f(cpus.entry(thread::current().id()).or_default())
    }

    pub(crate) fn interrupts_enabled(&self) -> bool {
        self.with_cpu(|cpu| cpu.interrupts)
    }

    /// Number of times interrupts went from enabled to disabled
    pub(crate) fn masks(&self) -> usize {
        self.masks.load(Ordering::SeqCst)
    }

    /// Number of times the IRQL was raised to CLOCK_LEVEL or above
    pub(crate) fn clock_raises(&self) -> usize {
        self.clock_raises.load(Ordering::SeqCst)
    }

    pub(crate) fn allocated_vectors(&self) -> usize {
        lock(&self.vectors).len()
    }

    pub(crate) fn vector_irql(&self, vector: InterruptVector) -> Option<Kirql> {
        let index = vector.0.checked_sub(FIRST_VECTOR)?;
        lock(&self.vectors).get(index as usize).map(|entry| entry.irql)
    }

    pub(crate) fn pending_interrupts(&self) -> Vec<InterruptVector> {
        lock(&self.pending).clone()
    }

    /// Run every pending software interrupt at its IRQL, including ones
    /// requested by the routines themselves
    pub(crate) fn deliver_pending(&self, platform: &Platform<'_>) {
        loop {
            let vector = {
                let mut pending = lock(&self.pending);
                if pending.is_empty() {
                    break;
                }
                pending.remove(0)
            };
            let (routine, irql) = {
                let vectors = lock(&self.vectors);
                let entry = &vectors[(vector.0 - FIRST_VECTOR) as usize];
                (entry.routine, entry.irql)
            };
            let _irql = IrqlGuard::raise(self, irql);
            routine(platform);
        }
    }
}

impl Hal for FakeHal {
    fn set_interrupts(&self, enabled: bool) -> bool {
        let were_enabled = self.with_cpu(|cpu| core::mem::replace(&mut cpu.interrupts, enabled));
        if were_enabled && !enabled {
            self.masks.fetch_add(1, Ordering::SeqCst);
        }
        were_enabled
    }

    fn current_irql(&self) -> Kirql {
        self.with_cpu(|cpu| cpu.irql)
    }

    fn raise_irql(&self, level: Kirql) -> Kirql {
        self.with_cpu(|cpu| {
            assert!(
                level >= cpu.irql,
                "raising IRQL from {} to lower level {}",
                cpu.irql,
                level
            );
            if cpu.irql < CLOCK_LEVEL && level >= CLOCK_LEVEL {
                self.clock_raises.fetch_add(1, Ordering::SeqCst);
            }
            core::mem::replace(&mut cpu.irql, level)
        })
    }

    fn lower_irql(&self, previous: Kirql) {
        self.with_cpu(|cpu| {
            assert!(
                previous <= cpu.irql,
                "lowering IRQL from {} to higher level {}",
                cpu.irql,
                previous
            );
            cpu.irql = previous;
        })
    }

    fn allocate_interrupt(
        &self,
        routine: InterruptRoutine,
        _eoi: Option<EndOfInterrupt>,
        irql: Kirql,
    ) -> Result<InterruptVector, KeError> {
        let mut vectors = lock(&self.vectors);
        if vectors.len() >= self.vector_limit {
            return Err(KeError::NoInterruptVector);
        }
        let vector = InterruptVector(FIRST_VECTOR + vectors.len() as u8);
        vectors.push(VectorEntry { routine, irql });
        Ok(vector)
    }

    fn request_software_interrupt(&self, vector: InterruptVector) {
        let mut pending = lock(&self.pending);
        if !pending.contains(&vector) {
            pending.push(vector);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SleepState {
    Running,
    Sleeping { interruptible: bool },
    Woken(WakeupReason),
}

#[derive(Clone, Copy, Default)]
struct ThreadContext {
    cpu: CpuId,
    thread: Option<ThreadId>,
    idle: bool,
}

/// Pin/unpin calls seen by [`FakeScheduler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PinEvent {
    Pin(ThreadId, CpuId),
    Unpin(ThreadId),
}

/// Scheduler whose kernel threads are host threads
pub(crate) struct FakeScheduler {
    processors: Vec<KPrcb>,
    contexts: Mutex<HashMap<thread::ThreadId, ThreadContext>>,
    threads: Mutex<HashMap<ThreadId, SleepState>>,
    wake_signal: Condvar,
    wake_log: Mutex<Vec<(ThreadId, WakeupReason)>>,
    pins: Mutex<Vec<PinEvent>>,
    voluntary_yields: AtomicUsize,
}

impl FakeScheduler {
    pub(crate) fn new(cpus: CpuId) -> Self {
        Self {
            processors: (0..cpus).map(KPrcb::new).collect(),
            contexts: Mutex::new(HashMap::new()),
            threads: Mutex::new(HashMap::new()),
            wake_signal: Condvar::new(),
            wake_log: Mutex::new(Vec::new()),
            pins: Mutex::new(Vec::new()),
            voluntary_yields: AtomicUsize::new(0),
        }
    }

    fn with_context<R>(&self, f: impl FnOnce(&mut ThreadContext) -> R) -> R {
        let mut contexts = lock(&self.contexts);
        f(contexts.entry(thread::current().id()).or_default())
    }

    fn require_thread(&self) -> ThreadId {
        match self.current_thread() {
            Some(thread) => thread,
            None => panic!("sleeping without a thread context"),
        }
    }

    /// Run the calling host thread as kernel thread `thread`
    pub(crate) fn enter(&self, thread: ThreadId) {
        self.with_context(|context| context.thread = Some(thread));
        lock(&self.threads).insert(thread, SleepState::Running);
    }

    /// Move the calling host thread onto processor `cpu`
    pub(crate) fn enter_cpu(&self, cpu: CpuId) {
        assert!((cpu as usize) < self.processors.len(), "no processor {}", cpu);
        self.with_context(|context| context.cpu = cpu);
    }

    pub(crate) fn set_idle(&self, idle: bool) {
        self.with_context(|context| context.idle = idle);
    }

    pub(crate) fn is_sleeping(&self, thread: ThreadId) -> bool {
        matches!(lock(&self.threads).get(&thread), Some(SleepState::Sleeping { .. }))
    }

    /// Block until `thread` has gone to sleep
    pub(crate) fn wait_until_sleeping(&self, thread: ThreadId) {
        wait_until(|| self.is_sleeping(thread));
    }

    /// Deliver a signal to `thread` if it sleeps interruptibly
    pub(crate) fn interrupt(&self, thread: ThreadId) -> bool {
        let mut threads = lock(&self.threads);
        match threads.get(&thread) {
            Some(SleepState::Sleeping { interruptible: true }) => {
                threads.insert(thread, SleepState::Woken(WakeupReason::Interrupted));
                lock(&self.wake_log).push((thread, WakeupReason::Interrupted));
                self.wake_signal.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Threads woken so far, in wake order
    pub(crate) fn wake_log(&self) -> Vec<(ThreadId, WakeupReason)> {
        lock(&self.wake_log).clone()
    }

    /// Yields that were not part of a sleep
    pub(crate) fn voluntary_yields(&self) -> usize {
        self.voluntary_yields.load(Ordering::SeqCst)
    }

    pub(crate) fn pin_events(&self) -> Vec<PinEvent> {
        lock(&self.pins).clone()
    }
}

impl Scheduler for FakeScheduler {
    fn current_thread(&self) -> Option<ThreadId> {
        self.with_context(|context| context.thread)
    }

    fn current_processor(&self) -> &KPrcb {
        let cpu = self.with_context(|context| context.cpu);
        &self.processors[cpu as usize]
    }

    fn processor(&self, number: CpuId) -> Option<&KPrcb> {
        self.processors.get(number as usize)
    }

    fn is_idle(&self) -> bool {
        self.with_context(|context| context.idle)
    }

    fn prepare_sleep(&self, interruptible: bool) {
        let thread = self.require_thread();
        lock(&self.threads).insert(thread, SleepState::Sleeping { interruptible });
    }

    fn yield_thread(&self) -> WakeupReason {
        let thread = self.require_thread();
        let deadline = Instant::now() + HANG_TIMEOUT;
        let mut threads = lock(&self.threads);
        loop {
            match threads.get(&thread).copied() {
                Some(SleepState::Woken(reason)) => {
                    threads.insert(thread, SleepState::Running);
                    return reason;
                }
                Some(SleepState::Sleeping { .. }) => {
                    let now = Instant::now();
                    assert!(now < deadline, "{} never woke up", thread);
                    threads = self
                        .wake_signal
                        .wait_timeout(threads, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0;
                }
                _ => {
                    drop(threads);
                    self.voluntary_yields.fetch_add(1, Ordering::SeqCst);
                    thread::yield_now();
                    return WakeupReason::Normal;
                }
            }
        }
    }

    fn wakeup(&self, thread: ThreadId, reason: WakeupReason) {
        let mut threads = lock(&self.threads);
        if let Some(SleepState::Sleeping { .. }) = threads.get(&thread) {
            threads.insert(thread, SleepState::Woken(reason));
            lock(&self.wake_log).push((thread, reason));
            self.wake_signal.notify_all();
        }
    }

    fn pin(&self, cpu: CpuId) {
        let thread = self.require_thread();
        lock(&self.pins).push(PinEvent::Pin(thread, cpu));
    }

    fn unpin(&self) {
        let thread = self.require_thread();
        lock(&self.pins).push(PinEvent::Unpin(thread));
    }
}

#[derive(Default)]
struct CountdownState {
    remaining: Option<u64>,
    elapsed: u64,
    stops: usize,
}

/// Countdown advanced by hand
#[derive(Default)]
pub(crate) struct FakeCountdown {
    state: Mutex<CountdownState>,
}

impl FakeCountdown {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Ticks left before expiry, while armed
    pub(crate) fn armed_ticks(&self) -> Option<u64> {
        lock(&self.state).remaining
    }

    /// Number of `stop` calls on an armed countdown
    pub(crate) fn stops(&self) -> usize {
        lock(&self.state).stops
    }

    /// Let up to `ticks` pass; an expired countdown stays at zero
    pub(crate) fn advance(&self, ticks: u64) {
        let mut state = lock(&self.state);
        if let Some(remaining) = state.remaining {
            let step = ticks.min(remaining);
            state.remaining = Some(remaining - step);
            state.elapsed += step;
        }
    }

    /// The countdown reached zero and raised its interrupt
    pub(crate) fn fire(&self) {
        let mut state = lock(&self.state);
        assert_eq!(state.remaining, Some(0), "countdown fired before expiry");
        state.remaining = None;
    }
}

impl CountdownTimer for FakeCountdown {
    fn arm(&self, ticks: u64) {
        let mut state = lock(&self.state);
        state.remaining = Some(ticks);
        state.elapsed = 0;
    }

    fn stop(&self) -> u64 {
        let mut state = lock(&self.state);
        match state.remaining.take() {
            Some(_) => {
                state.stops += 1;
                core::mem::take(&mut state.elapsed)
            }
            None => 0,
        }
    }
}

/// Let `ticks` of countdown time pass
///
/// Every expiry runs the timer interrupt at CLOCK_LEVEL and then the
/// software interrupts it requested.
pub(crate) fn run_ticks(
    timers: &KTimerQueue<FakeCountdown>,
    platform: &Platform<'_>,
    hal: &FakeHal,
    mut ticks: u64,
) {
    let countdown = timers.hardware();
    while let Some(remaining) = countdown.armed_ticks() {
        if remaining > ticks {
            countdown.advance(ticks);
            break;
        }
        countdown.advance(remaining);
        ticks -= remaining;
        countdown.fire();
        {
            let _irql = IrqlGuard::raise(hal, CLOCK_LEVEL);
            timers.ki_timer_interrupt(platform);
        }
        hal.deliver_pending(platform);
    }
}

/// Spin until `condition` holds
pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + HANG_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition never became true");
        thread::sleep(Duration::from_millis(1));
    }
}
