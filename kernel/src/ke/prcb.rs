//! Kernel Processor Control Block (KPRCB)
//!
//! The KPRCB is the explicit per-processor context of the executive:
//! - the DPC queue and the software interrupt vector that drains it
//! - the load-average tick counter
//! - per-processor statistics
//!
//! In a multiprocessor system, each CPU has its own KPRCB. The scheduler
//! owns them and hands out the current one through
//! [`Scheduler::current_processor`](super::scheduler::Scheduler::current_processor).
//! A PRCB is brought up with [`ki_initialize_processor`] before the CPU
//! takes interrupts and torn down with [`ki_shutdown_processor`] when the
//! CPU goes offline.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::Once;

use super::dpc::{ki_retire_dpc_list, DpcQueue};
use super::irql::DISPATCH_LEVEL;
use super::platform::Platform;
use super::spinlock::SpinLock;
use super::status::KeError;
use super::thread::CpuId;
use crate::hal::{InterruptGuard, InterruptVector};

/// Kernel Processor Control Block
pub struct KPrcb {
    /// Processor number (0 for BSP)
    number: CpuId,

    /// DPC queue, most recently queued first
    pub(crate) dpc_queue: SpinLock<DpcQueue>,

    /// Software interrupt that drains the DPC queue
    dpc_vector: Once<InterruptVector>,

    /// Set while a DPC drain runs on this processor
    pub(crate) dpc_routine_active: AtomicBool,

    /// Number of DPCs retired on this processor
    pub(crate) dpc_count: AtomicU64,

    /// Scheduler ticks since the last load sample
    pub(crate) load_ticks: AtomicU32,

    /// Processor is up and taking DPC interrupts
    online: AtomicBool,
}

impl KPrcb {
    /// Create an offline PRCB for processor `number`
    pub const fn new(number: CpuId) -> Self {
        Self {
            number,
            dpc_queue: SpinLock::new(DpcQueue::new()),
            dpc_vector: Once::new(),
            dpc_routine_active: AtomicBool::new(false),
            dpc_count: AtomicU64::new(0),
            load_ticks: AtomicU32::new(0),
            online: AtomicBool::new(false),
        }
    }

    /// Processor number
    #[inline]
    pub fn number(&self) -> CpuId {
        self.number
    }

    /// DPC vector, once the processor has been initialized
    #[inline]
    pub fn dpc_vector(&self) -> Option<InterruptVector> {
        self.dpc_vector.get().copied()
    }

    /// Number of DPCs waiting to run
    pub fn dpc_queue_depth(&self, platform: &Platform<'_>) -> usize {
        let _interrupts = InterruptGuard::disable(platform.hal);
        self.dpc_queue.lock().depth()
    }

    /// Number of DPCs retired so far
    #[inline]
    pub fn dpc_count(&self) -> u64 {
        self.dpc_count.load(Ordering::Relaxed)
    }

    /// Whether the processor is online
    #[inline]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

/// Bring up the executive state of `prcb`
///
/// Allocates the DPC software interrupt at DISPATCH_LEVEL. Calling it
/// again for a processor that is already initialized only marks it
/// online.
pub fn ki_initialize_processor(platform: &Platform<'_>, prcb: &KPrcb) -> Result<(), KeError> {
    if prcb.dpc_vector.get().is_none() {
        let vector = platform
            .hal
            .allocate_interrupt(ki_retire_dpc_list, None, DISPATCH_LEVEL)?;
        prcb.dpc_vector.call_once(|| vector);
        log::debug!("ke: cpu {} DPC interrupt on {}", prcb.number, vector);
    }
    prcb.online.store(true, Ordering::Release);
    Ok(())
}

/// Take the current processor offline
///
/// Runs whatever is still queued so no DPC is stranded, then marks the
/// PRCB offline. Must be called on the processor being shut down.
pub fn ki_shutdown_processor(platform: &Platform<'_>) {
    let prcb = platform.prcb();
    let pending = prcb.dpc_queue_depth(platform);
    if pending != 0 {
        log::debug!("ke: cpu {} retiring {} DPCs before shutdown", prcb.number, pending);
        ki_retire_dpc_list(platform);
    }
    assert_eq!(prcb.dpc_queue_depth(platform), 0, "DPC queued during processor shutdown");
    prcb.online.store(false, Ordering::Release);
    log::info!("ke: cpu {} offline", prcb.number);
}
