//! Services the executive runs on
//!
//! Every operation that may mask interrupts, touch per-CPU state or
//! block receives a [`Platform`]: the interrupt layer plus the
//! scheduler. Per-CPU state is reached through
//! [`Scheduler::current_processor`] instead of hidden globals.

use core::fmt;

use super::prcb::KPrcb;
use super::scheduler::Scheduler;
use crate::hal::Hal;

/// Interrupt layer and scheduler, passed explicitly
#[derive(Clone, Copy)]
pub struct Platform<'a> {
    /// Interrupt flag, IRQL and vectors
    pub hal: &'a dyn Hal,
    /// Sleep, wakeup and per-CPU context
    pub scheduler: &'a dyn Scheduler,
}

impl<'a> Platform<'a> {
    /// Bundle an interrupt layer and a scheduler
    pub const fn new(hal: &'a dyn Hal, scheduler: &'a dyn Scheduler) -> Self {
        Self { hal, scheduler }
    }

    /// Control block of the CPU executing the caller
    #[inline]
    pub fn prcb(&self) -> &'a KPrcb {
        self.scheduler.current_processor()
    }
}

impl fmt::Debug for Platform<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("cpu", &self.scheduler.current_cpu())
            .field("thread", &self.scheduler.current_thread())
            .finish()
    }
}
