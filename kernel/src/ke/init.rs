//! Kernel Executive Initialization
//!
//! Brings up the executive on the boot processor and bundles the state
//! shared by all processors: the timer queue bound to the hardware
//! countdown, and the load-average sampler. Application processors call
//! [`ki_initialize_processor`] themselves as they come online.

use super::loadavg::LoadAverage;
use super::platform::Platform;
use super::prcb::ki_initialize_processor;
use super::status::KeError;
use super::timer::KTimerQueue;
use super::wait::{ke_delay_execution, DelayStatus};
use crate::config::KeConfig;
use crate::hal::CountdownTimer;

/// Executive state shared by all processors
pub struct KeSubsystem<H> {
    config: KeConfig,
    timers: KTimerQueue<H>,
    load: LoadAverage,
}

impl<H: CountdownTimer> KeSubsystem<H> {
    #[inline]
    pub fn config(&self) -> &KeConfig {
        &self.config
    }

    /// Timer queue driven by the hardware countdown
    #[inline]
    pub fn timers(&self) -> &KTimerQueue<H> {
        &self.timers
    }

    #[inline]
    pub fn load(&self) -> &LoadAverage {
        &self.load
    }

    /// Scheduler clock tick on the current processor
    pub fn clock_tick(&self, platform: &Platform<'_>) {
        self.load.tick(platform);
    }

    /// Countdown expiry, from the timer interrupt at CLOCK_LEVEL
    pub fn timer_interrupt(&self, platform: &Platform<'_>) {
        self.timers.ki_timer_interrupt(platform);
    }

    /// Sleep the current thread for `interval_us` microseconds
    pub fn delay_execution(&self, platform: &Platform<'_>, interval_us: u64) -> DelayStatus {
        ke_delay_execution(platform, &self.timers, interval_us)
    }
}

/// Initialize the kernel executive
///
/// Called on the boot processor once the interrupt layer and the
/// scheduler are up. Allocates the boot processor's DPC interrupt and
/// binds an idle timer queue to `hardware`.
pub fn ki_initialize_executive<H: CountdownTimer>(
    platform: &Platform<'_>,
    config: KeConfig,
    hardware: H,
) -> Result<KeSubsystem<H>, KeError> {
    if config.ticks_per_us == 0 || config.clock_hz == 0 {
        return Err(KeError::InvalidParameter);
    }

    let prcb = platform.prcb();
    ki_initialize_processor(platform, prcb)?;

    let subsystem = KeSubsystem {
        config,
        timers: KTimerQueue::new(config.ticks_per_us, hardware),
        load: LoadAverage::new(config.load_sample_ticks()),
    };

    log::info!(
        "ke: executive initialized on cpu {} ({} ticks/us, {} Hz clock)",
        prcb.number(),
        config.ticks_per_us,
        config.clock_hz
    );
    Ok(subsystem)
}
