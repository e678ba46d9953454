//! System load average
//!
//! Every processor samples itself once per sampling interval (five
//! seconds of scheduler ticks): a CPU that is not running its idle
//! thread counts as one active task. The boot processor then folds the
//! accumulated count into three exponentially-decaying averages with
//! 1, 5 and 15 minute horizons.
//!
//! Averages are fixed point with [`FSHIFT`] fractional bits.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use super::platform::Platform;
use super::thread::BOOT_PROCESSOR;

/// Bits of fractional precision
pub const FSHIFT: u32 = 11;
/// 1.0 in fixed point
pub const FIXED_1: u64 = 1 << FSHIFT;
/// 1/exp(5sec/1min) in fixed point
pub const EXP_1: u64 = 1884;
/// 1/exp(5sec/5min)
pub const EXP_5: u64 = 2014;
/// 1/exp(5sec/15min)
pub const EXP_15: u64 = 2037;

const LOAD_EXP: [u64; 3] = [EXP_1, EXP_5, EXP_15];

/// One decay step of an average towards `active`
///
/// Rounds up while the average is rising so it reaches `active` instead
/// of stalling just below it.
pub fn calc_load(load: u64, exp: u64, active: u64) -> u64 {
    let mut newload = load * exp + active * (FIXED_1 - exp);
    if active >= load {
        newload += FIXED_1 - 1;
    }
    newload / FIXED_1
}

/// Load-average state shared by all processors
pub struct LoadAverage {
    /// 1, 5 and 15 minute averages
    avenrun: [AtomicU64; 3],

    /// Active samples since the last recompute
    calc_load_tasks: AtomicU64,

    /// Scheduler ticks per sampling interval
    sample_ticks: u32,
}

impl LoadAverage {
    /// Sampler taking one sample every `sample_ticks` scheduler ticks
    pub const fn new(sample_ticks: u32) -> Self {
        Self {
            avenrun: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            calc_load_tasks: AtomicU64::new(0),
            sample_ticks,
        }
    }

    #[inline]
    pub fn sample_ticks(&self) -> u32 {
        self.sample_ticks
    }

    /// Account one scheduler tick on the current processor
    pub fn tick(&self, platform: &Platform<'_>) {
        let prcb = platform.prcb();
        let ticks = prcb.load_ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if ticks < self.sample_ticks {
            return;
        }
        prcb.load_ticks.fetch_sub(self.sample_ticks, Ordering::Relaxed);

        let active = u64::from(!platform.scheduler.is_idle());
        self.calc_load_tasks.fetch_add(active, Ordering::Relaxed);

        if prcb.number() == BOOT_PROCESSOR {
            self.recompute();
        }
    }

    /// Fold the accumulated samples into the averages
    pub fn recompute(&self) {
        let active = self.calc_load_tasks.swap(0, Ordering::Relaxed) * FIXED_1;
        for (avg, exp) in self.avenrun.iter().zip(LOAD_EXP) {
            let load = avg.load(Ordering::Relaxed);
            avg.store(calc_load(load, exp, active), Ordering::Relaxed);
        }
        log::trace!("ke: load average {}", self.snapshot());
    }

    /// Current averages
    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            avenrun: [
                self.avenrun[0].load(Ordering::Relaxed),
                self.avenrun[1].load(Ordering::Relaxed),
                self.avenrun[2].load(Ordering::Relaxed),
            ],
        }
    }
}

/// Copy of the three averages, in fixed point
///
/// Displays as `"0.52 0.58 0.59"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSnapshot {
    pub avenrun: [u64; 3],
}

impl LoadSnapshot {
    pub fn load1(&self) -> u64 {
        self.avenrun[0]
    }

    pub fn load5(&self) -> u64 {
        self.avenrun[1]
    }

    pub fn load15(&self) -> u64 {
        self.avenrun[2]
    }
}

impl fmt::Display for LoadSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, avg) in self.avenrun.iter().enumerate() {
            // Round to two decimals
            let avg = avg + FIXED_1 / 200;
            let whole = avg >> FSHIFT;
            let hundredths = ((avg & (FIXED_1 - 1)) * 100) >> FSHIFT;
            if index != 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}.{:02}", whole, hundredths)?;
        }
        Ok(())
    }
}
