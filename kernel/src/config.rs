//! Executive configuration
//!
//! Built-in defaults, optionally overridden from the boot command line.
//! Options owned by the executive are `ke.`-prefixed `key=value` words:
//!
//! - `ke.tpus=<n>`: timer countdown ticks per microsecond
//! - `ke.hz=<n>`: scheduler clock ticks per second
//! - `ke.log=<level>`: `off`, `error`, `warn`, `info`, `debug` or `trace`
//!
//! Words without the `ke.` prefix belong to other subsystems and are
//! skipped.

use core::str::FromStr;

use log::LevelFilter;

use crate::ke::status::KeError;

/// Scheduler clock frequency in Hz (1000 = 1ms tick)
pub const DEFAULT_CLOCK_HZ: u32 = 1000;

/// Countdown ticks per microsecond
pub const DEFAULT_TICKS_PER_US: u64 = 10;

/// Seconds between load-average samples
pub const LOAD_SAMPLE_SECONDS: u32 = 5;

/// Executive configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeConfig {
    /// Timer countdown ticks per microsecond
    pub ticks_per_us: u64,
    /// Scheduler clock ticks per second
    pub clock_hz: u32,
    /// Maximum level passed to the kernel logger
    pub log_level: LevelFilter,
}

impl KeConfig {
    /// Built-in defaults
    pub const fn new() -> Self {
        Self {
            ticks_per_us: DEFAULT_TICKS_PER_US,
            clock_hz: DEFAULT_CLOCK_HZ,
            log_level: LevelFilter::Info,
        }
    }

    /// Defaults overridden by the `ke.` options in `cmdline`
    pub fn parse(cmdline: &str) -> Result<Self, KeError> {
        let mut config = Self::new();

        for word in cmdline.split_whitespace() {
            let Some(option) = word.strip_prefix("ke.") else {
                continue;
            };
            let Some((key, value)) = option.split_once('=') else {
                log::warn!("ke: boot option '{}' has no value", word);
                return Err(KeError::InvalidParameter);
            };

            match key {
                "tpus" => config.ticks_per_us = parse_nonzero(word, value)?,
                "hz" => config.clock_hz = parse_nonzero(word, value)?,
                "log" => {
                    config.log_level = LevelFilter::from_str(value).map_err(|_| {
                        log::warn!("ke: unknown log level in '{}'", word);
                        KeError::InvalidParameter
                    })?;
                }
                _ => {
                    log::warn!("ke: unknown boot option '{}'", word);
                    return Err(KeError::InvalidParameter);
                }
            }
        }

        Ok(config)
    }

    /// Scheduler ticks between load-average samples
    pub fn load_sample_ticks(&self) -> u32 {
        self.clock_hz.saturating_mul(LOAD_SAMPLE_SECONDS)
    }
}

impl Default for KeConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_nonzero<T>(word: &str, value: &str) -> Result<T, KeError>
where
    T: FromStr + Default + PartialEq,
{
    match value.parse::<T>() {
        Ok(parsed) if parsed != T::default() => Ok(parsed),
        _ => {
            log::warn!("ke: boot option '{}' needs a positive number", word);
            Err(KeError::InvalidParameter)
        }
    }
}
