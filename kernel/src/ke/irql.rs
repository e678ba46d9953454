//! Interrupt Request Levels (IRQL)
//!
//! An IRQL is a priority threshold: while a CPU runs at a given level,
//! every interrupt source at or below it is masked on that CPU, while
//! higher-priority sources still get through.
//!
//! - PASSIVE_LEVEL (0): Normal thread execution
//! - APC_LEVEL (1): APC delivery masked
//! - DISPATCH_LEVEL (2): DPC drain and the scheduler run here
//! - Device IRQLs (3-26): Hardware interrupts
//! - CLOCK_LEVEL (28): Timer queue and its hardware countdown
//! - HIGH_LEVEL (31): Everything masked

/// Interrupt request level
pub type Kirql = u8;

/// Normal thread execution
pub const PASSIVE_LEVEL: Kirql = 0;
/// APC delivery masked
pub const APC_LEVEL: Kirql = 1;
/// DPC software interrupt level
pub const DISPATCH_LEVEL: Kirql = 2;
/// Lowest device interrupt level
pub const DEVICE_LEVEL_BASE: Kirql = 3;
/// Timer queue interrupt level
pub const CLOCK_LEVEL: Kirql = 28;
/// Inter-processor interrupts
pub const IPI_LEVEL: Kirql = 29;
/// Power failure
pub const POWER_LEVEL: Kirql = 30;
/// All interrupts masked
pub const HIGH_LEVEL: Kirql = 31;

/// Human readable name of a level, for diagnostics
pub fn irql_name(irql: Kirql) -> &'static str {
    match irql {
        PASSIVE_LEVEL => "PASSIVE_LEVEL",
        APC_LEVEL => "APC_LEVEL",
        DISPATCH_LEVEL => "DISPATCH_LEVEL",
        CLOCK_LEVEL => "CLOCK_LEVEL",
        IPI_LEVEL => "IPI_LEVEL",
        POWER_LEVEL => "POWER_LEVEL",
        HIGH_LEVEL => "HIGH_LEVEL",
        DEVICE_LEVEL_BASE..=27 => "DEVICE_LEVEL",
        _ => "INVALID_LEVEL",
    }
}
