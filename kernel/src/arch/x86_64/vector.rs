//! Interrupt vector allocation
//!
//! The local APIC masks interrupts by priority class: the upper four
//! bits of a vector. Each IRQL maps to one class (the value loaded into
//! CR8 while running at that IRQL), and every vector that runs at an
//! IRQL is taken from that IRQL's class. Raising the IRQL therefore masks
//! exactly the vectors at or below it.
//!
//! | IRQL              | Class | Vectors     |
//! |-------------------|-------|-------------|
//! | PASSIVE, APC      | 0     | (none)      |
//! | DISPATCH          | 4     | 0x40 - 0x4F |
//! | device 3 - 27     | 5 - 12| 0x50 - 0xCF |
//! | CLOCK             | 13    | 0xD0 - 0xDF |
//! | IPI               | 14    | 0xE0 - 0xEF |
//! | POWER, HIGH       | 15    | 0xF0 - 0xFF |

use crate::hal::{EndOfInterrupt, InterruptRoutine, InterruptVector};
use crate::ke::irql::{
    Kirql, APC_LEVEL, CLOCK_LEVEL, DEVICE_LEVEL_BASE, DISPATCH_LEVEL, IPI_LEVEL, PASSIVE_LEVEL,
};
use crate::ke::status::KeError;

/// Vectors per priority class
const CLASS_SIZE: usize = 16;

/// Task priority class for `irql`
pub const fn irql_to_tpr(irql: Kirql) -> u8 {
    match irql {
        PASSIVE_LEVEL..=APC_LEVEL => 0,
        DISPATCH_LEVEL => 4,
        CLOCK_LEVEL => 13,
        IPI_LEVEL => 14,
        device if device < CLOCK_LEVEL => {
            // Three device IRQLs per class; the top one shares class 12
            let class = 5 + (device - DEVICE_LEVEL_BASE) / 3;
            if class > 12 {
                12
            } else {
                class
            }
        }
        _ => 15,
    }
}

/// Routine bound to a vector
#[derive(Clone, Copy)]
pub struct VectorEntry {
    pub routine: InterruptRoutine,
    pub eoi: Option<EndOfInterrupt>,
    pub irql: Kirql,
}

/// Vector assignments of the interrupt layer
pub struct VectorTable {
    entries: [Option<VectorEntry>; 256],
    allocated: usize,
}

impl VectorTable {
    pub const fn new() -> Self {
        Self {
            entries: [None; 256],
            allocated: 0,
        }
    }

    /// Number of vectors handed out
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Bind `routine` to a free vector in the class of `irql`
    pub fn allocate(
        &mut self,
        routine: InterruptRoutine,
        eoi: Option<EndOfInterrupt>,
        irql: Kirql,
    ) -> Result<InterruptVector, KeError> {
        let class = irql_to_tpr(irql) as usize;
        if class == 0 {
            // Nothing can be masked below DISPATCH_LEVEL
            return Err(KeError::InvalidParameter);
        }

        let first = class * CLASS_SIZE;
        let slot = self.entries[first..first + CLASS_SIZE]
            .iter()
            .position(Option::is_none)
            .ok_or(KeError::NoInterruptVector)?;

        let vector = first + slot;
        self.entries[vector] = Some(VectorEntry { routine, eoi, irql });
        self.allocated += 1;
        Ok(InterruptVector(vector as u8))
    }

    /// Entry bound to `vector`
    pub fn lookup(&self, vector: InterruptVector) -> Option<VectorEntry> {
        self.entries[vector.0 as usize]
    }
}

impl Default for VectorTable {
    fn default() -> Self {
        Self::new()
    }
}
