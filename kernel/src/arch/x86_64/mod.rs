//! x86_64 architecture support
//!
//! Bare-metal implementation of the interrupt layer:
//!
//! - interrupt flag through `cli`/`sti`
//! - IRQL through the task priority register (CR8)
//! - vector allocation per priority class (see [`vector`])
//! - software interrupts as x2APIC self-IPIs
//!
//! The IDT stubs call [`X86Hal::dispatch`] with the vector number.

pub mod apic;
pub mod vector;

use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;
use x86_64::instructions::interrupts;

use crate::hal::{EndOfInterrupt, Hal, InterruptRoutine, InterruptVector, IrqlGuard};
use crate::ke::irql::{irql_name, Kirql, PASSIVE_LEVEL};
use crate::ke::platform::Platform;
use crate::ke::status::KeError;
use vector::{irql_to_tpr, VectorTable};

/// Maximum number of processors (indexed by x2APIC ID)
pub const MAX_CPUS: usize = 64;

/// Interrupt layer of an x2APIC machine
pub struct X86Hal {
    vectors: Mutex<VectorTable>,
    /// Current IRQL per processor; CR8 only holds its priority class
    irql: [AtomicU8; MAX_CPUS],
}

impl X86Hal {
    pub const fn new() -> Self {
        Self {
            vectors: Mutex::new(VectorTable::new()),
            irql: [const { AtomicU8::new(PASSIVE_LEVEL) }; MAX_CPUS],
        }
    }

    fn current_irql_slot(&self) -> &AtomicU8 {
        let id = apic::current_apic_id() as usize;
        match self.irql.get(id) {
            Some(slot) => slot,
            None => panic!("x2APIC ID {} beyond MAX_CPUS", id),
        }
    }

    /// Common interrupt entry, called from the IDT stub for `vector`
    ///
    /// Runs the bound routine at its IRQL with interrupts enabled, so
    /// higher-priority sources can nest, then acknowledges the vector.
    pub fn dispatch(&self, vector: u8, platform: &Platform<'_>) {
        let vector = InterruptVector(vector);
        let Some(entry) = self.vectors.lock().lookup(vector) else {
            log::warn!("hal: spurious interrupt on {}", vector);
            apic::end_of_interrupt(vector);
            return;
        };

        {
            let _irql = IrqlGuard::raise(self, entry.irql);
            interrupts::enable();
            (entry.routine)(platform);
            interrupts::disable();
        }

        match entry.eoi {
            Some(eoi) => eoi(vector),
            None => apic::end_of_interrupt(vector),
        }
    }
}

impl Default for X86Hal {
    fn default() -> Self {
        Self::new()
    }
}

impl Hal for X86Hal {
    fn set_interrupts(&self, enabled: bool) -> bool {
        let were_enabled = interrupts::are_enabled();
        if enabled {
            interrupts::enable();
        } else {
            interrupts::disable();
        }
        were_enabled
    }

    fn current_irql(&self) -> Kirql {
        self.current_irql_slot().load(Ordering::Relaxed)
    }

    fn raise_irql(&self, level: Kirql) -> Kirql {
        let slot = self.current_irql_slot();
        let previous = slot.load(Ordering::Relaxed);
        assert!(
            level >= previous,
            "raise_irql: new IRQL {} < current IRQL {}",
            level,
            previous
        );
        slot.store(level, Ordering::Relaxed);
        apic::write_tpr(irql_to_tpr(level));
        previous
    }

    fn lower_irql(&self, previous: Kirql) {
        let slot = self.current_irql_slot();
        let current = slot.load(Ordering::Relaxed);
        assert!(
            previous <= current,
            "lower_irql: new IRQL {} > current IRQL {}",
            previous,
            current
        );
        slot.store(previous, Ordering::Relaxed);
        apic::write_tpr(irql_to_tpr(previous));
    }

    fn allocate_interrupt(
        &self,
        routine: InterruptRoutine,
        eoi: Option<EndOfInterrupt>,
        irql: Kirql,
    ) -> Result<InterruptVector, KeError> {
        let vector = self.vectors.lock().allocate(routine, eoi, irql)?;
        log::debug!("hal: {} bound at {}", vector, irql_name(irql));
        Ok(vector)
    }

    fn request_software_interrupt(&self, vector: InterruptVector) {
        apic::send_self_ipi(vector);
    }
}
