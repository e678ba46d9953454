//! Local APIC access in x2APIC mode
//!
//! In x2APIC mode the APIC registers are MSRs at 0x800 + (offset >> 4),
//! so no MMIO mapping is needed.

use x86_64::registers::model_specific::Msr;

use crate::hal::InterruptVector;

/// x2APIC MSR numbers
mod msr {
    pub const ID: u32 = 0x802;          // Local APIC ID
    pub const EOI: u32 = 0x80B;         // End of Interrupt
    pub const SELF_IPI: u32 = 0x83F;    // Self IPI
}

/// x2APIC ID of the executing processor
#[inline]
pub fn current_apic_id() -> u32 {
    // SAFETY: reading the ID register has no side effects
    unsafe { Msr::new(msr::ID).read() as u32 }
}

/// Signal end of interrupt for `vector`
#[inline]
pub fn end_of_interrupt(_vector: InterruptVector) {
    // SAFETY: EOI write of zero acknowledges the in-service interrupt
    unsafe { Msr::new(msr::EOI).write(0) }
}

/// Make `vector` pending on the executing processor
#[inline]
pub fn send_self_ipi(vector: InterruptVector) {
    // SAFETY: vector comes from the vector table, so a handler exists
    unsafe { Msr::new(msr::SELF_IPI).write(u64::from(vector.0)) }
}

/// Load the task priority register (CR8)
#[inline]
pub fn write_tpr(class: u8) {
    // SAFETY: CR8 only masks interrupt delivery
    unsafe {
        core::arch::asm!(
            "mov cr8, {}",
            in(reg) u64::from(class),
            options(nomem, nostack, preserves_flags)
        );
    }
}
