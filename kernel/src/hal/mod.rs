//! Hardware Abstraction Layer (hal)
//!
//! The executive does not program interrupt controllers or timer chips
//! itself. It consumes two narrow interfaces:
//!
//! - [`Hal`]: the interrupt layer (interrupt flag, IRQL masking, software
//!   interrupt vectors);
//! - [`CountdownTimer`]: a one-shot hardware countdown that raises the
//!   timer interrupt when it reaches zero.
//!
//! # IRQL Management
//!
//! - [`Hal::raise_irql`]: Raise interrupt level (KeRaiseIrql)
//! - [`Hal::lower_irql`]: Lower interrupt level (KeLowerIrql)
//! - [`IrqlGuard`]: raise for the lifetime of a scope
//! - [`InterruptGuard`]: interrupts off for the lifetime of a scope

use core::fmt;

use crate::ke::irql::Kirql;
use crate::ke::platform::Platform;
use crate::ke::status::KeError;

/// Interrupt service routine registered with [`Hal::allocate_interrupt`]
///
/// Invoked by the interrupt layer at the vector's IRQL.
pub type InterruptRoutine = fn(platform: &Platform<'_>);

/// End-of-interrupt acknowledgement for a vector
pub type EndOfInterrupt = fn(vector: InterruptVector);

/// Interrupt vector handed out by [`Hal::allocate_interrupt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterruptVector(pub u8);

impl fmt::Display for InterruptVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vector {:#04x}", self.0)
    }
}

/// Interrupt layer interface
pub trait Hal: Sync {
    /// Enable or disable interrupts on this CPU
    ///
    /// Returns whether they were enabled before the call.
    fn set_interrupts(&self, enabled: bool) -> bool;

    /// This CPU's current IRQL
    fn current_irql(&self) -> Kirql;

    /// Raise this CPU's IRQL to `level`, returning the previous level
    ///
    /// `level` must not be below the current IRQL.
    fn raise_irql(&self, level: Kirql) -> Kirql;

    /// Return to `previous`, as obtained from [`raise_irql`](Hal::raise_irql)
    fn lower_irql(&self, previous: Kirql);

    /// Reserve a vector that runs `routine` at `irql`
    fn allocate_interrupt(
        &self,
        routine: InterruptRoutine,
        eoi: Option<EndOfInterrupt>,
        irql: Kirql,
    ) -> Result<InterruptVector, KeError>;

    /// Make `vector` pending on this CPU
    ///
    /// The routine runs as soon as the CPU's IRQL drops below the
    /// vector's level.
    fn request_software_interrupt(&self, vector: InterruptVector);
}

/// One-shot hardware countdown bound to the timer interrupt
///
/// The countdown is single-shot: after it fires, it stays idle until
/// armed again.
pub trait CountdownTimer: Sync {
    /// Start counting down `ticks`; zero requests an immediate expiry
    fn arm(&self, ticks: u64);

    /// Stop the countdown and return the ticks elapsed since it was armed
    ///
    /// A stopped countdown does not raise its interrupt, even if it had
    /// already reached zero.
    fn stop(&self) -> u64;
}

/// Interrupts disabled until dropped, then restored
pub struct InterruptGuard<'a> {
    hal: &'a dyn Hal,
    were_enabled: bool,
}

impl<'a> InterruptGuard<'a> {
    /// Disable interrupts, remembering the previous state
    #[inline]
    pub fn disable(hal: &'a dyn Hal) -> Self {
        let were_enabled = hal.set_interrupts(false);
        Self { hal, were_enabled }
    }

    /// Whether interrupts were enabled when the guard was taken
    #[inline]
    pub fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        if self.were_enabled {
            self.hal.set_interrupts(true);
        }
    }
}

/// IRQL raised until dropped, then lowered back
pub struct IrqlGuard<'a> {
    hal: &'a dyn Hal,
    previous: Kirql,
}

impl<'a> IrqlGuard<'a> {
    /// Raise to `level`
    #[inline]
    pub fn raise(hal: &'a dyn Hal, level: Kirql) -> Self {
        let previous = hal.raise_irql(level);
        Self { hal, previous }
    }

    /// Level in effect before the guard was taken
    #[inline]
    pub fn previous(&self) -> Kirql {
        self.previous
    }
}

impl Drop for IrqlGuard<'_> {
    fn drop(&mut self) {
        self.hal.lower_irql(self.previous);
    }
}
