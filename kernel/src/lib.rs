//! Nostalgia OS Kernel Executive
//!
//! The synchronization and deferred-execution core of the kernel,
//! following the NT model:
//!
//! - **ke** - Kernel Executive: spinlocks, DPCs, timers, semaphores, timed waits, load average
//! - **io** - I/O poll: readiness notification between drivers and waiting threads
//! - **hal** - Hardware Abstraction Layer: interrupt flag, IRQL, vectors, countdown timer
//! - **arch** - Bare-metal x86_64 interrupt layer
//! - **config** - Boot command line options
//! - **klog** - Kernel logger backing the `log` facade
//!
//! # Initialization
//!
//! The boot processor brings the executive up with
//! [`ke::ki_initialize_executive`] once the interrupt layer and the
//! scheduler are running. Application processors then call
//! [`ke::ki_initialize_processor`] as they come online.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod hal;
pub mod io;
pub mod ke;
pub mod klog;

#[cfg(test)]
mod testing;
