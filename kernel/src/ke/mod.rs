//! Kernel Executive (ke)
//!
//! The low-level synchronization and deferred-execution layer:
//!
//! - **Spinlocks**: busy-wait mutual exclusion
//! - **Semaphores**: blocking counting semaphores with FIFO wakeup
//! - **DPC**: Deferred Procedure Calls for interrupt deferral
//! - **Timers**: deadline queue bound to a hardware countdown
//! - **Timed waits**: interruptible sleeps (nanosleep)
//! - **Load average**: 1/5/15 minute run-queue averages
//!
//! # IRQL (Interrupt Request Level)
//!
//! The kernel uses IRQL to manage interrupt priority:
//! - PASSIVE_LEVEL (0): Normal thread execution
//! - DISPATCH_LEVEL (2): DPC execution, scheduler runs
//! - Device IRQLs (3-26): Hardware interrupts
//! - CLOCK_LEVEL (28): Timer queue
//! - HIGH_LEVEL (31): Everything masked
//!
//! # Key Structures
//!
//! - `KPRCB`: Per-processor control block
//! - `KDPC`: Deferred procedure call
//! - `KTIMER`: Kernel timer
//! - `KSEMAPHORE`: Counting semaphore
//!
//! Every operation takes a [`Platform`]: the interrupt layer plus the
//! scheduler, passed explicitly instead of reached through globals.

// Core modules
pub mod list;
pub mod irql;
pub mod status;
pub mod thread;
pub mod platform;
pub mod scheduler;
pub mod prcb;
pub mod init;

// Synchronization primitives
pub mod spinlock;
pub mod semaphore;

// Deferred execution
pub mod dpc;

// Timer support
pub mod timer;
pub mod loadavg;

// Wait support
pub mod wait;

// Re-export key types
pub use list::{KList, ListHandle};
pub use irql::Kirql;
pub use status::{KeError, WaitStatus};
pub use thread::{CpuId, ThreadId, WakeupReason, BOOT_PROCESSOR};
pub use platform::Platform;
pub use scheduler::Scheduler;
pub use prcb::{ki_initialize_processor, ki_shutdown_processor, KPrcb};
pub use init::{ki_initialize_executive, KeSubsystem};

pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};
pub use semaphore::KSemaphore;

pub use dpc::{ke_insert_queue_dpc, ke_remove_queue_dpc, ki_retire_dpc_list, DpcRoutine, KDpc};

pub use timer::{KTimer, KTimerQueue, TimerQueueStats};
pub use loadavg::{LoadAverage, LoadSnapshot};

pub use wait::{ke_delay_execution, DelayStatus};
