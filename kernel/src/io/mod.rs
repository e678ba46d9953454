//! I/O Manager (io)
//!
//! Only the readiness-notification layer lives here: file-like objects
//! use it to let threads block until data can be read or written.
//!
//! # Key Structures
//!
//! - `IoPoll`: notification source embedded in a file-like object
//! - `IoPollWaiter`: one thread's registration on one or more sources

pub mod poll;

pub use poll::{IoPoll, IoPollWaiter, PollEvents, PollOutcome};
