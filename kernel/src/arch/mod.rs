//! Architecture-specific code
//!
//! This module provides the bare-metal interrupt layer for x86_64.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::X86Hal;
