//! Pebbles_R - a preemptive teaching kernel core in Rust
//!
//! This crate provides the scheduler, the kernel synchronization
//! primitives, two-level paging with zero-fill-on-demand, and the
//! fork/exec/wait/vanish task lifecycle of a small uniprocessor kernel.
//! The hardware sits behind [`arch::Machine`], so the whole kernel runs
//! hosted under `cargo test` against [`arch::TraceMachine`].

#![no_std]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Kernel code often needs explicit casts between address widths
#![allow(clippy::unnecessary_cast)]
// Manual ceiling division is clearer in memory allocation contexts
#![allow(clippy::manual_div_ceil)]

// Standard library replacement for no_std
#[macro_use]
extern crate alloc;

// Core types
pub mod types;

pub mod arch;
pub mod config;
pub mod console;
pub mod error;
pub mod kern;
pub mod vm;

pub use config::KernelConfig;
pub use error::{KernError, KernResult};
pub use kern::{Kernel, Outcome, Syscall};

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "Pebbles_R";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "Pebbles_R");
        assert!(!VERSION.is_empty());
    }
}
