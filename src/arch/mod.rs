//! Architecture boundary for Pebbles_R
//!
//! The scheduler and VM code never touch hardware directly. Everything
//! that would be privileged instruction sequences on a real i386 (loading
//! `esp0`, loading `%cr3`, `invlpg`, the register save/restore of a
//! context switch) goes through [`Machine`].

pub mod trace;
pub mod ureg;

pub use trace::{MachineEvent, TraceMachine};
pub use ureg::{Ureg, EFLAGS_USER, IDT_DE, IDT_GP, IDT_PF};

use crate::types::{PhysAddr, Tid, VirtAddr};

/// Bytes the switch code pushes on the outgoing kernel stack
///
/// Callee-saved registers, `%eflags` and the return address: eight words.
/// A switched-out thread's saved stack pointer is always this far below
/// the top of its kernel stack, and [`TraceMachine`] checks it.
pub const SWITCH_FRAME: u32 = 32;

/// How a dispatched thread continues
///
/// The scheduler picks the variant from the thread's status at dispatch
/// time; each arm is what the low-level switch code has to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Never ran: drop to user mode at the program entry point
    Fresh { entry_ip: VirtAddr, user_sp: VirtAddr },
    /// Created by fork or thread_fork: return to user mode with `%eax = 0`
    Forked { saved_ip: VirtAddr, saved_sp: VirtAddr },
    /// Previously switched out: restore the saved kernel stack
    Resumable { saved_sp: u32 },
}

/// Privileged operations the kernel core needs from the CPU
pub trait Machine: Send {
    /// Kernel stack used on the next trap from user mode
    fn set_kernel_stack(&mut self, esp0: u32);

    /// Switch address spaces (also flushes non-global TLB entries)
    fn set_page_directory(&mut self, dir: PhysAddr);

    /// Drop one stale translation
    fn invalidate_page(&mut self, va: VirtAddr);

    /// Save `from` and continue `to`
    fn context_switch(&mut self, from: Tid, to: Tid, resume: Resume);
}
