//! Kern subsystem - scheduler, synchronization and task lifecycle
//!
//! Everything here runs against a [`Kernel`] context. Operations that must
//! not be interleaved with the timer take `&mut KernelState`, which callers
//! only obtain through [`Kernel::disable_interrupts`]; the public entry
//! points are thin wrappers that take that lock and forward.

pub mod condvar;
pub mod copyio;
pub mod elf_loader;
pub mod exception;
pub mod exec;
pub mod exit;
pub mod fork;
pub mod ids;
pub mod kernel;
pub mod lock;
pub mod mutex;
pub mod queue;
pub mod sched;
pub mod semaphore;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod thread;

#[cfg(test)]
pub(crate) mod testutil;

pub use condvar::KCond;
pub use copyio::UserSpace;
pub use elf_loader::{ProgramImage, ProgramLoader, RamDisk, Section, SectionKind, SimpleElf};
pub use exception::{ExceptionType, Fault, FaultDisposition};
pub use ids::IdAllocator;
pub use kernel::{Kernel, KernelState};
pub use lock::{SpinLock, SpinLockGuard, SpinMutex};
pub use mutex::KMutex;
pub use queue::{Chained, QueueChain, QueueHead};
pub use sched::Scheduler;
pub use semaphore::KSem;
pub use syscall::{Outcome, Syscall};
pub use task::{Task, TaskState};
pub use thread::{Continuation, SwexnHandler, Thread, ThreadStatus, WaitObject};
