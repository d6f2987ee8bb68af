//! Common types used across Pebbles_R
//!
//! Identifiers and address aliases shared by the scheduler, the task
//! lifecycle layer and the VM subsystem. Keeping them here avoids circular
//! module dependencies.

use core::fmt;

/// A 32-bit virtual address
pub type VirtAddr = u32;

/// A 32-bit physical address
pub type PhysAddr = u32;

/// Thread identifier
///
/// Assigned from a single monotonically increasing counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tid(pub u32);

impl Tid {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Value as seen by user code (syscall return registers are signed)
    pub fn as_i32(self) -> i32 {
        self.0 as i32
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

/// Task identifier
///
/// A task's id is the tid of the first thread it was created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TaskId(pub u32);

impl TaskId {
    pub const NULL: Self = Self(0);

    pub fn as_i32(self) -> i32 {
        self.0 as i32
    }
}

impl From<Tid> for TaskId {
    fn from(tid: Tid) -> Self {
        TaskId(tid.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {}", self.0)
    }
}

/// Handle to a blocking kernel mutex
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutexId(pub u32);

/// Handle to a kernel condition variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CondId(pub u32);

/// Handle to a kernel semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemId(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_from_tid() {
        assert_eq!(TaskId::from(Tid(7)), TaskId(7));
        assert!(Tid::NULL.is_null());
        assert!(!Tid(3).is_null());
    }
}
