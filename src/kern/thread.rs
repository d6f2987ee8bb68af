//! Thread Management
//!
//! Based on Mach4 kern/thread.h/c by Avadis Tevanian, Jr.
//!
//! A thread belongs to exactly one task, which supplies its address space.
//! Each thread carries three queue chains so it can simultaneously be on a
//! scheduler queue, a wait list (mutex, condition, or parent task's waiters)
//! and its task's thread list.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::queue::{Chained, QueueChain};
use crate::arch::{Resume, Ureg, SWITCH_FRAME};
use crate::config::{KERNEL_STACK_BASE, KERNEL_STACK_SIZE};
use crate::error::{KernError, KernResult};
use crate::types::{CondId, MutexId, SemId, TaskId, Tid, VirtAddr};

// ============================================================================
// Thread Status
// ============================================================================

/// Scheduling status of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created with a fresh program image, never dispatched
    Initialized,
    /// Running or on the ready queue
    Runnable,
    /// Created by fork/thread_fork, never dispatched
    Forked,
    /// Blocked on a condition, a child, or deschedule
    Suspended,
    /// On the sleep queue
    Sleeping,
    /// Waiting for a blocking mutex
    BlockedOnMutex,
    /// Exited; resources reclaimed once it is no longer current
    Zombie,
}

impl ThreadStatus {
    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            ThreadStatus::Suspended | ThreadStatus::Sleeping | ThreadStatus::BlockedOnMutex
        )
    }
}

// ============================================================================
// Continuations
// ============================================================================

/// What to do once a blocking mutex acquisition finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterLock {
    /// Plain lock call: return 0
    Return,
    /// Semaphore wait: re-check the count
    SemRecheck(SemId),
    /// Semaphore signal: bump the count and wake a waiter
    SemPost(SemId),
}

/// Work a blocked thread finishes when it is next dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// The unlocker handed us the mutex
    MutexHandoff(AfterLock),
    /// Signalled on a condition; reacquire `mutex` before continuing
    CondWake { mutex: MutexId, then: AfterLock },
    /// Sleep finished
    SleepExpired,
    /// Made runnable after deschedule
    Descheduled,
    /// A child task was handed to us through `wait_record`
    ReapChild { status_ptr: VirtAddr },
}

/// Sync object whose wait list holds a blocked thread's `wait_link`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitObject {
    Mutex(MutexId),
    Cond(CondId),
}

/// Registered software exception handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwexnHandler {
    /// Exclusive top of the handler stack
    pub esp3: VirtAddr,
    pub eip: VirtAddr,
    pub arg: u32,
}

// ============================================================================
// Thread
// ============================================================================

/// Thread control block
#[derive(Debug)]
pub struct Thread {
    pub tid: Tid,
    pub task: TaskId,
    pub status: ThreadStatus,
    /// Top of this thread's kernel stack
    pub kern_sp: u32,
    /// Kernel stack pointer saved at the last switch away
    pub saved_sp: u32,
    /// User register image (syscall results land in `eax`)
    pub regs: Ureg,
    pub swexn: Option<SwexnHandler>,
    /// Absolute tick to wake at while sleeping
    pub wake_tick: u64,
    pub descheduled: bool,
    /// Set when another thread of the task took a fatal fault
    pub doomed: bool,
    pub continuation: Option<Continuation>,
    /// Set while queued on a mutex or condition wait list
    pub waiting_on: Option<WaitObject>,
    /// Child task handed over by a vanishing child while we waited
    pub wait_record: Option<TaskId>,
    pub(crate) run_link: QueueChain<Tid>,
    pub(crate) wait_link: QueueChain<Tid>,
    pub(crate) task_link: QueueChain<Tid>,
    stack_slot: usize,
}

impl Thread {
    fn new(tid: Tid, task: TaskId, stack_slot: usize) -> Self {
        let kern_sp = KernelStacks::top(stack_slot);
        Self {
            tid,
            task,
            status: ThreadStatus::Initialized,
            kern_sp,
            saved_sp: kern_sp,
            regs: Ureg::default(),
            swexn: None,
            wake_tick: 0,
            descheduled: false,
            doomed: false,
            continuation: None,
            waiting_on: None,
            wait_record: None,
            run_link: QueueChain::new(),
            wait_link: QueueChain::new(),
            task_link: QueueChain::new(),
            stack_slot,
        }
    }

    /// Resume tag for dispatching this thread now
    pub fn resume(&self) -> Resume {
        match self.status {
            ThreadStatus::Initialized => Resume::Fresh {
                entry_ip: self.regs.eip,
                user_sp: self.regs.esp,
            },
            ThreadStatus::Forked => Resume::Forked {
                saved_ip: self.regs.eip,
                saved_sp: self.regs.esp,
            },
            _ => Resume::Resumable {
                saved_sp: self.saved_sp,
            },
        }
    }

    /// Record the stack pointer the switch code leaves behind
    pub(crate) fn switched_out(&mut self) {
        self.saved_sp = self.kern_sp - SWITCH_FRAME;
    }

    pub(crate) fn set_return(&mut self, value: i32) {
        self.regs.eax = value as u32;
    }
}

// ============================================================================
// Kernel Stacks
// ============================================================================

/// Fixed pool of kernel stack slots; its size is the thread budget
#[derive(Debug)]
struct KernelStacks {
    free: Vec<usize>,
}

impl KernelStacks {
    fn new(slots: usize) -> Self {
        Self {
            free: (0..slots).rev().collect(),
        }
    }

    fn top(slot: usize) -> u32 {
        KERNEL_STACK_BASE + (slot as u32 + 1) * KERNEL_STACK_SIZE
    }

    fn alloc(&mut self) -> Option<usize> {
        self.free.pop()
    }

    fn release(&mut self, slot: usize) {
        self.free.push(slot);
    }
}

// ============================================================================
// Thread Table
// ============================================================================

/// All thread control blocks, keyed by tid
#[derive(Debug)]
pub struct ThreadTable {
    threads: BTreeMap<Tid, Thread>,
    stacks: KernelStacks,
}

impl ThreadTable {
    pub fn new(max_threads: usize) -> Self {
        Self {
            threads: BTreeMap::new(),
            stacks: KernelStacks::new(max_threads),
        }
    }

    /// Allocate a control block and kernel stack
    pub fn create(&mut self, tid: Tid, task: TaskId) -> KernResult<&mut Thread> {
        let slot = self.stacks.alloc().ok_or(KernError::NoMemory)?;
        Ok(self
            .threads
            .entry(tid)
            .or_insert_with(|| Thread::new(tid, task, slot)))
    }

    /// Free a control block and its stack
    pub fn destroy(&mut self, tid: Tid) -> Option<Thread> {
        let thread = self.threads.remove(&tid)?;
        debug_assert!(
            !thread.run_link.is_linked() && !thread.wait_link.is_linked(),
            "destroying queued {}",
            tid
        );
        self.stacks.release(thread.stack_slot);
        Some(thread)
    }

    pub fn get(&self, tid: Tid) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.threads.get_mut(&tid)
    }

    /// Lookup for a tid the caller knows is live
    pub fn thread(&self, tid: Tid) -> &Thread {
        match self.threads.get(&tid) {
            Some(t) => t,
            None => panic!("no control block for {}", tid),
        }
    }

    pub fn thread_mut(&mut self, tid: Tid) -> &mut Thread {
        match self.threads.get_mut(&tid) {
            Some(t) => t,
            None => panic!("no control block for {}", tid),
        }
    }

    pub fn contains(&self, tid: Tid) -> bool {
        self.threads.contains_key(&tid)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn free_stacks(&self) -> usize {
        self.stacks.free.len()
    }
}

macro_rules! thread_chain {
    ($(#[$doc:meta])* $name:ident, $field:ident) => {
        $(#[$doc])*
        pub struct $name<'a>(pub &'a mut ThreadTable);

        impl Chained<Tid> for $name<'_> {
            fn chain(&self, tid: Tid) -> Option<&QueueChain<Tid>> {
                self.0.threads.get(&tid).map(|t| &t.$field)
            }

            fn chain_mut(&mut self, tid: Tid) -> Option<&mut QueueChain<Tid>> {
                self.0.threads.get_mut(&tid).map(|t| &mut t.$field)
            }
        }
    };
}

thread_chain!(
    /// Ready and sleep queues
    RunLinks,
    run_link
);
thread_chain!(
    /// Mutex, condition and child-wait lists
    WaitLinks,
    wait_link
);
thread_chain!(
    /// A task's live and zombie thread lists
    TaskLinks,
    task_link
);
