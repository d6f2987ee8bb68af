//! Scheduler - ready queue, sleep queue, yield and dispatch
//!
//! Based on Mach4 kern/sched_prim.c
//!
//! Uniprocessor round robin. Holding the kernel state lock stands in for
//! running with interrupts disabled: every decision here is made with the
//! lock held, and `*_cli` functions expect the caller to hold it.
//!
//! The ready queue is FIFO. The sleep queue is ordered by wake tick, so
//! only its head needs checking. The idle thread is never queued; it runs
//! whenever nothing else can.

use alloc::vec::Vec;

use super::kernel::{Kernel, KernelState};
use super::queue::QueueHead;
use super::syscall::Outcome;
use super::thread::{Continuation, RunLinks, ThreadStatus, ThreadTable};
use crate::error::{KernError, KernResult};
use crate::types::Tid;

// ============================================================================
// Scheduler State
// ============================================================================

#[derive(Debug)]
pub struct Scheduler {
    pub(crate) ready: QueueHead<Tid>,
    pub(crate) sleeping: QueueHead<Tid>,
    pub(crate) current: Tid,
    pub(crate) idle: Tid,
    pub(crate) ticks: u64,
    pub(crate) switches: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            ready: QueueHead::new(),
            sleeping: QueueHead::new(),
            current: Tid::NULL,
            idle: Tid::NULL,
            ticks: 0,
            switches: 0,
        }
    }

    /// Mark `tid` runnable and append it to the ready queue
    pub fn make_runnable(&mut self, threads: &mut ThreadTable, tid: Tid) {
        let thread = threads.thread_mut(tid);
        thread.status = ThreadStatus::Runnable;
        if !thread.run_link.is_linked() && tid != self.idle {
            self.ready.push_back(&mut RunLinks(threads), tid);
        }
    }

    /// Whether `tid` is waiting on the ready queue
    ///
    /// Threads that have never run sit there as `Initialized` or `Forked`.
    pub fn is_ready(&self, threads: &ThreadTable, tid: Tid) -> bool {
        threads.get(tid).is_some_and(|t| {
            t.run_link.is_linked()
                && matches!(
                    t.status,
                    ThreadStatus::Runnable | ThreadStatus::Initialized | ThreadStatus::Forked
                )
        })
    }

    /// Put a newly created thread on the ready tail without touching its
    /// status, so its first dispatch still knows how to enter user mode
    pub fn enqueue_new(&mut self, threads: &mut ThreadTable, tid: Tid) {
        self.ready.push_back(&mut RunLinks(threads), tid);
    }

    /// Wake `tid` and let it run before everything already ready
    pub fn make_runnable_front(&mut self, threads: &mut ThreadTable, tid: Tid) {
        let thread = threads.thread_mut(tid);
        thread.status = ThreadStatus::Runnable;
        if !thread.run_link.is_linked() && tid != self.idle {
            self.ready.push_front(&mut RunLinks(threads), tid);
        }
    }

    /// Move a ready thread to the head of the ready queue
    pub fn move_to_front(&mut self, threads: &mut ThreadTable, tid: Tid) -> bool {
        if !self.is_ready(threads, tid) {
            return false;
        }
        let mut links = RunLinks(threads);
        self.ready.remove(&mut links, tid);
        self.ready.push_front(&mut links, tid);
        true
    }

    /// Insert into the sleep queue after every sleeper due no later
    pub fn add_sleeper(&mut self, threads: &mut ThreadTable, tid: Tid, wake_tick: u64) {
        threads.thread_mut(tid).wake_tick = wake_tick;
        let mut links = RunLinks(threads);
        let before = self
            .sleeping
            .iter(&links)
            .find(|&s| links.0.thread(s).wake_tick > wake_tick);
        match before {
            Some(b) => self.sleeping.insert_before(&mut links, tid, b),
            None => self.sleeping.push_back(&mut links, tid),
        }
    }

    /// Take the next thread to run: a due sleeper first, else the ready head
    pub fn pick_next(&mut self, threads: &mut ThreadTable) -> Option<Tid> {
        if let Some(s) = self.sleeping.first() {
            if threads.thread(s).wake_tick <= self.ticks {
                self.sleeping.pop_front(&mut RunLinks(threads));
                return Some(s);
            }
        }
        self.ready.pop_front(&mut RunLinks(threads))
    }

    pub fn ready_ids(&self, threads: &mut ThreadTable) -> Vec<Tid> {
        self.ready.iter(&RunLinks(threads)).collect()
    }

    pub fn sleeping_ids(&self, threads: &mut ThreadTable) -> Vec<Tid> {
        self.sleeping.iter(&RunLinks(threads)).collect()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Yield and Dispatch
// ============================================================================

impl Kernel {
    /// Give up the CPU, leaving the current thread in `next_status`
    ///
    /// A current thread that stays `Runnable` goes to the ready tail; if
    /// nothing else can run it simply keeps the CPU. A thread that blocks
    /// with nothing else ready hands the CPU to the idle thread.
    pub(crate) fn yield_cli(&self, st: &mut KernelState, next_status: ThreadStatus) {
        let cur = st.sched.current;
        let idle = st.sched.idle;
        if cur != idle {
            st.threads.thread_mut(cur).status = next_status;
        }
        match st.sched.pick_next(&mut st.threads) {
            Some(next) => {
                if next_status == ThreadStatus::Runnable && cur != idle {
                    st.sched.ready.push_back(&mut RunLinks(&mut st.threads), cur);
                }
                self.dispatch(st, next);
            }
            None if next_status == ThreadStatus::Runnable || cur == idle => {}
            None => self.dispatch(st, idle),
        }
    }

    /// Switch to `next` and let it finish whatever it blocked in
    fn dispatch(&self, st: &mut KernelState, next: Tid) {
        let from = st.sched.current;
        let from_task = st.threads.get_mut(from).map(|t| {
            t.switched_out();
            t.task
        });
        let (resume, kern_sp, to_task) = {
            let t = st.threads.thread_mut(next);
            let resume = t.resume();
            t.status = ThreadStatus::Runnable;
            (resume, t.kern_sp, t.task)
        };
        st.machine.set_kernel_stack(kern_sp);
        if from_task != Some(to_task) {
            let dir = st.tasks.task(to_task).page_dir;
            st.machine.set_page_directory(dir);
        }
        st.machine.context_switch(from, next, resume);
        st.sched.current = next;
        st.sched.switches += 1;
        log::trace!(target: "sched", "{} -> {} {:?}", from, next, resume);

        let (doomed, continuation) = {
            let t = st.threads.thread_mut(next);
            (t.doomed, t.continuation.take())
        };
        if doomed {
            log::debug!(target: "sched", "{} exits: task was killed", next);
            self.vanish_cli(st);
            return;
        }
        if let Some(c) = continuation {
            self.run_continuation(st, next, c);
        }
    }

    /// Finish a blocked call on behalf of the thread now running
    fn run_continuation(&self, st: &mut KernelState, tid: Tid, c: Continuation) {
        match c {
            Continuation::MutexHandoff(then) => self.after_lock(st, tid, then),
            Continuation::CondWake { mutex, then } => {
                match self.mutex_lock_cli(st, mutex, then) {
                    Ok(true) => self.after_lock(st, tid, then),
                    Ok(false) => {}
                    Err(e) => st.threads.thread_mut(tid).set_return(e.errno()),
                }
            }
            Continuation::SleepExpired | Continuation::Descheduled => {
                st.threads.thread_mut(tid).set_return(0)
            }
            Continuation::ReapChild { status_ptr } => self.finish_wait(st, tid, status_ptr),
        }
    }

    /// Store a blocked call's final result, if it produced one
    pub(crate) fn complete(&self, st: &mut KernelState, tid: Tid, result: KernResult<Outcome>) {
        let value = match result {
            Ok(Outcome::Complete(v)) => v,
            Ok(_) => return,
            Err(e) => e.errno(),
        };
        if let Some(t) = st.threads.get_mut(tid) {
            t.set_return(value);
        }
    }

    // ========================================================================
    // Scheduling system calls
    // ========================================================================

    /// Clock interrupt: advance time and preempt the current thread
    pub fn timer_tick(&self) {
        let mut guard = self.disable_interrupts();
        let st = &mut *guard;
        st.sched.ticks += 1;
        self.yield_cli(st, ThreadStatus::Runnable);
    }

    pub(crate) fn sleep_cli(&self, st: &mut KernelState, ticks: i32) -> KernResult<Outcome> {
        if ticks < 0 {
            return Err(KernError::InvalidArgument);
        }
        if ticks == 0 {
            return Ok(Outcome::Complete(0));
        }
        let cur = st.sched.current;
        let wake = st.sched.ticks + ticks as u64;
        st.sched.add_sleeper(&mut st.threads, cur, wake);
        st.threads.thread_mut(cur).continuation = Some(Continuation::SleepExpired);
        self.yield_cli(st, ThreadStatus::Sleeping);
        Ok(Outcome::Blocked)
    }

    /// Yield to a specific ready thread, or to anyone with `-1`
    pub(crate) fn yield_to_cli(&self, st: &mut KernelState, tid: i32) -> KernResult<Outcome> {
        let cur = st.sched.current;
        if tid != -1 && tid != cur.as_i32() {
            if tid <= 0 {
                return Err(KernError::NotFound);
            }
            let target = Tid(tid as u32);
            if !st.threads.contains(target) {
                return Err(KernError::NotFound);
            }
            if !st.sched.move_to_front(&mut st.threads, target) {
                return Err(KernError::NotRunnable);
            }
        }
        self.yield_cli(st, ThreadStatus::Runnable);
        Ok(Outcome::Complete(0))
    }

    /// Block unless the word at `reject` is non-zero
    ///
    /// The check and the block happen under the same lock, so a
    /// `make_runnable` issued after the caller cleared `*reject` cannot be
    /// lost.
    pub(crate) fn deschedule_cli(
        &self,
        st: &mut KernelState,
        reject: crate::types::VirtAddr,
    ) -> KernResult<Outcome> {
        let k = st.current_task();
        let flag = st.user_space(&self.vm, k).fuword32(reject)?;
        if flag != 0 {
            return Ok(Outcome::Complete(0));
        }
        let cur = st.sched.current;
        let t = st.threads.thread_mut(cur);
        t.descheduled = true;
        t.continuation = Some(Continuation::Descheduled);
        self.yield_cli(st, ThreadStatus::Suspended);
        Ok(Outcome::Blocked)
    }

    pub(crate) fn make_runnable_cli(&self, st: &mut KernelState, tid: i32) -> KernResult<Outcome> {
        if tid <= 0 {
            return Err(KernError::NotFound);
        }
        let target = Tid(tid as u32);
        let t = st.threads.get_mut(target).ok_or(KernError::NotFound)?;
        if !t.descheduled || t.status != ThreadStatus::Suspended {
            return Err(KernError::NotRunnable);
        }
        t.descheduled = false;
        st.sched.make_runnable(&mut st.threads, target);
        Ok(Outcome::Complete(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskId;

    fn table(n: u32) -> ThreadTable {
        let mut t = ThreadTable::new(16);
        for i in 1..=n {
            t.create(Tid(i), TaskId(1)).unwrap();
        }
        t
    }

    #[test]
    fn test_pick_prefers_due_sleeper() {
        let mut threads = table(3);
        let mut s = Scheduler::new();
        s.make_runnable(&mut threads, Tid(1));
        s.add_sleeper(&mut threads, Tid(2), 5);
        s.ticks = 4;
        assert_eq!(s.pick_next(&mut threads), Some(Tid(1)));
        s.make_runnable(&mut threads, Tid(3));
        s.ticks = 5;
        assert_eq!(s.pick_next(&mut threads), Some(Tid(2)));
        assert_eq!(s.pick_next(&mut threads), Some(Tid(3)));
        assert_eq!(s.pick_next(&mut threads), None);
    }

    #[test]
    fn test_sleepers_sorted_stable() {
        let mut threads = table(4);
        let mut s = Scheduler::new();
        s.add_sleeper(&mut threads, Tid(1), 10);
        s.add_sleeper(&mut threads, Tid(2), 3);
        s.add_sleeper(&mut threads, Tid(3), 10);
        s.add_sleeper(&mut threads, Tid(4), 7);
        assert_eq!(
            s.sleeping_ids(&mut threads),
            [Tid(2), Tid(4), Tid(1), Tid(3)]
        );
    }

    #[test]
    fn test_move_to_front_only_when_ready() {
        let mut threads = table(3);
        let mut s = Scheduler::new();
        s.make_runnable(&mut threads, Tid(1));
        s.make_runnable(&mut threads, Tid(2));
        assert!(s.move_to_front(&mut threads, Tid(2)));
        assert_eq!(s.ready_ids(&mut threads), [Tid(2), Tid(1)]);
        assert!(!s.move_to_front(&mut threads, Tid(3)));
        assert!(!s.move_to_front(&mut threads, Tid(9)));
    }

    #[test]
    fn test_make_runnable_is_idempotent() {
        let mut threads = table(1);
        let mut s = Scheduler::new();
        s.make_runnable(&mut threads, Tid(1));
        s.make_runnable(&mut threads, Tid(1));
        assert_eq!(s.ready.len(), 1);
    }
}
