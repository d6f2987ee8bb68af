//! Condition Variables
//!
//! Based on Mach4 kern/sched_prim.c (assert_wait / thread_wakeup)
//!
//! `cond_wait` enqueues the caller, releases the mutex and blocks as one
//! step under the kernel state lock, so a signal sent after the mutex is
//! released cannot slip in before the caller is on the wait list. A woken
//! waiter reacquires the mutex before its wait returns.

use super::kernel::{Kernel, KernelState};
use super::queue::QueueHead;
use super::syscall::Outcome;
use super::thread::{AfterLock, Continuation, ThreadStatus, WaitLinks, WaitObject};
use crate::error::{KernError, KernResult};
use crate::types::{CondId, MutexId, Tid};

/// Condition variable record
#[derive(Debug, Default)]
pub struct KCond {
    pub(crate) waiters: QueueHead<Tid>,
}

impl Kernel {
    pub fn cond_create(&self) -> CondId {
        let mut st = self.disable_interrupts();
        let id = CondId(st.sync.next_id());
        st.sync.conds.insert(id, KCond::default());
        id
    }

    pub fn cond_destroy(&self, id: CondId) -> KernResult<()> {
        let mut st = self.disable_interrupts();
        if !st.sync.cond(id)?.waiters.is_empty() {
            return Err(KernError::InvalidArgument);
        }
        st.sync.conds.remove(&id);
        Ok(())
    }

    /// Wait on `cond`, releasing `mutex` (which the caller must hold)
    pub fn cond_wait(&self, cond: CondId, mutex: MutexId) -> KernResult<Outcome> {
        let mut guard = self.disable_interrupts();
        self.cond_wait_cli(&mut guard, cond, mutex, AfterLock::Return)?;
        Ok(Outcome::Blocked)
    }

    /// Wake the oldest waiter, if any
    pub fn cond_signal(&self, cond: CondId) -> KernResult<()> {
        let mut guard = self.disable_interrupts();
        self.cond_signal_cli(&mut guard, cond).map(|_| ())
    }

    /// Wake every thread waiting at the time of the call
    pub fn cond_broadcast(&self, cond: CondId) -> KernResult<()> {
        let mut guard = self.disable_interrupts();
        let st = &mut *guard;
        let n = st.sync.cond(cond)?.waiters.len();
        for _ in 0..n {
            self.cond_signal_cli(st, cond)?;
        }
        Ok(())
    }

    pub fn cond_waiter_count(&self, cond: CondId) -> KernResult<usize> {
        let st = self.disable_interrupts();
        Ok(st.sync.cond(cond)?.waiters.len())
    }

    pub(crate) fn cond_wait_cli(
        &self,
        st: &mut KernelState,
        cond: CondId,
        mutex: MutexId,
        then: AfterLock,
    ) -> KernResult<()> {
        let cur = st.sched.current;
        if st.sync.mutex(mutex)?.holder != Some(cur) {
            return Err(KernError::NotHolder);
        }
        let c = st.sync.cond_mut(cond)?;
        c.waiters.push_back(&mut WaitLinks(&mut st.threads), cur);
        let t = st.threads.thread_mut(cur);
        t.continuation = Some(Continuation::CondWake { mutex, then });
        t.waiting_on = Some(WaitObject::Cond(cond));
        self.mutex_unlock_cli(st, mutex)?;
        self.yield_cli(st, ThreadStatus::Suspended);
        Ok(())
    }

    /// Returns whether a waiter was woken
    pub(crate) fn cond_signal_cli(&self, st: &mut KernelState, cond: CondId) -> KernResult<bool> {
        let c = st.sync.cond_mut(cond)?;
        match c.waiters.pop_front(&mut WaitLinks(&mut st.threads)) {
            Some(t) => {
                st.threads.thread_mut(t).waiting_on = None;
                st.sched.make_runnable(&mut st.threads, t);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
