//! Blocking Mutex
//!
//! Based on Mach4 kern/lock.c (sleepable locks)
//!
//! A contended lock puts the caller on the mutex's FIFO wait list and
//! yields, first moving the holder to the front of the ready queue so the
//! holder gets the CPU next and can release sooner. Unlock hands ownership
//! directly to the oldest waiter and makes it runnable; the waiter wakes
//! already owning the mutex, so no thread can barge in between.

use alloc::vec::Vec;

use super::kernel::{Kernel, KernelState};
use super::queue::QueueHead;
use super::syscall::Outcome;
use super::thread::{AfterLock, Continuation, ThreadStatus, WaitLinks, WaitObject};
use crate::error::{KernError, KernResult};
use crate::types::{MutexId, Tid};

/// Mutex record
#[derive(Debug, Default)]
pub struct KMutex {
    pub(crate) holder: Option<Tid>,
    pub(crate) waiters: QueueHead<Tid>,
}

impl Kernel {
    pub fn mutex_create(&self) -> MutexId {
        let mut st = self.disable_interrupts();
        let id = MutexId(st.sync.next_id());
        st.sync.mutexes.insert(id, KMutex::default());
        id
    }

    /// Destroy an unheld mutex with no waiters
    pub fn mutex_destroy(&self, id: MutexId) -> KernResult<()> {
        let mut st = self.disable_interrupts();
        let m = st.sync.mutex(id)?;
        if m.holder.is_some() || !m.waiters.is_empty() {
            return Err(KernError::InvalidArgument);
        }
        st.sync.mutexes.remove(&id);
        Ok(())
    }

    /// Lock as the current thread; `Blocked` means the caller sleeps until
    /// ownership is handed over
    pub fn mutex_lock(&self, id: MutexId) -> KernResult<Outcome> {
        let mut guard = self.disable_interrupts();
        let acquired = self.mutex_lock_cli(&mut guard, id, AfterLock::Return)?;
        Ok(if acquired {
            Outcome::Complete(0)
        } else {
            Outcome::Blocked
        })
    }

    pub fn mutex_unlock(&self, id: MutexId) -> KernResult<()> {
        let mut guard = self.disable_interrupts();
        self.mutex_unlock_cli(&mut guard, id)
    }

    pub fn mutex_holder(&self, id: MutexId) -> KernResult<Option<Tid>> {
        let st = self.disable_interrupts();
        Ok(st.sync.mutex(id)?.holder)
    }

    /// Waiters in hand-off order
    pub fn mutex_waiters(&self, id: MutexId) -> KernResult<Vec<Tid>> {
        let mut guard = self.disable_interrupts();
        let st = &mut *guard;
        let waiters = st.sync.mutex(id)?.waiters;
        Ok(waiters.iter(&WaitLinks(&mut st.threads)).collect())
    }

    /// Acquire for the current thread; `Ok(false)` if it had to block
    ///
    /// A blocked caller finishes with `then` once the mutex is handed over.
    pub(crate) fn mutex_lock_cli(
        &self,
        st: &mut KernelState,
        id: MutexId,
        then: AfterLock,
    ) -> KernResult<bool> {
        let cur = st.sched.current;
        let m = st.sync.mutex_mut(id)?;
        let holder = match m.holder {
            None => {
                m.holder = Some(cur);
                return Ok(true);
            }
            Some(h) if h == cur => return Err(KernError::InvalidArgument),
            Some(h) => h,
        };
        m.waiters.push_back(&mut WaitLinks(&mut st.threads), cur);
        let t = st.threads.thread_mut(cur);
        t.continuation = Some(Continuation::MutexHandoff(then));
        t.waiting_on = Some(WaitObject::Mutex(id));
        st.sched.move_to_front(&mut st.threads, holder);
        log::trace!(target: "sync", "{} waits for mutex {} held by {}", cur, id.0, holder);
        self.yield_cli(st, ThreadStatus::BlockedOnMutex);
        Ok(false)
    }

    /// Release, handing ownership to the oldest waiter if there is one
    pub(crate) fn mutex_unlock_cli(&self, st: &mut KernelState, id: MutexId) -> KernResult<()> {
        let cur = st.sched.current;
        let m = st.sync.mutex_mut(id)?;
        if m.holder != Some(cur) {
            return Err(KernError::NotHolder);
        }
        self.hand_off(st, id)
    }

    /// Pass `id` to its oldest waiter, or leave it free
    fn hand_off(&self, st: &mut KernelState, id: MutexId) -> KernResult<()> {
        let m = st.sync.mutex_mut(id)?;
        match m.waiters.pop_front(&mut WaitLinks(&mut st.threads)) {
            Some(next) => {
                m.holder = Some(next);
                st.threads.thread_mut(next).waiting_on = None;
                st.sched.make_runnable(&mut st.threads, next);
            }
            None => m.holder = None,
        }
        Ok(())
    }

    /// Release every mutex an exiting thread still holds
    pub(crate) fn release_held_mutexes(&self, st: &mut KernelState, tid: Tid) {
        let held: Vec<MutexId> = st
            .sync
            .mutexes
            .iter()
            .filter(|(_, m)| m.holder == Some(tid))
            .map(|(&id, _)| id)
            .collect();
        for id in held {
            log::debug!(target: "sync", "{} exits holding mutex {}", tid, id.0);
            if let Err(e) = self.hand_off(st, id) {
                log::warn!(target: "sync", "mutex {} release failed: {}", id.0, e);
            }
        }
    }

    /// Take a doomed `tid` off the wait list of whatever it blocked on
    pub(crate) fn cancel_wait(&self, st: &mut KernelState, tid: Tid, on: WaitObject) {
        let mut links = WaitLinks(&mut st.threads);
        let removed = match on {
            WaitObject::Mutex(id) => st
                .sync
                .mutex_mut(id)
                .map(|m| m.waiters.remove(&mut links, tid)),
            WaitObject::Cond(id) => st
                .sync
                .cond_mut(id)
                .map(|c| c.waiters.remove(&mut links, tid)),
        };
        if !matches!(removed, Ok(true)) {
            log::warn!(target: "sync", "{} was not queued on {:?}", tid, on);
        }
    }

    /// Finish the operation that was waiting for a mutex
    pub(crate) fn after_lock(&self, st: &mut KernelState, tid: Tid, then: AfterLock) {
        let result = match then {
            AfterLock::Return => Ok(Outcome::Complete(0)),
            AfterLock::SemRecheck(sem) => self.sem_recheck_cli(st, sem),
            AfterLock::SemPost(sem) => self.sem_post_cli(st, sem),
        };
        self.complete(st, tid, result);
    }
}
