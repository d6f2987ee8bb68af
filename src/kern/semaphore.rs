//! Counting Semaphores
//!
//! A count guarded by a kernel mutex, with a condition variable for
//! threads waiting on a zero count. Both halves may block on the internal
//! mutex; when they do, the rest of the operation runs as the thread's
//! continuation once the mutex is handed over.

use super::kernel::{Kernel, KernelState};
use super::syscall::Outcome;
use super::thread::AfterLock;
use crate::error::{KernError, KernResult};
use crate::types::{CondId, MutexId, SemId};

/// Semaphore record
#[derive(Debug)]
pub struct KSem {
    pub(crate) count: i32,
    pub(crate) mutex: MutexId,
    pub(crate) cond: CondId,
}

impl Kernel {
    pub fn sem_create(&self, count: i32) -> KernResult<SemId> {
        if count < 0 {
            return Err(KernError::InvalidArgument);
        }
        let mutex = self.mutex_create();
        let cond = self.cond_create();
        let mut st = self.disable_interrupts();
        let id = SemId(st.sync.next_id());
        st.sync.sems.insert(id, KSem { count, mutex, cond });
        Ok(id)
    }

    pub fn sem_destroy(&self, id: SemId) -> KernResult<()> {
        let (mutex, cond) = {
            let st = self.disable_interrupts();
            let s = st.sync.sem(id)?;
            (s.mutex, s.cond)
        };
        self.cond_destroy(cond)?;
        self.mutex_destroy(mutex)?;
        self.disable_interrupts().sync.sems.remove(&id);
        Ok(())
    }

    /// Decrement, blocking while the count is zero
    pub fn sem_wait(&self, id: SemId) -> KernResult<Outcome> {
        let mut guard = self.disable_interrupts();
        let st = &mut *guard;
        let mutex = st.sync.sem(id)?.mutex;
        if self.mutex_lock_cli(st, mutex, AfterLock::SemRecheck(id))? {
            self.sem_recheck_cli(st, id)
        } else {
            Ok(Outcome::Blocked)
        }
    }

    /// Increment and wake one waiter
    pub fn sem_signal(&self, id: SemId) -> KernResult<Outcome> {
        let mut guard = self.disable_interrupts();
        let st = &mut *guard;
        let mutex = st.sync.sem(id)?.mutex;
        if self.mutex_lock_cli(st, mutex, AfterLock::SemPost(id))? {
            self.sem_post_cli(st, id)
        } else {
            Ok(Outcome::Blocked)
        }
    }

    pub fn sem_count(&self, id: SemId) -> KernResult<i32> {
        Ok(self.disable_interrupts().sync.sem(id)?.count)
    }

    /// With the semaphore's mutex held: take a unit or wait for one
    pub(crate) fn sem_recheck_cli(&self, st: &mut KernelState, id: SemId) -> KernResult<Outcome> {
        let s = st.sync.sem_mut(id)?;
        let (mutex, cond) = (s.mutex, s.cond);
        if s.count > 0 {
            s.count -= 1;
            self.mutex_unlock_cli(st, mutex)?;
            return Ok(Outcome::Complete(0));
        }
        self.cond_wait_cli(st, cond, mutex, AfterLock::SemRecheck(id))?;
        Ok(Outcome::Blocked)
    }

    /// With the semaphore's mutex held: add a unit and wake a waiter
    pub(crate) fn sem_post_cli(&self, st: &mut KernelState, id: SemId) -> KernResult<Outcome> {
        let s = st.sync.sem_mut(id)?;
        s.count += 1;
        let (mutex, cond) = (s.mutex, s.cond);
        self.cond_signal_cli(st, cond)?;
        self.mutex_unlock_cli(st, mutex)?;
        Ok(Outcome::Complete(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::syscall::Syscall;
    use crate::kern::testutil::boot_kernel;

    #[test]
    fn test_negative_initial_count_rejected() {
        let (k, _m) = boot_kernel();
        assert_eq!(k.sem_create(-1), Err(KernError::InvalidArgument));
    }

    #[test]
    fn test_wait_takes_available_units() {
        let (k, _m) = boot_kernel();
        let sem = k.sem_create(2).unwrap();
        assert_eq!(k.sem_wait(sem), Ok(Outcome::Complete(0)));
        assert_eq!(k.sem_wait(sem), Ok(Outcome::Complete(0)));
        assert_eq!(k.sem_count(sem), Ok(0));
        assert_eq!(k.sem_destroy(sem), Ok(()));
        assert_eq!(k.sem_count(sem), Err(KernError::InvalidArgument));
    }

    #[test]
    fn test_destroy_with_waiter_refused() {
        let (k, _m) = boot_kernel();
        let a = k.current_tid();
        let Outcome::Complete(b) = k.syscall(Syscall::ThreadFork) else { panic!() };
        let sem = k.sem_create(0).unwrap();

        assert_eq!(k.sem_wait(sem), Ok(Outcome::Blocked));
        assert_eq!(k.current_tid().as_i32(), b);
        assert_eq!(k.sem_destroy(sem), Err(KernError::InvalidArgument));
        assert_eq!(k.sem_signal(sem), Ok(Outcome::Complete(0)));
        k.timer_tick();
        assert_eq!(k.current_tid(), a);
        assert_eq!(k.sem_destroy(sem), Ok(()));
    }
}
