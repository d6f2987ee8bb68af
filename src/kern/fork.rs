//! Task and thread creation
//!
//! Based on Mach4 kern/task.c (task_create) and kern/thread.c
//! (thread_create)
//!
//! Both calls build the new thread completely before it becomes visible:
//! any failure unwinds what was built and leaves no trace in the task
//! tree or the scheduler. The new thread is queued as `Forked` and resumes
//! at the caller's user registers with `eax = 0`, while the caller gets
//! the new tid.

use super::kernel::{Kernel, KernelState};
use super::syscall::Outcome;
use super::task::{ChildList, Task};
use super::thread::{TaskLinks, ThreadStatus};
use crate::error::{KernError, KernResult};
use crate::types::{TaskId, Tid};

impl Kernel {
    /// Duplicate the calling task, which must have a single thread
    pub(crate) fn fork_cli(&self, st: &mut KernelState) -> KernResult<Outcome> {
        let cur = st.current();
        let parent = st.current_task();
        if st.tasks.task(parent).live_threads.len() != 1 {
            return Err(KernError::MultiThreaded);
        }

        let child_tid = self.ids.next_tid();
        let child = TaskId::from(child_tid);
        st.threads.create(child_tid, child)?;
        let dir = match self.vm.page_dir_copy(st.tasks.task(parent).page_dir) {
            Ok(dir) => dir,
            Err(e) => {
                st.threads.destroy(child_tid);
                log::debug!(target: "task", "fork by {} failed: {}", cur, e);
                return Err(e);
            }
        };
        let maps = st.tasks.task(parent).maps.clone();

        // point of no return
        self.init_forked(st, cur, child_tid, true);
        st.tasks.insert(Task::new(child, Some(parent), dir, maps));
        st.tasks
            .task_mut(child)
            .live_threads
            .push_back(&mut TaskLinks(&mut st.threads), child_tid);
        st.tasks
            .with_children(parent, ChildList::Live, |q, links| q.push_back(links, child));
        st.sched.enqueue_new(&mut st.threads, child_tid);
        log::debug!(target: "task", "{} forked {} ({})", parent, child, child_tid);
        Ok(Outcome::Complete(child_tid.as_i32()))
    }

    /// Add a thread to the calling task
    pub(crate) fn thread_fork_cli(&self, st: &mut KernelState) -> KernResult<Outcome> {
        let cur = st.current();
        let task = st.current_task();
        let tid = self.ids.next_tid();
        st.threads.create(tid, task)?;
        self.init_forked(st, cur, tid, false);
        st.tasks
            .task_mut(task)
            .live_threads
            .push_back(&mut TaskLinks(&mut st.threads), tid);
        st.sched.enqueue_new(&mut st.threads, tid);
        log::debug!(target: "task", "{} thread_fork -> {}", cur, tid);
        Ok(Outcome::Complete(tid.as_i32()))
    }

    /// Give `new` the caller's user state so both return from the same call
    fn init_forked(&self, st: &mut KernelState, caller: Tid, new: Tid, inherit_swexn: bool) {
        let (regs, swexn) = {
            let t = st.threads.thread(caller);
            (t.regs, t.swexn)
        };
        let t = st.threads.thread_mut(new);
        t.regs = regs;
        t.set_return(0);
        t.swexn = if inherit_swexn { swexn } else { None };
        t.status = ThreadStatus::Forked;
    }
}
