//! Thread exit, task teardown and wait
//!
//! Based on Mach4 kern/task.c (task_terminate) and kern/thread.c
//! (thread_terminate, thread_reaper)
//!
//! A vanishing thread cannot free the kernel stack it is running on, so
//! it parks itself on its task's zombie-thread list and someone else frees
//! it later: a sibling that vanishes after it, or whoever reaps the task.
//! The last thread out also releases the address space, hands its children
//! to init and reports the task to its parent, directly to a thread
//! already blocked in `wait` if there is one.
//!
//! Every check-then-act step below runs under the kernel state lock, so a
//! vanishing sibling and an arriving waiter cannot interleave.

use alloc::vec::Vec;

use super::kernel::{Kernel, KernelState};
use super::syscall::Outcome;
use super::task::{ChildList, TaskState};
use super::thread::{Continuation, RunLinks, TaskLinks, ThreadStatus, WaitLinks};
use crate::error::{KernError, KernResult};
use crate::types::{TaskId, Tid, VirtAddr};

impl Kernel {
    /// Record the status the task will report when it exits
    pub(crate) fn set_status_cli(&self, st: &mut KernelState, status: i32) -> KernResult<Outcome> {
        let task = st.current_task();
        st.tasks.task_mut(task).exit_status = status;
        Ok(Outcome::Complete(0))
    }

    /// Terminate the calling thread; never returns to it
    pub(crate) fn vanish_cli(&self, st: &mut KernelState) {
        let cur = st.current();
        let task = st.current_task();
        if cur == st.sched.idle {
            log::warn!(target: "task", "idle thread cannot vanish");
            return;
        }

        // a zombie handed over while we were being killed
        if let Some(z) = st.threads.thread_mut(cur).wait_record.take() {
            self.reap_task(st, z);
        }
        self.reap_zombie_threads(st, task);
        self.release_held_mutexes(st, cur);

        let remaining = {
            let t = st.tasks.task_mut(task);
            let mut links = TaskLinks(&mut st.threads);
            t.live_threads.remove(&mut links, cur);
            t.zombie_threads.push_back(&mut links, cur);
            t.live_threads.len()
        };
        if remaining > 0 {
            log::debug!(target: "task", "{} vanished, {} keeps {} threads", cur, task, remaining);
            self.yield_cli(st, ThreadStatus::Zombie);
            return;
        }

        let (dir, status) = {
            let t = st.tasks.task_mut(task);
            t.maps.clear_user();
            t.state = TaskState::Zombie;
            (t.page_dir, t.exit_status)
        };
        self.vm.page_dir_clear(dir);
        self.reparent_children(st, task);

        if task == self.init_task {
            log::warn!(target: "task", "init exited with status {}", status);
        } else {
            let parent = st.tasks.task(task).parent.unwrap_or(self.init_task);
            st.tasks
                .with_children(parent, ChildList::Live, |q, links| q.remove(links, task));
            self.deliver_zombie(st, parent, task);
        }
        log::debug!(target: "task", "{} exited with status {}", task, status);
        self.yield_cli(st, ThreadStatus::Zombie);
    }

    /// Give every child of `task` to init
    fn reparent_children(&self, st: &mut KernelState, task: TaskId) {
        let init = self.init_task;
        let live = st.tasks.child_ids(task, ChildList::Live);
        for child in live {
            st.tasks
                .with_children(task, ChildList::Live, |q, links| q.remove(links, child));
            st.tasks.task_mut(child).parent = Some(init);
            st.tasks
                .with_children(init, ChildList::Live, |q, links| q.push_back(links, child));
        }
        let zombies = st.tasks.child_ids(task, ChildList::Zombie);
        for child in zombies {
            st.tasks
                .with_children(task, ChildList::Zombie, |q, links| q.remove(links, child));
            st.tasks.task_mut(child).parent = Some(init);
            self.deliver_zombie(st, init, child);
        }
    }

    /// Report an exited `child` to `parent`
    ///
    /// A thread already waiting in the parent gets the child directly;
    /// otherwise it joins the parent's zombie list, and the zombie queued
    /// before it is stripped down to its exit status.
    fn deliver_zombie(&self, st: &mut KernelState, parent: TaskId, child: TaskId) {
        let waiter = st
            .tasks
            .task_mut(parent)
            .waiters
            .pop_front(&mut WaitLinks(&mut st.threads));
        match waiter {
            Some(w) => {
                st.threads.thread_mut(w).wait_record = Some(child);
                st.sched.make_runnable_front(&mut st.threads, w);
                log::trace!(target: "task", "{} handed to waiting {}", child, w);
            }
            None => {
                if let Some(prev) = st.tasks.task(parent).zombie_children.last() {
                    self.reclaim_task(st, prev);
                }
                st.tasks
                    .with_children(parent, ChildList::Zombie, |q, links| q.push_back(links, child));
            }
        }
    }

    /// Free the thread records and page directory of an exited task
    fn reclaim_task(&self, st: &mut KernelState, task: TaskId) {
        if st.tasks.task(task).reclaimed {
            return;
        }
        self.reap_zombie_threads(st, task);
        let t = st.tasks.task_mut(task);
        if !t.zombie_threads.is_empty() {
            // its last thread has not switched away yet
            return;
        }
        t.reclaimed = true;
        let dir = t.page_dir;
        self.vm.page_dir_free(dir);
    }

    /// Free zombie threads of `task` other than the running one
    fn reap_zombie_threads(&self, st: &mut KernelState, task: TaskId) {
        let cur = st.current();
        let head = st.tasks.task(task).zombie_threads;
        let zombies: Vec<Tid> = head
            .iter(&TaskLinks(&mut st.threads))
            .filter(|&z| z != cur)
            .collect();
        for z in zombies {
            st.tasks
                .task_mut(task)
                .zombie_threads
                .remove(&mut TaskLinks(&mut st.threads), z);
            st.threads.destroy(z);
        }
    }

    /// Remove a zombie task for good; returns its exit status
    fn reap_task(&self, st: &mut KernelState, task: TaskId) -> i32 {
        self.reclaim_task(st, task);
        let status = st.tasks.task(task).exit_status;
        st.tasks.remove(task);
        log::debug!(target: "task", "reaped {} (status {})", task, status);
        status
    }

    // ========================================================================
    // wait
    // ========================================================================

    /// Collect an exited child, blocking until one exits
    pub(crate) fn wait_cli(&self, st: &mut KernelState, status_ptr: VirtAddr) -> KernResult<Outcome> {
        let cur = st.current();
        let task = st.current_task();
        if status_ptr != 0 {
            st.user_space(&self.vm, task).check_writable(status_ptr, 4)?;
        }
        let zombie = st
            .tasks
            .with_children(task, ChildList::Zombie, |q, links| q.pop_front(links));
        if let Some(z) = zombie {
            return Ok(Outcome::Complete(self.collect_child(st, task, z, status_ptr)));
        }

        // every live child already has a waiter lined up for it
        let t = st.tasks.task(task);
        if t.waiters.len() >= t.children.len() {
            return Err(KernError::NoChildren);
        }
        st.tasks
            .task_mut(task)
            .waiters
            .push_back(&mut WaitLinks(&mut st.threads), cur);
        st.threads.thread_mut(cur).continuation = Some(Continuation::ReapChild { status_ptr });
        self.yield_cli(st, ThreadStatus::Suspended);
        Ok(Outcome::Blocked)
    }

    /// Reap `child` for `task` and store its status; returns the child id
    fn collect_child(&self, st: &mut KernelState, task: TaskId, child: TaskId, status_ptr: VirtAddr) -> i32 {
        let status = self.reap_task(st, child);
        if status_ptr != 0 {
            if let Err(e) = st.user_space(&self.vm, task).suword32(status_ptr, status as u32) {
                log::warn!(target: "task", "{} lost status of {}: {}", task, child, e);
            }
        }
        child.as_i32()
    }

    /// Continuation of a `wait` that blocked
    pub(crate) fn finish_wait(&self, st: &mut KernelState, tid: Tid, status_ptr: VirtAddr) {
        let record = st.threads.thread_mut(tid).wait_record.take();
        let result = match record {
            Some(child) => {
                let task = st.threads.thread(tid).task;
                Ok(Outcome::Complete(self.collect_child(st, task, child, status_ptr)))
            }
            None => Err(KernError::NoChildren),
        };
        self.complete(st, tid, result);
    }

    // ========================================================================
    // Killing a task
    // ========================================================================

    /// Terminate the whole calling task with `status`
    ///
    /// Other threads of the task are marked doomed and vanish the next time
    /// they are dispatched. Blocked ones are taken off whatever they wait
    /// on and made runnable now, since nothing in the dying task is left to
    /// wake them. Mutexes they hold are released as they vanish.
    pub(crate) fn kill_current_cli(&self, st: &mut KernelState, status: i32) {
        let cur = st.current();
        let task = st.current_task();
        st.tasks.task_mut(task).exit_status = status;
        let head = st.tasks.task(task).live_threads;
        let others: Vec<Tid> = head
            .iter(&TaskLinks(&mut st.threads))
            .filter(|&t| t != cur)
            .collect();
        for t in others {
            self.doom_thread(st, task, t);
        }
        log::debug!(target: "task", "{} killed by {} with status {}", task, cur, status);
        self.vanish_cli(st);
    }

    fn doom_thread(&self, st: &mut KernelState, task: TaskId, tid: Tid) {
        let thread = st.threads.thread_mut(tid);
        thread.doomed = true;
        if let Some(on) = thread.waiting_on.take() {
            self.cancel_wait(st, tid, on);
            st.sched.make_runnable(&mut st.threads, tid);
            return;
        }
        let blocked_in = thread.continuation;
        match blocked_in {
            Some(Continuation::SleepExpired) => {
                st.sched.sleeping.remove(&mut RunLinks(&mut st.threads), tid);
            }
            Some(Continuation::Descheduled) => st.threads.thread_mut(tid).descheduled = false,
            Some(Continuation::ReapChild { .. }) => {
                st.tasks
                    .task_mut(task)
                    .waiters
                    .remove(&mut WaitLinks(&mut st.threads), tid);
            }
            // runnable, or already woken and waiting for the CPU
            _ => return,
        }
        st.sched.make_runnable(&mut st.threads, tid);
    }
}
