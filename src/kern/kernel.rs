//! Kernel - global state, boot and inspection
//!
//! Based on Mach4 kern/startup.c
//!
//! [`Kernel`] ties together the frame pool, the program loader and the
//! [`KernelState`] behind a single spin lock. Taking that lock is this
//! kernel's "disable interrupts": thread and task tables, the scheduler
//! queues and the synchronization objects are only touched while holding
//! it, and context switches happen with it held.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use super::copyio::UserSpace;
use super::elf_loader::ProgramLoader;
use super::ids::IdAllocator;
use super::sched::Scheduler;
use super::sync::SyncTable;
use super::task::{ChildList, Task, TaskState, TaskTable};
use super::thread::{TaskLinks, ThreadStatus, ThreadTable};
use crate::arch::{Machine, Ureg};
use crate::config::KernelConfig;
use crate::error::{KernError, KernResult};
use crate::types::{PhysAddr, TaskId, Tid, VirtAddr};
use crate::vm::{MapList, MapRegion, Vm};

// ============================================================================
// Kernel State
// ============================================================================

/// Everything guarded by the interrupt-disable lock
pub struct KernelState {
    pub(crate) threads: ThreadTable,
    pub(crate) tasks: TaskTable,
    pub(crate) sched: Scheduler,
    pub(crate) sync: SyncTable,
    pub(crate) machine: Box<dyn Machine>,
}

impl KernelState {
    fn new(machine: Box<dyn Machine>, max_threads: usize) -> Self {
        Self {
            threads: ThreadTable::new(max_threads),
            tasks: TaskTable::new(),
            sched: Scheduler::new(),
            sync: SyncTable::new(),
            machine,
        }
    }

    pub(crate) fn current(&self) -> Tid {
        self.sched.current
    }

    pub(crate) fn current_task(&self) -> TaskId {
        self.threads.thread(self.sched.current).task
    }

    /// Kernel view of `task`'s user memory
    pub(crate) fn user_space<'s>(&'s mut self, vm: &'s Vm, task: TaskId) -> UserSpace<'s> {
        let t = self.tasks.task(task);
        UserSpace::new(vm, t.page_dir, &t.maps, &mut *self.machine)
    }
}

// ============================================================================
// Kernel
// ============================================================================

pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) vm: Vm,
    pub(crate) ids: IdAllocator,
    pub(crate) loader: Box<dyn ProgramLoader>,
    cpu: Mutex<KernelState>,
    pub(crate) init_task: TaskId,
    pub(crate) idle_task: TaskId,
}

impl Kernel {
    /// Bring up the kernel and dispatch the init program
    ///
    /// Creates the idle task (kernel-only address space) and the init task
    /// running `config.init_program`, then switches to init.
    pub fn boot(
        config: KernelConfig,
        machine: Box<dyn Machine>,
        loader: Box<dyn ProgramLoader>,
    ) -> KernResult<Self> {
        if config.stack_pages == 0 || config.max_threads < 2 {
            return Err(KernError::InvalidArgument);
        }
        let vm = Vm::new(config.user_frames)?;
        let state = KernelState::new(machine, config.max_threads);
        let mut kernel = Kernel {
            config,
            vm,
            ids: IdAllocator::new(),
            loader,
            cpu: Mutex::new(state),
            init_task: TaskId::NULL,
            idle_task: TaskId::NULL,
        };
        kernel.idle_task = kernel.create_idle()?;
        kernel.init_task = kernel.create_init()?;
        {
            let mut guard = kernel.disable_interrupts();
            kernel.yield_cli(&mut guard, ThreadStatus::Runnable);
        }
        log::info!(
            target: "boot",
            "{} {} up: idle {}, init {}, {} frames free",
            crate::NAME,
            crate::VERSION,
            kernel.idle_task,
            kernel.init_task,
            kernel.vm.num_free_frames()
        );
        Ok(kernel)
    }

    fn create_idle(&self) -> KernResult<TaskId> {
        let mut guard = self.disable_interrupts();
        let st = &mut *guard;
        let tid = self.ids.next_tid();
        let id = TaskId::from(tid);
        let dir = self.vm.page_dir_init()?;
        st.tasks.insert(Task::new(id, None, dir, MapList::with_reserved()));
        let thread = st.threads.create(tid, id)?;
        thread.status = ThreadStatus::Runnable;
        let kern_sp = thread.kern_sp;
        st.tasks
            .task_mut(id)
            .live_threads
            .push_back(&mut TaskLinks(&mut st.threads), tid);
        st.sched.idle = tid;
        st.sched.current = tid;
        st.machine.set_kernel_stack(kern_sp);
        st.machine.set_page_directory(dir);
        Ok(id)
    }

    fn create_init(&self) -> KernResult<TaskId> {
        let mut guard = self.disable_interrupts();
        let st = &mut *guard;
        let tid = self.ids.next_tid();
        let id = TaskId::from(tid);
        let dir = self.vm.page_dir_init()?;
        st.tasks.insert(Task::new(id, None, dir, MapList::with_reserved()));
        st.threads.create(tid, id)?;

        let name = self.config.init_program;
        let (entry, sp) = self.load_image(st, id, name, &[name.as_bytes().to_vec()])?;
        st.threads.thread_mut(tid).regs = Ureg::user_entry(entry, sp);
        st.tasks
            .task_mut(id)
            .live_threads
            .push_back(&mut TaskLinks(&mut st.threads), tid);
        st.sched.enqueue_new(&mut st.threads, tid);
        Ok(id)
    }

    /// Take the kernel state lock
    pub(crate) fn disable_interrupts(&self) -> MutexGuard<'_, KernelState> {
        self.cpu.lock()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn current_tid(&self) -> Tid {
        self.disable_interrupts().current()
    }

    pub fn current_task(&self) -> TaskId {
        self.disable_interrupts().current_task()
    }

    pub fn init_task(&self) -> TaskId {
        self.init_task
    }

    pub fn idle_tid(&self) -> Tid {
        self.disable_interrupts().sched.idle
    }

    pub fn ticks(&self) -> u64 {
        self.disable_interrupts().sched.ticks
    }

    pub fn context_switches(&self) -> u64 {
        self.disable_interrupts().sched.switches
    }

    pub fn thread_status(&self, tid: Tid) -> Option<ThreadStatus> {
        self.disable_interrupts().threads.get(tid).map(|t| t.status)
    }

    /// Value a thread's last system call returned (its `%eax`)
    pub fn return_value(&self, tid: Tid) -> Option<i32> {
        self.disable_interrupts()
            .threads
            .get(tid)
            .map(|t| t.regs.eax as i32)
    }

    pub fn registers(&self, tid: Tid) -> Option<Ureg> {
        self.disable_interrupts().threads.get(tid).map(|t| t.regs)
    }

    /// Replace a thread's user registers (what user code would do by
    /// running before it traps)
    pub fn set_registers(&self, tid: Tid, regs: Ureg) -> KernResult<()> {
        let mut st = self.disable_interrupts();
        st.threads.get_mut(tid).ok_or(KernError::NotFound)?.regs = regs;
        Ok(())
    }

    pub fn task_of(&self, tid: Tid) -> Option<TaskId> {
        self.disable_interrupts().threads.get(tid).map(|t| t.task)
    }

    pub fn thread_exists(&self, tid: Tid) -> bool {
        self.disable_interrupts().threads.contains(tid)
    }

    pub fn task_exists(&self, id: TaskId) -> bool {
        self.disable_interrupts().tasks.contains(id)
    }

    pub fn thread_count(&self) -> usize {
        self.disable_interrupts().threads.len()
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.disable_interrupts().tasks.get(id).map(|t| t.state)
    }

    pub fn exit_status(&self, id: TaskId) -> Option<i32> {
        self.disable_interrupts().tasks.get(id).map(|t| t.exit_status)
    }

    pub fn parent_of(&self, id: TaskId) -> Option<TaskId> {
        self.disable_interrupts().tasks.get(id).and_then(|t| t.parent)
    }

    pub fn live_threads(&self, id: TaskId) -> Vec<Tid> {
        let mut guard = self.disable_interrupts();
        let st = &mut *guard;
        match st.tasks.get(id) {
            Some(t) => {
                let head = t.live_threads;
                head.iter(&TaskLinks(&mut st.threads)).collect()
            }
            None => vec![],
        }
    }

    pub fn children(&self, id: TaskId) -> Vec<TaskId> {
        let st = self.disable_interrupts();
        if !st.tasks.contains(id) {
            return vec![];
        }
        st.tasks.child_ids(id, ChildList::Live)
    }

    pub fn zombie_children(&self, id: TaskId) -> Vec<TaskId> {
        let st = self.disable_interrupts();
        if !st.tasks.contains(id) {
            return vec![];
        }
        st.tasks.child_ids(id, ChildList::Zombie)
    }

    pub fn ready_queue(&self) -> Vec<Tid> {
        let mut guard = self.disable_interrupts();
        let st = &mut *guard;
        st.sched.ready_ids(&mut st.threads)
    }

    pub fn sleep_queue(&self) -> Vec<Tid> {
        let mut guard = self.disable_interrupts();
        let st = &mut *guard;
        st.sched.sleeping_ids(&mut st.threads)
    }

    pub fn free_frames(&self) -> usize {
        self.vm.num_free_frames()
    }

    /// User regions of a task, in address order
    pub fn regions(&self, id: TaskId) -> Vec<MapRegion> {
        self.disable_interrupts()
            .tasks
            .get(id)
            .map(|t| t.maps.user_regions())
            .unwrap_or_default()
    }

    pub fn page_directory(&self, id: TaskId) -> Option<PhysAddr> {
        self.disable_interrupts().tasks.get(id).map(|t| t.page_dir)
    }

    /// Physical address `va` maps to in `task`
    pub fn translate(&self, id: TaskId, va: VirtAddr) -> Option<PhysAddr> {
        let dir = self.page_directory(id)?;
        self.vm.translate(dir, va)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Resume, TraceMachine};
    use crate::kern::elf_loader::RamDisk;
    use crate::kern::testutil::{boot_kernel, init_image};

    #[test]
    fn test_boot_dispatches_init() {
        let (k, m) = boot_kernel();
        let init = k.current_tid();
        assert_ne!(init, k.idle_tid());
        assert_eq!(k.task_of(init), Some(k.init_task()));
        assert_eq!(k.thread_status(init), Some(ThreadStatus::Runnable));
        assert_eq!(k.thread_count(), 2);

        let (from, to, resume) = m.switches()[0];
        assert_eq!((from, to), (k.idle_tid(), init));
        assert!(matches!(resume, Resume::Fresh { entry_ip: 0x0100_0000, .. }));
    }

    #[test]
    fn test_boot_rejects_bad_config() {
        let disk = RamDisk::new().with("init", init_image());
        let config = KernelConfig::default().with_max_threads(1);
        let booted = Kernel::boot(config, Box::new(TraceMachine::new()), Box::new(disk));
        assert!(matches!(booted, Err(KernError::InvalidArgument)));
    }

    #[test]
    fn test_boot_needs_init_program() {
        let config = KernelConfig::default().with_user_frames(64);
        let booted = Kernel::boot(config, Box::new(TraceMachine::new()), Box::new(RamDisk::new()));
        assert!(matches!(booted, Err(KernError::NotFound)));
    }

    #[test]
    fn test_init_owns_image_and_stack() {
        let (k, _m) = boot_kernel();
        let regions = k.regions(k.init_task());
        assert!(regions.iter().any(|r| r.contains(0x0100_0000)));
        assert!(regions
            .iter()
            .any(|r| r.contains(crate::config::USER_STACK_TOP - 1)));
        assert!(k.translate(k.init_task(), 0x0100_0000).is_some());
    }
}
