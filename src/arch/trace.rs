//! Recording machine for hosted runs
//!
//! Performs no privileged work; every request is appended to a shared
//! event log so tests can check which thread the kernel dispatched, with
//! what resume tag, and when it reloaded page directories.
//!
//! Resuming a switched-out thread is also checked against the kernel stack
//! loaded just before it: the saved pointer must sit one [`SWITCH_FRAME`]
//! below that stack's top, or a [`MachineEvent::StackMismatch`] is logged.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::{Machine, Resume, SWITCH_FRAME};
use crate::types::{PhysAddr, Tid, VirtAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineEvent {
    KernelStack(u32),
    PageDirectory(PhysAddr),
    Invalidate(VirtAddr),
    Switch { from: Tid, to: Tid, resume: Resume },
    /// `to` was resumed on a stack pointer its kernel stack cannot hold
    StackMismatch { to: Tid, saved_sp: u32, esp0: Option<u32> },
}

/// Cloneable handle; clones share one event log
#[derive(Debug, Clone, Default)]
pub struct TraceMachine {
    events: Arc<Mutex<Vec<MachineEvent>>>,
}

impl TraceMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MachineEvent> {
        self.events.lock().clone()
    }

    /// Context switches in order
    pub fn switches(&self) -> Vec<(Tid, Tid, Resume)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match *e {
                MachineEvent::Switch { from, to, resume } => Some((from, to, resume)),
                _ => None,
            })
            .collect()
    }

    /// Last thread switched to
    pub fn last_switch_target(&self) -> Option<Tid> {
        self.switches().last().map(|s| s.1)
    }

    /// Resume tag of the last switch
    pub fn last_switch_resume(&self) -> Option<Resume> {
        self.switches().last().map(|s| s.2)
    }

    /// Pages invalidated, in order
    pub fn invalidations(&self) -> Vec<VirtAddr> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match *e {
                MachineEvent::Invalidate(va) => Some(va),
                _ => None,
            })
            .collect()
    }

    /// Resumes whose saved stack pointer did not match the loaded stack
    pub fn stack_mismatches(&self) -> Vec<MachineEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, MachineEvent::StackMismatch { .. }))
            .copied()
            .collect()
    }

    pub fn directory_loads(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, MachineEvent::PageDirectory(_)))
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn record(&self, event: MachineEvent) {
        self.events.lock().push(event);
    }
}

impl Machine for TraceMachine {
    fn set_kernel_stack(&mut self, esp0: u32) {
        self.record(MachineEvent::KernelStack(esp0));
    }

    fn set_page_directory(&mut self, dir: PhysAddr) {
        self.record(MachineEvent::PageDirectory(dir));
    }

    fn invalidate_page(&mut self, va: VirtAddr) {
        self.record(MachineEvent::Invalidate(va));
    }

    fn context_switch(&mut self, from: Tid, to: Tid, resume: Resume) {
        let mut events = self.events.lock();
        if let Resume::Resumable { saved_sp } = resume {
            let esp0 = events.iter().rev().find_map(|e| match *e {
                MachineEvent::KernelStack(sp) => Some(sp),
                _ => None,
            });
            if esp0.and_then(|top| top.checked_sub(SWITCH_FRAME)) != Some(saved_sp) {
                events.push(MachineEvent::StackMismatch { to, saved_sp, esp0 });
            }
        }
        events.push(MachineEvent::Switch { from, to, resume });
    }
}
