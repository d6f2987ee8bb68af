//! Kernel synchronization object table
//!
//! Mutexes, condition variables and semaphores used by kernel code are
//! named by small integer handles and live here, inside the kernel state,
//! so their wait lists are protected by the same lock as the scheduler
//! queues.

use alloc::collections::BTreeMap;

use super::condvar::KCond;
use super::mutex::KMutex;
use super::semaphore::KSem;
use crate::error::{KernError, KernResult};
use crate::types::{CondId, MutexId, SemId};

#[derive(Debug, Default)]
pub struct SyncTable {
    pub(crate) mutexes: BTreeMap<MutexId, KMutex>,
    pub(crate) conds: BTreeMap<CondId, KCond>,
    pub(crate) sems: BTreeMap<SemId, KSem>,
    next_id: u32,
}

impl SyncTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub fn mutex(&self, id: MutexId) -> KernResult<&KMutex> {
        self.mutexes.get(&id).ok_or(KernError::InvalidArgument)
    }

    pub fn mutex_mut(&mut self, id: MutexId) -> KernResult<&mut KMutex> {
        self.mutexes.get_mut(&id).ok_or(KernError::InvalidArgument)
    }

    pub fn cond(&self, id: CondId) -> KernResult<&KCond> {
        self.conds.get(&id).ok_or(KernError::InvalidArgument)
    }

    pub fn cond_mut(&mut self, id: CondId) -> KernResult<&mut KCond> {
        self.conds.get_mut(&id).ok_or(KernError::InvalidArgument)
    }

    pub fn sem(&self, id: SemId) -> KernResult<&KSem> {
        self.sems.get(&id).ok_or(KernError::InvalidArgument)
    }

    pub fn sem_mut(&mut self, id: SemId) -> KernResult<&mut KSem> {
        self.sems.get_mut(&id).ok_or(KernError::InvalidArgument)
    }
}
