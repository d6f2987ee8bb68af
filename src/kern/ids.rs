//! Thread id allocation
//!
//! One counter under a spin lock hands out tids for every thread in the
//! system. Ids only grow and are never recycled, so a stale tid held by
//! user code can never name a different thread.

use super::lock::SpinLock;
use crate::types::Tid;

pub struct IdAllocator {
    next: SpinLock<u32>,
}

impl IdAllocator {
    pub const fn new() -> Self {
        Self {
            next: SpinLock::new("tids", 1),
        }
    }

    pub fn next_tid(&self) -> Tid {
        let mut next = self.next.lock();
        let tid = Tid(*next);
        *next += 1;
        tid
    }

    /// Highest tid handed out so far
    pub fn last_issued(&self) -> Tid {
        Tid(*self.next.lock() - 1)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
