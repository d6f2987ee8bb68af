//! Physical Frame Allocator
//!
//! Free frames form a singly linked list threaded through their own first
//! word (0 terminates the list; frame 0 is kernel memory and never pooled).
//! The list is guarded by a spin lock.
//!
//! Admission control is separate from allocation: callers reserve frames by
//! decrementing the free counter up front ([`FrameAllocator::dec_num_free_frames`]),
//! which fails cleanly when memory is short. [`FrameAllocator::frame_alloc`]
//! then pops a frame for a reservation already held and never touches the
//! counter, so a later page fault cannot run out of memory.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::phys::PhysMem;
use crate::error::{KernError, KernResult};
use crate::kern::lock::SpinLock;
use crate::types::PhysAddr;

const LIST_END: PhysAddr = 0;

pub struct FrameAllocator {
    head: SpinLock<PhysAddr>,
    free: AtomicUsize,
    total: usize,
}

impl FrameAllocator {
    /// Thread every frame of `phys` onto the free list
    pub fn new(phys: &PhysMem) -> Self {
        let total = phys.frame_count();
        let mut head = LIST_END;
        for i in (0..total).rev() {
            let frame = phys.frame_addr(i);
            phys.write_u32(frame, head);
            head = frame;
        }
        Self {
            head: SpinLock::new("free frames", head),
            free: AtomicUsize::new(total),
            total,
        }
    }

    pub fn total_frames(&self) -> usize {
        self.total
    }

    /// Frames neither allocated nor reserved
    pub fn num_free_frames(&self) -> usize {
        self.free.load(Ordering::Acquire)
    }

    /// Reserve `n` frames, failing without side effects if fewer remain
    pub fn dec_num_free_frames(&self, n: usize) -> KernResult<()> {
        self.free
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| free.checked_sub(n))
            .map(|_| ())
            .map_err(|_| KernError::NoFrames)
    }

    /// Return `n` reservations
    pub fn inc_num_free_frames(&self, n: usize) {
        let prev = self.free.fetch_add(n, Ordering::AcqRel);
        debug_assert!(prev + n <= self.total, "frame counter overflow");
    }

    /// Pop a frame for a reservation the caller already holds
    pub fn frame_alloc(&self, phys: &PhysMem) -> KernResult<PhysAddr> {
        let mut head = self.head.lock();
        let frame = *head;
        if frame == LIST_END {
            log::error!(target: "vm", "free list empty with reservation held");
            return Err(KernError::NoFrames);
        }
        *head = phys.read_u32(frame);
        Ok(frame)
    }

    /// Push a frame back; the caller decides whether its reservation goes too
    pub fn frame_free(&self, phys: &PhysMem, frame: PhysAddr) {
        let mut head = self.head.lock();
        phys.write_u32(frame, *head);
        *head = frame;
    }

    /// Walk the free list (diagnostics)
    pub fn free_list(&self, phys: &PhysMem) -> Vec<PhysAddr> {
        let head = self.head.lock();
        let mut out = Vec::new();
        let mut cur = *head;
        while cur != LIST_END && out.len() <= self.total {
            out.push(cur);
            cur = phys.read_u32(cur);
        }
        out
    }
}
