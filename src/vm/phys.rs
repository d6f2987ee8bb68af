//! Physical Memory - the user frame pool and the physical access window
//!
//! Frames live at `USER_MEM_START + i * PAGE_SIZE`. The kernel only reaches
//! a frame's contents through the window, which maps one frame at a time;
//! every access here takes the window lock, so only one thread touches
//! physical memory this way at once.

use alloc::boxed::Box;
use alloc::vec;

use crate::config::{PAGE_SIZE, USER_MEM_START};
use crate::kern::lock::SpinLock;
use crate::types::PhysAddr;

/// Backing store for the user frame pool
pub struct PhysMem {
    frames: usize,
    window: SpinLock<Box<[u8]>>,
}

impl PhysMem {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            window: SpinLock::new(
                "phys window",
                vec![0u8; frames * PAGE_SIZE as usize].into_boxed_slice(),
            ),
        }
    }

    /// Number of frames in the pool
    pub fn frame_count(&self) -> usize {
        self.frames
    }

    /// Physical address of frame `index`
    pub fn frame_addr(&self, index: usize) -> PhysAddr {
        USER_MEM_START + (index as u32) * PAGE_SIZE
    }

    /// Whether `[pa, pa + len)` lies inside the pool
    pub fn contains(&self, pa: PhysAddr, len: usize) -> bool {
        let end = USER_MEM_START as u64 + (self.frames as u64) * PAGE_SIZE as u64;
        pa >= USER_MEM_START && (pa as u64) + (len as u64) <= end
    }

    fn offset(&self, pa: PhysAddr, len: usize) -> usize {
        assert!(
            self.contains(pa, len),
            "physical access {:#x}+{} outside frame pool",
            pa,
            len
        );
        (pa - USER_MEM_START) as usize
    }

    pub fn read(&self, pa: PhysAddr, buf: &mut [u8]) {
        let off = self.offset(pa, buf.len());
        let mem = self.window.lock();
        buf.copy_from_slice(&mem[off..off + buf.len()]);
    }

    pub fn write(&self, pa: PhysAddr, data: &[u8]) {
        let off = self.offset(pa, data.len());
        let mut mem = self.window.lock();
        mem[off..off + data.len()].copy_from_slice(data);
    }

    pub fn read_u32(&self, pa: PhysAddr) -> u32 {
        let mut word = [0u8; 4];
        self.read(pa, &mut word);
        u32::from_le_bytes(word)
    }

    pub fn write_u32(&self, pa: PhysAddr, value: u32) {
        self.write(pa, &value.to_le_bytes());
    }

    pub fn zero_frame(&self, frame: PhysAddr) {
        let off = self.offset(frame, PAGE_SIZE as usize);
        let mut mem = self.window.lock();
        mem[off..off + PAGE_SIZE as usize].fill(0);
    }

    /// Copy one frame to another through the window
    pub fn copy_frame(&self, dst: PhysAddr, src: PhysAddr) {
        let s = self.offset(src, PAGE_SIZE as usize);
        let d = self.offset(dst, PAGE_SIZE as usize);
        let mut mem = self.window.lock();
        mem.copy_within(s..s + PAGE_SIZE as usize, d);
    }
}
