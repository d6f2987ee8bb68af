//! VM subsystem - frames, page tables, address-space maps and faults
//!
//! Based on Mach4 vm/ (pmap, vm_map, vm_fault, vm_user)
//!
//! [`Vm`] owns the user frame pool and the boot-time structures every
//! address space shares: the kernel identity-mapping tables and the
//! all-zero frame that backs zero-fill-on-demand pages.

pub mod fault;
pub mod frame;
pub mod phys;
pub mod pmap;
pub mod vm_map;
pub mod vm_user;

pub use fault::{FaultResult, FaultStats, FaultType};
pub use frame::FrameAllocator;
pub use phys::PhysMem;
pub use pmap::{Pte, PteFlags};
pub use vm_map::{MapFlags, MapList, MapRegion};

use crate::config::{KERNEL_PDE_COUNT, PAGE_SIZE};
use crate::error::KernResult;
use crate::types::PhysAddr;

/// Physical memory plus the structures shared by every address space
pub struct Vm {
    pub phys: PhysMem,
    pub frames: FrameAllocator,
    kernel_tables: [PhysAddr; KERNEL_PDE_COUNT],
    zfod: PhysAddr,
    pub stats: FaultStats,
}

impl Vm {
    /// Build the frame pool, the kernel tables and the zero frame
    pub fn new(user_frames: usize) -> KernResult<Self> {
        let phys = PhysMem::new(user_frames);
        let frames = FrameAllocator::new(&phys);
        let mut vm = Vm {
            phys,
            frames,
            kernel_tables: [0; KERNEL_PDE_COUNT],
            zfod: 0,
            stats: FaultStats::new(),
        };
        vm.kernel_tables = vm.build_kernel_tables()?;
        vm.zfod = vm.take_frame()?;
        log::info!(
            target: "vm",
            "{} user frames, {} free after boot structures",
            user_frames,
            vm.frames.num_free_frames()
        );
        Ok(vm)
    }

    /// Frame every ZFOD mapping points at
    pub fn zfod_frame(&self) -> PhysAddr {
        self.zfod
    }

    pub fn kernel_tables(&self) -> &[PhysAddr; KERNEL_PDE_COUNT] {
        &self.kernel_tables
    }

    pub fn num_free_frames(&self) -> usize {
        self.frames.num_free_frames()
    }

    /// Reserve, pop and zero one frame
    pub(crate) fn take_frame(&self) -> KernResult<PhysAddr> {
        self.frames.dec_num_free_frames(1)?;
        match self.frames.frame_alloc(&self.phys) {
            Ok(frame) => {
                self.phys.zero_frame(frame);
                Ok(frame)
            }
            Err(e) => {
                self.frames.inc_num_free_frames(1);
                Err(e)
            }
        }
    }

    /// Free a frame together with its reservation
    pub(crate) fn give_frame(&self, frame: PhysAddr) {
        self.frames.frame_free(&self.phys, frame);
        self.frames.inc_num_free_frames(1);
    }

    /// Pages needed to cover `len` bytes
    pub fn pages_for(len: u32) -> usize {
        len.div_ceil(PAGE_SIZE) as usize
    }
}
