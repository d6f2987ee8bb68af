//! Fixtures shared by the kernel unit tests

use alloc::boxed::Box;

use super::elf_loader::{ProgramImage, RamDisk};
use super::kernel::Kernel;
use super::syscall::{Outcome, Syscall};
use crate::arch::TraceMachine;
use crate::config::{KernelConfig, PAGE_SIZE};
use crate::types::{Tid, VirtAddr};

/// Writable scratch region every test kernel gives init
pub const SCRATCH: VirtAddr = 0x0110_0000;
pub const SCRATCH_PAGES: i32 = 4;

/// Text at the bottom of user memory, optional data on the next page
pub fn program(entry: VirtAddr, text: &[u8], data: &[u8]) -> ProgramImage {
    let image = ProgramImage::new(entry).text(0x0100_0000, text);
    if data.is_empty() {
        image
    } else {
        image.data(0x0100_1000, data)
    }
}

pub fn init_image() -> ProgramImage {
    program(0x0100_0000, &[0x90, 0x90, 0xeb, 0xfe], b"init data").bss(0x0100_2000, 0x1800)
}

pub fn boot_with(disk: RamDisk) -> (Kernel, TraceMachine) {
    let machine = TraceMachine::new();
    let config = KernelConfig::default().with_user_frames(256).with_max_threads(32);
    let kernel = Kernel::boot(config, Box::new(machine.clone()), Box::new(disk)).unwrap();
    let out = kernel.syscall(Syscall::NewPages {
        base: SCRATCH,
        len: SCRATCH_PAGES * PAGE_SIZE as i32,
    });
    assert_eq!(out, Outcome::Complete(0));
    (kernel, machine)
}

pub fn boot_kernel() -> (Kernel, TraceMachine) {
    boot_with(RamDisk::new().with("init", init_image()))
}

/// Fork from the current thread; returns the child's tid
pub fn fork_child(kernel: &Kernel) -> Tid {
    match kernel.syscall(Syscall::Fork) {
        Outcome::Complete(tid) if tid > 0 => Tid(tid as u32),
        other => panic!("fork failed: {:?}", other),
    }
}
