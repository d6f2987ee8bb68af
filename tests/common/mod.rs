//! Shared fixtures for the integration scenarios

#![allow(dead_code)]

use pebbles_r::arch::TraceMachine;
use pebbles_r::config::PAGE_SIZE;
use pebbles_r::kern::{ProgramImage, RamDisk};
use pebbles_r::types::{TaskId, Tid, VirtAddr};
use pebbles_r::{Kernel, KernelConfig, Outcome, Syscall};

/// Writable page range init maps right after boot
pub const SCRATCH: VirtAddr = 0x0110_0000;

pub fn init_image() -> ProgramImage {
    ProgramImage::new(0x0100_0000)
        .text(0x0100_0000, &[0x90, 0x90, 0xeb, 0xfe])
        .data(0x0100_1000, b"init data")
}

pub fn boot() -> (Kernel, TraceMachine) {
    boot_with(KernelConfig::default().with_user_frames(256).with_max_threads(32))
}

pub fn boot_with(config: KernelConfig) -> (Kernel, TraceMachine) {
    let machine = TraceMachine::new();
    let disk = RamDisk::new().with("init", init_image());
    let kernel = Kernel::boot(config, Box::new(machine.clone()), Box::new(disk)).unwrap();
    let out = kernel.syscall(Syscall::NewPages {
        base: SCRATCH,
        len: 2 * PAGE_SIZE as i32,
    });
    assert_eq!(out, Outcome::Complete(0));
    (kernel, machine)
}

pub fn spawn(kernel: &Kernel, call: Syscall) -> Tid {
    match kernel.syscall(call) {
        Outcome::Complete(tid) if tid > 0 => Tid(tid as u32),
        other => panic!("{:?} failed: {:?}", call, other),
    }
}

/// Preempt until `tid` holds the CPU
pub fn run_until(kernel: &Kernel, tid: Tid) {
    for _ in 0..64 {
        if kernel.current_tid() == tid {
            return;
        }
        kernel.timer_tick();
    }
    panic!("{} never scheduled", tid);
}

pub fn task(tid: Tid) -> TaskId {
    TaskId::from(tid)
}

pub fn read_word(kernel: &Kernel, va: VirtAddr) -> u32 {
    let mut buf = [0u8; 4];
    kernel.user_read(va, &mut buf).unwrap();
    u32::from_le_bytes(buf)
}
