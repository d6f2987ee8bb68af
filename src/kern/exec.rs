//! Program loading and exec
//!
//! Everything exec needs from the old address space (program name and
//! argument strings) is copied into the kernel and checked before the
//! first destructive step. Once teardown starts there is nothing to return
//! to, so a failure while installing the new image kills the task.
//!
//! A new image has this layout:
//!
//! ```text
//! USER_STACK_TOP  +----------------------+
//!                 | argument strings     |
//!                 | argv[argc] = NULL    |
//!                 | argv[0..argc]        |
//!                 | stack_low            |
//!                 | stack_high           |
//!                 | argv                 |
//!                 | argc                 |
//!          esp -> | return address (0)   |
//!                 +----------------------+ ... grows down to stack_low
//!
//!                 data / bss / rodata / text, from USER_MEM_START
//! ```

use alloc::vec;
use alloc::vec::Vec;

use super::elf_loader::{SectionKind, SimpleElf};
use super::kernel::{Kernel, KernelState};
use super::syscall::Outcome;
use crate::arch::Ureg;
use crate::config::{ARGBYTES_MAX, ARGC_MAX, EXECNAME_MAX, FAULT_EXIT_STATUS, USER_STACK_TOP};
use crate::error::{KernError, KernResult};
use crate::types::{TaskId, VirtAddr};
use crate::vm::{MapFlags, MapRegion};

impl Kernel {
    /// Replace the calling task's program
    pub(crate) fn exec_cli(
        &self,
        st: &mut KernelState,
        name_ptr: VirtAddr,
        argv_ptr: VirtAddr,
    ) -> KernResult<Outcome> {
        let cur = st.current();
        let task = st.current_task();
        if st.tasks.task(task).live_threads.len() != 1 {
            return Err(KernError::MultiThreaded);
        }
        let (name, args) = self.copyin_args(st, task, name_ptr, argv_ptr)?;
        let name = core::str::from_utf8(&name).map_err(|_| KernError::InvalidArgument)?;
        let header = self.loader.load_header(name)?;
        header.validate(self.config.stack_low())?;

        // point of no return
        {
            let t = st.tasks.task_mut(task);
            self.vm.page_dir_clear(t.page_dir);
            t.maps.clear_user();
            let dir = t.page_dir;
            st.machine.set_page_directory(dir);
        }
        match self.install_image(st, task, name, &header, &args) {
            Ok(sp) => {
                let t = st.threads.thread_mut(cur);
                t.regs = Ureg::user_entry(header.entry, sp);
                t.swexn = None;
                log::debug!(target: "task", "{} exec {} argc {}", task, name, args.len());
            }
            Err(e) => {
                log::error!(target: "task", "{} exec {} failed after teardown: {}", task, name, e);
                self.kill_current_cli(st, FAULT_EXIT_STATUS);
            }
        }
        Ok(Outcome::NoReturn)
    }

    /// Copy the program name and argument vector into the kernel
    fn copyin_args(
        &self,
        st: &mut KernelState,
        task: TaskId,
        name_ptr: VirtAddr,
        argv_ptr: VirtAddr,
    ) -> KernResult<(Vec<u8>, Vec<Vec<u8>>)> {
        let mut user = st.user_space(&self.vm, task);
        let name = user.copyinstr(name_ptr, EXECNAME_MAX, KernError::NameTooLong)?;
        if name.is_empty() {
            return Err(KernError::InvalidArgument);
        }

        let mut args = Vec::new();
        let mut used = 0usize;
        loop {
            let slot = argv_ptr
                .checked_add(4 * args.len() as u32)
                .ok_or(KernError::BadAddress(argv_ptr))?;
            let ptr = user.fuword32(slot)?;
            if ptr == 0 {
                break;
            }
            if args.len() == ARGC_MAX {
                return Err(KernError::ArgsTooLong);
            }
            let arg = user.copyinstr(ptr, ARGBYTES_MAX - used, KernError::ArgsTooLong)?;
            used += arg.len() + 1;
            args.push(arg);
        }
        Ok((name, args))
    }

    /// Load `name` into the empty address space of `task`
    ///
    /// Returns the entry point and the initial user stack pointer.
    pub(crate) fn load_image(
        &self,
        st: &mut KernelState,
        task: TaskId,
        name: &str,
        args: &[Vec<u8>],
    ) -> KernResult<(VirtAddr, VirtAddr)> {
        let header = self.loader.load_header(name)?;
        header.validate(self.config.stack_low())?;
        let sp = self.install_image(st, task, name, &header, args)?;
        Ok((header.entry, sp))
    }

    fn install_image(
        &self,
        st: &mut KernelState,
        task: TaskId,
        name: &str,
        header: &SimpleElf,
        args: &[Vec<u8>],
    ) -> KernResult<VirtAddr> {
        let stack_low = self.config.stack_low();
        {
            let t = st.tasks.task_mut(task);
            let dir = t.page_dir;
            for (kind, section) in header.sections() {
                let Some((low, high)) = section.page_span() else {
                    continue;
                };
                let (flags, zfod) = match kind {
                    SectionKind::Text => (MapFlags::USER | MapFlags::EXEC, false),
                    SectionKind::Rodata => (MapFlags::USER, false),
                    SectionKind::Data => (MapFlags::USER | MapFlags::WRITE, false),
                    SectionKind::Bss => (MapFlags::USER | MapFlags::WRITE, true),
                };
                self.vm
                    .map_region(dir, &mut t.maps, MapRegion::new(low, high, flags), zfod)?;
                if kind != SectionKind::Bss {
                    let mut bytes = vec![0u8; section.len as usize];
                    self.loader.read_bytes(name, section.offset, &mut bytes)?;
                    self.vm.write_user_phys(dir, section.start, &bytes)?;
                }
            }
            let stack = MapRegion::new(stack_low, USER_STACK_TOP - 1, MapFlags::USER | MapFlags::WRITE);
            self.vm.map_region(dir, &mut t.maps, stack, true)?;
        }
        self.build_stack(st, task, args)
    }

    /// Lay out argc/argv on the fresh stack; returns the stack pointer
    fn build_stack(&self, st: &mut KernelState, task: TaskId, args: &[Vec<u8>]) -> KernResult<VirtAddr> {
        let stack_low = self.config.stack_low();
        let stack_high = USER_STACK_TOP - 1;
        let mut user = st.user_space(&self.vm, task);

        let mut sp = USER_STACK_TOP;
        let mut ptrs = Vec::with_capacity(args.len());
        for arg in args.iter().rev() {
            sp -= arg.len() as u32 + 1;
            user.copyout(sp, arg)?;
            user.copyout(sp + arg.len() as u32, &[0])?;
            ptrs.push(sp);
        }
        sp &= !3;

        let mut push = |sp: &mut VirtAddr, word: u32| -> KernResult<()> {
            *sp -= 4;
            user.suword32(*sp, word)
        };
        push(&mut sp, 0)?;
        for &p in &ptrs {
            push(&mut sp, p)?;
        }
        let argv = sp;
        push(&mut sp, stack_low)?;
        push(&mut sp, stack_high)?;
        push(&mut sp, argv)?;
        push(&mut sp, args.len() as u32)?;
        push(&mut sp, 0)?;
        Ok(sp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::elf_loader::RamDisk;
    use crate::kern::syscall::Syscall;
    use crate::kern::testutil::{boot_with, init_image, program, SCRATCH, SCRATCH_PAGES};
    use crate::kern::thread::ThreadStatus;

    /// Put `name` and `args` into init's scratch page; returns the pointers
    fn stage_args(k: &Kernel, name: &str, args: &[&str]) -> (VirtAddr, VirtAddr) {
        let mut strings = SCRATCH + 0x100;
        let mut put = |s: &str| {
            let at = strings;
            let mut bytes = s.as_bytes().to_vec();
            bytes.push(0);
            k.user_write(at, &bytes).unwrap();
            strings += bytes.len() as u32;
            at
        };
        let name_ptr = put(name);
        let ptrs: Vec<u32> = args.iter().map(|a| put(a)).collect();
        for (i, p) in ptrs.iter().chain([0u32].iter()).enumerate() {
            k.user_write(SCRATCH + 4 * i as u32, &p.to_le_bytes()).unwrap();
        }
        (name_ptr, SCRATCH)
    }

    fn read_word(k: &Kernel, va: VirtAddr) -> u32 {
        let mut w = [0u8; 4];
        k.user_read(va, &mut w).unwrap();
        u32::from_le_bytes(w)
    }

    fn read_str(k: &Kernel, mut va: VirtAddr) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut b = [0u8; 1];
            k.user_read(va, &mut b).unwrap();
            if b[0] == 0 {
                return out;
            }
            out.push(b[0]);
            va += 1;
        }
    }

    #[test]
    fn test_init_entry_frame() {
        let (k, _m) = boot_with(RamDisk::new().with("init", init_image()));
        let init = k.current_tid();
        let regs = k.registers(init).unwrap();
        assert_eq!(regs.eip, 0x0100_0000);
        let sp = regs.esp;
        assert_eq!(read_word(&k, sp), 0);
        assert_eq!(read_word(&k, sp + 4), 1);
        let argv = read_word(&k, sp + 8);
        assert_eq!(read_word(&k, sp + 12), USER_STACK_TOP - 1);
        assert_eq!(read_word(&k, sp + 16), k.config().stack_low());
        assert_eq!(read_str(&k, read_word(&k, argv)), b"init");
        assert_eq!(read_word(&k, argv + 4), 0);
    }

    #[test]
    fn test_exec_replaces_image() {
        let disk = RamDisk::new()
            .with("init", init_image())
            .with("hello", program(0x0100_0000, b"\x90\x90\xcc", b"greeting"));
        let (k, _m) = boot_with(disk);
        let init = k.current_tid();
        let (name, argv) = stage_args(&k, "hello", &["hello", "world"]);

        assert_eq!(k.syscall(Syscall::Exec { name, argv }), Outcome::NoReturn);
        assert_eq!(k.current_tid(), init);
        assert_eq!(k.thread_status(init), Some(ThreadStatus::Runnable));
        let regs = k.registers(init).unwrap();
        assert_eq!(regs.eip, 0x0100_0000);
        assert_eq!(read_word(&k, regs.esp + 4), 2);
        let argv = read_word(&k, regs.esp + 8);
        assert_eq!(read_str(&k, read_word(&k, argv)), b"hello");
        assert_eq!(read_str(&k, read_word(&k, argv + 4)), b"world");

        // the old scratch region is gone, the new data is there
        assert_eq!(k.translate(k.init_task(), SCRATCH), None);
        assert!(k.regions(k.init_task()).iter().all(|r| !r.contains(SCRATCH)));
        let mut data = [0u8; 8];
        k.user_read(0x0100_1000, &mut data).unwrap();
        assert_eq!(&data, b"greeting");
    }

    #[test]
    fn test_exec_checks_arguments_before_teardown() {
        let disk = RamDisk::new()
            .with("init", init_image())
            .with("hello", program(0x0100_0000, b"\xcc", b""));
        let (k, _m) = boot_with(disk);
        let regions = k.regions(k.init_task());

        let (name, argv) = stage_args(&k, "nosuch", &["nosuch"]);
        assert_eq!(
            k.syscall(Syscall::Exec { name, argv }),
            Outcome::Complete(KernError::NotFound.errno())
        );

        let long = "x".repeat(EXECNAME_MAX);
        let (name, argv) = stage_args(&k, &long, &[]);
        assert_eq!(
            k.syscall(Syscall::Exec { name, argv }),
            Outcome::Complete(KernError::NameTooLong.errno())
        );

        let many: Vec<&str> = (0..=ARGC_MAX).map(|_| "a").collect();
        let (name, argv) = stage_args(&k, "hello", &many);
        assert_eq!(
            k.syscall(Syscall::Exec { name, argv }),
            Outcome::Complete(KernError::ArgsTooLong.errno())
        );

        let big = "b".repeat(ARGBYTES_MAX / 2);
        let (name, argv) = stage_args(&k, "hello", &[&big, &big]);
        assert_eq!(
            k.syscall(Syscall::Exec { name, argv }),
            Outcome::Complete(KernError::ArgsTooLong.errno())
        );

        assert_eq!(
            k.syscall(Syscall::Exec {
                name: 0x10,
                argv: SCRATCH
            }),
            Outcome::Complete(KernError::BadAddress(0x10).errno())
        );
        assert_eq!(k.regions(k.init_task()), regions);
    }

    #[test]
    fn test_exec_refuses_multithreaded_task() {
        let disk = RamDisk::new()
            .with("init", init_image())
            .with("hello", program(0x0100_0000, b"\xcc", b""));
        let (k, _m) = boot_with(disk);
        let (name, argv) = stage_args(&k, "hello", &["hello"]);
        k.syscall(Syscall::ThreadFork);
        assert_eq!(
            k.syscall(Syscall::Exec { name, argv }),
            Outcome::Complete(KernError::MultiThreaded.errno())
        );
    }

    #[test]
    fn test_exec_frees_old_frames() {
        let disk = RamDisk::new()
            .with("init", init_image())
            .with("init2", init_image());
        let (k, _m) = boot_with(disk);
        let (name, argv) = stage_args(&k, "init2", &["init2"]);
        // what a fresh copy of the same image costs, measured after staging
        let before = k.free_frames();
        assert_eq!(k.syscall(Syscall::Exec { name, argv }), Outcome::NoReturn);
        // the scratch region the arguments lived in is not part of the image
        assert_eq!(k.free_frames(), before + SCRATCH_PAGES as usize);
    }
}
