//! Copyin/Copyout - user/kernel data transfer
//!
//! Based on Mach4 kern/kern_subr.c and machine/copyio.c
//!
//! User pointers are checked against the task's region map before any
//! byte moves, so a bad pointer becomes an error return instead of a
//! kernel fault. Transfers go page by page through the page tables; a
//! store into a ZFOD page resolves it first, exactly as the user's own
//! write would.

use alloc::vec::Vec;

use crate::arch::Machine;
use crate::config::{page_align_down, PAGE_SIZE};
use crate::error::{KernError, KernResult};
use crate::types::{PhysAddr, VirtAddr};
use crate::vm::{MapFlags, MapList, Vm};

/// One task's user memory as seen by kernel code
pub struct UserSpace<'a> {
    vm: &'a Vm,
    dir: PhysAddr,
    maps: &'a MapList,
    machine: &'a mut dyn Machine,
}

impl<'a> UserSpace<'a> {
    pub fn new(vm: &'a Vm, dir: PhysAddr, maps: &'a MapList, machine: &'a mut dyn Machine) -> Self {
        Self {
            vm,
            dir,
            maps,
            machine,
        }
    }

    /// Fail unless `[addr, addr + len)` is user-readable
    pub fn check_readable(&self, addr: VirtAddr, len: usize) -> KernResult<()> {
        self.maps.check_range(addr, len, MapFlags::USER)
    }

    /// Fail unless `[addr, addr + len)` is user-writable
    pub fn check_writable(&self, addr: VirtAddr, len: usize) -> KernResult<()> {
        self.maps
            .check_range(addr, len, MapFlags::USER | MapFlags::WRITE)
    }

    /// Walk `[addr, addr + len)` one page-bounded chunk at a time
    fn for_each_chunk(
        &mut self,
        addr: VirtAddr,
        len: usize,
        write: bool,
        mut f: impl FnMut(&Vm, PhysAddr, usize, usize),
    ) -> KernResult<()> {
        let mut done = 0usize;
        while done < len {
            let va = addr + done as u32;
            let n = ((PAGE_SIZE - va % PAGE_SIZE) as usize).min(len - done);
            if write && self.vm.resolve_zfod(self.dir, va)? {
                self.machine.invalidate_page(page_align_down(va));
            }
            let pa = self
                .vm
                .translate(self.dir, va)
                .ok_or(KernError::BadAddress(va))?;
            f(self.vm, pa, done, n);
            done += n;
        }
        Ok(())
    }

    pub fn copyin(&mut self, addr: VirtAddr, buf: &mut [u8]) -> KernResult<()> {
        self.check_readable(addr, buf.len())?;
        self.for_each_chunk(addr, buf.len(), false, |vm, pa, off, n| {
            vm.phys.read(pa, &mut buf[off..off + n])
        })
    }

    pub fn copyout(&mut self, addr: VirtAddr, data: &[u8]) -> KernResult<()> {
        self.check_writable(addr, data.len())?;
        self.for_each_chunk(addr, data.len(), true, |vm, pa, off, n| {
            vm.phys.write(pa, &data[off..off + n])
        })
    }

    /// Fetch a 32-bit word
    pub fn fuword32(&mut self, addr: VirtAddr) -> KernResult<u32> {
        let mut word = [0u8; 4];
        self.copyin(addr, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Store a 32-bit word
    pub fn suword32(&mut self, addr: VirtAddr, value: u32) -> KernResult<()> {
        self.copyout(addr, &value.to_le_bytes())
    }

    /// Copy a NUL-terminated string of at most `max` bytes including the
    /// terminator; `too_long` is returned if no terminator fits
    pub fn copyinstr(
        &mut self,
        addr: VirtAddr,
        max: usize,
        too_long: KernError,
    ) -> KernResult<Vec<u8>> {
        let mut out = Vec::new();
        for i in 0..max {
            let va = addr.checked_add(i as u32).ok_or(KernError::BadAddress(addr))?;
            let mut byte = [0u8; 1];
            self.copyin(va, &mut byte)?;
            if byte[0] == 0 {
                return Ok(out);
            }
            out.push(byte[0]);
        }
        Err(too_long)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::TraceMachine;
    use crate::vm::MapRegion;

    struct Fixture {
        vm: Vm,
        dir: PhysAddr,
        maps: MapList,
        machine: TraceMachine,
    }

    impl Fixture {
        fn new() -> Self {
            let vm = Vm::new(64).unwrap();
            let dir = vm.page_dir_init().unwrap();
            let mut maps = MapList::with_reserved();
            vm.new_pages(dir, &mut maps, 0x0200_0000, 0x2000).unwrap();
            let ro = MapRegion::new(0x0300_0000, 0x0300_0fff, MapFlags::USER);
            vm.map_region(dir, &mut maps, ro, false).unwrap();
            Self {
                vm,
                dir,
                maps,
                machine: TraceMachine::new(),
            }
        }

        fn user(&mut self) -> UserSpace<'_> {
            UserSpace::new(&self.vm, self.dir, &self.maps, &mut self.machine)
        }
    }

    #[test]
    fn test_copy_across_page_boundary() {
        let mut fx = Fixture::new();
        let mut us = fx.user();
        us.copyout(0x0200_0ffc, b"abcdefgh").unwrap();
        let mut buf = [0u8; 8];
        us.copyin(0x0200_0ffc, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");
        // both ZFOD pages were made private
        assert_eq!(fx.vm.stats.zero_fills(), 2);
    }

    #[test]
    fn test_bad_pointers() {
        let mut fx = Fixture::new();
        let mut us = fx.user();
        assert_eq!(us.fuword32(0x10), Err(KernError::BadAddress(0x10)));
        assert_eq!(
            us.suword32(0x0300_0000, 1),
            Err(KernError::BadAddress(0x0300_0000))
        );
        assert_eq!(
            us.copyin(0x0200_1ffe, &mut [0u8; 4]),
            Err(KernError::BadAddress(0x0200_2000))
        );
        assert!(us.fuword32(0x0300_0000).is_ok());
    }

    #[test]
    fn test_copyinstr() {
        let mut fx = Fixture::new();
        let mut us = fx.user();
        us.copyout(0x0200_0000, b"init\0").unwrap();
        assert_eq!(
            us.copyinstr(0x0200_0000, 8, KernError::NameTooLong).unwrap(),
            b"init"
        );
        assert_eq!(
            us.copyinstr(0x0200_0000, 4, KernError::NameTooLong),
            Err(KernError::NameTooLong)
        );
    }

    #[test]
    fn test_word_roundtrip_reads_zero_page() {
        let mut fx = Fixture::new();
        let mut us = fx.user();
        assert_eq!(us.fuword32(0x0200_1000).unwrap(), 0);
        us.suword32(0x0200_1000, 0x1234_5678).unwrap();
        assert_eq!(us.fuword32(0x0200_1000).unwrap(), 0x1234_5678);
    }
}
