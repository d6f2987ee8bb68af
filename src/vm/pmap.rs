//! Physical Map (pmap) - two-level x86 page tables
//!
//! Based on Mach4 vm/pmap.h/c
//!
//! A page directory is one frame of 1024 entries, each pointing at a page
//! table frame of 1024 entries. The first [`KERNEL_PDE_COUNT`] directory
//! slots point at the kernel tables built at boot, which identity-map the
//! kernel range and are shared by every directory. Everything above is
//! private to one address space.
//!
//! Frame accounting: every present user page table entry and every user
//! page table holds exactly one frame reservation. ZFOD entries hold a
//! reservation for the frame their first write will need; private entries
//! hold the frame itself.

use alloc::vec::Vec;

use bitflags::bitflags;

use super::Vm;
use crate::config::{KERNEL_PDE_COUNT, PAGE_SIZE, PAGE_TABLE_ENTRIES};
use crate::error::KernResult;
use crate::types::{PhysAddr, VirtAddr};

bitflags! {
    /// Hardware bits of a directory or table entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const GLOBAL = 1 << 8;
    }
}

const FRAME_MASK: u32 = !(PAGE_SIZE - 1);

/// Directory entry flags for user page tables; the table entries decide
const USER_PDE: PteFlags = PteFlags::PRESENT
    .union(PteFlags::WRITABLE)
    .union(PteFlags::USER);

const KERNEL_PDE: PteFlags = PteFlags::PRESENT.union(PteFlags::WRITABLE);

/// A directory or page table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pte(pub u32);

impl Pte {
    pub const EMPTY: Pte = Pte(0);

    pub fn new(frame: PhysAddr, flags: PteFlags) -> Self {
        Pte((frame & FRAME_MASK) | flags.bits())
    }

    pub fn frame(self) -> PhysAddr {
        self.0 & FRAME_MASK
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & !FRAME_MASK)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn is_writable(self) -> bool {
        self.flags().contains(PteFlags::WRITABLE)
    }
}

pub fn pde_index(va: VirtAddr) -> usize {
    (va >> 22) as usize
}

pub fn pte_index(va: VirtAddr) -> usize {
    ((va >> 12) & 0x3ff) as usize
}

impl Vm {
    fn read_entry(&self, table: PhysAddr, index: usize) -> Pte {
        Pte(self.phys.read_u32(table + (index as u32) * 4))
    }

    fn write_entry(&self, table: PhysAddr, index: usize, entry: Pte) {
        self.phys.write_u32(table + (index as u32) * 4, entry.0);
    }

    /// Identity-map the kernel range into freshly allocated tables
    pub(super) fn build_kernel_tables(&self) -> KernResult<[PhysAddr; KERNEL_PDE_COUNT]> {
        let mut tables = [0; KERNEL_PDE_COUNT];
        for (slot, table) in tables.iter_mut().enumerate() {
            *table = self.take_frame()?;
            for i in 0..PAGE_TABLE_ENTRIES {
                let pa = ((slot * PAGE_TABLE_ENTRIES + i) as u32) * PAGE_SIZE;
                self.write_entry(
                    *table,
                    i,
                    Pte::new(pa, KERNEL_PDE | PteFlags::GLOBAL),
                );
            }
        }
        Ok(tables)
    }

    /// New directory containing only the kernel mappings
    pub fn page_dir_init(&self) -> KernResult<PhysAddr> {
        let dir = self.take_frame()?;
        for (slot, table) in self.kernel_tables.iter().enumerate() {
            self.write_entry(dir, slot, Pte::new(*table, KERNEL_PDE));
        }
        Ok(dir)
    }

    /// Table entry for `va`, or `None` when no table covers it
    pub fn get_pte(&self, dir: PhysAddr, va: VirtAddr) -> Option<Pte> {
        let pde = self.read_entry(dir, pde_index(va));
        if !pde.is_present() {
            return None;
        }
        Some(self.read_entry(pde.frame(), pte_index(va)))
    }

    /// Install an entry, creating the page table if needed
    ///
    /// A new table consumes one frame reservation of its own.
    pub fn set_pte(&self, dir: PhysAddr, va: VirtAddr, entry: Pte) -> KernResult<()> {
        let pdi = pde_index(va);
        debug_assert!(pdi >= KERNEL_PDE_COUNT, "user mapping in kernel range");
        let mut pde = self.read_entry(dir, pdi);
        if !pde.is_present() {
            let table = self.take_frame()?;
            pde = Pte::new(table, USER_PDE);
            self.write_entry(dir, pdi, pde);
        }
        self.write_entry(pde.frame(), pte_index(va), entry);
        Ok(())
    }

    /// Remove the entry for `va`, returning what was there
    pub fn clear_pte(&self, dir: PhysAddr, va: VirtAddr) -> Option<Pte> {
        let pde = self.read_entry(dir, pde_index(va));
        if !pde.is_present() {
            return None;
        }
        let old = self.read_entry(pde.frame(), pte_index(va));
        self.write_entry(pde.frame(), pte_index(va), Pte::EMPTY);
        Some(old).filter(|p| p.is_present())
    }

    /// Physical address backing `va`
    pub fn translate(&self, dir: PhysAddr, va: VirtAddr) -> Option<PhysAddr> {
        let pte = self.get_pte(dir, va)?;
        pte.is_present()
            .then(|| pte.frame() | (va & (PAGE_SIZE - 1)))
    }

    /// Private copy of a user address space
    ///
    /// ZFOD entries stay shared with the zero frame; every other page is
    /// copied into a new frame. On failure nothing is leaked.
    pub fn page_dir_copy(&self, src: PhysAddr) -> KernResult<PhysAddr> {
        let dst = self.page_dir_init()?;
        if let Err(e) = self.copy_user_entries(src, dst) {
            log::debug!(target: "vm", "address space copy failed: {}", e);
            self.page_dir_clear(dst);
            self.page_dir_free(dst);
            return Err(e);
        }
        Ok(dst)
    }

    fn copy_user_entries(&self, src: PhysAddr, dst: PhysAddr) -> KernResult<()> {
        for pdi in KERNEL_PDE_COUNT..PAGE_TABLE_ENTRIES {
            let pde = self.read_entry(src, pdi);
            if !pde.is_present() {
                continue;
            }
            let table = self.take_frame()?;
            self.write_entry(dst, pdi, Pte::new(table, pde.flags()));
            for pti in 0..PAGE_TABLE_ENTRIES {
                let pte = self.read_entry(pde.frame(), pti);
                if !pte.is_present() {
                    continue;
                }
                self.frames.dec_num_free_frames(1)?;
                if pte.frame() == self.zfod {
                    self.write_entry(table, pti, pte);
                    continue;
                }
                let frame = match self.frames.frame_alloc(&self.phys) {
                    Ok(f) => f,
                    Err(e) => {
                        self.frames.inc_num_free_frames(1);
                        return Err(e);
                    }
                };
                self.phys.copy_frame(frame, pte.frame());
                self.write_entry(table, pti, Pte::new(frame, pte.flags()));
            }
        }
        Ok(())
    }

    /// Release every user page and page table; the directory itself stays
    pub fn page_dir_clear(&self, dir: PhysAddr) {
        for pdi in KERNEL_PDE_COUNT..PAGE_TABLE_ENTRIES {
            let pde = self.read_entry(dir, pdi);
            if !pde.is_present() {
                continue;
            }
            let table = pde.frame();
            for pti in 0..PAGE_TABLE_ENTRIES {
                let pte = self.read_entry(table, pti);
                if !pte.is_present() {
                    continue;
                }
                if pte.frame() != self.zfod {
                    self.frames.frame_free(&self.phys, pte.frame());
                }
                self.frames.inc_num_free_frames(1);
            }
            self.give_frame(table);
            self.write_entry(dir, pdi, Pte::EMPTY);
        }
    }

    /// Free a directory already emptied by [`Vm::page_dir_clear`]
    pub fn page_dir_free(&self, dir: PhysAddr) {
        debug_assert!(
            (KERNEL_PDE_COUNT..PAGE_TABLE_ENTRIES).all(|i| !self.read_entry(dir, i).is_present()),
            "freeing a directory with live user tables"
        );
        self.give_frame(dir);
    }

    /// Present user mappings, in address order
    pub fn user_mappings(&self, dir: PhysAddr) -> Vec<(VirtAddr, Pte)> {
        let mut out = Vec::new();
        for pdi in KERNEL_PDE_COUNT..PAGE_TABLE_ENTRIES {
            let pde = self.read_entry(dir, pdi);
            if !pde.is_present() {
                continue;
            }
            for pti in 0..PAGE_TABLE_ENTRIES {
                let pte = self.read_entry(pde.frame(), pti);
                if pte.is_present() {
                    let va = ((pdi << 22) | (pti << 12)) as VirtAddr;
                    out.push((va, pte));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::USER_MEM_START;

    const USER_RW: PteFlags = PteFlags::PRESENT
        .union(PteFlags::USER)
        .union(PteFlags::WRITABLE);

    fn map_private(vm: &Vm, dir: PhysAddr, va: VirtAddr, byte: u8) {
        let frame = vm.take_frame().unwrap();
        vm.phys.write(frame, &[byte; 8]);
        vm.set_pte(dir, va, Pte::new(frame, USER_RW)).unwrap();
    }

    #[test]
    fn test_pte_bits() {
        let pte = Pte::new(0x0123_4fff, USER_RW);
        assert_eq!(pte.frame(), 0x0123_4000);
        assert!(pte.is_present());
        assert!(pte.is_writable());
        assert_eq!(pde_index(0xffff_f000), 1023);
        assert_eq!(pte_index(0x0040_3000), 3);
    }

    #[test]
    fn test_kernel_range_identity_mapped() {
        let vm = Vm::new(32).unwrap();
        let dir = vm.page_dir_init().unwrap();
        assert_eq!(vm.translate(dir, 0x0012_3456), Some(0x0012_3456));
        assert_eq!(vm.translate(dir, USER_MEM_START - 1), Some(USER_MEM_START - 1));
        assert_eq!(vm.translate(dir, USER_MEM_START), None);
        let pte = vm.get_pte(dir, 0x1000).unwrap();
        assert!(!pte.flags().contains(PteFlags::USER));
    }

    #[test]
    fn test_set_pte_allocates_table_once() {
        let vm = Vm::new(32).unwrap();
        let dir = vm.page_dir_init().unwrap();
        let before = vm.num_free_frames();
        map_private(&vm, dir, 0x0200_0000, 1);
        // one page plus one table
        assert_eq!(vm.num_free_frames(), before - 2);
        map_private(&vm, dir, 0x0200_1000, 2);
        assert_eq!(vm.num_free_frames(), before - 3);
        assert_eq!(vm.user_mappings(dir).len(), 2);
    }

    #[test]
    fn test_copy_is_private() {
        let vm = Vm::new(32).unwrap();
        let src = vm.page_dir_init().unwrap();
        map_private(&vm, src, 0x0200_0000, 0xaa);
        let dst = vm.page_dir_copy(src).unwrap();

        let pa_src = vm.translate(src, 0x0200_0000).unwrap();
        let pa_dst = vm.translate(dst, 0x0200_0000).unwrap();
        assert_ne!(pa_src, pa_dst);
        vm.phys.write(pa_dst, &[0x55]);
        let mut b = [0u8; 1];
        vm.phys.read(pa_src, &mut b);
        assert_eq!(b[0], 0xaa);
    }

    #[test]
    fn test_copy_shares_zero_frame() {
        let vm = Vm::new(32).unwrap();
        let src = vm.page_dir_init().unwrap();
        vm.frames.dec_num_free_frames(1).unwrap();
        let ro = PteFlags::PRESENT | PteFlags::USER;
        vm.set_pte(src, 0x0300_0000, Pte::new(vm.zfod_frame(), ro)).unwrap();
        let before = vm.num_free_frames();
        let dst = vm.page_dir_copy(src).unwrap();
        // directory, table and one reservation for the ZFOD page
        assert_eq!(vm.num_free_frames(), before - 3);
        assert_eq!(vm.get_pte(dst, 0x0300_0000).unwrap().frame(), vm.zfod_frame());
    }

    #[test]
    fn test_copy_failure_leaks_nothing() {
        let vm = Vm::new(12).unwrap();
        let src = vm.page_dir_init().unwrap();
        map_private(&vm, src, 0x0200_0000, 1);
        map_private(&vm, src, 0x0200_1000, 2);
        // 12 - 5 boot - 1 dir - 1 table - 2 pages = 3 left; a copy needs 4
        let before = vm.num_free_frames();
        assert_eq!(before, 3);
        assert!(vm.page_dir_copy(src).is_err());
        assert_eq!(vm.num_free_frames(), before);
    }

    #[test]
    fn test_clear_and_free_return_everything() {
        let vm = Vm::new(32).unwrap();
        let start = vm.num_free_frames();
        let dir = vm.page_dir_init().unwrap();
        map_private(&vm, dir, 0x0200_0000, 1);
        map_private(&vm, dir, 0x0280_0000, 1);
        vm.page_dir_clear(dir);
        assert!(vm.user_mappings(dir).is_empty());
        vm.page_dir_free(dir);
        assert_eq!(vm.num_free_frames(), start);
        assert_eq!(vm.frames.free_list(&vm.phys).len(), start);
    }

    #[test]
    fn test_clear_pte_returns_old_entry() {
        let vm = Vm::new(32).unwrap();
        let dir = vm.page_dir_init().unwrap();
        assert_eq!(vm.clear_pte(dir, 0x0200_0000), None);
        map_private(&vm, dir, 0x0200_0000, 1);
        let old = vm.clear_pte(dir, 0x0200_0000).unwrap();
        assert!(old.is_present());
        assert_eq!(vm.translate(dir, 0x0200_0000), None);
    }
}
