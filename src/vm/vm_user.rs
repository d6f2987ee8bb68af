//! VM User Interface - region allocation and removal
//!
//! Based on Mach4 vm/vm_user.c
//!
//! `new_pages` and `remove_pages` are the only ways user code changes its
//! own address space. Program loading uses [`Vm::map_region`] for text,
//! data, bss and stack.

use super::pmap::{Pte, PteFlags};
use super::vm_map::{MapFlags, MapList, MapRegion};
use super::Vm;
use crate::arch::Machine;
use crate::config::{is_page_aligned, PAGE_SIZE, PHYS_WINDOW, USER_MEM_START};
use crate::error::{KernError, KernResult};
use crate::types::{PhysAddr, VirtAddr};

const USER_RO: PteFlags = PteFlags::PRESENT.union(PteFlags::USER);

impl Vm {
    /// Allocate `len` bytes of zero-filled memory at `base`
    ///
    /// Frames for every page are reserved now and taken on first write.
    pub fn new_pages(
        &self,
        dir: PhysAddr,
        maps: &mut MapList,
        base: VirtAddr,
        len: i32,
    ) -> KernResult<()> {
        if len <= 0 || !is_page_aligned(base) || !is_page_aligned(len as u32) {
            return Err(KernError::InvalidArgument);
        }
        let high = base
            .checked_add(len as u32 - 1)
            .ok_or(KernError::InvalidArgument)?;
        if base < USER_MEM_START || high >= PHYS_WINDOW {
            return Err(KernError::InvalidArgument);
        }
        if maps.overlaps(base, high) {
            return Err(KernError::Overlap);
        }
        let region = MapRegion::new(
            base,
            high,
            MapFlags::USER | MapFlags::WRITE | MapFlags::REMOVABLE,
        );
        self.populate(dir, &region, true)?;
        maps.insert(region)?;
        log::debug!(target: "vm", "new_pages {:#010x}..={:#010x}", base, high);
        Ok(())
    }

    /// Free a region previously created by `new_pages`, identified by its base
    pub fn remove_pages(
        &self,
        dir: PhysAddr,
        maps: &mut MapList,
        base: VirtAddr,
        machine: &mut dyn Machine,
    ) -> KernResult<()> {
        let region = match maps.find(base) {
            Some(r) if r.low == base && r.flags.contains(MapFlags::REMOVABLE) => *r,
            _ => return Err(KernError::InvalidArgument),
        };
        for va in region.pages() {
            if self.unmap_page(dir, va) {
                machine.invalidate_page(va);
            }
        }
        maps.remove(base);
        log::debug!(target: "vm", "remove_pages {:#010x}..={:#010x}", region.low, region.high);
        Ok(())
    }

    /// Record and back a program region
    ///
    /// ZFOD regions share the zero frame; others get private zeroed
    /// frames immediately so the loader can fill them.
    pub fn map_region(
        &self,
        dir: PhysAddr,
        maps: &mut MapList,
        region: MapRegion,
        zfod: bool,
    ) -> KernResult<()> {
        if maps.overlaps(region.low, region.high) {
            return Err(KernError::Overlap);
        }
        self.populate(dir, &region, zfod)?;
        maps.insert(region)
    }

    /// Install entries for every page of `region`, all or nothing
    fn populate(&self, dir: PhysAddr, region: &MapRegion, zfod: bool) -> KernResult<()> {
        let pages = region.pages().count();
        self.frames.dec_num_free_frames(pages)?;

        let mut done = 0;
        let mut result = Ok(());
        for va in region.pages() {
            result = self.populate_page(dir, va, region.flags, zfod);
            if result.is_err() {
                break;
            }
            done += 1;
        }
        if let Err(e) = result {
            for va in region.pages().take(done) {
                self.unmap_page(dir, va);
            }
            self.frames.inc_num_free_frames(pages - done);
            return Err(e);
        }
        Ok(())
    }

    fn populate_page(
        &self,
        dir: PhysAddr,
        va: VirtAddr,
        flags: MapFlags,
        zfod: bool,
    ) -> KernResult<()> {
        if zfod {
            return self.set_pte(dir, va, Pte::new(self.zfod_frame(), USER_RO));
        }
        let frame = self.frames.frame_alloc(&self.phys)?;
        self.phys.zero_frame(frame);
        let mut pte_flags = USER_RO;
        if flags.contains(MapFlags::WRITE) {
            pte_flags |= PteFlags::WRITABLE;
        }
        if let Err(e) = self.set_pte(dir, va, Pte::new(frame, pte_flags)) {
            self.frames.frame_free(&self.phys, frame);
            return Err(e);
        }
        Ok(())
    }

    /// Drop one mapping and its reservation; true if something was mapped
    fn unmap_page(&self, dir: PhysAddr, va: VirtAddr) -> bool {
        match self.clear_pte(dir, va) {
            Some(old) => {
                if old.frame() != self.zfod_frame() {
                    self.frames.frame_free(&self.phys, old.frame());
                }
                self.frames.inc_num_free_frames(1);
                true
            }
            None => false,
        }
    }

    /// Kernel-side store into user pages, ignoring user write protection
    ///
    /// Used by the loader to fill read-only text. ZFOD pages are made
    /// private first so the zero frame stays zero.
    pub fn write_user_phys(&self, dir: PhysAddr, va: VirtAddr, data: &[u8]) -> KernResult<()> {
        let mut done = 0usize;
        while done < data.len() {
            let addr = va
                .checked_add(done as u32)
                .ok_or(KernError::BadAddress(va))?;
            let in_page = (PAGE_SIZE - (addr % PAGE_SIZE)) as usize;
            let n = in_page.min(data.len() - done);
            self.resolve_zfod(dir, addr)?;
            let pa = self.translate(dir, addr).ok_or(KernError::BadAddress(addr))?;
            self.phys.write(pa, &data[done..done + n]);
            done += n;
        }
        Ok(())
    }
}
