//! VM Fault - zero-fill-on-demand resolution
//!
//! Based on Mach4 vm/vm_fault.h/c
//!
//! Pages handed out by `new_pages` (and program bss and stacks) start out
//! mapped read-only onto the shared zero frame. The first write faults;
//! the handler swaps in a private zeroed frame, paid for by the
//! reservation taken when the page was mapped, and makes it writable.

use core::sync::atomic::{AtomicU64, Ordering};

use super::pmap::{Pte, PteFlags};
use super::vm_map::{MapFlags, MapList};
use super::Vm;
use crate::config::page_align_down;
use crate::error::KernResult;
use crate::types::{PhysAddr, VirtAddr};

// ============================================================================
// Fault Result
// ============================================================================

/// Result of a page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResult {
    /// A private frame replaced the zero frame; retry the access
    Success,
    /// Address is mapped but the access is not allowed
    ProtectionFailure,
    /// Address is not in any user region
    InvalidAddress,
    /// No frame despite a held reservation
    ResourceShortage,
}

/// Fault type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    Read,
    Write,
}

impl FaultType {
    /// Decode the x86 page fault error code
    pub fn from_error_code(code: u32) -> Self {
        if code & 0x2 != 0 {
            FaultType::Write
        } else {
            FaultType::Read
        }
    }
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Fault statistics counters
pub struct FaultStats {
    pub total: AtomicU64,
    pub zero_fill: AtomicU64,
    pub failures: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            zero_fill: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn zero_fills(&self) -> u64 {
        self.zero_fill.load(Ordering::Relaxed)
    }
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

const USER_RW: PteFlags = PteFlags::PRESENT
    .union(PteFlags::USER)
    .union(PteFlags::WRITABLE);

impl Vm {
    /// Whether `pte` is a ZFOD mapping
    pub fn is_zfod(&self, pte: Pte) -> bool {
        pte.is_present() && pte.frame() == self.zfod_frame()
    }

    /// Replace the zero frame under `va` with a private writable frame
    ///
    /// Returns `Ok(false)` if the page is not a ZFOD mapping. The caller
    /// must invalidate the TLB entry for the page when this returns true.
    pub fn resolve_zfod(&self, dir: PhysAddr, va: VirtAddr) -> KernResult<bool> {
        let page = page_align_down(va);
        match self.get_pte(dir, page) {
            Some(pte) if self.is_zfod(pte) => {}
            _ => return Ok(false),
        }
        let frame = self.frames.frame_alloc(&self.phys)?;
        self.phys.zero_frame(frame);
        self.set_pte(dir, page, Pte::new(frame, USER_RW))?;
        self.stats.zero_fill.fetch_add(1, Ordering::Relaxed);
        log::trace!(target: "vm", "zfod {:#010x} -> frame {:#010x}", page, frame);
        Ok(true)
    }

    /// Handle a user page fault at `va`
    pub fn handle_fault(
        &self,
        dir: PhysAddr,
        maps: &MapList,
        va: VirtAddr,
        kind: FaultType,
    ) -> FaultResult {
        self.stats.total.fetch_add(1, Ordering::Relaxed);
        let result = match maps.find(va) {
            Some(r) if r.flags.contains(MapFlags::USER) && !r.flags.contains(MapFlags::RESERVED) => {
                if kind != FaultType::Write || !r.flags.contains(MapFlags::WRITE) {
                    FaultResult::ProtectionFailure
                } else {
                    match self.resolve_zfod(dir, va) {
                        Ok(true) => FaultResult::Success,
                        Ok(false) => FaultResult::ProtectionFailure,
                        Err(_) => FaultResult::ResourceShortage,
                    }
                }
            }
            _ => FaultResult::InvalidAddress,
        };
        if result != FaultResult::Success {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::vm_map::MapRegion;

    fn zfod_page(vm: &Vm, dir: PhysAddr, va: VirtAddr) {
        vm.frames.dec_num_free_frames(1).unwrap();
        let ro = PteFlags::PRESENT | PteFlags::USER;
        vm.set_pte(dir, va, Pte::new(vm.zfod_frame(), ro)).unwrap();
    }

    #[test]
    fn test_write_fault_on_zfod_page() {
        let vm = Vm::new(32).unwrap();
        let dir = vm.page_dir_init().unwrap();
        let mut maps = MapList::with_reserved();
        maps.insert(MapRegion::new(0x0200_0000, 0x0200_0fff, MapFlags::USER | MapFlags::WRITE))
            .unwrap();
        zfod_page(&vm, dir, 0x0200_0000);
        let free = vm.num_free_frames();

        let r = vm.handle_fault(dir, &maps, 0x0200_0123, FaultType::Write);
        assert_eq!(r, FaultResult::Success);
        // frame came out of the existing reservation
        assert_eq!(vm.num_free_frames(), free);
        let pte = vm.get_pte(dir, 0x0200_0000).unwrap();
        assert!(pte.is_writable());
        assert_ne!(pte.frame(), vm.zfod_frame());
        assert_eq!(vm.stats.zero_fills(), 1);

        // second write fault on the same page is a real protection error
        assert!(!vm.resolve_zfod(dir, 0x0200_0000).unwrap());
    }

    #[test]
    fn test_fault_classification() {
        let vm = Vm::new(32).unwrap();
        let dir = vm.page_dir_init().unwrap();
        let mut maps = MapList::with_reserved();
        maps.insert(MapRegion::new(0x0200_0000, 0x0200_0fff, MapFlags::USER)).unwrap();
        zfod_page(&vm, dir, 0x0200_0000);

        assert_eq!(
            vm.handle_fault(dir, &maps, 0x0200_0000, FaultType::Write),
            FaultResult::ProtectionFailure
        );
        assert_eq!(
            vm.handle_fault(dir, &maps, 0x0300_0000, FaultType::Read),
            FaultResult::InvalidAddress
        );
        assert_eq!(
            vm.handle_fault(dir, &maps, 0x10, FaultType::Write),
            FaultResult::InvalidAddress
        );
        assert_eq!(FaultType::from_error_code(0x7), FaultType::Write);
        assert_eq!(FaultType::from_error_code(0x4), FaultType::Read);
    }
}
