//! Kernel configuration and memory layout constants

use crate::types::VirtAddr;

// ============================================================================
// Memory Layout
// ============================================================================

/// Page size
pub const PAGE_SIZE: u32 = 4096;

/// log2 of PAGE_SIZE
pub const PAGE_SHIFT: u32 = 12;

/// Entries in a page directory or page table
pub const PAGE_TABLE_ENTRIES: usize = 1024;

/// Start of user memory; everything below is identity-mapped kernel memory
pub const USER_MEM_START: VirtAddr = 0x0100_0000;

/// Directory slots covering the kernel range (4MB each)
pub const KERNEL_PDE_COUNT: usize = (USER_MEM_START >> 22) as usize;

/// Reserved always-mapped physical access window (last virtual page)
pub const PHYS_WINDOW: VirtAddr = 0xFFFF_F000;

/// Exclusive top of the user stack region
pub const USER_STACK_TOP: VirtAddr = PHYS_WINDOW;

/// Synthetic kernel stack area inside the kernel range
pub const KERNEL_STACK_BASE: u32 = 0x0040_0000;

/// Size of each thread's kernel stack
pub const KERNEL_STACK_SIZE: u32 = 8192;

// ============================================================================
// Exec Limits
// ============================================================================

/// Maximum executable name length, including the terminator
pub const EXECNAME_MAX: usize = 64;

/// Maximum total argument bytes, including terminators
pub const ARGBYTES_MAX: usize = 128;

/// Maximum argument count
pub const ARGC_MAX: usize = 16;

/// Exit status of a task killed by an unhandled fault
pub const FAULT_EXIT_STATUS: i32 = -2;

/// Round an address down to its page
pub const fn page_align_down(addr: u32) -> u32 {
    addr & !(PAGE_SIZE - 1)
}

/// True if the address is page aligned
pub const fn is_page_aligned(addr: u32) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

// ============================================================================
// Runtime Configuration
// ============================================================================

/// Boot-time kernel configuration
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Physical frames in the user pool (page tables, directories, user pages)
    pub user_frames: usize,
    /// Maximum number of live thread control blocks (kernel heap budget)
    pub max_threads: usize,
    /// User stack size in pages for freshly loaded programs
    pub stack_pages: u32,
    /// Program loaded into the init task at boot
    pub init_program: &'static str,
    /// Timer interrupt frequency
    pub timer_hz: u32,
}

impl KernelConfig {
    pub fn with_user_frames(mut self, frames: usize) -> Self {
        self.user_frames = frames;
        self
    }

    pub fn with_max_threads(mut self, threads: usize) -> Self {
        self.max_threads = threads;
        self
    }

    pub fn with_stack_pages(mut self, pages: u32) -> Self {
        self.stack_pages = pages;
        self
    }

    pub fn with_init_program(mut self, name: &'static str) -> Self {
        self.init_program = name;
        self
    }

    /// Lowest address of the user stack region
    pub fn stack_low(&self) -> VirtAddr {
        USER_STACK_TOP - self.stack_pages * PAGE_SIZE
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            user_frames: 1024,
            max_threads: 256,
            stack_pages: 4,
            init_program: "init",
            timer_hz: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(KERNEL_PDE_COUNT, 4);
        assert!(is_page_aligned(USER_MEM_START));
        assert_eq!(page_align_down(0x0100_0fff), 0x0100_0000);
        // Kernel stacks must stay inside the kernel range
        let top = KERNEL_STACK_BASE + KernelConfig::default().max_threads as u32 * KERNEL_STACK_SIZE;
        assert!(top <= USER_MEM_START);
    }

    #[test]
    fn test_builder() {
        let cfg = KernelConfig::default().with_user_frames(64).with_stack_pages(2);
        assert_eq!(cfg.user_frames, 64);
        assert_eq!(cfg.stack_low(), USER_STACK_TOP - 2 * PAGE_SIZE);
    }
}
