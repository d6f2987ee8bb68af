//! Exception Handling
//!
//! Based on Mach4 kern/exception.c
//!
//! A hardware exception in user mode goes through three stages:
//! 1. A write fault on a ZFOD page is fixed by the VM layer and the
//!    instruction restarts.
//! 2. Otherwise, if the thread registered a software exception handler
//!    with `swexn`, the handler is deregistered and the thread is
//!    redirected into it with a copy of its faulting registers.
//! 3. Otherwise the registers are dumped to the log and the whole task
//!    is killed with status [`FAULT_EXIT_STATUS`].

use super::kernel::{Kernel, KernelState};
use super::syscall::Outcome;
use super::thread::SwexnHandler;
use crate::arch::{Ureg, IDT_DE, IDT_GP, IDT_PF};
use crate::config::{page_align_down, FAULT_EXIT_STATUS, PAGE_SIZE, PHYS_WINDOW, USER_MEM_START};
use crate::error::{KernError, KernResult};
use crate::types::{Tid, VirtAddr};
use crate::vm::{FaultResult, FaultType, PteFlags};

// ============================================================================
// Exception Types
// ============================================================================

/// Exception type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionType {
    /// Bad access (page fault, protection violation)
    BadAccess,
    /// Bad instruction (general protection, invalid opcode)
    BadInstruction,
    /// Arithmetic exception (divide error)
    Arithmetic,
    /// Breakpoint (debugger trap)
    Breakpoint,
    /// Any other vector
    Other(u32),
}

impl ExceptionType {
    pub fn from_vector(cause: u32) -> Self {
        match cause {
            IDT_DE => Self::Arithmetic,
            3 => Self::Breakpoint,
            6 | IDT_GP => Self::BadInstruction,
            IDT_PF => Self::BadAccess,
            v => Self::Other(v),
        }
    }

    /// Get exception name for debugging
    pub fn name(&self) -> &'static str {
        match self {
            Self::BadAccess => "bad_access",
            Self::BadInstruction => "bad_instruction",
            Self::Arithmetic => "arithmetic",
            Self::Breakpoint => "breakpoint",
            Self::Other(_) => "other",
        }
    }
}

/// Page fault error code bits
const PF_PRESENT: u32 = 1 << 0;
const PF_WRITE: u32 = 1 << 1;
const PF_USER: u32 = 1 << 2;

/// One exception raised by the current thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// IDT vector
    pub cause: u32,
    /// Faulting address (page faults only)
    pub addr: VirtAddr,
    pub error_code: u32,
}

impl Fault {
    /// A user-mode page fault at `addr`
    pub fn page(addr: VirtAddr, write: bool, present: bool) -> Self {
        let mut error_code = PF_USER;
        if write {
            error_code |= PF_WRITE;
        }
        if present {
            error_code |= PF_PRESENT;
        }
        Self {
            cause: IDT_PF,
            addr,
            error_code,
        }
    }

    pub fn divide_error() -> Self {
        Self {
            cause: IDT_DE,
            addr: 0,
            error_code: 0,
        }
    }

    pub fn general_protection(error_code: u32) -> Self {
        Self {
            cause: IDT_GP,
            addr: 0,
            error_code,
        }
    }

    pub fn kind(&self) -> ExceptionType {
        ExceptionType::from_vector(self.cause)
    }
}

/// How an exception was dealt with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Fixed transparently; the instruction can restart
    Resolved,
    /// The thread now runs its software exception handler
    Delivered,
    /// The task was terminated
    Killed,
}

impl Kernel {
    /// Raise `fault` on behalf of the current thread
    pub fn raise_exception(&self, fault: Fault) -> FaultDisposition {
        let mut guard = self.disable_interrupts();
        self.raise_exception_cli(&mut guard, fault)
    }

    pub(crate) fn raise_exception_cli(&self, st: &mut KernelState, fault: Fault) -> FaultDisposition {
        let cur = st.current();
        let task = st.current_task();

        if fault.cause == IDT_PF {
            let t = st.tasks.task(task);
            let kind = FaultType::from_error_code(fault.error_code);
            match self.vm.handle_fault(t.page_dir, &t.maps, fault.addr, kind) {
                FaultResult::Success => {
                    st.machine.invalidate_page(page_align_down(fault.addr));
                    return FaultDisposition::Resolved;
                }
                result => {
                    log::debug!(target: "exception", "{} page fault at {:#010x}: {:?}", cur, fault.addr, result)
                }
            }
        }

        let regs = {
            let t = st.threads.thread_mut(cur);
            t.regs.cause = fault.cause;
            t.regs.cr2 = fault.addr;
            t.regs.error_code = fault.error_code;
            t.regs
        };
        if let Some(handler) = st.threads.thread_mut(cur).swexn.take() {
            match self.enter_handler(st, cur, handler, &regs) {
                Ok(()) => return FaultDisposition::Delivered,
                Err(e) => log::debug!(target: "exception", "{} handler stack unusable: {}", cur, e),
            }
        }

        dump_registers(cur, fault, &regs);
        self.kill_current_cli(st, FAULT_EXIT_STATUS);
        FaultDisposition::Killed
    }

    /// Redirect `tid` into its handler
    ///
    /// The handler stack receives a copy of the faulting registers and a
    /// call frame for `handler(arg, ureg)`.
    fn enter_handler(
        &self,
        st: &mut KernelState,
        tid: Tid,
        handler: SwexnHandler,
        regs: &Ureg,
    ) -> KernResult<()> {
        let task = st.current_task();
        let ureg_at = handler.esp3 - Ureg::SIZE as u32;
        let sp = ureg_at - 12;
        {
            let mut user = st.user_space(&self.vm, task);
            user.check_writable(sp, (handler.esp3 - sp) as usize)?;
            user.copyout(ureg_at, &regs.to_bytes())?;
            user.suword32(sp + 8, ureg_at)?;
            user.suword32(sp + 4, handler.arg)?;
            user.suword32(sp, 0)?;
        }
        let t = st.threads.thread_mut(tid);
        t.regs.eip = handler.eip;
        t.regs.esp = sp;
        log::debug!(target: "exception", "{} enters handler at {:#010x}", tid, handler.eip);
        Ok(())
    }

    /// Install or remove the caller's handler, optionally adopting registers
    ///
    /// Everything is checked before anything changes. With `newureg`
    /// non-null the caller resumes from those registers instead of
    /// returning.
    pub(crate) fn swexn_cli(
        &self,
        st: &mut KernelState,
        esp3: VirtAddr,
        eip: VirtAddr,
        arg: u32,
        newureg: VirtAddr,
    ) -> KernResult<Outcome> {
        let cur = st.current();
        let task = st.current_task();
        let install = esp3 != 0 && eip != 0;
        if install && !(is_user_addr(eip) && is_user_addr(esp3 - 1)) {
            return Err(KernError::InvalidArgument);
        }
        let adopt = if newureg != 0 {
            let mut bytes = [0u8; Ureg::SIZE];
            st.user_space(&self.vm, task).copyin(newureg, &mut bytes)?;
            let regs = Ureg::from_bytes(&bytes);
            if !regs.eflags_safe() || !is_user_addr(regs.eip) {
                return Err(KernError::InvalidArgument);
            }
            Some(regs)
        } else {
            None
        };

        let t = st.threads.thread_mut(cur);
        t.swexn = install.then_some(SwexnHandler { esp3, eip, arg });
        match adopt {
            Some(regs) => {
                t.regs = regs;
                Ok(Outcome::NoReturn)
            }
            None => Ok(Outcome::Complete(0)),
        }
    }

    pub fn swexn_handler(&self, tid: Tid) -> Option<SwexnHandler> {
        self.disable_interrupts().threads.get(tid).and_then(|t| t.swexn)
    }

    // ========================================================================
    // User memory accesses
    // ========================================================================

    /// Read user memory as the current thread would, faulting like the MMU
    pub fn user_read(&self, va: VirtAddr, buf: &mut [u8]) -> Result<(), FaultDisposition> {
        self.user_access(va, buf.len(), false, |vm, pa, off, n| {
            vm.phys.read(pa, &mut buf[off..off + n])
        })
    }

    /// Write user memory as the current thread would, faulting like the MMU
    pub fn user_write(&self, va: VirtAddr, data: &[u8]) -> Result<(), FaultDisposition> {
        self.user_access(va, data.len(), true, |vm, pa, off, n| {
            vm.phys.write(pa, &data[off..off + n])
        })
    }

    fn user_access(
        &self,
        va: VirtAddr,
        len: usize,
        write: bool,
        mut f: impl FnMut(&crate::vm::Vm, crate::types::PhysAddr, usize, usize),
    ) -> Result<(), FaultDisposition> {
        let mut guard = self.disable_interrupts();
        let st = &mut *guard;
        let mut done = 0usize;
        while done < len {
            let addr = va.wrapping_add(done as u32);
            let n = ((PAGE_SIZE - addr % PAGE_SIZE) as usize).min(len - done);
            let dir = st.tasks.task(st.current_task()).page_dir;
            let mut need = PteFlags::PRESENT | PteFlags::USER;
            if write {
                need |= PteFlags::WRITABLE;
            }
            match self.vm.get_pte(dir, addr) {
                Some(pte) if pte.flags().contains(need) => {
                    f(&self.vm, pte.frame() | (addr % PAGE_SIZE), done, n);
                    done += n;
                }
                pte => {
                    let present = pte.is_some_and(|p| p.is_present());
                    match self.raise_exception_cli(st, Fault::page(addr, write, present)) {
                        FaultDisposition::Resolved => {}
                        other => return Err(other),
                    }
                }
            }
        }
        Ok(())
    }
}

fn is_user_addr(va: VirtAddr) -> bool {
    (USER_MEM_START..PHYS_WINDOW).contains(&va)
}

fn dump_registers(tid: Tid, fault: Fault, r: &Ureg) {
    log::error!(
        target: "exception",
        "{} killed by {} (vector {}) at eip {:#010x}, cr2 {:#010x}, err {:#x}",
        tid,
        fault.kind().name(),
        fault.cause,
        r.eip,
        r.cr2,
        r.error_code
    );
    log::error!(
        target: "exception",
        "eax {:#010x} ebx {:#010x} ecx {:#010x} edx {:#010x}",
        r.eax,
        r.ebx,
        r.ecx,
        r.edx
    );
    log::error!(
        target: "exception",
        "esi {:#010x} edi {:#010x} ebp {:#010x} esp {:#010x} eflags {:#010x}",
        r.esi,
        r.edi,
        r.ebp,
        r.esp,
        r.eflags
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::syscall::Syscall;
    use crate::kern::task::TaskState;
    use crate::kern::testutil::{boot_kernel, fork_child, SCRATCH};
    use crate::types::TaskId;

    #[test]
    fn test_zfod_write_is_transparent() {
        let (k, m) = boot_kernel();
        let fresh = SCRATCH + 0x1000;
        let before = k.vm().stats.zero_fills();
        k.user_write(fresh, b"abc").unwrap();
        assert_eq!(k.vm().stats.zero_fills(), before + 1);
        assert!(m.invalidations().contains(&fresh));
        let mut buf = [0u8; 3];
        k.user_read(fresh, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn test_unhandled_fault_kills_task() {
        crate::console::init(log::LevelFilter::Error);
        let (k, _m) = boot_kernel();
        let init = k.current_tid();
        let child = fork_child(&k);
        k.syscall(Syscall::YieldTo(child.as_i32()));
        assert_eq!(k.raise_exception(Fault::divide_error()), FaultDisposition::Killed);
        assert_eq!(k.current_tid(), init);
        let task = TaskId::from(child);
        assert_eq!(k.task_state(task), Some(TaskState::Zombie));
        assert_eq!(k.exit_status(task), Some(FAULT_EXIT_STATUS));
        assert!(crate::console::contains("killed by arithmetic"));
    }

    #[test]
    fn test_write_to_text_is_fatal() {
        let (k, _m) = boot_kernel();
        let child = fork_child(&k);
        k.syscall(Syscall::YieldTo(child.as_i32()));
        assert_eq!(k.user_write(0x0100_0000, b"x"), Err(FaultDisposition::Killed));
        assert_eq!(k.exit_status(TaskId::from(child)), Some(FAULT_EXIT_STATUS));
    }

    #[test]
    fn test_handler_gets_registers_once() {
        let (k, _m) = boot_kernel();
        let init = k.current_tid();
        let top = SCRATCH + 0x1000;
        assert_eq!(
            k.syscall(Syscall::Swexn {
                esp3: top,
                eip: 0x0100_0000,
                arg: 0x55,
                newureg: 0,
            }),
            Outcome::Complete(0)
        );
        let before = k.registers(init).unwrap();

        assert_eq!(k.raise_exception(Fault::general_protection(0)), FaultDisposition::Delivered);
        let regs = k.registers(init).unwrap();
        assert_eq!(regs.eip, 0x0100_0000);
        let mut frame = [0u8; 12];
        k.user_read(regs.esp, &mut frame).unwrap();
        let word = |i: usize| u32::from_le_bytes([frame[i], frame[i + 1], frame[i + 2], frame[i + 3]]);
        assert_eq!(word(0), 0);
        assert_eq!(word(4), 0x55);
        let mut saved = [0u8; Ureg::SIZE];
        k.user_read(word(8), &mut saved).unwrap();
        let saved = Ureg::from_bytes(&saved);
        assert_eq!(saved.cause, IDT_GP);
        assert_eq!(saved.eip, before.eip);
        assert!(k.swexn_handler(init).is_none());

        // no handler left: the next fault is fatal
        assert_eq!(k.raise_exception(Fault::general_protection(0)), FaultDisposition::Killed);
    }

    #[test]
    fn test_swexn_validates_before_changing() {
        let (k, _m) = boot_kernel();
        let init = k.current_tid();
        assert_eq!(
            k.syscall(Syscall::Swexn {
                esp3: 0x1000,
                eip: 0x0100_0000,
                arg: 0,
                newureg: 0
            }),
            Outcome::Complete(KernError::InvalidArgument.errno())
        );
        assert!(k.swexn_handler(init).is_none());

        // adopt a register set with unsafe flags: refused
        let mut bad = Ureg::user_entry(0x0100_0000, SCRATCH + 0x800);
        bad.eflags = 0;
        k.user_write(SCRATCH, &bad.to_bytes()).unwrap();
        assert_eq!(
            k.syscall(Syscall::Swexn {
                esp3: 0,
                eip: 0,
                arg: 0,
                newureg: SCRATCH
            }),
            Outcome::Complete(KernError::InvalidArgument.errno())
        );

        let mut good = Ureg::user_entry(0x0100_0000, SCRATCH + 0x800);
        good.eax = 42;
        k.user_write(SCRATCH, &good.to_bytes()).unwrap();
        assert_eq!(
            k.syscall(Syscall::Swexn {
                esp3: 0,
                eip: 0,
                arg: 0,
                newureg: SCRATCH
            }),
            Outcome::NoReturn
        );
        assert_eq!(k.registers(init), Some(good));
        assert_eq!(k.return_value(init), Some(42));
    }
}
