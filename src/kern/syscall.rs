//! System Call Dispatch
//!
//! Based on Mach4 kern/syscall_sw.c
//!
//! [`Kernel::syscall`] runs one call for the current thread with the
//! kernel state lock held. A call either completes at once, with its
//! result stored in the caller's `%eax`, or blocks; a blocked call is
//! finished later by the continuation it left in its thread.
//!
//! [`Kernel::trap`] is the software-interrupt entry: it decodes the
//! arguments from the caller's registers (a single argument travels in
//! `%esi`, several in a packet of words `%esi` points to) and dispatches.

use super::kernel::{Kernel, KernelState};
use crate::error::{KernError, KernResult};
use crate::types::{TaskId, VirtAddr};

/// What a system call did to its caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Finished; the value is in the caller's `%eax`
    Complete(i32),
    /// The caller is blocked and will be finished by its continuation
    Blocked,
    /// The caller does not return to the call site (exit, exec, swexn
    /// with new registers)
    NoReturn,
}

/// A decoded system call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Fork,
    ThreadFork,
    Exec { name: VirtAddr, argv: VirtAddr },
    Wait { status_ptr: VirtAddr },
    Vanish(i32),
    NewPages { base: VirtAddr, len: i32 },
    RemovePages { base: VirtAddr },
    Sleep(i32),
    YieldTo(i32),
    GetTid,
    GetTicks,
    SetStatus(i32),
    Deschedule { reject: VirtAddr },
    MakeRunnable(i32),
    Swexn {
        esp3: VirtAddr,
        eip: VirtAddr,
        arg: u32,
        newureg: VirtAddr,
    },
}

// ============================================================================
// Trap vectors
// ============================================================================

pub const FORK_INT: u32 = 0x41;
pub const EXEC_INT: u32 = 0x42;
pub const WAIT_INT: u32 = 0x44;
pub const YIELD_INT: u32 = 0x45;
pub const DESCHEDULE_INT: u32 = 0x46;
pub const MAKE_RUNNABLE_INT: u32 = 0x47;
pub const GETTID_INT: u32 = 0x48;
pub const NEW_PAGES_INT: u32 = 0x49;
pub const REMOVE_PAGES_INT: u32 = 0x4A;
pub const SLEEP_INT: u32 = 0x4B;
pub const THREAD_FORK_INT: u32 = 0x52;
pub const GET_TICKS_INT: u32 = 0x53;
pub const SET_STATUS_INT: u32 = 0x59;
pub const VANISH_INT: u32 = 0x60;
pub const SWEXN_INT: u32 = 0x74;

impl Kernel {
    /// Run `call` for the current thread
    pub fn syscall(&self, call: Syscall) -> Outcome {
        let mut guard = self.disable_interrupts();
        let st = &mut *guard;
        let caller = st.current();
        log::trace!(target: "syscall", "{} {:?}", caller, call);

        let outcome = match self.dispatch_call(st, call) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::trace!(target: "syscall", "{} {:?} failed: {}", caller, call, e);
                Outcome::Complete(e.errno())
            }
        };
        if let Outcome::Complete(value) = outcome {
            if let Some(t) = st.threads.get_mut(caller) {
                t.set_return(value);
            }
        }
        outcome
    }

    fn dispatch_call(&self, st: &mut KernelState, call: Syscall) -> KernResult<Outcome> {
        match call {
            Syscall::Fork => self.fork_cli(st),
            Syscall::ThreadFork => self.thread_fork_cli(st),
            Syscall::Exec { name, argv } => self.exec_cli(st, name, argv),
            Syscall::Wait { status_ptr } => self.wait_cli(st, status_ptr),
            Syscall::Vanish(status) => {
                self.set_status_cli(st, status)?;
                self.vanish_cli(st);
                Ok(Outcome::NoReturn)
            }
            Syscall::NewPages { base, len } => {
                let task = st.current_task();
                let t = st.tasks.task_mut(task);
                self.vm.new_pages(t.page_dir, &mut t.maps, base, len)?;
                Ok(Outcome::Complete(0))
            }
            Syscall::RemovePages { base } => {
                let task = st.current_task();
                let t = st.tasks.task_mut(task);
                self.vm
                    .remove_pages(t.page_dir, &mut t.maps, base, &mut *st.machine)?;
                Ok(Outcome::Complete(0))
            }
            Syscall::Sleep(ticks) => self.sleep_cli(st, ticks),
            Syscall::YieldTo(tid) => self.yield_to_cli(st, tid),
            Syscall::GetTid => Ok(Outcome::Complete(st.current().as_i32())),
            Syscall::GetTicks => Ok(Outcome::Complete(st.sched.ticks as i32)),
            Syscall::SetStatus(status) => self.set_status_cli(st, status),
            Syscall::Deschedule { reject } => self.deschedule_cli(st, reject),
            Syscall::MakeRunnable(tid) => self.make_runnable_cli(st, tid),
            Syscall::Swexn {
                esp3,
                eip,
                arg,
                newureg,
            } => self.swexn_cli(st, esp3, eip, arg, newureg),
        }
    }

    /// Software interrupt `vector` raised by the current thread
    pub fn trap(&self, vector: u32) -> Outcome {
        let decoded = {
            let mut guard = self.disable_interrupts();
            self.decode(&mut guard, vector)
        };
        match decoded {
            Ok(call) => self.syscall(call),
            Err(e) => {
                let value = e.errno();
                let mut st = self.disable_interrupts();
                let cur = st.current();
                st.threads.thread_mut(cur).set_return(value);
                Outcome::Complete(value)
            }
        }
    }

    fn decode(&self, st: &mut KernelState, vector: u32) -> KernResult<Syscall> {
        let esi = st.threads.thread(st.current()).regs.esi;
        let task = st.current_task();
        let call = match vector {
            FORK_INT => Syscall::Fork,
            THREAD_FORK_INT => Syscall::ThreadFork,
            EXEC_INT => {
                let [name, argv] = self.packet(st, task, esi)?;
                Syscall::Exec { name, argv }
            }
            WAIT_INT => Syscall::Wait { status_ptr: esi },
            VANISH_INT => Syscall::Vanish(esi as i32),
            NEW_PAGES_INT => {
                let [base, len] = self.packet(st, task, esi)?;
                Syscall::NewPages {
                    base,
                    len: len as i32,
                }
            }
            REMOVE_PAGES_INT => Syscall::RemovePages { base: esi },
            SLEEP_INT => Syscall::Sleep(esi as i32),
            YIELD_INT => Syscall::YieldTo(esi as i32),
            GETTID_INT => Syscall::GetTid,
            GET_TICKS_INT => Syscall::GetTicks,
            SET_STATUS_INT => Syscall::SetStatus(esi as i32),
            DESCHEDULE_INT => Syscall::Deschedule { reject: esi },
            MAKE_RUNNABLE_INT => Syscall::MakeRunnable(esi as i32),
            SWEXN_INT => {
                let [esp3, eip, arg, newureg] = self.packet(st, task, esi)?;
                Syscall::Swexn {
                    esp3,
                    eip,
                    arg,
                    newureg,
                }
            }
            _ => return Err(KernError::InvalidArgument),
        };
        Ok(call)
    }

    /// Fetch an argument packet of `N` words
    fn packet<const N: usize>(
        &self,
        st: &mut KernelState,
        task: TaskId,
        addr: VirtAddr,
    ) -> KernResult<[u32; N]> {
        let mut user = st.user_space(&self.vm, task);
        let mut words = [0u32; N];
        for (i, w) in words.iter_mut().enumerate() {
            let at = addr
                .checked_add(4 * i as u32)
                .ok_or(KernError::BadAddress(addr))?;
            *w = user.fuword32(at)?;
        }
        Ok(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil::{boot_kernel, SCRATCH};
    use crate::kern::thread::ThreadStatus;
    use crate::types::Tid;

    fn set_esi(k: &Kernel, esi: u32) {
        let tid = k.current_tid();
        let mut regs = k.registers(tid).unwrap();
        regs.esi = esi;
        k.set_registers(tid, regs).unwrap();
    }

    #[test]
    fn test_gettid_and_ticks() {
        let (k, _m) = boot_kernel();
        let init = k.current_tid();
        assert_eq!(k.trap(GETTID_INT), Outcome::Complete(init.as_i32()));
        assert_eq!(k.return_value(init), Some(init.as_i32()));
        k.timer_tick();
        k.timer_tick();
        assert_eq!(k.syscall(Syscall::GetTicks), Outcome::Complete(2));
    }

    #[test]
    fn test_new_pages_through_packet() {
        let (k, _m) = boot_kernel();
        let packet = [0x0300_0000u32, 0x2000];
        let bytes: alloc::vec::Vec<u8> = packet.iter().flat_map(|w| w.to_le_bytes()).collect();
        k.user_write(SCRATCH, &bytes).unwrap();
        set_esi(&k, SCRATCH);
        assert_eq!(k.trap(NEW_PAGES_INT), Outcome::Complete(0));
        assert!(k
            .regions(k.init_task())
            .iter()
            .any(|r| r.low == 0x0300_0000 && r.high == 0x0300_1fff));

        set_esi(&k, 0x0300_0000);
        assert_eq!(k.trap(REMOVE_PAGES_INT), Outcome::Complete(0));
        assert_eq!(
            k.trap(REMOVE_PAGES_INT),
            Outcome::Complete(KernError::InvalidArgument.errno())
        );
    }

    #[test]
    fn test_bad_packet_pointer() {
        let (k, _m) = boot_kernel();
        set_esi(&k, 0x0800);
        let Outcome::Complete(err) = k.trap(SWEXN_INT) else {
            panic!("swexn blocked")
        };
        assert_eq!(err, KernError::BadAddress(0x0800).errno());
        assert_eq!(
            k.trap(0x99),
            Outcome::Complete(KernError::InvalidArgument.errno())
        );
    }

    #[test]
    fn test_sleep_wakes_in_tick_order() {
        let (k, _m) = boot_kernel();
        let init = k.current_tid();
        let Outcome::Complete(t) = k.syscall(Syscall::ThreadFork) else {
            panic!("thread_fork blocked")
        };
        let t = Tid(t as u32);
        assert_eq!(k.syscall(Syscall::Sleep(3)), Outcome::Blocked);
        assert_eq!(k.thread_status(init), Some(ThreadStatus::Sleeping));
        assert_eq!(k.current_tid(), t);
        assert_eq!(k.syscall(Syscall::Sleep(1)), Outcome::Blocked);
        assert_eq!(k.sleep_queue(), [t, init]);
        assert_eq!(k.current_tid(), k.idle_tid());

        k.timer_tick();
        assert_eq!(k.current_tid(), t);
        assert_eq!(k.return_value(t), Some(0));
        k.timer_tick();
        k.timer_tick();
        assert_eq!(k.current_tid(), init);
        assert!(k.sleep_queue().is_empty());
        assert_eq!(
            k.syscall(Syscall::Sleep(-1)),
            Outcome::Complete(KernError::InvalidArgument.errno())
        );
        assert_eq!(k.syscall(Syscall::Sleep(0)), Outcome::Complete(0));
    }

    #[test]
    fn test_deschedule_and_make_runnable() {
        let (k, _m) = boot_kernel();
        let init = k.current_tid();
        let Outcome::Complete(t) = k.syscall(Syscall::ThreadFork) else {
            panic!("thread_fork blocked")
        };
        let t = Tid(t as u32);

        // a set reject word returns at once
        k.user_write(SCRATCH, &1u32.to_le_bytes()).unwrap();
        assert_eq!(
            k.syscall(Syscall::Deschedule { reject: SCRATCH }),
            Outcome::Complete(0)
        );
        assert_eq!(
            k.syscall(Syscall::MakeRunnable(t.as_i32())),
            Outcome::Complete(KernError::NotRunnable.errno())
        );

        k.user_write(SCRATCH, &0u32.to_le_bytes()).unwrap();
        assert_eq!(
            k.syscall(Syscall::Deschedule { reject: SCRATCH }),
            Outcome::Blocked
        );
        assert_eq!(k.current_tid(), t);
        assert_eq!(k.thread_status(init), Some(ThreadStatus::Suspended));
        // time alone does not wake it
        k.timer_tick();
        assert_eq!(k.current_tid(), t);

        assert_eq!(
            k.syscall(Syscall::MakeRunnable(init.as_i32())),
            Outcome::Complete(0)
        );
        assert_eq!(k.ready_queue(), [init]);
        assert_eq!(
            k.syscall(Syscall::MakeRunnable(9999)),
            Outcome::Complete(KernError::NotFound.errno())
        );
        k.syscall(Syscall::YieldTo(-1));
        assert_eq!(k.current_tid(), init);
        assert_eq!(k.return_value(init), Some(0));
    }

    #[test]
    fn test_yield_to_errors() {
        let (k, _m) = boot_kernel();
        let init = k.current_tid();
        assert_eq!(
            k.syscall(Syscall::YieldTo(4242)),
            Outcome::Complete(KernError::NotFound.errno())
        );
        assert_eq!(
            k.syscall(Syscall::YieldTo(k.idle_tid().as_i32())),
            Outcome::Complete(KernError::NotRunnable.errno())
        );
        // yielding to oneself with nothing else ready keeps the CPU
        assert_eq!(
            k.syscall(Syscall::YieldTo(init.as_i32())),
            Outcome::Complete(0)
        );
        assert_eq!(k.current_tid(), init);
    }
}
