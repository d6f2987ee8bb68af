//! Whole-kernel task lifecycle scenarios

mod common;

use common::{boot, read_word, run_until, spawn, task, SCRATCH};
use pebbles_r::config::{FAULT_EXIT_STATUS, PAGE_SIZE};
use pebbles_r::kern::{Fault, FaultDisposition, TaskState, ThreadStatus};
use pebbles_r::{KernError, Outcome, Syscall};

#[test]
fn test_two_children_reaped_then_no_children() {
    let (k, _m) = boot();
    let init = k.current_tid();

    let first = spawn(&k, Syscall::Fork);
    run_until(&k, first);
    assert_eq!(k.syscall(Syscall::Vanish(5)), Outcome::NoReturn);
    assert_eq!(k.current_tid(), init);

    let second = spawn(&k, Syscall::Fork);
    run_until(&k, second);
    assert_eq!(k.syscall(Syscall::Vanish(7)), Outcome::NoReturn);
    assert_eq!(k.current_tid(), init);
    assert_eq!(k.zombie_children(k.init_task()).len(), 2);

    let mut reaped = Vec::new();
    for _ in 0..2 {
        let out = k.syscall(Syscall::Wait { status_ptr: SCRATCH });
        let Outcome::Complete(id) = out else {
            panic!("wait did not complete: {:?}", out)
        };
        reaped.push((id, read_word(&k, SCRATCH) as i32));
    }
    reaped.sort();
    assert_eq!(
        reaped,
        [(first.as_i32(), 5), (second.as_i32(), 7)]
    );
    assert!(!k.task_exists(task(first)));
    assert!(!k.task_exists(task(second)));

    assert_eq!(
        k.syscall(Syscall::Wait { status_ptr: 0 }),
        Outcome::Complete(KernError::NoChildren.errno())
    );
}

#[test]
fn test_parent_blocks_until_child_exits() {
    let (k, _m) = boot();
    let init = k.current_tid();
    let child = spawn(&k, Syscall::Fork);

    assert_eq!(k.syscall(Syscall::Wait { status_ptr: SCRATCH }), Outcome::Blocked);
    assert_eq!(k.thread_status(init), Some(ThreadStatus::Suspended));
    assert_eq!(k.current_tid(), child);

    k.syscall(Syscall::Vanish(42));
    assert_eq!(k.current_tid(), init);
    assert_eq!(k.return_value(init), Some(child.as_i32()));
    assert_eq!(read_word(&k, SCRATCH), 42);
}

#[test]
fn test_fork_copies_memory() {
    let (k, _m) = boot();
    let init = k.current_tid();
    k.user_write(SCRATCH, &0xaaaa_aaaau32.to_le_bytes()).unwrap();

    let child = spawn(&k, Syscall::Fork);
    run_until(&k, child);
    assert_eq!(read_word(&k, SCRATCH), 0xaaaa_aaaa);
    k.user_write(SCRATCH, &0xbbbb_bbbbu32.to_le_bytes()).unwrap();
    assert_eq!(read_word(&k, SCRATCH), 0xbbbb_bbbb);

    run_until(&k, init);
    assert_eq!(read_word(&k, SCRATCH), 0xaaaa_aaaa);
    assert_ne!(
        k.translate(k.init_task(), SCRATCH),
        k.translate(task(child), SCRATCH)
    );

    k.user_write(SCRATCH, &0xcccc_ccccu32.to_le_bytes()).unwrap();
    run_until(&k, child);
    assert_eq!(read_word(&k, SCRATCH), 0xbbbb_bbbb);
    run_until(&k, init);
    assert_eq!(read_word(&k, SCRATCH), 0xcccc_cccc);
}

#[test]
fn test_fork_shares_untouched_zero_pages() {
    let (k, _m) = boot();
    let init = k.current_tid();
    let fresh = SCRATCH + PAGE_SIZE;
    let zero = k.vm().zfod_frame();
    assert_eq!(k.translate(k.init_task(), fresh), Some(zero));

    let child = spawn(&k, Syscall::Fork);
    assert_eq!(k.translate(task(child), fresh), Some(zero));

    run_until(&k, child);
    k.user_write(fresh, b"kid").unwrap();
    let private = k.translate(task(child), fresh);
    assert!(private.is_some());
    assert_ne!(private, Some(zero));
    assert_eq!(k.translate(k.init_task(), fresh), Some(zero));

    run_until(&k, init);
    assert_eq!(read_word(&k, fresh), 0);
    k.user_write(fresh, b"dad").unwrap();
    assert_ne!(k.translate(k.init_task(), fresh), Some(zero));
    assert_ne!(k.translate(k.init_task(), fresh), private);
    run_until(&k, child);
    let mut buf = [0u8; 3];
    k.user_read(fresh, &mut buf).unwrap();
    assert_eq!(&buf, b"kid");
}

#[test]
fn test_faulting_child_reports_fault_status() {
    let (k, _m) = boot();
    let init = k.current_tid();
    let child = spawn(&k, Syscall::Fork);
    run_until(&k, child);

    assert_eq!(k.raise_exception(Fault::divide_error()), FaultDisposition::Killed);
    assert_eq!(k.current_tid(), init);
    assert_eq!(k.task_state(task(child)), Some(TaskState::Zombie));

    let out = k.syscall(Syscall::Wait { status_ptr: SCRATCH });
    assert_eq!(out, Outcome::Complete(child.as_i32()));
    assert_eq!(read_word(&k, SCRATCH) as i32, FAULT_EXIT_STATUS);
}

#[test]
fn test_grandchildren_reparented_to_init() {
    let (k, _m) = boot();
    let child = spawn(&k, Syscall::Fork);
    run_until(&k, child);
    let grandchild = spawn(&k, Syscall::Fork);
    assert_eq!(k.parent_of(task(grandchild)), Some(task(child)));

    k.syscall(Syscall::Vanish(0));
    assert_eq!(k.parent_of(task(grandchild)), Some(k.init_task()));
    assert!(k.children(k.init_task()).contains(&task(grandchild)));
}

#[test]
fn test_frames_return_after_reap() {
    let (k, _m) = boot();
    let before = k.free_frames();
    let child = spawn(&k, Syscall::Fork);
    assert!(k.free_frames() < before);

    run_until(&k, child);
    k.syscall(Syscall::Vanish(1));
    assert_eq!(
        k.syscall(Syscall::Wait { status_ptr: 0 }),
        Outcome::Complete(child.as_i32())
    );
    assert_eq!(k.free_frames(), before);
}
