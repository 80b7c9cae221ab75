//! `fork()`: duplicate the calling process into a new child that
//! shares nothing but its open files and copy-on-write pages.

use super::pid;
use super::scheduler::{self, Tid};
use super::task::Task;
use crate::lib::error::Errno;
use crate::mm::vmm;
use alloc::sync::Arc;

/// Duplicates `parent`, returning the new child's `Pid`. The calling
/// thread's trap frame is copied into the child's main thread so that,
/// once scheduled, it resumes at the same user-mode instruction with
/// `rax` forced to `0` -- the parent keeps running here and gets the
/// child's pid back from this call.
pub fn do_fork(parent: &Arc<Task>) -> Result<super::Pid, Errno> {
    let child_pid = pid::alloc_pid().map_err(|_| Errno::EAGAIN)?;

    let child_vmm = vmm::duplicate_context(&parent.vmm()).map_err(|_| Errno::ENOMEM)?;

    let child_tid = scheduler::spawn(child_pid, fork_child_entry as usize as u64, child_vmm.phys());

    let cred = *parent.cred.lock();
    let child = Task::new(
        child_pid,
        parent.pid,
        child_vmm,
        parent.root(),
        parent.cwd(),
        cred,
        parent.name(),
        child_tid,
    );

    {
        let mut frame = *parent.trap_frame.lock();
        frame.set_return_value(0);
        *child.trap_frame.lock() = frame;
    }
    *child.files.lock() = parent.files.lock().fork_copy();

    if let Some(group) = parent.group() {
        child.join_group(group);
    }

    pid::insert_task(child).map_err(|_| Errno::EAGAIN)?;
    Ok(child_pid)
}

/// Entry point for a just-forked thread: it has no Rust call stack to
/// resume, only the trap frame stashed in its `Task` by `do_fork`.
extern "C" fn fork_child_entry() -> ! {
    let tid: Tid = scheduler::current_tid();
    let task = pid::lookup(scheduler::current_thread().pid).expect("forked task must be registered before its thread runs");
    debug_assert_eq!(task.main_tid(), tid);
    let frame = *task.trap_frame.lock();
    unsafe { crate::arch::x86_64::syscall::return_to_user(&frame) }
}
