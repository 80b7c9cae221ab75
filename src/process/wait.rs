//! `wait4`/`waitpid`: reaping zombie children and retrieving their
//! exit status.

use super::pid;
use super::scheduler;
use super::task::{ProcessState, Task};
use crate::lib::error::Errno;
use alloc::sync::Arc;
use spin::Mutex;

pub const WNOHANG: i32 = 1;
pub const WUNTRACED: i32 = 2;
pub const WCONTINUED: i32 = 8;

pub fn w_exitcode(exit_code: i32, signal: i32) -> i32 {
    (exit_code << 8) | (signal & 0x7f)
}

fn candidates(current: &Arc<Task>, pid: i32) -> Result<alloc::vec::Vec<super::Pid>, Errno> {
    let children = if pid > 0 {
        alloc::vec![pid as super::Pid]
    } else if pid == -1 || pid == 0 {
        // pid == 0 (same process group) is approximated as "any child"
        // until job-control-aware callers filter by pgid themselves.
        super::pid::find_children(current.pid)
    } else {
        let group = pid::lookup_group((-pid) as super::Pid).ok_or(Errno::ECHILD)?;
        group.members()
    };
    if children.is_empty() {
        return Err(Errno::ECHILD);
    }
    Ok(children)
}

/// Blocks (unless `WNOHANG`) until a child matching `pid` changes
/// state, reaping it if it has exited. `pid` follows `wait4` semantics:
/// `> 0` a specific child, `-1` any child, `0`/`< -1` process-group
/// variants.
pub fn do_wait4(current: &Arc<Task>, pid: i32, wstatus: &mut i32, options: i32) -> Result<super::Pid, Errno> {
    static WAIT_LOCK: Mutex<()> = Mutex::new(());

    loop {
        let children = candidates(current, pid)?;

        for child_pid in &children {
            let Some(child) = pid::lookup(*child_pid) else { continue };
            if child.is_zombie() {
                *wstatus = w_exitcode(child.exit_code(), 0);
                scheduler::retire(child.main_tid());
                pid::remove_task(*child_pid);
                return Ok(*child_pid);
            }
            if (options & WUNTRACED) != 0 {
                if let Some(sig) = child.stop_signal() {
                    *wstatus = 0x7f | ((sig as i32) << 8);
                    return Ok(*child_pid);
                }
            }
        }

        if (options & WNOHANG) != 0 {
            return Ok(0);
        }

        let guard = WAIT_LOCK.lock();
        let _guard = scheduler::wait(&current.waitpid_waitlist, &WAIT_LOCK, guard);
    }
}

/// Terminates the calling process: marks it a zombie, reparents its
/// children to init, and wakes anyone waiting on it.
pub fn do_exit(current: &Arc<Task>, exit_code: i32) -> ! {
    current.mark_exited(exit_code);
    current.leave_group();
    pid::reparent_to_init(current.pid);

    crate::info!("pid={} exited with code {}", current.pid, exit_code);

    notify_parent(current);

    crate::mm::vmm::destroy_context(current.vmm());
    scheduler::exit_current();
}

/// Stops every thread of the process for a job-control stop signal,
/// waking its parent. Returns without effect if the process is
/// already stopped (mirrors `send_to_thread`'s "don't flood the system
/// with an infinite number of stop signals" guard).
pub fn stop(task: &Arc<Task>, signal: u8) {
    if !task.begin_stop(signal) {
        return;
    }
    task.set_process_state(ProcessState::Stopped);
    notify_parent(task);
    let _ = super::signal::send_to_process(task.ppid(), super::signal::SIGCHLD);
}

/// A child changed state: wake whichever thread(s) of its parent are
/// blocked in `wait4`/`waitpid`. The parent waits on its own
/// `waitpid_waitlist` regardless of which child it's watching, so a
/// single queue per process is enough even for `wait4(-1, ...)`.
fn notify_parent(child: &Arc<Task>) {
    if let Some(parent) = pid::lookup(child.ppid()) {
        scheduler::notify(&parent.waitpid_waitlist);
    }
}
