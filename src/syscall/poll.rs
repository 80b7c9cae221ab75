//! `poll(2)`: multiplexed readiness wait over a set of file descriptors.
//!
//! One `Poller` is created for the call and registered (weakly) with
//! every polled file's `poll_head`. Any fd becoming ready, the timeout
//! callout firing, or a pending signal wakes it; the condition is
//! re-evaluated from scratch on every wake, same as the vnode layer's
//! own `wait`/`notify` pattern.

use crate::lib::error::{Errno, Result};
use crate::process::scheduler::{self, callout};
use crate::vfs::poll::{PollEvents, Poller};
use alloc::sync::Arc;
use alloc::vec::Vec;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct PollFd {
    pub fd: i32,
    pub events: i16,
    pub revents: i16,
}

/// Polls `fds`, blocking up to `timeout_ms` (`-1` forever, `0` = poll
/// once and return). Returns the number of fds with nonzero `revents`.
pub fn sys_poll(fds: &mut [PollFd], timeout_ms: i64) -> Result<isize> {
    if fds.len() > 4096 {
        return Err(Errno::EINVAL);
    }

    let task = crate::process::current_task().ok_or(Errno::ESRCH)?;
    let poller = Poller::new();

    loop {
        let mut ready = 0isize;
        let mut heads = Vec::with_capacity(fds.len());

        for pfd in fds.iter_mut() {
            pfd.revents = 0;
            if pfd.fd < 0 {
                continue;
            }
            let Some(file) = task.files.lock().get(pfd.fd) else {
                pfd.revents = PollEvents::POLLNVAL.bits() as i16;
                ready += 1;
                continue;
            };
            let requested = pfd.events as u16;
            let bits = file.poll().unwrap_or(PollEvents::POLLNVAL.bits() as u32) as u16;
            let revents = bits & (requested | PollEvents::POLLERR.bits() | PollEvents::POLLHUP.bits() | PollEvents::POLLNVAL.bits());
            if revents != 0 {
                pfd.revents = revents as i16;
                ready += 1;
            } else if let Some(head) = file.poll_head() {
                heads.push(head);
            }
        }

        if ready > 0 || timeout_ms == 0 {
            return Ok(ready);
        }
        if task.signals.next_deliverable().is_some() {
            return Err(Errno::EINTR);
        }

        for head in &heads {
            head.register(&poller);
        }

        let handle = if timeout_ms > 0 {
            let cpu = scheduler::cpu_id();
            let delay = ((timeout_ms as u64 * 1000 + 999) / 1000).max(1);
            let raw = Arc::into_raw(poller.clone()) as usize;
            callout::add(cpu, delay, crate::vfs::poll::expire_callout, raw)
        } else {
            None
        };

        let guard = poller.lock.lock();
        drop(scheduler::wait(&poller.waiters, &poller.lock, guard));

        if let Some(handle) = handle {
            callout::cancel(scheduler::cpu_id(), handle);
            if !poller.is_expired() {
                let raw = Arc::as_ptr(&poller);
                unsafe { drop(Arc::from_raw(raw)) };
            }
        }

        if poller.is_expired() {
            return Ok(0);
        }
        if task.signals.next_deliverable().is_some() {
            return Err(Errno::EINTR);
        }
    }
}
