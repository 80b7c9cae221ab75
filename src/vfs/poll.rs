/// Readiness multiplexing: `poll_head`/`poller` pair that lets `sys_poll`
/// block on several files at once without each vnode knowing anything
/// about the syscall that's waiting on it.
///
/// A `Poller` is created fresh for each `poll()` call and registered
/// (weakly) into every polled file's `PollHead`; any of them can wake it
/// via `notify`. Unlike an intrusive C linked list, a dropped `Poller`
/// just becomes a dead `Weak` that `notify` prunes on its next pass.
use crate::process::scheduler::WaitQueue;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u16 {
        const POLLIN = 0x0001;
        const POLLPRI = 0x0002;
        const POLLOUT = 0x0004;
        const POLLERR = 0x0008;
        const POLLHUP = 0x0010;
        const POLLNVAL = 0x0020;
    }
}

/// Per-`poll()`-call waiter. Lives on the syscall's stack (wrapped in an
/// `Arc` so `PollHead`s can hold a `Weak` to it); woken by any resource
/// it was registered with becoming ready.
pub struct Poller {
    pub waiters: WaitQueue,
    /// Generic sleep lock for `scheduler::wait`, unrelated to any data
    /// it guards -- this `Poller` has no state besides the wait queue
    /// and the expiry flag, both already safe to touch without it.
    pub lock: Mutex<()>,
    expired: AtomicBool,
}

impl Poller {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { waiters: WaitQueue::new(), lock: Mutex::new(()), expired: AtomicBool::new(false) })
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    fn mark_expired(&self) {
        self.expired.store(true, Ordering::Release);
        crate::process::scheduler::notify_all(&self.waiters);
    }
}

/// `sys_poll`'s timeout callout callback. Reclaims the `Arc<Poller>`
/// leaked via `Arc::into_raw` when the callout was scheduled, flags the
/// poller expired, and lets the reclaimed `Arc` drop normally.
pub fn expire_callout(raw: usize) {
    let poller = unsafe { Arc::from_raw(raw as *const Poller) };
    poller.mark_expired();
}

/// Lives on a pollable resource (pipe, tty, socket). Tracks every
/// `Poller` currently blocked on this resource so a producer can wake
/// them all when readiness changes.
pub struct PollHead {
    pollers: Mutex<Vec<Weak<Poller>>>,
}

impl PollHead {
    pub const fn new() -> Self {
        Self { pollers: Mutex::new(Vec::new()) }
    }

    /// Registers `poller` with this resource. Idempotent enough for
    /// `sys_poll`'s usage pattern (one registration per fd per call).
    pub fn register(&self, poller: &Arc<Poller>) {
        self.pollers.lock().push(Arc::downgrade(poller));
    }

    /// Wakes every still-live registered poller and prunes dead ones.
    /// Called whenever this resource's readiness may have changed (data
    /// arrived, space freed, peer hung up).
    pub fn notify(&self) {
        let mut pollers = self.pollers.lock();
        pollers.retain(|weak| {
            if let Some(poller) = weak.upgrade() {
                crate::process::scheduler::notify_all(&poller.waiters);
                true
            } else {
                false
            }
        });
    }
}

impl Default for PollHead {
    fn default() -> Self {
        Self::new()
    }
}
