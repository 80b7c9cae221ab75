//! Per-CPU deadline callouts.
//!
//! A callout is a `{deadline, callback, arg}` triple run once, from the
//! timer ISR, on the CPU it was scheduled on -- used for things like
//! `setitimer` and blocking-syscall timeouts that need to fire even if
//! the thread that scheduled them is asleep. Each CPU keeps its list
//! sorted by deadline so the timer tick only has to look at the head.

use crate::lib::arena::{Arena, Handle};
use crate::smp::MAX_CPUS;
use alloc::vec::Vec;
use spin::Mutex;

pub type Tick = u64;

/// Opaque handle to a scheduled callout, returned by [`add`]/[`reschedule`]
/// for later use with [`cancel`]/[`reschedule`]. `Callout` itself stays
/// private to this module; callers only ever carry the handle around.
pub type CalloutHandle = Handle<Callout>;

struct Callout {
    deadline: Tick,
    callback: fn(usize),
    arg: usize,
}

struct CpuCallouts {
    entries: Arena<Callout>,
    /// Handles into `entries`, kept sorted ascending by deadline.
    order: Vec<Handle<Callout>>,
}

impl CpuCallouts {
    const fn new() -> Self {
        Self { entries: Arena::new(), order: Vec::new() }
    }
}

static CALLOUTS: [Mutex<CpuCallouts>; MAX_CPUS] = [const { Mutex::new(CpuCallouts::new()) }; MAX_CPUS];

static TICKS: [core::sync::atomic::AtomicU64; MAX_CPUS] =
    [const { core::sync::atomic::AtomicU64::new(0) }; MAX_CPUS];

fn now(cpu: usize) -> Tick {
    TICKS[cpu].load(core::sync::atomic::Ordering::Acquire)
}

/// Current tick count on `cpu`, for callers that need to stamp a
/// deadline (e.g. `setitimer`'s `ctime`) without scheduling anything.
pub fn ticks(cpu: usize) -> Tick {
    now(cpu)
}

/// Schedules `callback(arg)` to run on CPU `cpu` after `delay_ticks`
/// timer ticks. Returns a handle usable with [`cancel`] or [`reschedule`].
pub fn add(cpu: usize, delay_ticks: Tick, callback: fn(usize), arg: usize) -> Option<Handle<Callout>> {
    if cpu >= MAX_CPUS {
        return None;
    }
    let deadline = now(cpu) + delay_ticks;
    let mut list = CALLOUTS[cpu].lock();
    let handle = list.entries.insert(Callout { deadline, callback, arg });
    insert_sorted(&mut list.order, handle, deadline, &list.entries);
    Some(handle)
}

fn insert_sorted(order: &mut Vec<Handle<Callout>>, handle: Handle<Callout>, deadline: Tick, entries: &Arena<Callout>) {
    let pos = order
        .iter()
        .position(|h| entries.get(*h).map(|c| c.deadline).unwrap_or(Tick::MAX) > deadline)
        .unwrap_or(order.len());
    order.insert(pos, handle);
}

/// Cancels a pending callout. No-op if it already fired or was already cancelled.
pub fn cancel(cpu: usize, handle: Handle<Callout>) {
    if cpu >= MAX_CPUS {
        return;
    }
    let mut list = CALLOUTS[cpu].lock();
    if list.entries.remove(handle).is_some() {
        list.order.retain(|h| *h != handle);
    }
}

/// Cancels and re-adds a callout with a new delay relative to now.
pub fn reschedule(cpu: usize, handle: Handle<Callout>, delay_ticks: Tick) -> Option<Handle<Callout>> {
    let (callback, arg) = {
        let mut list = CALLOUTS[cpu].lock();
        let callout = list.entries.remove(handle)?;
        list.order.retain(|h| *h != handle);
        (callout.callback, callout.arg)
    };
    add(cpu, delay_ticks, callback, arg)
}

/// Advances CPU `cpu`'s tick count by one and runs every callout whose
/// deadline has passed. Called once per timer interrupt, before
/// preemption is considered.
pub fn run_expired(cpu: usize) {
    if cpu >= MAX_CPUS {
        return;
    }
    let tick = TICKS[cpu].fetch_add(1, core::sync::atomic::Ordering::AcqRel) + 1;

    loop {
        let due = {
            let mut list = CALLOUTS[cpu].lock();
            let Some(&head) = list.order.first() else { break };
            let Some(callout) = list.entries.get(head) else {
                list.order.remove(0);
                continue;
            };
            if callout.deadline > tick {
                break;
            }
            list.order.remove(0);
            let callout = list.entries.remove(head).expect("just looked up");
            (callout.callback, callout.arg)
        };
        due.0(due.1);
    }
}
