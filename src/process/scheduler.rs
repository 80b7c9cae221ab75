//! Per-CPU preemptive scheduler.
//!
//! One FIFO run queue per CPU, one idle thread per CPU. Threads move
//! between run queues only when `notify` wakes a sleeper onto the waking
//! CPU's queue -- there is no load-balancing pass and no migration of an
//! already-running thread. Each `Thread` is reached through a stable
//! [`Handle`], the arena-backed replacement for the intrusive queue
//! links a C kernel would thread through the struct itself.

use crate::arch::x86_64::percpu::CpuLocal;
use crate::arch::x86_64::{switch_to, CpuContext};
use crate::lib::arena::{Arena, Handle};
use crate::mm::mmu;
use crate::mm::page::PAGE_SIZE;
use crate::mm::pmm_cache;
use crate::smp::MAX_CPUS;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use spin::Mutex;
use x86_64::instructions::interrupts;

pub mod callout;

pub type Tid = u32;

const TIMESLICE_TICKS: u32 = 4;
const NONE_CPU: u64 = u64::MAX;

/// A schedulable unit of execution. Carries its own kernel stack and
/// saved register state; the process (and its address space) a thread
/// belongs to is looked up through `pid`, not embedded here, so the same
/// thread bookkeeping works whether or not the process model above it
/// has grown multiple threads per process.
pub struct Thread {
    pub tid: Tid,
    pub pid: super::Pid,
    is_idle: bool,
    context: UnsafeCell<CpuContext>,
    kernel_stack_top: u64,
    /// Physical address of this thread's address space root, 0 for
    /// kernel-only threads (idle) that never leave the kernel's own
    /// mappings.
    address_space_phys: AtomicU64,
    /// Mirrors the original's per-thread `sched_lock`: held by whichever
    /// CPU is currently moving this thread between "running" and
    /// "queued"/"sleeping", so a concurrent `notify` can't race a
    /// concurrent `yield`.
    sched_lock: Mutex<()>,
    runnable: AtomicBool,
    /// Address of the `WaitQueue` this thread is parked on, 0 if none.
    /// Debug-only bookkeeping, mirroring the original's `waiting_on`.
    waiting_on: AtomicU64,
    /// Which CPU currently owns this thread (running or head-of-queue),
    /// `NONE_CPU` while asleep.
    cpu: AtomicU64,
}

// The `UnsafeCell<CpuContext>` is only touched by the CPU currently
// running this thread, or by the CPU performing the switch into/out of
// it, both serialized by `sched_lock`.
unsafe impl Sync for Thread {}

impl Thread {
    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn is_runnable(&self) -> bool {
        self.runnable.load(Ordering::Acquire)
    }

    /// Records the page table root a future context switch into this
    /// thread should load. Does not itself touch `CR3` -- only the
    /// currently running thread may do that, via
    /// [`switch_current_address_space`].
    pub fn set_address_space(&self, phys: u64) {
        self.address_space_phys.store(phys, Ordering::Release);
    }
}

/// Installs a new address space for the calling thread, for `execve`:
/// updates the bookkeeping a future context switch back in would use
/// and loads `CR3` immediately, since the caller is running in the
/// address space being replaced right now.
pub fn switch_current_address_space(phys: u64) {
    interrupts::without_interrupts(|| {
        current_thread().set_address_space(phys);
        unsafe { mmu::switch_to_phys(phys) };
    });
}

static THREADS: Mutex<Arena<Arc<Thread>>> = Mutex::new(Arena::new());
static RUN_QUEUES: [Mutex<VecDeque<Handle<Thread>>>; MAX_CPUS] =
    [const { Mutex::new(VecDeque::new()) }; MAX_CPUS];
static CURRENT: [AtomicU64; MAX_CPUS] = [const { AtomicU64::new(NONE_CPU) }; MAX_CPUS];
static IDLE: [AtomicU64; MAX_CPUS] = [const { AtomicU64::new(NONE_CPU) }; MAX_CPUS];
static TIMESLICE_REMAINING: [AtomicU32; MAX_CPUS] =
    [const { AtomicU32::new(TIMESLICE_TICKS) }; MAX_CPUS];
static NEED_RESCHED: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];
static NEXT_TID: AtomicU32 = AtomicU32::new(1);

pub fn cpu_id() -> usize {
    CpuLocal::current().cpu_id as usize
}

fn current_handle(cpu: usize) -> Option<Handle<Thread>> {
    Handle::from_bits(CURRENT[cpu].load(Ordering::Acquire))
}

fn set_current_handle(cpu: usize, handle: Handle<Thread>) {
    CURRENT[cpu].store(handle.to_bits(), Ordering::Release);
}

fn get_thread(handle: Handle<Thread>) -> Option<Arc<Thread>> {
    THREADS.lock().get(handle).cloned()
}

fn handle_of(thread: &Arc<Thread>) -> Handle<Thread> {
    THREADS
        .lock()
        .iter()
        .find(|(_, t)| Arc::ptr_eq(t, thread))
        .map(|(h, _)| h)
        .expect("thread must be registered in the arena")
}

fn idle_handle(cpu: usize) -> Handle<Thread> {
    Handle::from_bits(IDLE[cpu].load(Ordering::Acquire)).expect("scheduler not initialized on this CPU")
}

/// Returns the thread currently running on this CPU.
pub fn current_thread() -> Arc<Thread> {
    let cpu = cpu_id();
    let handle = current_handle(cpu).expect("scheduler not initialized on this CPU");
    get_thread(handle).expect("current thread handle stale")
}

pub fn current_tid() -> Tid {
    current_thread().tid
}

fn alloc_kernel_stack() -> u64 {
    let phys = pmm_cache::alloc().expect("out of memory allocating a kernel stack");
    mmu::phys_to_virt(phys).as_u64() + PAGE_SIZE as u64
}

fn new_thread(pid: super::Pid, is_idle: bool, entry: u64, stack_top: u64, address_space_phys: u64) -> Arc<Thread> {
    let tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    let mut context = CpuContext::new();
    context.rip = entry;
    // The switch primitive `ret`s into `rip`; give it a dummy return
    // address slot so the very first switch behaves like any other.
    context.rsp = stack_top - 8;
    unsafe {
        (context.rsp as *mut u64).write(entry);
    }
    context.rflags = 0x202; // IF set, reserved bit 1 set
    Arc::new(Thread {
        tid,
        pid,
        is_idle,
        context: UnsafeCell::new(context),
        kernel_stack_top: stack_top,
        address_space_phys: AtomicU64::new(address_space_phys),
        sched_lock: Mutex::new(()),
        runnable: AtomicBool::new(!is_idle),
        waiting_on: AtomicU64::new(0),
        cpu: AtomicU64::new(NONE_CPU),
    })
}

/// Creates a new thread and places it on the calling CPU's run queue.
/// Returns the new thread's `Tid`.
pub fn spawn(pid: super::Pid, entry: u64, address_space_phys: u64) -> Tid {
    let stack_top = alloc_kernel_stack();
    let thread = new_thread(pid, false, entry, stack_top, address_space_phys);
    let tid = thread.tid;
    let handle = THREADS.lock().insert(thread);
    enqueue(cpu_id(), handle);
    tid
}

/// Looks up a live thread by `Tid`. `O(n)` over the arena; used only by
/// the handful of callers (signal delivery, thread exit) that only
/// have a `Tid` on hand, not a `Handle`.
fn handle_by_tid(tid: Tid) -> Option<Handle<Thread>> {
    THREADS.lock().iter().find(|(_, t)| t.tid == tid).map(|(h, _)| h)
}

pub fn thread_by_tid(tid: Tid) -> Option<Arc<Thread>> {
    get_thread(handle_by_tid(tid)?)
}

/// Removes a finished thread from the arena and its CPU's idle/current
/// slot bookkeeping. Must only be called on a thread that is no longer
/// referenced by any run queue (i.e. it has already yielded away for
/// the last time).
pub fn retire(tid: Tid) {
    if let Some(handle) = handle_by_tid(tid) {
        THREADS.lock().remove(handle);
    }
}

fn enqueue(cpu: usize, handle: Handle<Thread>) {
    RUN_QUEUES[cpu].lock().push_back(handle);
}

extern "C" fn idle_loop() -> ! {
    loop {
        interrupts::enable_and_hlt();
    }
}

/// Sets up this CPU's idle thread and current-thread pointer. Must run
/// once per CPU, with interrupts disabled, before the first timer tick
/// or `yield_now` on that CPU.
pub fn init_cpu() {
    let cpu = cpu_id();
    let stack_top = alloc_kernel_stack();
    let idle = new_thread(0, true, idle_loop as usize as u64, stack_top, 0);
    let handle = THREADS.lock().insert(idle);
    IDLE[cpu].store(handle.to_bits(), Ordering::Release);
    set_current_handle(cpu, handle);
    TIMESLICE_REMAINING[cpu].store(TIMESLICE_TICKS, Ordering::Release);
}

fn clear_need_resched(cpu: usize) {
    NEED_RESCHED[cpu].store(false, Ordering::Release);
}

pub fn need_resched() -> bool {
    NEED_RESCHED[cpu_id()].load(Ordering::Acquire)
}

/// Marks this CPU's currently running thread for preemption at the next
/// safe point. Called from the reschedule-IPI handler and from
/// `notify`/`notify_all` when they wake a thread onto this CPU.
pub fn request_resched() {
    NEED_RESCHED[cpu_id()].store(true, Ordering::Release);
}

/// Picks the next thread to run on this CPU and switches to it,
/// re-enqueuing the outgoing thread at the tail if it's still runnable.
pub fn yield_now() {
    interrupts::without_interrupts(|| {
        let cpu = cpu_id();
        let current = current_thread();
        let sched_guard = current.sched_lock.lock();

        let mut queue = RUN_QUEUES[cpu].lock();
        let next = match queue.pop_front() {
            Some(handle) => get_thread(handle).expect("runqueue handle stale"),
            None => {
                if current.is_runnable() && !current.is_idle {
                    drop(queue);
                    clear_need_resched(cpu);
                    return;
                }
                get_thread(idle_handle(cpu)).expect("idle thread handle stale")
            }
        };

        if current.is_runnable() && !current.is_idle {
            let outgoing = current_handle(cpu).expect("current thread always has a handle");
            queue.push_back(outgoing);
        }
        drop(queue);
        clear_need_resched(cpu);

        if Arc::ptr_eq(&current, &next) {
            TIMESLICE_REMAINING[cpu].store(TIMESLICE_TICKS, Ordering::Release);
            return;
        }

        let next_as = next.address_space_phys.load(Ordering::Acquire);
        let current_as = current.address_space_phys.load(Ordering::Acquire);
        if next_as != 0 && next_as != current_as {
            unsafe {
                mmu::switch_to_phys(next_as);
            }
        }

        let next_handle = handle_of(&next);
        current.cpu.store(NONE_CPU, Ordering::Release);
        next.cpu.store(cpu as u64, Ordering::Release);
        set_current_handle(cpu, next_handle);
        TIMESLICE_REMAINING[cpu].store(TIMESLICE_TICKS, Ordering::Release);

        let cpu_local = CpuLocal::current_mut();
        cpu_local.kernel_stack = next.kernel_stack_top;
        cpu_local.tss_rsp0 = next.kernel_stack_top;

        let prev_ctx = current.context.get();
        let next_ctx = next.context.get();

        // Release the outgoing thread's scheduler lock now, not when
        // this call eventually returns -- that return only happens once
        // this exact thread is switched back in, possibly long after
        // another CPU needed to `notify` it out of a wait queue. With
        // interrupts already disabled on this CPU, nothing can run
        // between the unlock and the register save `switch_to` performs
        // next.
        unsafe {
            sched_guard.force_unlock();
            switch_to(prev_ctx, next_ctx);
        }
    });
}

/// Alias kept for callers written against the teacher's naming.
pub fn schedule() {
    yield_now();
}

/// Timer ISR hook: runs expired callouts, then preempts the current
/// thread once its timeslice is exhausted.
pub fn timer_tick() {
    let cpu = cpu_id();
    callout::run_expired(cpu);

    let remaining = TIMESLICE_REMAINING[cpu].load(Ordering::Acquire);
    if remaining <= 1 {
        TIMESLICE_REMAINING[cpu].store(0, Ordering::Release);
        request_resched();
        yield_now();
    } else {
        TIMESLICE_REMAINING[cpu].store(remaining - 1, Ordering::Release);
    }
}

/// A FIFO list of threads parked on some condition. Analogous to the
/// original's `struct com_thread_tailq`, minus the intrusive links.
pub struct WaitQueue {
    waiters: Mutex<VecDeque<Handle<Thread>>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self { waiters: Mutex::new(VecDeque::new()) }
    }

    fn tag(&self) -> u64 {
        self as *const Self as u64
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Parks the calling thread on `waitlist`, releasing `guard`'s lock
/// first and reacquiring a guard on the same `lock` once woken. Mirrors
/// `com_sys_sched_wait`: the handoff from "about to sleep" to "asleep"
/// is atomic with respect to a concurrent `notify` because both paths
/// take the sleeping thread's own scheduler lock.
pub fn wait<'a, T>(waitlist: &WaitQueue, lock: &'a Mutex<T>, guard: spin::MutexGuard<'a, T>) -> spin::MutexGuard<'a, T> {
    interrupts::without_interrupts(|| {
        let cpu = cpu_id();
        let current = current_thread();
        let current_handle = current_handle(cpu).expect("current thread always has a handle");
        let self_guard = current.sched_lock.lock();

        current.cpu.store(NONE_CPU, Ordering::Release);
        current.runnable.store(false, Ordering::Release);
        current.waiting_on.store(waitlist.tag(), Ordering::Release);
        waitlist.waiters.lock().push_back(current_handle);

        drop(self_guard);
        drop(guard);
    });

    yield_now();
    lock.lock()
}

/// Wakes the thread at the head of `waitlist`, if any, onto this CPU's
/// run queue, then requests a reschedule in case it should preempt the
/// thread now running here. Returns whether a thread was actually woken.
pub fn notify(waitlist: &WaitQueue) -> bool {
    let woke = interrupts::without_interrupts(|| {
        let cpu = cpu_id();
        let current = current_thread();
        let _self_guard = current.sched_lock.lock();

        let Some(handle) = waitlist.waiters.lock().pop_front() else {
            return false;
        };
        let Some(next) = get_thread(handle) else {
            return false;
        };

        let next_guard = next.sched_lock.lock();
        debug_assert_eq!(next.cpu.load(Ordering::Acquire), NONE_CPU, "woken thread already owned by a CPU");
        next.waiting_on.store(0, Ordering::Release);
        next.cpu.store(cpu as u64, Ordering::Release);
        RUN_QUEUES[cpu].lock().push_front(handle);
        next.runnable.store(true, Ordering::Release);
        drop(next_guard);
        true
    });

    if woke {
        request_resched();
        crate::smp::ipi::send_ipi(cpu_id(), crate::smp::ipi::IpiType::Reschedule);
    }
    woke
}

/// Marks the calling thread dead and switches away from it for the
/// last time. Never returns: `yield_now`'s "current is runnable" check
/// is what keeps a thread on the run queue, so clearing `runnable`
/// first means it is simply dropped instead of requeued once
/// `handle_of` hands it off. The arena slot is reclaimed by whichever
/// caller reaps this thread's exit status (see `process::wait`).
pub fn exit_current() -> ! {
    interrupts::without_interrupts(|| {
        current_thread().runnable.store(false, Ordering::Release);
    });
    loop {
        yield_now();
    }
}

/// Wakes every thread currently parked on `waitlist`. Returns how many
/// were woken.
pub fn notify_all(waitlist: &WaitQueue) -> usize {
    let mut count = 0;
    loop {
        if waitlist.waiters.lock().is_empty() {
            break;
        }
        if notify(waitlist) {
            count += 1;
        }
    }
    count
}

/// Wakes up to `max` threads parked on `waitlist`. Returns how many
/// were actually woken.
pub fn notify_n(waitlist: &WaitQueue, max: usize) -> usize {
    let mut count = 0;
    while count < max {
        if waitlist.waiters.lock().is_empty() {
            break;
        }
        if notify(waitlist) {
            count += 1;
        } else {
            break;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_cpu_sentinel_decodes_to_no_handle() {
        assert_eq!(Handle::<Thread>::from_bits(NONE_CPU), None);
    }
}
