//! Futex: fast userspace mutex primitives.
//!
//! Mirrors `com_sys_syscall_futex`: waiters are keyed on the *physical*
//! page backing the futex word, not its virtual address, so two
//! processes mapping the same page `MAP_SHARED` wait on the same
//! bucket. `FUTEX_WAIT` is a compare-and-block: the value check and
//! the enqueue happen under the same lock so a concurrent `FUTEX_WAKE`
//! can't be missed between the compare and the sleep.

use crate::lib::error::{Errno, Result};
use crate::process::scheduler::{self, WaitQueue};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

pub const FUTEX_WAIT: u32 = 0;
pub const FUTEX_WAKE: u32 = 1;

const WAKE_ALL: u32 = i32::MAX as u32;

struct FutexBucket {
    waiters: WaitQueue,
    lock: Mutex<()>,
}

impl FutexBucket {
    fn new() -> Arc<Self> {
        Arc::new(Self { waiters: WaitQueue::new(), lock: Mutex::new(()) })
    }
}

static FUTEX_TABLE: Mutex<BTreeMap<u64, Arc<FutexBucket>>> = Mutex::new(BTreeMap::new());

fn bucket_for(phys: u64) -> Arc<FutexBucket> {
    let mut table = FUTEX_TABLE.lock();
    table.entry(phys).or_insert_with(FutexBucket::new).clone()
}

fn lookup_bucket(phys: u64) -> Option<Arc<FutexBucket>> {
    FUTEX_TABLE.lock().get(&phys).cloned()
}

fn resolve_phys(word_ptr: u64) -> Result<u64> {
    let task = crate::process::current_task().ok_or(Errno::ESRCH)?;
    crate::mm::vmm::get_physical(&task.vmm(), word_ptr).ok_or(Errno::EFAULT)
}

/// `FUTEX_WAIT(word_ptr, expected)`: blocks while `*word_ptr == expected`.
/// Returns `Ok(0)` once woken by a matching `FUTEX_WAKE`, `EAGAIN` if the
/// value had already changed, or `EINTR` if a signal was delivered while
/// parked.
pub fn futex_wait(word_ptr: u64, expected: u32) -> Result<isize> {
    if word_ptr == 0 || word_ptr as usize % 4 != 0 {
        return Err(Errno::EINVAL);
    }
    crate::syscall::uaccess::validate_user_read(word_ptr as *const u8, 4)?;

    let phys = resolve_phys(word_ptr)?;
    let bucket = bucket_for(phys);
    let word = word_ptr as *const AtomicU32;

    let guard = bucket.lock.lock();
    if unsafe { (*word).load(Ordering::SeqCst) } != expected {
        return Err(Errno::EAGAIN);
    }
    drop(scheduler::wait(&bucket.waiters, &bucket.lock, guard));

    let task = crate::process::current_task().ok_or(Errno::ESRCH)?;
    if task.signals.next_deliverable().is_some() {
        return Err(Errno::EINTR);
    }
    Ok(0)
}

/// `FUTEX_WAKE(word_ptr, n)`: wakes up to `n` waiters blocked on the same
/// physical word (`n == INT_MAX` wakes all of them). Returns the number
/// actually woken, or `0` if no thread has ever waited on this address.
pub fn futex_wake(word_ptr: u64, n: u32) -> Result<isize> {
    if word_ptr == 0 {
        return Err(Errno::EINVAL);
    }
    let phys = resolve_phys(word_ptr)?;
    let Some(bucket) = lookup_bucket(phys) else {
        return Ok(0);
    };

    let woken = if n >= WAKE_ALL {
        scheduler::notify_all(&bucket.waiters)
    } else {
        scheduler::notify_n(&bucket.waiters, n as usize)
    };
    Ok(woken as isize)
}

pub fn sys_futex(word_ptr: u64, op: u32, val: u32) -> Result<isize> {
    match op {
        FUTEX_WAIT => futex_wait(word_ptr, val),
        FUTEX_WAKE => futex_wake(word_ptr, val),
        _ => Err(Errno::ENOSYS),
    }
}
