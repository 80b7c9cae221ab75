//! Per-CPU cache of free physical frames.
//!
//! Batches calls into the global PMM so that the common single-page
//! alloc/free path on a busy CPU rarely takes the PMM's global lock. Each
//! cache holds a LIFO chain of runs ("pools"); the head of each run
//! doubles as its own bookkeeping node (`next`, remaining `len`), stored
//! in the first few bytes of the page itself via its HHDM address.

use crate::mm::page::{PhysAddr, PAGE_SIZE};
use crate::mm::pmm;
use crate::smp::MAX_CPUS;
use core::mem::size_of;
use spin::Mutex;

/// Number of pages a cache refills itself with when it runs dry.
const REFILL_PAGES: usize = 16;
/// Cache never holds more than this many pages; excess on free goes
/// straight back to the global PMM.
const MAX_CACHED_PAGES: usize = 64;

#[repr(C)]
struct PoolNode {
    next: Option<PhysAddr>,
    len: usize,
}

const _: () = assert!(size_of::<PoolNode>() <= PAGE_SIZE);

struct PmmCache {
    pool: Option<PhysAddr>,
    avail_pages: usize,
}

impl PmmCache {
    const fn new() -> Self {
        Self { pool: None, avail_pages: 0 }
    }
}

static CACHES: [Mutex<PmmCache>; MAX_CPUS] = [const { Mutex::new(PmmCache::new()) }; MAX_CPUS];

#[inline]
fn phys_to_hhdm(pa: PhysAddr) -> *mut PoolNode {
    (pa + pmm::PHYS_MEM_OFFSET) as *mut PoolNode
}

fn read_node(pa: PhysAddr) -> PoolNode {
    unsafe { phys_to_hhdm(pa).read() }
}

fn write_node(pa: PhysAddr, node: &PoolNode) {
    unsafe { phys_to_hhdm(pa).write(PoolNode { next: node.next, len: node.len }) }
}

fn current_cpu_id() -> usize {
    crate::arch::x86_64::percpu::CpuLocal::current().cpu_id as usize
}

fn refill(cache: &mut PmmCache) -> bool {
    match pmm::alloc_many(REFILL_PAGES) {
        Ok(base) => {
            write_node(base, &PoolNode { next: cache.pool, len: REFILL_PAGES });
            cache.pool = Some(base);
            cache.avail_pages += REFILL_PAGES;
            true
        }
        Err(_) => false,
    }
}

/// Allocates a single physical frame, refilling from the global PMM on
/// an empty cache.
pub fn alloc() -> Result<PhysAddr, crate::lib::error::KernelError> {
    let id = current_cpu_id();
    let mut cache = CACHES[id].lock();

    if cache.pool.is_none() && !refill(&mut cache) {
        return Err(crate::lib::error::KernelError::OutOfMemory);
    }

    let head = cache.pool.expect("cache pool populated by refill");
    let mut node = read_node(head);
    cache.avail_pages -= 1;
    node.len -= 1;

    if node.len == 0 {
        cache.pool = node.next;
    } else {
        let next_addr = head + PAGE_SIZE as u64;
        write_node(next_addr, &PoolNode { next: node.next, len: node.len });
        cache.pool = Some(next_addr);
    }

    Ok(head)
}

/// Returns a single physical frame to this CPU's cache, spilling to the
/// global PMM once the cache is saturated.
pub fn free(phys: PhysAddr) {
    let id = current_cpu_id();
    let mut cache = CACHES[id].lock();

    if cache.avail_pages >= MAX_CACHED_PAGES {
        drop(cache);
        pmm::free(phys);
        return;
    }

    write_node(phys, &PoolNode { next: cache.pool, len: 1 });
    cache.pool = Some(phys);
    cache.avail_pages += 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_node_fits_in_a_page() {
        assert!(size_of::<PoolNode>() <= PAGE_SIZE);
    }
}
