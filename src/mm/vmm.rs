//! Virtual memory contexts: the process-facing layer on top of
//! [`mmu::AddressSpace`].
//!
//! A [`VmmContext`] owns one address space and a bump cursor for
//! anonymous mappings that don't care where they land. Tearing one down
//! touches every user leaf frame in the address space, which can be a
//! lot of work to do synchronously on `exit()` -- so `destroy_context`
//! only queues the context; a dedicated reaper thread drains the queue
//! and does the actual freeing off the exiting thread's critical path.

use crate::lib::error::{Errno, KernelError};
use crate::mm::mmu::{self, AddressSpace, VirtAddr};
use crate::mm::page::PAGE_SIZE;
use crate::mm::{pmm, pmm_cache};
use crate::process::scheduler::WaitQueue;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use bitflags::bitflags;
use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;

bitflags! {
    /// Mirrors the original's `COM_MM_VMM_FLAGS_*`: how a mapping's
    /// virtual address and backing frame should be chosen.
    pub struct MapFlags: u32 {
        /// Caller supplied no virtual address hint; pick one.
        const NOHINT    = 1 << 0;
        /// Back the mapping with freshly zeroed, demand-allocated pages
        /// rather than the frame passed to `map`.
        const ALLOCATE  = 1 << 1;
        /// Changes are visible to other mappers of the same frames
        /// (never marked CoW).
        const SHARED    = 1 << 2;
        /// Changes are private to this address space (CoW-eligible).
        const PRIVATE   = 1 << 3;
        /// With `NOHINT`: place the mapping in the anonymous region
        /// rather than at the physical-to-virtual identity offset.
        const ANONYMOUS = 1 << 4;
        /// With `NOHINT` and not `ANONYMOUS`: place the mapping at the
        /// direct physical-memory-map alias of the backing frame.
        const PHYSICAL  = 1 << 5;
    }
}

/// Why [`handle_fault`] was called, matching the original's
/// `COM_MM_VMM_FAULT_ATTR_*` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A write hit a page marked copy-on-write.
    Cow,
    /// A read or write hit an unmapped page inside a range that was
    /// pre-reserved (by `prealloc_range` or a CONT_PRIVATE ALLOCATE
    /// mapping) but never backed by a real frame.
    DemandZero,
    /// Neither of the above: a genuine access violation.
    Violation,
}

const ANON_START: u64 = 0x0000_7000_0000_0000;

/// A process's address space plus the VMM-level bookkeeping the raw
/// page tables don't carry: where the next no-hint anonymous mapping
/// goes, and the lock serializing that cursor.
pub struct VmmContext {
    inner: Mutex<ContextInner>,
}

struct ContextInner {
    address_space: AddressSpace,
    /// Next unused page index in the anonymous region, in pages.
    anon_pages: u64,
}

static ROOT_CONTEXT: Mutex<Option<Arc<VmmContext>>> = Mutex::new(None);
static ZERO_PAGE: Mutex<Option<u64>> = Mutex::new(None);

static ZOMBIE_QUEUE: Mutex<VecDeque<Arc<VmmContext>>> = Mutex::new(VecDeque::new());
static REAPER_WAITLIST: WaitQueue = WaitQueue::new();

/// Max number of zombie contexts the reaper destroys per wakeup before
/// yielding the CPU back, so a storm of exiting processes can't starve
/// everything else.
const REAPER_MAX_PER_PASS: usize = 32;

impl VmmContext {
    /// Physical address of this context's top-level page table -- what
    /// a thread running in it needs loaded into `CR3`.
    pub fn phys(&self) -> u64 {
        self.inner.lock().address_space.phys()
    }
}

fn root_context() -> Arc<VmmContext> {
    ROOT_CONTEXT.lock().as_ref().expect("vmm::init not called").clone()
}

/// Sets up the kernel's own (root) context and the shared zero page.
/// Must run once, early in boot, before any `new_context`/`map` call.
pub fn init() {
    crate::info!("vmm: initializing");
    let root = VmmContext {
        inner: Mutex::new(ContextInner { address_space: AddressSpace::current(), anon_pages: 0 }),
    };
    *ROOT_CONTEXT.lock() = Some(Arc::new(root));

    let zero_phys = pmm_cache::alloc().expect("out of memory allocating the zero page");
    let zero_virt = mmu::phys_to_virt(zero_phys);
    unsafe {
        core::ptr::write_bytes(zero_virt.as_u64() as *mut u8, 0, PAGE_SIZE);
    }
    *ZERO_PAGE.lock() = Some(zero_phys);
}

/// Spawns the reaper thread that drains [`destroy_context`]'s queue.
/// Call once, after the scheduler is up, from the boot CPU.
pub fn init_reaper() {
    crate::info!("vmm: initializing reaper");
    let pml4 = root_context().inner.lock().address_space.phys();
    crate::process::scheduler::spawn(0, reaper_thread as usize as u64, pml4);
}

extern "C" fn reaper_thread() -> ! {
    loop {
        let mut guard = REAPER_WAITLIST_LOCK.lock();
        if ZOMBIE_QUEUE.lock().is_empty() {
            guard = crate::process::scheduler::wait(&REAPER_WAITLIST, &REAPER_WAITLIST_LOCK, guard);
        }

        let mut local: VecDeque<Arc<VmmContext>> = VecDeque::new();
        {
            let mut queue = ZOMBIE_QUEUE.lock();
            for _ in 0..REAPER_MAX_PER_PASS {
                let Some(context) = queue.pop_front() else { break };
                local.push_back(context);
            }
        }
        drop(guard);

        for context in local {
            destroy_context_now(context);
        }
    }
}

/// Dedicated lock used purely as the reaper's condvar companion to
/// [`REAPER_WAITLIST`]; the actual queue is [`ZOMBIE_QUEUE`].
static REAPER_WAITLIST_LOCK: Mutex<()> = Mutex::new(());

/// Creates a new context. `None` gets a fresh address space inheriting
/// the kernel's upper half; `Some` adopts an already-built one (used by
/// [`duplicate_context`]).
pub fn new_context(address_space: Option<AddressSpace>) -> Result<Arc<VmmContext>, KernelError> {
    let address_space = match address_space {
        Some(existing) => existing,
        None => {
            let root = root_context();
            let guard = root.inner.lock();
            AddressSpace::new(&guard.address_space)?
        }
    };
    Ok(Arc::new(VmmContext { inner: Mutex::new(ContextInner { address_space, anon_pages: 0 }) }))
}

/// Queues `context` for asynchronous teardown by the reaper thread.
/// Must not be called with `context` as the caller's own current
/// address space, nor with the root context.
pub fn destroy_context(context: Arc<VmmContext>) {
    let mut queue = ZOMBIE_QUEUE.lock();
    queue.push_back(context);
    if queue.len() >= 1 {
        crate::process::scheduler::notify(&REAPER_WAITLIST);
    }
}

fn destroy_context_now(context: Arc<VmmContext>) {
    let context = Arc::into_inner(context).unwrap_or_else(|| {
        panic!("vmm: context destroyed while still referenced");
    });
    context.inner.into_inner().address_space.destroy();
}

/// Duplicates `context`'s address space (full CoW fork semantics: user
/// mappings are shared read-only and refcounted, not copied) and its
/// anonymous-region cursor.
pub fn duplicate_context(context: &Arc<VmmContext>) -> Result<Arc<VmmContext>, KernelError> {
    let mut src = context.inner.lock();
    let root = root_context();
    let mut new_as = AddressSpace::new(&root.inner.lock().address_space)?;
    src.address_space.duplicate_into(&mut new_as)?;
    Ok(Arc::new(VmmContext {
        inner: Mutex::new(ContextInner { address_space: new_as, anon_pages: src.anon_pages }),
    }))
}

fn flags_for(vmm_flags: MapFlags, mut mmu_flags: PageTableFlags) -> PageTableFlags {
    if vmm_flags.contains(MapFlags::PRIVATE) && mmu_flags.contains(PageTableFlags::WRITABLE) {
        mmu_flags.remove(PageTableFlags::WRITABLE);
        mmu_flags.insert(mmu::COW_BIT);
    }
    mmu_flags
}

/// Maps `len` bytes (rounded up to whole pages) of `phys` at `virt` (or,
/// with [`MapFlags::NOHINT`], at a VMM-chosen address), returning the
/// actual mapped virtual address (including any sub-page offset `phys`
/// had, matching the original's pointer-arithmetic return value).
pub fn map(
    context: &Arc<VmmContext>,
    virt: u64,
    phys: u64,
    len: usize,
    vmm_flags: MapFlags,
    mmu_flags: PageTableFlags,
) -> Result<u64, KernelError> {
    let allocate = vmm_flags.contains(MapFlags::ALLOCATE);
    let phys = if allocate { 0 } else { phys };

    let page_phys_base = phys & !(PAGE_SIZE as u64 - 1);
    let page_off = phys % PAGE_SIZE as u64;
    let size_in_pages = ((page_off as usize + len) + PAGE_SIZE - 1) / PAGE_SIZE;

    let mmu_flags = flags_for(vmm_flags, mmu_flags);

    let mut inner = context.inner.lock();

    let virt_base = if vmm_flags.contains(MapFlags::NOHINT) {
        if vmm_flags.contains(MapFlags::ANONYMOUS) {
            let base = inner.anon_pages * PAGE_SIZE as u64 + ANON_START;
            inner.anon_pages += size_in_pages as u64;
            base
        } else if vmm_flags.contains(MapFlags::PHYSICAL) {
            mmu::phys_to_virt(page_phys_base).as_u64()
        } else {
            return Err(KernelError::InvalidArgument);
        }
    } else {
        virt & !(PAGE_SIZE as u64 - 1)
    };

    for i in 0..size_in_pages {
        let offset = (i * PAGE_SIZE) as u64;
        let page_virt = VirtAddr::new(virt_base + offset);
        let page_phys = if allocate {
            let zero = zero_page();
            pmm::frame_get(zero);
            zero
        } else {
            page_phys_base + offset
        };
        inner.address_space.map(page_virt, page_phys, mmu_flags)?;
    }

    Ok(virt_base + page_off)
}

fn zero_page() -> u64 {
    ZERO_PAGE.lock().expect("vmm::init not called")
}

/// Unmaps `len` bytes (rounded up) starting at `virt`, returning owned
/// frames to the PMM.
pub fn unmap(context: &Arc<VmmContext>, virt: u64, len: usize) {
    let page_off = virt % PAGE_SIZE as u64;
    let size_in_pages = ((page_off as usize + len) + PAGE_SIZE - 1) / PAGE_SIZE;
    let virt_base = virt & !(PAGE_SIZE as u64 - 1);

    let mut inner = context.inner.lock();
    for i in 0..size_in_pages {
        let offset = (i * PAGE_SIZE) as u64;
        let page_virt = VirtAddr::new(virt_base + offset);
        if let Some(phys) = inner.address_space.unmap(page_virt) {
            pmm::frame_put(phys);
        }
    }
}

/// Reserves `len` bytes (rounded up) of the anonymous region without
/// backing them with any frame yet; the first access demand-zero-faults
/// each page in. Used for lazily-grown stacks and heaps.
pub fn prealloc_range(context: &Arc<VmmContext>, len: usize) -> u64 {
    let size_in_pages = (len + PAGE_SIZE - 1) / PAGE_SIZE;
    let mut inner = context.inner.lock();
    let base = inner.anon_pages * PAGE_SIZE as u64 + ANON_START;
    inner.anon_pages += size_in_pages as u64;
    base
}

pub fn get_physical(context: &Arc<VmmContext>, virt: u64) -> Option<u64> {
    context.inner.lock().address_space.get_physical(VirtAddr::new(virt))
}

/// Loads `context`'s address space into CR3. `None` switches to the
/// kernel's own root context.
///
/// # Safety
/// Same obligations as [`AddressSpace::switch`].
pub unsafe fn switch(context: Option<&Arc<VmmContext>>) {
    let context = match context {
        Some(c) => c.clone(),
        None => root_context(),
    };
    context.inner.lock().address_space.switch();
}

/// Services a page fault at `fault_virt`/`fault_phys` (the frame that
/// was mapped there before the fault, if any) in the current process's
/// context. `mmu_flags_hint` is reapplied to the new mapping on a
/// CoW/demand-zero resolution. Returns `Ok(())` if the fault was
/// resolved; `Err` means the caller should deliver `SIGSEGV` (user) or
/// panic (kernel).
pub fn handle_fault(
    context: &Arc<VmmContext>,
    fault_virt: u64,
    fault_phys: Option<u64>,
    kind: FaultKind,
    mmu_flags_hint: PageTableFlags,
) -> Result<(), Errno> {
    let page_virt = VirtAddr::new(fault_virt & !(PAGE_SIZE as u64 - 1));

    match kind {
        FaultKind::Cow => {
            let old_phys = fault_phys.ok_or(Errno::EFAULT)?;
            let old_phys_page = old_phys & !(PAGE_SIZE as u64 - 1);
            let new_phys = pmm_cache::alloc().map_err(|_| Errno::ENOMEM)?;

            let old_virt = mmu::phys_to_virt(old_phys_page);
            let new_virt = mmu::phys_to_virt(new_phys);
            unsafe {
                core::ptr::copy_nonoverlapping(old_virt.as_u64() as *const u8, new_virt.as_u64() as *mut u8, PAGE_SIZE);
            }

            let mut inner = context.inner.lock();
            inner.address_space.remap(page_virt, new_phys, mmu_flags_hint);
            drop(inner);
            crate::smp::ipi::tlb_shootdown_all();
            pmm::frame_put(old_phys_page);
            Ok(())
        }
        FaultKind::DemandZero => {
            let new_phys = pmm_cache::alloc().map_err(|_| Errno::ENOMEM)?;
            let new_virt = mmu::phys_to_virt(new_phys);
            unsafe {
                core::ptr::write_bytes(new_virt.as_u64() as *mut u8, 0, PAGE_SIZE);
            }

            let mut inner = context.inner.lock();
            inner.address_space.map(page_virt, new_phys, mmu_flags_hint).map_err(|_| Errno::ENOMEM)?;
            Ok(())
        }
        FaultKind::Violation => Err(Errno::EFAULT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_flags_private_strips_writable_and_sets_cow() {
        let flags = flags_for(MapFlags::PRIVATE, PageTableFlags::PRESENT | PageTableFlags::WRITABLE);
        assert!(!flags.contains(PageTableFlags::WRITABLE));
        assert!(flags.contains(mmu::COW_BIT));
    }

    #[test]
    fn map_flags_shared_keeps_writable() {
        let flags = flags_for(MapFlags::SHARED, PageTableFlags::PRESENT | PageTableFlags::WRITABLE);
        assert!(flags.contains(PageTableFlags::WRITABLE));
    }
}
