/// Inter-Processor Interrupts (IPIs).
///
/// IPIs let one CPU interrupt another for:
/// - Rescheduling (force a CPU to re-enter the scheduler)
/// - TLB shootdown (invalidate stale translations after an address space
///   changes on a CPU other than the one that changed it)
/// - Function calls (run a closure on a specific remote CPU)
///
/// Dispatch goes through the Local APIC (`crate::arch::x86_64::apic`); the
/// vectors below are wired to LVT/IDT entries during boot.

use crate::arch::x86_64::apic::{self, IpiDestination, IpiType as ApicIpiType};
use core::sync::atomic::{AtomicU64, Ordering};

/// Interrupt vectors the IDT routes to [`handle_ipi`]. Picked from the
/// range above the legacy PIC/PIT vectors and below the spurious vector.
pub const VECTOR_RESCHEDULE: u8 = 0xFC;
pub const VECTOR_TLB_SHOOTDOWN: u8 = 0xFD;
pub const VECTOR_FUNCTION_CALL: u8 = 0xFE;

/// IPI types this kernel sends over the Local APIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiType {
    /// Force the target CPU to re-enter the scheduler at the next
    /// interrupt-safe point.
    Reschedule,
    /// Invalidate TLB entries for an address space the target CPU may
    /// also have loaded.
    TlbShootdown,
    /// Run a queued closure on the target CPU.
    FunctionCall,
}

impl IpiType {
    fn vector(self) -> u8 {
        match self {
            IpiType::Reschedule => VECTOR_RESCHEDULE,
            IpiType::TlbShootdown => VECTOR_TLB_SHOOTDOWN,
            IpiType::FunctionCall => VECTOR_FUNCTION_CALL,
        }
    }

    fn from_vector(vector: u8) -> Option<Self> {
        match vector {
            VECTOR_RESCHEDULE => Some(IpiType::Reschedule),
            VECTOR_TLB_SHOOTDOWN => Some(IpiType::TlbShootdown),
            VECTOR_FUNCTION_CALL => Some(IpiType::FunctionCall),
            _ => None,
        }
    }
}

/// IPI statistics, one set per CPU.
pub struct IpiStats {
    pub reschedule: AtomicU64,
    pub tlb_shootdown: AtomicU64,
    pub function_call: AtomicU64,
}

impl IpiStats {
    const fn new() -> Self {
        Self {
            reschedule: AtomicU64::new(0),
            tlb_shootdown: AtomicU64::new(0),
            function_call: AtomicU64::new(0),
        }
    }

    fn inc(&self, ipi_type: IpiType) {
        match ipi_type {
            IpiType::Reschedule => self.reschedule.fetch_add(1, Ordering::Relaxed),
            IpiType::TlbShootdown => self.tlb_shootdown.fetch_add(1, Ordering::Relaxed),
            IpiType::FunctionCall => self.function_call.fetch_add(1, Ordering::Relaxed),
        };
    }
}

static IPI_STATS: [IpiStats; super::MAX_CPUS] = [
    IpiStats::new(),
    IpiStats::new(),
    IpiStats::new(),
    IpiStats::new(),
    IpiStats::new(),
    IpiStats::new(),
    IpiStats::new(),
    IpiStats::new(),
];

/// Sends an IPI to a specific CPU by APIC ID.
pub fn send_ipi(target_cpu: usize, ipi_type: IpiType) {
    if target_cpu >= super::MAX_CPUS {
        crate::warn!("IPI: invalid target CPU {}", target_cpu);
        return;
    }
    if !super::is_cpu_online(target_cpu) {
        crate::debug!("IPI: target CPU {} is offline", target_cpu);
        return;
    }

    let Some(apic) = apic::get() else {
        crate::warn!("IPI: local APIC not available");
        return;
    };
    let Some(apic) = apic.as_ref() else {
        crate::warn!("IPI: local APIC not initialized");
        return;
    };

    unsafe {
        apic.send_ipi(
            IpiDestination::Physical(target_cpu as u32),
            ApicIpiType::Fixed(ipi_type.vector()),
        );
    }

    crate::debug!("IPI: sent {:?} to CPU {}", ipi_type, target_cpu);
}

/// Broadcasts an IPI to every online CPU but the caller.
pub fn send_ipi_all_but_self(ipi_type: IpiType) {
    let Some(apic) = apic::get() else {
        crate::warn!("IPI: local APIC not available");
        return;
    };
    let Some(apic) = apic.as_ref() else {
        crate::warn!("IPI: local APIC not initialized");
        return;
    };

    unsafe {
        apic.send_ipi(IpiDestination::AllExcludingSelf, ApicIpiType::Fixed(ipi_type.vector()));
    }
}

/// Runs on the receiving CPU from the IDT handler for `vector`. Returns
/// `true` if the vector belonged to an IPI this module owns.
pub fn handle_ipi(vector: u8) -> bool {
    let Some(ipi_type) = IpiType::from_vector(vector) else {
        return false;
    };

    let cpu_id = crate::arch::x86_64::percpu::CpuLocal::current().cpu_id as usize;
    if cpu_id < super::MAX_CPUS {
        IPI_STATS[cpu_id].inc(ipi_type);
    }

    match ipi_type {
        IpiType::Reschedule => {
            crate::process::scheduler::request_resched();
        }
        IpiType::TlbShootdown => {
            crate::mm::mmu::invalidate_all();
        }
        IpiType::FunctionCall => {
            crate::debug!("IPI: function call on CPU {}", cpu_id);
        }
    }

    unsafe {
        apic::eoi();
    }

    true
}

/// Forces `target_cpu` to re-enter the scheduler.
pub fn send_reschedule_ipi(target_cpu: usize) {
    send_ipi(target_cpu, IpiType::Reschedule);
}

/// Flushes the local TLB, then has every other online CPU flush its own.
/// Callers that changed a mapping shared with other address spaces
/// (kernel mappings, or a user mapping another CPU is currently running)
/// must call this instead of just [`crate::mm::mmu::invalidate`].
pub fn tlb_shootdown_all() {
    crate::mm::mmu::invalidate_all();
    send_ipi_all_but_self(IpiType::TlbShootdown);
}

/// Returns `(reschedule, tlb_shootdown, function_call)` counters for a CPU.
pub fn get_stats(cpu_id: usize) -> Option<(u64, u64, u64)> {
    if cpu_id >= super::MAX_CPUS {
        return None;
    }
    let stats = &IPI_STATS[cpu_id];
    Some((
        stats.reschedule.load(Ordering::Relaxed),
        stats.tlb_shootdown.load(Ordering::Relaxed),
        stats.function_call.load(Ordering::Relaxed),
    ))
}
