//! POSIX signal mask, pending set, and dispatch.
//!
//! Delivery follows the original kernel's shape: a pending signal is
//! checked whenever a thread is about to return to user mode, default
//! actions (`kill`/`stop`/`ignore`) are looked up in a fixed table, and
//! anything else gets a sigframe pushed onto the user stack via the
//! per-arch trampoline trait below.

use crate::lib::error::Errno;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

pub const NSIG: usize = 64;

pub const SIGHUP: u8 = 1;
pub const SIGINT: u8 = 2;
pub const SIGQUIT: u8 = 3;
pub const SIGILL: u8 = 4;
pub const SIGTRAP: u8 = 5;
pub const SIGABRT: u8 = 6;
pub const SIGBUS: u8 = 7;
pub const SIGFPE: u8 = 8;
pub const SIGKILL: u8 = 9;
pub const SIGUSR1: u8 = 10;
pub const SIGSEGV: u8 = 11;
pub const SIGUSR2: u8 = 12;
pub const SIGPIPE: u8 = 13;
pub const SIGALRM: u8 = 14;
pub const SIGTERM: u8 = 15;
pub const SIGCHLD: u8 = 17;
pub const SIGCONT: u8 = 18;
pub const SIGSTOP: u8 = 19;
pub const SIGTSTP: u8 = 20;
pub const SIGTTIN: u8 = 21;
pub const SIGTTOU: u8 = 22;
pub const SIGWINCH: u8 = 28;

bitflags::bitflags! {
    struct Disposition: u8 {
        const KILL     = 0x01;
        const CORE     = 0x02;
        const STOP     = 0x04;
        const TTYSTOP  = 0x08;
        const IGNORE   = 0x10;
        const CONT     = 0x20;
        const CANTMASK = 0x40;
    }
}

/// Default disposition per signal number, CREDIT: OpenBSD / the kernel
/// this is ported from. Index 0 is unused (`0` is "no signal").
const PROPERTIES: [Disposition; NSIG] = {
    let mut table = [Disposition::empty(); NSIG];
    table[SIGHUP as usize] = Disposition::KILL;
    table[SIGINT as usize] = Disposition::KILL;
    table[SIGQUIT as usize] = Disposition::from_bits_truncate(Disposition::KILL.bits() | Disposition::CORE.bits());
    table[SIGILL as usize] = Disposition::from_bits_truncate(Disposition::KILL.bits() | Disposition::CORE.bits());
    table[SIGTRAP as usize] = Disposition::from_bits_truncate(Disposition::KILL.bits() | Disposition::CORE.bits());
    table[SIGABRT as usize] = Disposition::from_bits_truncate(Disposition::KILL.bits() | Disposition::CORE.bits());
    table[SIGFPE as usize] = Disposition::from_bits_truncate(Disposition::KILL.bits() | Disposition::CORE.bits());
    table[SIGKILL as usize] = Disposition::KILL;
    table[SIGBUS as usize] = Disposition::from_bits_truncate(Disposition::KILL.bits() | Disposition::CORE.bits());
    table[SIGSEGV as usize] = Disposition::from_bits_truncate(Disposition::KILL.bits() | Disposition::CORE.bits());
    table[SIGPIPE as usize] = Disposition::KILL;
    table[SIGALRM as usize] = Disposition::KILL;
    table[SIGTERM as usize] = Disposition::KILL;
    table[SIGSTOP as usize] = Disposition::STOP;
    table[SIGTSTP as usize] = Disposition::from_bits_truncate(Disposition::STOP.bits() | Disposition::TTYSTOP.bits());
    table[SIGCONT as usize] = Disposition::from_bits_truncate(Disposition::IGNORE.bits() | Disposition::CONT.bits());
    table[SIGCHLD as usize] = Disposition::IGNORE;
    table[SIGTTIN as usize] = Disposition::from_bits_truncate(Disposition::STOP.bits() | Disposition::TTYSTOP.bits());
    table[SIGTTOU as usize] = Disposition::from_bits_truncate(Disposition::STOP.bits() | Disposition::TTYSTOP.bits());
    table[SIGUSR1 as usize] = Disposition::KILL;
    table[SIGUSR2 as usize] = Disposition::KILL;
    table[SIGWINCH as usize] = Disposition::IGNORE;
    table
};

pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;

pub const SA_NODEFER: u32 = 0x1;
pub const SA_RESETHAND: u32 = 0x2;
pub const SA_RESTART: u32 = 0x4;
pub const SA_SIGINFO: u32 = 0x8;

#[derive(Debug, Clone, Copy)]
pub struct SigAction {
    pub handler: u64,
    pub mask: u64,
    pub flags: u32,
    pub restorer: u64,
}

impl Default for SigAction {
    fn default() -> Self {
        Self { handler: SIG_DFL, mask: 0, flags: 0, restorer: 0 }
    }
}

fn sigmask_bit(sig: u8) -> u64 {
    1u64 << (sig as u64 - 1)
}

pub fn is_valid(sig: u8) -> bool {
    sig > 0 && (sig as usize) < NSIG
}

/// What `dispatch` decided to do with a delivered signal.
pub enum Disposal {
    /// Nothing further to do (ignored, or the dedicated stop/cont path
    /// already ran).
    Handled,
    /// The process must be torn down with this signal as cause.
    Terminate(u8),
    /// A user handler needs a sigframe built on top of `frame`.
    Invoke { handler: u64, restorer: u64, flags: u32 },
}

/// Per-process signal state: one pending/masked bitmask and the
/// `sigaction` table, shared by every thread of the process (threads
/// only differ in which signals they've individually masked, which
/// this kernel does not yet model separately from the process mask).
pub struct SignalState {
    pending: AtomicU64,
    masked: AtomicU64,
    actions: Mutex<[SigAction; NSIG]>,
}

impl SignalState {
    pub fn new() -> Self {
        Self {
            pending: AtomicU64::new(0),
            masked: AtomicU64::new(0),
            actions: Mutex::new([SigAction::default(); NSIG]),
        }
    }

    pub fn raise(&self, sig: u8) {
        self.pending.fetch_or(sigmask_bit(sig), Ordering::SeqCst);
    }

    pub fn clear(&self, sig: u8) {
        self.pending.fetch_and(!sigmask_bit(sig), Ordering::SeqCst);
    }

    pub fn is_pending(&self, sig: u8) -> bool {
        self.pending.load(Ordering::SeqCst) & sigmask_bit(sig) != 0
    }

    /// Lowest-numbered pending, unmasked signal, or `None`.
    pub fn next_deliverable(&self) -> Option<u8> {
        let deliverable = self.pending.load(Ordering::SeqCst) & !self.masked.load(Ordering::SeqCst);
        if deliverable == 0 {
            return None;
        }
        Some(deliverable.trailing_zeros() as u8 + 1)
    }

    pub fn mask(&self) -> u64 {
        self.masked.load(Ordering::SeqCst)
    }

    pub fn set_mask(&self, how: SigmaskHow, set: Option<u64>, old: &mut u64) {
        *old = self.masked.load(Ordering::SeqCst);
        let Some(set) = set else { return };
        let uncatchable = sigmask_bit(SIGKILL) | sigmask_bit(SIGSTOP);
        let set = set & !uncatchable;
        match how {
            SigmaskHow::Block => {
                self.masked.fetch_or(set, Ordering::SeqCst);
            }
            SigmaskHow::Unblock => {
                self.masked.fetch_and(!set, Ordering::SeqCst);
            }
            SigmaskHow::Set => {
                self.masked.store(set, Ordering::SeqCst);
            }
        }
    }

    pub fn action(&self, sig: u8) -> SigAction {
        self.actions.lock()[sig as usize]
    }

    pub fn set_action(&self, sig: u8, action: SigAction) -> Result<(), Errno> {
        if !is_valid(sig) || sig == SIGKILL || sig == SIGSTOP {
            return Err(Errno::EINVAL);
        }
        self.actions.lock()[sig as usize] = action;
        Ok(())
    }

    /// Runs one step of signal dispatch for the calling thread: decides
    /// what to do about the next deliverable signal, applying handler
    /// mask/`SA_RESETHAND` bookkeeping for the invoke case.
    pub fn dispatch(&self) -> Option<Disposal> {
        let sig = self.next_deliverable()?;
        self.clear(sig);

        let action = self.action(sig);
        if action.handler == SIG_DFL {
            let props = PROPERTIES[sig as usize];
            if props.contains(Disposition::KILL) {
                return Some(Disposal::Terminate(sig));
            }
            if props.contains(Disposition::STOP) {
                return Some(Disposal::Handled);
            }
            return Some(Disposal::Handled);
        }
        if action.handler == SIG_IGN {
            return Some(Disposal::Handled);
        }

        let mut actions = self.actions.lock();
        let entry = &mut actions[sig as usize];
        let mut new_mask = self.masked.load(Ordering::SeqCst) | entry.mask;
        if entry.flags & SA_NODEFER == 0 {
            new_mask |= sigmask_bit(sig);
        }
        self.masked.store(new_mask, Ordering::SeqCst);
        let handler = entry.handler;
        let restorer = entry.restorer;
        let flags = entry.flags;
        if entry.flags & SA_RESETHAND != 0 {
            entry.handler = SIG_DFL;
        }
        Some(Disposal::Invoke { handler, restorer, flags })
    }
}

#[derive(Clone, Copy)]
pub enum SigmaskHow {
    Block,
    Unblock,
    Set,
}

/// Signal disposition lookup for code that needs it without a full
/// `dispatch()` (e.g. `kill()` deciding whether to wake a stopped
/// process on `SIGCONT`).
pub fn is_stop_signal(sig: u8) -> bool {
    is_valid(sig) && PROPERTIES[sig as usize].contains(Disposition::STOP)
}

pub fn is_ignored_by_default(sig: u8) -> bool {
    is_valid(sig) && PROPERTIES[sig as usize].contains(Disposition::IGNORE)
}

/// Send `sig` to every thread of `pid`'s process, waking any thread
/// blocked in `scheduler::wait` on it and marking it ready otherwise.
pub fn send_to_process(pid: super::Pid, sig: u8) -> Result<(), Errno> {
    if !is_valid(sig) {
        return Err(Errno::EINVAL);
    }
    let task = super::pid::lookup(pid).ok_or(Errno::ESRCH)?;
    if task.is_zombie() {
        return Err(Errno::ESRCH);
    }

    if sig == SIGCONT {
        task.clear_stop();
    } else if is_stop_signal(sig) && task.begin_stop(sig) {
        task.set_process_state(super::task::ProcessState::Stopped);
    }

    task.signals.raise(sig);
    super::scheduler::notify(&task.waitpid_waitlist);
    Ok(())
}

pub fn send_to_group(pgid: super::Pid, sig: u8) -> Result<(), Errno> {
    let group = super::pid::lookup_group(pgid).ok_or(Errno::ESRCH)?;
    for pid in group.members() {
        let _ = send_to_process(pid, sig);
    }
    Ok(())
}
