//! `setitimer`/`getitimer`: one `{ctime, itimerval, callout}` per task,
//! driving `SIGALRM` off the per-CPU callout wheel (`scheduler::callout`).
//!
//! Arming cancels whatever callout was previously scheduled before
//! installing the new one, so a fired-but-superseded callout can never
//! run: `callout::cancel` removes it from the wheel outright rather than
//! merely flagging it, unlike the `cancelled`-bit scheme this is ported
//! from.

use super::scheduler::callout::{self, CalloutHandle, Tick};
use super::task::Pid;
use crate::lib::error::{Errno, Result};

/// The scheduler's timer ISR runs at 1kHz (`scheduler::timer_tick`).
const TICK_US: u64 = 1000;

pub const ITIMER_REAL: i32 = 0;

#[derive(Clone, Copy, Default)]
pub struct ItimerVal {
    pub interval_usec: u64,
    pub value_usec: u64,
}

pub struct ItimerState {
    ctime: Tick,
    itimerval: ItimerVal,
    callout: Option<CalloutHandle>,
    /// CPU the callout above (if any) is scheduled on -- callouts are
    /// per-CPU, so cancelling/rescheduling must target the same one
    /// regardless of which CPU the next syscall happens to run on.
    cpu: usize,
}

impl ItimerState {
    pub const fn new() -> Self {
        Self { ctime: 0, itimerval: ItimerVal { interval_usec: 0, value_usec: 0 }, callout: None, cpu: 0 }
    }
}

fn usec_to_ticks(usec: u64) -> Tick {
    if usec == 0 {
        0
    } else {
        ((usec + TICK_US - 1) / TICK_US).max(1)
    }
}

/// Callout callback: fires `SIGALRM` at the task and, if periodic,
/// re-arms itself for another interval.
fn fire(pid_raw: usize) {
    let pid = pid_raw as Pid;
    let Some(task) = super::pid::lookup(pid) else { return };
    let _ = super::signal::send_to_process(pid, super::signal::SIGALRM);

    let mut state = task.itimer.lock();
    let cpu = state.cpu;
    state.callout = None;
    if state.itimerval.interval_usec > 0 {
        let delay = usec_to_ticks(state.itimerval.interval_usec);
        state.ctime = callout::ticks(cpu);
        state.itimerval.value_usec = state.itimerval.interval_usec;
        state.callout = callout::add(cpu, delay, fire, pid_raw);
    } else {
        state.itimerval.value_usec = 0;
    }
}

/// `setitimer(ITIMER_REAL, new, old)`. Returns the previous value.
pub fn set(task: &super::Task, which: i32, new: ItimerVal) -> Result<ItimerVal> {
    if which != ITIMER_REAL {
        return Err(Errno::EINVAL);
    }

    let mut state = task.itimer.lock();
    let old = remaining_locked(&state);

    if let Some(handle) = state.callout.take() {
        callout::cancel(state.cpu, handle);
    }

    let cpu = super::scheduler::cpu_id();
    state.cpu = cpu;
    state.itimerval = new;
    state.ctime = callout::ticks(cpu);
    if new.value_usec > 0 {
        let delay = usec_to_ticks(new.value_usec);
        state.callout = callout::add(cpu, delay, fire, task.pid as usize);
    }

    Ok(old)
}

/// `getitimer(ITIMER_REAL, &out)`: remaining time, clamped to zero if
/// the callout is already due.
pub fn get(task: &super::Task, which: i32) -> Result<ItimerVal> {
    if which != ITIMER_REAL {
        return Err(Errno::EINVAL);
    }
    let state = task.itimer.lock();
    Ok(remaining_locked(&state))
}

fn remaining_locked(state: &ItimerState) -> ItimerVal {
    if state.callout.is_none() || state.itimerval.value_usec == 0 {
        return ItimerVal { interval_usec: state.itimerval.interval_usec, value_usec: 0 };
    }
    let elapsed_ticks = callout::ticks(state.cpu).saturating_sub(state.ctime);
    let elapsed_usec = elapsed_ticks * TICK_US;
    let remaining = state.itimerval.value_usec.saturating_sub(elapsed_usec);
    ItimerVal { interval_usec: state.itimerval.interval_usec, value_usec: remaining }
}

/// Cancels a task's armed timer, for use on `exit`.
pub fn clear(task: &alloc::sync::Arc<super::Task>) {
    let mut state = task.itimer.lock();
    if let Some(handle) = state.callout.take() {
        callout::cancel(state.cpu, handle);
    }
}
