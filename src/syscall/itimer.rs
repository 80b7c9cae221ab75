//! `setitimer(2)`/`getitimer(2)` ABI: marshals the user-space
//! `struct itimerval` (two `timeval`s) to/from `process::itimer`'s
//! microsecond-only representation.

use crate::lib::error::{Errno, Result};
use crate::process::itimer::{self, ItimerVal};
use crate::syscall::uaccess;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Timeval {
    sec: i64,
    usec: i64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct UserItimerVal {
    interval: Timeval,
    value: Timeval,
}

fn from_user(v: UserItimerVal) -> ItimerVal {
    ItimerVal {
        interval_usec: (v.interval.sec.max(0) as u64) * 1_000_000 + v.interval.usec.max(0) as u64,
        value_usec: (v.value.sec.max(0) as u64) * 1_000_000 + v.value.usec.max(0) as u64,
    }
}

fn to_user(v: ItimerVal) -> UserItimerVal {
    UserItimerVal {
        interval: Timeval { sec: (v.interval_usec / 1_000_000) as i64, usec: (v.interval_usec % 1_000_000) as i64 },
        value: Timeval { sec: (v.value_usec / 1_000_000) as i64, usec: (v.value_usec % 1_000_000) as i64 },
    }
}

pub fn sys_setitimer(which: i32, new_ptr: u64, old_ptr: u64) -> Result<isize> {
    let task = crate::process::current_task().ok_or(Errno::ESRCH)?;

    let new = if new_ptr != 0 {
        uaccess::validate_user_read(new_ptr as *const u8, core::mem::size_of::<UserItimerVal>())?;
        from_user(unsafe { core::ptr::read(new_ptr as *const UserItimerVal) })
    } else {
        ItimerVal::default()
    };

    let old = itimer::set(&task, which, new)?;

    if old_ptr != 0 {
        uaccess::validate_user_write(old_ptr as *mut u8, core::mem::size_of::<UserItimerVal>())?;
        unsafe { core::ptr::write(old_ptr as *mut UserItimerVal, to_user(old)) };
    }
    Ok(0)
}

pub fn sys_getitimer(which: i32, out_ptr: u64) -> Result<isize> {
    let task = crate::process::current_task().ok_or(Errno::ESRCH)?;
    let cur = itimer::get(&task, which)?;

    uaccess::validate_user_write(out_ptr as *mut u8, core::mem::size_of::<UserItimerVal>())?;
    unsafe { core::ptr::write(out_ptr as *mut UserItimerVal, to_user(cur)) };
    Ok(0)
}
