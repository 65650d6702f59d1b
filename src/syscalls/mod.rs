use crate::errno;
use crate::tasking::{ProcessId, SchedError, Signal, WaitTarget};

/// Syscall numbers (passed in RAX).
pub const SYS_EXIT: u64 = 0;
pub const SYS_WRITE: u64 = 1;
pub const SYS_YIELD: u64 = 2;
pub const SYS_GETPID: u64 = 3;
pub const SYS_SLEEP: u64 = 4;
pub const SYS_WAIT: u64 = 5;
pub const SYS_KILL: u64 = 6;
pub const SYS_SYNC: u64 = 7;
pub const SYS_USLEEP: u64 = 8;
pub const SYS_SHUTDOWN: u64 = 9;

const MAX_WRITE: usize = 4096;

pub fn sched_errno(err: SchedError) -> i64 {
    match err {
        SchedError::NoSuchProcess => errno::ESRCH,
        SchedError::NoChildren => errno::ECHILD,
        SchedError::NotRunning => errno::EINVAL,
    }
}

/// `wait` argument: a negative pid waits for any child.
pub fn wait_target(arg: u64) -> WaitTarget {
    if (arg as i64) < 0 {
        WaitTarget::Any
    } else {
        WaitTarget::Pid(ProcessId(arg))
    }
}

pub fn kill(pid: u64, signo: u64) -> i64 {
    let Some(signal) = Signal::from_number(signo) else {
        return -errno::EINVAL;
    };
    match crate::tasking::kill(ProcessId(pid), signal) {
        Ok(()) => 0,
        Err(e) => -sched_errno(e),
    }
}

pub fn getpid() -> i64 {
    crate::tasking::current_pid().map_or(-errno::ESRCH, |pid| pid.0 as i64)
}

pub fn sync() -> i64 {
    match crate::fs::sync() {
        Ok(()) => 0,
        Err(e) => -e.errno(),
    }
}

/// Central syscall dispatcher, called from the int 0x80 stub with
/// rax=number, rdi=arg0, rsi=arg1, rdx=arg2. Errors come back as negative
/// errno values in rax.
///
/// A process killed during the call exits here, after every lock taken on
/// its behalf has been released.
#[cfg(not(test))]
pub extern "C" fn dispatch(number: u64, arg0: u64, arg1: u64, arg2: u64) -> i64 {
    let ret = handle(number, arg0, arg1, arg2);
    crate::tasking::deliver_signals();
    ret
}

#[cfg(not(test))]
fn handle(number: u64, arg0: u64, arg1: u64, _arg2: u64) -> i64 {
    use crate::tasking;

    match number {
        SYS_EXIT => tasking::exit_current(arg0 as i32),
        SYS_WRITE => {
            use core::fmt::Write;
            let len = arg1 as usize;
            if len > MAX_WRITE {
                return -errno::EINVAL;
            }
            let slice = unsafe { core::slice::from_raw_parts(arg0 as *const u8, len) };
            match core::str::from_utf8(slice) {
                Ok(s) => {
                    x86_64::instructions::interrupts::without_interrupts(|| {
                        let _ = crate::serial::SERIAL1.lock().write_str(s);
                    });
                    len as i64
                }
                Err(_) => -errno::EINVAL,
            }
        }
        SYS_YIELD => {
            tasking::kernel_yield();
            0
        }
        SYS_GETPID => getpid(),
        SYS_SLEEP => {
            tasking::sleep_ms(arg0);
            0
        }
        SYS_USLEEP => {
            tasking::sleep_us(arg0);
            0
        }
        SYS_WAIT => match tasking::wait_for(wait_target(arg0)) {
            Ok((pid, status)) => {
                if arg1 != 0 {
                    unsafe { *(arg1 as *mut i32) = status };
                }
                pid.0 as i64
            }
            Err(e) => -sched_errno(e),
        },
        SYS_KILL => kill(arg0, arg1),
        SYS_SYNC => sync(),
        SYS_SHUTDOWN => crate::shutdown(),
        _ => {
            crate::log_warn!("syscall: unknown number {}", number);
            -errno::ENOSYS
        }
    }
}
