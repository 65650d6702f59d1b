pub mod context;
pub mod delta_queue;
pub mod process;
pub mod scheduler;
pub mod sleep_lock;

use lazy_static::lazy_static;
use spin::Mutex;

pub use delta_queue::DeltaQueue;
pub use process::{Process, ProcessId, ProcessState, Signal, SignalSet, WaitTarget};
pub use scheduler::{signal_exit_status, SchedError, SchedResult, Scheduler, Switch};
pub use sleep_lock::SleepLock;

lazy_static! {
    pub static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

/// Run `f` on the global scheduler with interrupts disabled, so interrupt
/// handlers that take the lock can never find it held.
pub fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(|| f(&mut SCHEDULER.lock()))
}

/// Adopt the boot thread as process 0. It doubles as the idle task.
pub fn init() {
    let pid = with_scheduler(|s| s.adopt_running("kernel", crate::time::ticks()));
    crate::log_info!("Scheduler initialized, boot task is PID {}.", pid);
}

pub fn current_pid() -> Option<ProcessId> {
    with_scheduler(|s| s.current())
}

/// Interrupt-side completion of a blocking hardware operation.
pub fn complete_io(pid: ProcessId) {
    with_scheduler(|s| {
        s.complete_io(pid);
    });
}

/// Deliver `signal` to `pid`. A terminating signal takes effect when the
/// target next passes `deliver_signals`.
pub fn kill(pid: ProcessId, signal: Signal) -> SchedResult<()> {
    with_scheduler(|s| s.raise(pid, signal))
}

#[cfg(not(test))]
pub use self::switching::*;

#[cfg(not(test))]
mod switching {
    use alloc::vec;
    use super::context::{self, Context};
    use super::{signal_exit_status, with_scheduler, ProcessId, SchedError, SchedResult, Switch, WaitTarget, SCHEDULER};
    use crate::config::TASK_STACK_SIZE;

    /// Spawn a kernel task running `entry`. It exits when `entry` returns.
    pub fn create_kernel_task(entry: extern "C" fn(), name: &str) -> ProcessId {
        let stack = vec![0u8; TASK_STACK_SIZE].into_boxed_slice();
        let stack_top = stack.as_ptr() as u64 + TASK_STACK_SIZE as u64;
        let ctx = Context::new(
            context::task_trampoline as *const () as u64,
            entry as *const () as u64,
            stack_top,
        );
        with_scheduler(|s| s.spawn(name, ctx, stack))
    }

    /// Hand the CPU to the next ready process.
    pub fn schedule() {
        x86_64::instructions::interrupts::without_interrupts(|| {
            let mut sched = SCHEDULER.lock();
            if !sched.active {
                return;
            }

            let Some(Switch { prev, next }) = sched.schedule(crate::time::ticks()) else {
                panic!("scheduler: no runnable process");
            };
            let Some(prev) = prev else {
                return;
            };
            if prev == next {
                return;
            }

            let Some((old, new)) = sched.context_ptrs(prev, next) else {
                panic!("scheduler: lost context of PID {} or {}", prev, next);
            };

            // `next` resumes inside its own `schedule()`, which must be able
            // to take the scheduler lock again.
            drop(sched);
            unsafe { context::switch_context(old, new) };
        });
    }

    pub fn kernel_yield() {
        schedule();
    }

    pub fn sleep_ticks(ticks: u64) {
        with_scheduler(|s| {
            if let Some(pid) = s.current() {
                let _ = s.sleep(pid, ticks);
            }
        });
        schedule();
    }

    pub fn sleep_ms(ms: u64) {
        sleep_ticks(crate::time::ms_to_ticks(ms));
    }

    pub fn sleep_us(us: u64) {
        sleep_ticks(crate::time::us_to_ticks(us));
    }

    /// Exit if a terminating signal is pending for the running process.
    ///
    /// Only call this with no locks held and no device transfer in flight:
    /// the process never comes back to release them.
    pub fn deliver_signals() {
        let fatal = with_scheduler(|s| s.current().and_then(|pid| s.pending_fatal(pid)));
        if let Some(signal) = fatal {
            exit_current(signal_exit_status(signal));
        }
    }

    /// Block until a child matching `target` exits, then reap it.
    pub fn wait_for(target: WaitTarget) -> SchedResult<(ProcessId, i32)> {
        loop {
            let reaped = with_scheduler(|s| -> SchedResult<Option<(ProcessId, i32)>> {
                let me = s.current().ok_or(SchedError::NotRunning)?;
                let reaped = s.reap(me, target)?;
                if reaped.is_none() {
                    s.block_on_child(me, target)?;
                }
                Ok(reaped)
            })?;
            if let Some(reaped) = reaped {
                return Ok(reaped);
            }
            schedule();
            deliver_signals();
        }
    }

    /// Block the running process until `complete_io` or `deadline` (ticks).
    /// `done` is checked with interrupts off, so a completion that lands
    /// before the process is parked is not lost.
    pub fn block_on_io(deadline: Option<u64>, done: impl Fn() -> bool) {
        let parked = with_scheduler(|s| match s.current() {
            Some(pid) if s.active && !done() => s.set_io_wait(pid, deadline).is_ok(),
            _ => false,
        });
        if parked {
            schedule();
        } else {
            core::hint::spin_loop();
        }
    }

    /// Terminate the running process. Never returns.
    pub fn exit_current(status: i32) -> ! {
        with_scheduler(|s| {
            if let Some(pid) = s.current() {
                let _ = s.exit(pid, status);
            }
        });
        schedule();
        unreachable!("exit_current: zombie was scheduled again");
    }
}

/// Landing point for kernel tasks whose entry function returned.
#[cfg(not(test))]
pub extern "C" fn task_exit(status: i32) -> ! {
    exit_current(status)
}
