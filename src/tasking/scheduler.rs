//! Cooperative round-robin scheduler.
//!
//! `Scheduler` only *decides*: it keeps the process table, the sleep queue
//! and the running pid, and `schedule()` returns which process should run
//! next. The register switch itself lives in `tasking::schedule`, which
//! wraps this type in the global `SCHEDULER` lock.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Bound::{Excluded, Unbounded};

use super::context::Context;
use super::delta_queue::DeltaQueue;
use super::process::{Process, ProcessId, ProcessState, Signal, SignalAction, WaitTarget};

/// Exit status given to a process terminated by a signal.
pub fn signal_exit_status(signal: Signal) -> i32 {
    128 + signal.number() as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    NoSuchProcess,
    NoChildren,
    NotRunning,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SchedError::NoSuchProcess => write!(f, "No such process"),
            SchedError::NoChildren => write!(f, "No child processes"),
            SchedError::NotRunning => write!(f, "Scheduler has no running process"),
        }
    }
}

pub type SchedResult<T> = Result<T, SchedError>;

/// Outcome of one scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub prev: Option<ProcessId>,
    pub next: ProcessId,
}

impl Switch {
    pub fn is_noop(&self) -> bool {
        self.prev == Some(self.next)
    }
}

/// The global scheduler state.
pub struct Scheduler {
    processes: BTreeMap<ProcessId, Box<Process>>,
    current: Option<ProcessId>,
    next_pid: u64,
    sleep_queue: DeltaQueue<ProcessId>,
    /// Tick value seen by the previous `schedule()`.
    last_tick: u64,
    /// Context switches stay off until the kernel has finished booting.
    pub active: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            processes: BTreeMap::new(),
            current: None,
            next_pid: 0,
            sleep_queue: DeltaQueue::new(),
            last_tick: 0,
            active: false,
        }
    }

    /// Register the thread of execution that is already running (the boot
    /// thread) as a process. Its context is filled in on the first switch.
    pub fn adopt_running(&mut self, name: &str, now: u64) -> ProcessId {
        let pid = self.allocate_pid();
        let mut process = Process::new(pid, None, name, Context::empty(), Box::new([]));
        process.switch_to();
        self.processes.insert(pid, Box::new(process));
        self.current = Some(pid);
        self.last_tick = now;
        pid
    }

    /// Add a new process as a child of the running one.
    pub fn spawn(&mut self, name: &str, context: Context, kernel_stack: Box<[u8]>) -> ProcessId {
        let pid = self.allocate_pid();
        let parent = self.current;
        self.processes
            .insert(pid, Box::new(Process::new(pid, parent, name, context, kernel_stack)));
        if let Some(parent) = parent.and_then(|p| self.processes.get_mut(&p)) {
            parent.children.push(pid);
        }
        pid
    }

    fn allocate_pid(&mut self) -> ProcessId {
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        pid
    }

    pub fn current(&self) -> Option<ProcessId> {
        self.current
    }

    pub fn get(&self, pid: ProcessId) -> Option<&Process> {
        self.processes.get(&pid).map(|p| &**p)
    }

    pub fn get_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.processes.get_mut(&pid).map(|p| &mut **p)
    }

    pub fn is_sleeping(&self, pid: ProcessId) -> bool {
        self.sleep_queue.find(pid)
    }

    /// Whether `pid` may be picked by the round robin right now.
    pub fn process_ready(&self, pid: ProcessId) -> bool {
        let Some(process) = self.processes.get(&pid) else {
            return false;
        };
        match process.state {
            ProcessState::Active => true,
            ProcessState::Sleeping => !self.sleep_queue.find(pid),
            ProcessState::IoWait => process
                .io_deadline
                .map_or(false, |deadline| self.last_tick >= deadline),
            ProcessState::Waiting(target) => !process.children.iter().any(|child| {
                target.matches(*child)
                    && self.processes.get(child).map_or(false, |c| !c.is_zombie())
            }),
            ProcessState::Zombie => false,
        }
    }

    /// Round robin over the pid-ordered table, starting after the running pid.
    ///
    /// The running process is considered last, so it is only picked again
    /// when nothing else is ready.
    pub fn find_next_pid(&self) -> Option<ProcessId> {
        let ready = |pid: &&ProcessId| self.process_ready(**pid);
        match self.current {
            Some(current) => self
                .processes
                .range((Excluded(current), Unbounded))
                .chain(self.processes.range(..=current))
                .map(|(pid, _)| pid)
                .find(ready)
                .copied(),
            None => self.processes.keys().find(ready).copied(),
        }
    }

    /// Advance the sleep queue to `now`. Returns the pids whose sleep ended.
    pub fn advance_time(&mut self, now: u64) -> Vec<ProcessId> {
        let elapsed = now.saturating_sub(self.last_tick);
        self.last_tick = self.last_tick.max(now);
        self.sleep_queue.decrease(elapsed)
    }

    /// Pick the next process and make it the running one.
    ///
    /// Returns `None` only when no process at all is ready, which the idle
    /// task is there to prevent.
    pub fn schedule(&mut self, now: u64) -> Option<Switch> {
        let prev = self.current;
        if let Some(process) = prev.and_then(|pid| self.processes.get_mut(&pid)) {
            process.unswitch();
        }

        self.advance_time(now);
        self.collect_orphans();

        let next = self.find_next_pid()?;
        if let Some(process) = self.processes.get_mut(&next) {
            process.switch_to();
        }
        self.current = Some(next);
        Some(Switch { prev, next })
    }

    /// Drop zombies nobody will reap. The running process is kept because
    /// its stack is still in use.
    fn collect_orphans(&mut self) {
        let current = self.current;
        self.processes
            .retain(|pid, p| !(p.is_zombie() && p.parent.is_none() && Some(*pid) != current));
    }

    /// Park `pid` in the sleep queue for `ticks`.
    pub fn sleep(&mut self, pid: ProcessId, ticks: u64) -> SchedResult<()> {
        let process = self.processes.get_mut(&pid).ok_or(SchedError::NoSuchProcess)?;
        process.state = ProcessState::Sleeping;
        self.sleep_queue.remove(pid);
        self.sleep_queue.insert(pid, ticks);
        Ok(())
    }

    /// Block `pid` on a hardware operation. `deadline` is an absolute tick.
    pub fn set_io_wait(&mut self, pid: ProcessId, deadline: Option<u64>) -> SchedResult<()> {
        let process = self.processes.get_mut(&pid).ok_or(SchedError::NoSuchProcess)?;
        process.state = ProcessState::IoWait;
        process.io_deadline = deadline;
        Ok(())
    }

    /// Completion side of `set_io_wait`. Ignored unless `pid` is in `IoWait`.
    pub fn complete_io(&mut self, pid: ProcessId) -> bool {
        match self.processes.get_mut(&pid) {
            Some(process) if process.state == ProcessState::IoWait => {
                process.state = ProcessState::Active;
                process.io_deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Terminate `pid`: it becomes a zombie, its parent gets SIGCHLD and its
    /// children are orphaned.
    pub fn exit(&mut self, pid: ProcessId, status: i32) -> SchedResult<()> {
        let (parent, children) = {
            let process = self.processes.get_mut(&pid).ok_or(SchedError::NoSuchProcess)?;
            if process.is_zombie() {
                return Ok(());
            }
            process.state = ProcessState::Zombie;
            process.exit_status = Some(status);
            process.io_deadline = None;
            (process.parent, core::mem::take(&mut process.children))
        };
        self.sleep_queue.remove(pid);

        for child in children {
            if let Some(child) = self.processes.get_mut(&child) {
                child.parent = None;
            }
        }

        if let Some(parent) = parent.and_then(|p| self.processes.get_mut(&p)) {
            parent.raise(Signal::Child);
        }
        Ok(())
    }

    /// Deliver `signal` to `pid`.
    ///
    /// The signal is only recorded here. A terminating signal also cuts a
    /// sleep or a child wait short; the target then exits itself through
    /// `pending_fatal` once it is back at a point where it holds no locks.
    /// An `IoWait` is left alone: the device still owns the transfer buffer,
    /// so the target wakes at completion or at its deadline.
    pub fn raise(&mut self, pid: ProcessId, signal: Signal) -> SchedResult<()> {
        let process = self.processes.get_mut(&pid).ok_or(SchedError::NoSuchProcess)?;
        if process.is_zombie() {
            return Ok(());
        }
        if process.raise(signal) != SignalAction::Terminate {
            return Ok(());
        }
        match process.state {
            ProcessState::Sleeping | ProcessState::Waiting(_) => {
                process.state = ProcessState::Active;
                self.sleep_queue.remove(pid);
            }
            ProcessState::Active | ProcessState::IoWait | ProcessState::Zombie => {}
        }
        Ok(())
    }

    /// The terminating signal `pid` must exit with, if any.
    pub fn pending_fatal(&self, pid: ProcessId) -> Option<Signal> {
        self.processes.get(&pid).and_then(|p| p.pending.fatal())
    }

    /// Put `parent` to sleep until a child matching `target` exits.
    pub fn block_on_child(&mut self, parent: ProcessId, target: WaitTarget) -> SchedResult<()> {
        let process = self.processes.get_mut(&parent).ok_or(SchedError::NoSuchProcess)?;
        process.state = ProcessState::Waiting(target);
        Ok(())
    }

    /// Reap one zombie child of `parent` matching `target`.
    ///
    /// `Ok(None)` means matching children exist but none has exited yet.
    pub fn reap(&mut self, parent: ProcessId, target: WaitTarget) -> SchedResult<Option<(ProcessId, i32)>> {
        let children = &self.processes.get(&parent).ok_or(SchedError::NoSuchProcess)?.children;

        let mut found = false;
        let mut zombie = None;
        for child in children.iter().filter(|c| target.matches(**c)) {
            found = true;
            if self.processes.get(child).map_or(false, |c| c.is_zombie()) {
                zombie = Some(*child);
                break;
            }
        }

        let Some(child) = zombie else {
            return if found { Ok(None) } else { Err(SchedError::NoChildren) };
        };

        let status = self
            .processes
            .remove(&child)
            .and_then(|p| p.exit_status)
            .unwrap_or(0);
        if let Some(parent) = self.processes.get_mut(&parent) {
            parent.children.retain(|&c| c != child);
        }
        Ok(Some((child, status)))
    }

    /// Raw pointers to the saved contexts of a switch.
    ///
    /// Processes are boxed, so the pointers stay valid after the scheduler
    /// lock is released as long as neither process is removed.
    pub fn context_ptrs(&mut self, prev: ProcessId, next: ProcessId) -> Option<(*mut Context, *const Context)> {
        let old = &mut self.processes.get_mut(&prev)?.context as *mut Context;
        let new = &self.processes.get(&next)?.context as *const Context;
        Some((old, new))
    }

}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
