use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use super::context::Context;

/// Unique process identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which children a waiting parent is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Any,
    Pid(ProcessId),
}

impl WaitTarget {
    pub fn matches(&self, pid: ProcessId) -> bool {
        match self {
            WaitTarget::Any => true,
            WaitTarget::Pid(target) => *target == pid,
        }
    }
}

/// Scheduling state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Running or eligible to run.
    Active,
    /// Parked in the sleep queue until its entry fires.
    Sleeping,
    /// Blocked on a hardware transfer until the completion handler wakes it.
    IoWait,
    /// Blocked in `wait_for` until a matching child becomes a zombie.
    Waiting(WaitTarget),
    /// Exited, waiting to be reaped.
    Zombie,
}

/// Signals understood by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Signal {
    Hangup = 1,
    Interrupt = 2,
    Kill = 9,
    User1 = 10,
    User2 = 12,
    Terminate = 15,
    Child = 17,
}

/// What happens to a process that receives a signal it has no handler for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Terminate,
    Ignore,
}

impl Signal {
    pub const ALL: [Signal; 7] = [
        Signal::Hangup,
        Signal::Interrupt,
        Signal::Kill,
        Signal::User1,
        Signal::User2,
        Signal::Terminate,
        Signal::Child,
    ];

    pub fn from_number(signo: u64) -> Option<Signal> {
        match signo {
            1 => Some(Signal::Hangup),
            2 => Some(Signal::Interrupt),
            9 => Some(Signal::Kill),
            10 => Some(Signal::User1),
            12 => Some(Signal::User2),
            15 => Some(Signal::Terminate),
            17 => Some(Signal::Child),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn default_action(self) -> SignalAction {
        match self {
            Signal::Child | Signal::User1 | Signal::User2 => SignalAction::Ignore,
            Signal::Hangup | Signal::Interrupt | Signal::Kill | Signal::Terminate => {
                SignalAction::Terminate
            }
        }
    }

    fn as_set(self) -> SignalSet {
        SignalSet::from_bits_truncate(1 << (self.number() - 1))
    }
}

bitflags! {
    /// Pending signal mask, bit `n - 1` for signal number `n`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SignalSet: u32 {
        const HANGUP    = 1 << 0;
        const INTERRUPT = 1 << 1;
        const KILL      = 1 << 8;
        const USER1     = 1 << 9;
        const USER2     = 1 << 11;
        const TERMINATE = 1 << 14;
        const CHILD     = 1 << 16;
    }
}

impl SignalSet {
    pub fn has(&self, signal: Signal) -> bool {
        self.contains(signal.as_set())
    }

    /// Lowest-numbered pending signal whose default action terminates.
    pub fn fatal(&self) -> Option<Signal> {
        Signal::ALL
            .into_iter()
            .find(|&signal| self.has(signal) && signal.default_action() == SignalAction::Terminate)
    }
}

/// Process control block.
pub struct Process {
    pub pid: ProcessId,
    pub parent: Option<ProcessId>,
    pub name: String,
    pub state: ProcessState,
    /// Set only for the one process whose registers are live on the CPU.
    pub running: bool,
    pub exit_status: Option<i32>,
    pub children: Vec<ProcessId>,
    pub pending: SignalSet,
    /// Tick after which an `IoWait` is abandoned.
    pub io_deadline: Option<u64>,
    pub context: Context,
    /// Owned stack memory, kept alive as long as the process exists.
    pub kernel_stack: Box<[u8]>,
}

impl Process {
    pub fn new(
        pid: ProcessId,
        parent: Option<ProcessId>,
        name: &str,
        context: Context,
        kernel_stack: Box<[u8]>,
    ) -> Self {
        Process {
            pid,
            parent,
            name: String::from(name),
            state: ProcessState::Active,
            running: false,
            exit_status: None,
            children: Vec::new(),
            pending: SignalSet::empty(),
            io_deadline: None,
            context,
            kernel_stack,
        }
    }

    /// Become the running process.
    pub fn switch_to(&mut self) {
        debug_assert!(self.state != ProcessState::Zombie, "switching to zombie {}", self.pid);
        self.state = ProcessState::Active;
        self.io_deadline = None;
        self.running = true;
    }

    /// Give up the CPU. The register snapshot is written by the context switch.
    pub fn unswitch(&mut self) {
        self.running = false;
    }

    /// Mark `signal` pending and report what its default action is.
    pub fn raise(&mut self, signal: Signal) -> SignalAction {
        self.pending.insert(signal.as_set());
        signal.default_action()
    }

    /// Consume and return every pending signal.
    pub fn take_pending(&mut self) -> SignalSet {
        core::mem::replace(&mut self.pending, SignalSet::empty())
    }

    pub fn is_zombie(&self) -> bool {
        self.state == ProcessState::Zombie
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcessState::Active => write!(f, "active"),
            ProcessState::Sleeping => write!(f, "sleeping"),
            ProcessState::IoWait => write!(f, "iowait"),
            ProcessState::Waiting(WaitTarget::Any) => write!(f, "wait(any)"),
            ProcessState::Waiting(WaitTarget::Pid(pid)) => write!(f, "wait({})", pid),
            ProcessState::Zombie => write!(f, "zombie"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(pid: u64) -> Process {
        Process::new(ProcessId(pid), None, "test", Context::empty(), Box::new([]))
    }

    #[test]
    fn test_switch_and_unswitch() {
        let mut p = process(3);
        p.state = ProcessState::Sleeping;
        p.io_deadline = Some(40);
        p.switch_to();
        assert!(p.running);
        assert_eq!(p.state, ProcessState::Active);
        assert_eq!(p.io_deadline, None);
        p.unswitch();
        assert!(!p.running);
        assert_eq!(p.state, ProcessState::Active);
    }

    #[test]
    fn test_raise_accumulates_pending() {
        let mut p = process(1);
        assert_eq!(p.raise(Signal::Child), SignalAction::Ignore);
        assert_eq!(p.raise(Signal::Terminate), SignalAction::Terminate);
        assert!(p.pending.has(Signal::Child));
        assert!(p.pending.has(Signal::Terminate));
        assert!(!p.pending.has(Signal::Kill));

        let taken = p.take_pending();
        assert_eq!(taken, SignalSet::CHILD | SignalSet::TERMINATE);
        assert!(p.pending.is_empty());
    }

    #[test]
    fn test_signal_numbers_round_trip() {
        for signal in [Signal::Hangup, Signal::Kill, Signal::User2, Signal::Child] {
            assert_eq!(Signal::from_number(signal.number() as u64), Some(signal));
            assert!(signal.as_set().bits().is_power_of_two());
        }
        assert_eq!(Signal::from_number(0), None);
        assert_eq!(Signal::from_number(64), None);
    }

    #[test]
    fn test_wait_target_matches() {
        assert!(WaitTarget::Any.matches(ProcessId(9)));
        assert!(WaitTarget::Pid(ProcessId(9)).matches(ProcessId(9)));
        assert!(!WaitTarget::Pid(ProcessId(9)).matches(ProcessId(8)));
    }
}
