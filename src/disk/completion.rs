//! Single-slot hand-off of a disk command result from the IRQ handler to
//! the task that issued the command.

use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use super::{DiskError, DiskResult};
use crate::tasking::ProcessId;

const IDLE: u8 = 0;
const ARMED: u8 = 1;
const READY: u8 = 2;

const NO_WAITER: u64 = u64::MAX;

pub struct Completion {
    state: AtomicU8,
    result: AtomicU8,
    waiter: AtomicU64,
}

impl Completion {
    pub const fn new() -> Self {
        Completion {
            state: AtomicU8::new(IDLE),
            result: AtomicU8::new(0),
            waiter: AtomicU64::new(NO_WAITER),
        }
    }

    /// Prepare for a command issued by `waiter`. Any unconsumed result is
    /// discarded.
    pub fn arm(&self, waiter: Option<ProcessId>) {
        self.state.store(IDLE, Ordering::Release);
        self.waiter.store(waiter.map_or(NO_WAITER, |pid| pid.0), Ordering::Relaxed);
        self.state.store(ARMED, Ordering::Release);
    }

    /// Interrupt side. Returns the process to wake, if the slot was armed.
    pub fn publish(&self, result: DiskResult<()>) -> Option<ProcessId> {
        if self.state.load(Ordering::Acquire) != ARMED {
            return None;
        }
        self.result.store(encode(result), Ordering::Relaxed);
        self.state.store(READY, Ordering::Release);
        match self.waiter.load(Ordering::Relaxed) {
            NO_WAITER => None,
            pid => Some(ProcessId(pid)),
        }
    }

    /// Task side. Consumes a published result.
    pub fn take(&self) -> Option<DiskResult<()>> {
        self.state
            .compare_exchange(READY, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| decode(self.result.load(Ordering::Relaxed)))
    }

    /// Give up on the outstanding command (timeout).
    pub fn cancel(&self) {
        self.state.store(IDLE, Ordering::Release);
    }

    /// A result is waiting to be taken.
    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    pub fn is_armed(&self) -> bool {
        self.state.load(Ordering::Acquire) == ARMED
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(result: DiskResult<()>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(DiskError::BadSector) => 1,
        Err(DiskError::NoMedia) => 2,
        Err(DiskError::Aborted) => 3,
        Err(DiskError::Unknown) => 4,
        Err(DiskError::TimeOut) => 5,
    }
}

fn decode(code: u8) -> DiskResult<()> {
    match code {
        0 => Ok(()),
        1 => Err(DiskError::BadSector),
        2 => Err(DiskError::NoMedia),
        3 => Err(DiskError::Aborted),
        5 => Err(DiskError::TimeOut),
        _ => Err(DiskError::Unknown),
    }
}
