//! Lock for state that stays held across blocking I/O.
//!
//! A holder of a `SleepLock` may park itself in `IoWait`. Contenders give the
//! CPU away instead of spinning, so the holder gets to run and release it.

use spin::{Mutex, MutexGuard};

pub struct SleepLock<T> {
    inner: Mutex<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(value: T) -> Self {
        SleepLock { inner: Mutex::new(value) }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.inner.try_lock() {
                return guard;
            }
            relax();
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

#[cfg(not(test))]
fn relax() {
    super::kernel_yield();
}

#[cfg(test)]
fn relax() {
    core::hint::spin_loop();
}
