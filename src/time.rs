//! PIT-driven monotonic tick counter.

use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::instructions::port::Port;

use crate::config::TIMER_FREQUENCY_HZ;

const PIT_BASE_FREQUENCY: u64 = 1_193_182;
const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// Only the timer interrupt writes this; tasks read it.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Program PIT channel 0 as a rate generator at `TIMER_FREQUENCY_HZ`.
pub fn init() {
    let divisor = (PIT_BASE_FREQUENCY / TIMER_FREQUENCY_HZ) as u16;
    unsafe {
        Port::<u8>::new(PIT_COMMAND).write(0x36); // channel 0, lo/hi, mode 3
        let mut data = Port::<u8>::new(PIT_CHANNEL0);
        data.write(divisor as u8);
        data.write((divisor >> 8) as u8);
    }
    crate::log_info!("PIT programmed at {} Hz (divisor {}).", TIMER_FREQUENCY_HZ, divisor);
}

/// Called from the timer interrupt.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Release);
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Ticks covering at least `ms` milliseconds.
pub fn ms_to_ticks(ms: u64) -> u64 {
    div_ceil(ms.saturating_mul(TIMER_FREQUENCY_HZ), 1000)
}

/// Ticks covering at least `us` microseconds.
pub fn us_to_ticks(us: u64) -> u64 {
    div_ceil(us.saturating_mul(TIMER_FREQUENCY_HZ), 1_000_000)
}

fn div_ceil(value: u64, divisor: u64) -> u64 {
    value / divisor + (value % divisor != 0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_round_up() {
        assert_eq!(ms_to_ticks(0), 0);
        assert_eq!(ms_to_ticks(1000), TIMER_FREQUENCY_HZ);
        assert_eq!(us_to_ticks(1), 1);
        assert_eq!(us_to_ticks(1_000_000), TIMER_FREQUENCY_HZ);
        assert!(ms_to_ticks(1) >= 1);
        assert_eq!(ms_to_ticks(2500), 2500 * TIMER_FREQUENCY_HZ / 1000);
    }

    #[test]
    fn test_saturates_instead_of_overflowing() {
        assert!(ms_to_ticks(u64::MAX) > 0);
    }
}
