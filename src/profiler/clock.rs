//! Nanosecond clock port.
//!
//! The engine never reads the wall clock directly; everything goes through
//! [`NanoClock`] so tests can drive time deterministically.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of nanosecond timestamps for the profiler session.
pub trait NanoClock {
    /// Current time in nanoseconds.
    fn nano_time(&self) -> u64;

    /// Translate a session timestamp into epoch nanoseconds for emission.
    /// The default is the identity, for clocks that already produce
    /// epoch-anchored values.
    fn epoch_nanos(&self, session_nanos: u64) -> u64 {
        session_nanos
    }
}

/// Monotonic system clock (`CLOCK_MONOTONIC`).
#[derive(Debug, Default)]
pub struct SystemClock;

impl NanoClock for SystemClock {
    fn nano_time(&self) -> u64 {
        clock_monotonic_ns()
    }
}

/// Read `CLOCK_MONOTONIC` in nanoseconds.
pub(crate) fn clock_monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid timespec on the stack. CLOCK_MONOTONIC is
    // always available and the call cannot fail with these arguments.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Settable clock for tests. Thread-safe so a harness can advance time while
/// a worker observes it.
#[derive(Debug, Default)]
pub struct FixedClock {
    nanos: AtomicU64,
}

impl FixedClock {
    pub fn new(nanos: u64) -> Self {
        Self {
            nanos: AtomicU64::new(nanos),
        }
    }

    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::Relaxed);
    }
}

impl NanoClock for FixedClock {
    fn nano_time(&self) -> u64 {
        self.nanos.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock_set() {
        let clock = FixedClock::new(1);
        assert_eq!(clock.nano_time(), 1);
        clock.set(42);
        assert_eq!(clock.nano_time(), 42);
        assert_eq!(clock.epoch_nanos(42), 42);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock;
        let a = clock.nano_time();
        let b = clock.nano_time();
        assert!(b >= a);
    }
}
