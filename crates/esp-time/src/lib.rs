//! Monotonic clock abstraction.
//!
//! The timer core (`esp-timers`) and the interrupt bus measure deadlines
//! against a [`TimeSource`] rather than calling `Instant::now()` directly,
//! so tests can drive time deterministically with [`FakeClock`] instead of
//! racing a real clock.

#[cfg(not(target_arch = "wasm32"))]
use std::time::{Duration, Instant};

#[cfg(target_arch = "wasm32")]
use web_time::{Duration, Instant};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub trait TimeSource: Send + Sync {
    fn now(&self) -> Instant;
}

/// Real wall-clock time source.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostClock;

impl TimeSource for HostClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Deterministic clock for tests: `now()` returns a fixed epoch plus an
/// explicitly-advanced offset, so alarm-scheduling tests don't depend on
/// real wall-clock scheduling jitter.
#[derive(Clone)]
pub struct FakeClock {
    epoch: Instant,
    offset_nanos: Arc<AtomicU64>,
}

impl FakeClock {
    pub fn new() -> Self {
        FakeClock {
            epoch: Instant::now(),
            offset_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_nanos
            .fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for FakeClock {
    fn now(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_monotonically() {
        let clock = FakeClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_millis(5));
        let t1 = clock.now();
        assert!(t1 > t0);
        assert_eq!(t1 - t0, Duration::from_millis(5));
    }

    #[test]
    fn host_clock_is_monotonic() {
        let clock = HostClock;
        let t0 = clock.now();
        let t1 = clock.now();
        assert!(t1 >= t0);
    }
}
