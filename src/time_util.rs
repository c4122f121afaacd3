//! A small clock abstraction.
//!
//! The Journal stamps every delta with a timestamp, and the InodeMap's
//! stale-inode sweep compares inode atimes against a threshold. Both need to
//! be driven by a fake clock in tests, so callers take a `&dyn Clock` rather
//! than calling `SystemTime::now()` directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of monotonically-nondecreasing wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only advances when told to, for deterministic tests.
#[derive(Debug, Default)]
pub struct FakeClock {
    nanos_since_epoch: AtomicU64,
}

impl FakeClock {
    pub fn new(start: SystemTime) -> Self {
        let nanos = start
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self {
            nanos_since_epoch: AtomicU64::new(nanos),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.nanos_since_epoch
            .fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.nanos_since_epoch.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_on_demand() {
        let clock = FakeClock::new(UNIX_EPOCH);
        let t0 = clock.now();
        clock.advance(Duration::from_secs(60));
        let t1 = clock.now();
        assert_eq!(t1.duration_since(t0).unwrap(), Duration::from_secs(60));
    }
}
