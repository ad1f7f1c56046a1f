// =============================================================================
// Clock abstraction — injectable time source
// =============================================================================
//
// Debounce windows, lock expiry deadlines, and rate-limit pauses all compare
// against a `Clock` instead of calling `Instant::now()` directly, so tests can
// advance time without sleeping.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Injectable time source.
pub trait Clock: Send + Sync {
    /// Monotonic instant for interval arithmetic.
    fn now(&self) -> Instant;

    /// Wall-clock epoch millis for timestamps in snapshots and logs.
    fn now_ms(&self) -> i64;
}

/// Production clock backed by the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for deterministic tests and simulations.
pub struct ManualClock {
    origin: Instant,
    elapsed: Mutex<Duration>,
    epoch_ms: Mutex<i64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            epoch_ms: Mutex::new(0),
        }
    }

    /// Move both the monotonic and wall clocks forward.
    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock() += by;
        *self.epoch_ms.lock() += by.as_millis() as i64;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.elapsed.lock()
    }

    fn now_ms(&self) -> i64 {
        *self.epoch_ms.lock()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now_ms(), 0);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now() - t0, Duration::from_millis(1500));
        assert_eq!(clock.now_ms(), 1500);
    }

    #[test]
    fn manual_clock_is_monotonic_without_advance() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), clock.now());
    }
}
