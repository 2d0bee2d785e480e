//! Wall-clock sources and the hybrid logical clock.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock milliseconds since the Unix epoch.
pub trait TimeSource: Send + Sync {
    /// Returns the current time in milliseconds.
    fn now_millis(&self) -> u64;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Advances by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Sets the current reading.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Hybrid logical clock producing `logical_time` values.
///
/// Readings are strictly increasing and never behind any observed
/// remote time.
pub struct HybridClock<C: TimeSource + ?Sized> {
    source: std::sync::Arc<C>,
    last: Mutex<u64>,
}

impl<C: TimeSource + ?Sized> HybridClock<C> {
    /// Creates a clock over `source`.
    pub fn new(source: std::sync::Arc<C>) -> Self {
        Self {
            source,
            last: Mutex::new(0),
        }
    }

    /// Returns the next timestamp: `max(wall, last + 1)`.
    pub fn tick(&self) -> u64 {
        let wall = self.source.now_millis();
        let mut last = self.last.lock();
        *last = wall.max(last.saturating_add(1));
        *last
    }

    /// Folds in a timestamp seen on a remote operation.
    pub fn observe(&self, remote: u64) {
        let mut last = self.last.lock();
        if remote > *last {
            *last = remote;
        }
    }

    /// Returns the last issued or observed timestamp.
    pub fn last(&self) -> u64 {
        *self.last.lock()
    }

    /// Returns the wall-clock reading.
    pub fn wall(&self) -> u64 {
        self.source.now_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn ticks_follow_wall_clock() {
        let wall = Arc::new(ManualClock::new(1_000));
        let clock = HybridClock::new(wall.clone());
        assert_eq!(clock.tick(), 1_000);
        wall.advance(50);
        assert_eq!(clock.tick(), 1_050);
    }

    #[test]
    fn ticks_are_strictly_increasing_when_wall_stalls() {
        let wall = Arc::new(ManualClock::new(1_000));
        let clock = HybridClock::new(wall);
        let a = clock.tick();
        let b = clock.tick();
        let c = clock.tick();
        assert!(a < b && b < c);
    }

    #[test]
    fn observe_moves_clock_forward() {
        let wall = Arc::new(ManualClock::new(1_000));
        let clock = HybridClock::new(wall);
        clock.observe(5_000);
        assert_eq!(clock.tick(), 5_001);
        clock.observe(10);
        assert_eq!(clock.tick(), 5_002);
    }

    #[test]
    fn system_clock_is_past_2020() {
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
