use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// Returns the current unix timestamp in milliseconds. Wall-clock time is only
/// suitable for statistics timestamps, never for deadlines.
#[inline]
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_millis() as u64
}

/// Source of monotonic millisecond readings. Deadlines and expiry arithmetic
/// must go through a `TimeSource` so they stay immune to wall-clock jumps and
/// can be driven manually in tests and simulations.
pub trait TimeSource: Send + Sync {
    /// Milliseconds elapsed on a monotonic clock with an arbitrary epoch.
    fn monotonic_millis(&self) -> u64;
}

/// The production time source, anchored to process start.
pub struct SystemTimeSource {
    epoch: Instant,
}

impl SystemTimeSource {
    #[inline]
    pub fn new() -> SystemTimeSource {
        SystemTimeSource { epoch: Instant::now() }
    }
}

impl TimeSource for SystemTimeSource {
    #[inline]
    fn monotonic_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// A hand-cranked time source for deterministic tests.
pub struct ManualTimeSource {
    now: AtomicU64,
}

impl ManualTimeSource {
    #[inline]
    pub fn new(start: u64) -> Arc<ManualTimeSource> {
        Arc::new(ManualTimeSource {
            now: AtomicU64::new(start),
        })
    }

    /// Advance the clock by `millis`.
    #[inline]
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute reading.
    #[inline]
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    #[inline]
    fn monotonic_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Default shared time source.
#[inline]
pub fn system_time_source() -> Arc<dyn TimeSource> {
    Arc::new(SystemTimeSource::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_source_monotone() {
        let source = SystemTimeSource::new();
        let first = source.monotonic_millis();
        let second = source.monotonic_millis();
        assert!(second >= first);
    }

    #[test]
    fn test_manual_source() {
        let source = ManualTimeSource::new(100);
        assert_eq!(source.monotonic_millis(), 100);

        source.advance(50);
        assert_eq!(source.monotonic_millis(), 150);

        source.set(1000);
        assert_eq!(source.monotonic_millis(), 1000);
    }

    #[test]
    fn test_timestamp_millis_plausible() {
        // 2020-01-01 in epoch millis; anything earlier means a broken clock.
        assert!(timestamp_millis() > 1_577_836_800_000);
    }
}
