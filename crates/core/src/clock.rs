//! Time sources consumed by the controller.
//!
//! Two clocks live behind one trait: a wall clock (local calendar time, only
//! trustworthy once synchronised) and a monotonic counter used for every
//! interval measurement in the core.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use time::{OffsetDateTime, UtcOffset};

/// 2020-01-01T00:00:00Z. A wall clock reporting anything earlier has not
/// been synchronised yet.
pub const MIN_VALID_UNIX: i64 = 1_577_836_800;

pub trait Clock {
    /// Local calendar time. Garbage until `is_valid` returns true.
    fn now(&self) -> OffsetDateTime;

    fn is_valid(&self) -> bool;

    fn monotonic_millis(&self) -> u64;

    fn monotonic_micros(&self) -> u64;

    /// Calendar time, or `None` while the clock is not synchronised.
    fn calendar(&self) -> Option<OffsetDateTime> {
        if self.is_valid() {
            Some(self.now())
        } else {
            None
        }
    }
}

impl<T: Clock + ?Sized> Clock for Box<T> {
    fn now(&self) -> OffsetDateTime {
        (**self).now()
    }

    fn is_valid(&self) -> bool {
        (**self).is_valid()
    }

    fn monotonic_millis(&self) -> u64 {
        (**self).monotonic_millis()
    }

    fn monotonic_micros(&self) -> u64 {
        (**self).monotonic_micros()
    }
}

// ---------------------------------------------------------------------------
// Manually driven clock (tests, replay)
// ---------------------------------------------------------------------------

/// A clock that only moves when told to. Clones share the same time, so a
/// test can keep a handle while the controller owns another.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<ManualInner>,
}

struct ManualInner {
    mono_us: AtomicU64,
    wall_us: AtomicI64,
    offset: UtcOffset,
    valid: AtomicBool,
}

impl ManualClock {
    /// Starts at `wall` (synchronised) with the monotonic counter at zero.
    pub fn new(wall: OffsetDateTime) -> Self {
        let wall_us = (wall.unix_timestamp_nanos() / 1_000) as i64;
        Self {
            inner: Arc::new(ManualInner {
                mono_us: AtomicU64::new(0),
                wall_us: AtomicI64::new(wall_us),
                offset: wall.offset(),
                valid: AtomicBool::new(true),
            }),
        }
    }

    /// Starts unsynchronised at the Unix epoch.
    pub fn unsynchronised() -> Self {
        let clock = Self::new(OffsetDateTime::UNIX_EPOCH);
        clock.set_valid(false);
        clock
    }

    /// Advance both the monotonic counter and the wall clock.
    pub fn advance(&self, by: Duration) {
        let us = by.as_micros() as u64;
        self.inner.mono_us.fetch_add(us, Ordering::SeqCst);
        self.inner.wall_us.fetch_add(us as i64, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    /// Jump the wall clock (e.g. an NTP sync) without touching monotonic time.
    pub fn set_wall(&self, wall: OffsetDateTime) {
        let wall_us = (wall.unix_timestamp_nanos() / 1_000) as i64;
        self.inner.wall_us.store(wall_us, Ordering::SeqCst);
    }

    pub fn set_valid(&self, valid: bool) {
        self.inner.valid.store(valid, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        let us = self.inner.wall_us.load(Ordering::SeqCst);
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(us) * 1_000)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
            .to_offset(self.inner.offset)
    }

    fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::SeqCst)
            && self.now().unix_timestamp() > MIN_VALID_UNIX
    }

    fn monotonic_millis(&self) -> u64 {
        self.inner.mono_us.load(Ordering::SeqCst) / 1_000
    }

    fn monotonic_micros(&self) -> u64 {
        self.inner.mono_us.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn advance_moves_both_clocks() {
        let clock = ManualClock::new(datetime!(2024-06-02 05:59:58 +7));
        clock.advance_ms(2_500);
        assert_eq!(clock.monotonic_millis(), 2_500);
        assert_eq!(clock.monotonic_micros(), 2_500_000);
        let now = clock.now();
        assert_eq!((now.hour(), now.minute(), now.second()), (6, 0, 0));
    }

    #[test]
    fn keeps_configured_offset() {
        let clock = ManualClock::new(datetime!(2024-06-02 23:30:00 +7));
        assert_eq!(clock.now().offset(), UtcOffset::from_hms(7, 0, 0).unwrap());
        assert_eq!(clock.now().hour(), 23);
    }

    #[test]
    fn unsynchronised_has_no_calendar() {
        let clock = ManualClock::unsynchronised();
        assert!(!clock.is_valid());
        assert!(clock.calendar().is_none());
    }

    #[test]
    fn wall_before_2020_is_invalid_even_if_flagged() {
        let clock = ManualClock::new(datetime!(2019-12-31 23:00:00 UTC));
        assert!(!clock.is_valid());
        clock.set_wall(datetime!(2024-01-01 00:00:00 UTC));
        assert!(clock.is_valid());
    }

    #[test]
    fn clones_share_time() {
        let a = ManualClock::new(datetime!(2024-06-02 06:00:00 UTC));
        let b = a.clone();
        a.advance_ms(10);
        assert_eq!(b.monotonic_millis(), 10);
    }
}
