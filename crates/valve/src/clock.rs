//! Host clock: system wall time at a fixed UTC offset plus a monotonic
//! counter started at process launch.

use std::time::Instant;

use anyhow::{Context, Result};
use time::{OffsetDateTime, UtcOffset};

use irrigation_core::clock::{Clock, MIN_VALID_UNIX};

pub struct SystemClock {
    started: Instant,
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(utc_offset_hours: i8) -> Result<Self> {
        let offset = UtcOffset::from_hms(utc_offset_hours, 0, 0)
            .with_context(|| format!("invalid utc offset: {utc_offset_hours} h"))?;
        Ok(Self {
            started: Instant::now(),
            offset,
        })
    }

    /// Zero point of the monotonic counter.
    pub fn epoch(&self) -> Instant {
        self.started
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }

    /// A Pi without RTC boots at its last saved time or at the epoch; the
    /// wall clock counts once NTP has pushed it past 2020.
    fn is_valid(&self) -> bool {
        self.now().unix_timestamp() > MIN_VALID_UNIX
    }

    fn monotonic_millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn monotonic_micros(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }
}
