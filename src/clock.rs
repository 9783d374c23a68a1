//! Time source and model version assignment
//!
//! Model versions are derived from the wall clock, truncated to whole
//! seconds. Repeated requests within one second get a `.N` suffix so a
//! single process never hands out the same version twice.

use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};

/// Source of "now" for versioning, `created_at` and trailing windows
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to one instant, settable from tests
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Pin the clock to midday of `day`
    pub fn at_day(day: NaiveDate) -> Self {
        let noon = day
            .and_hms_opt(12, 0, 0)
            .map(|dt| Utc.from_utc_datetime(&dt))
            .unwrap_or_else(Utc::now);
        Self::new(noon)
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Issues model versions that never repeat within this process
#[derive(Debug, Default)]
pub struct VersionGenerator {
    last: Mutex<Option<(DateTime<Utc>, u32)>>,
}

impl VersionGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next version for the instant `now`
    pub fn next(&self, now: DateTime<Utc>) -> String {
        let second = now.with_nanosecond(0).unwrap_or(now);
        let base = second.format("%Y%m%dT%H%M%SZ").to_string();

        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let previous = *last;
        match previous {
            // Same second, or the clock stepped backwards
            Some((prev, seq)) if second <= prev => {
                let seq = seq + 1;
                *last = Some((prev, seq));
                let prev_base = prev.format("%Y%m%dT%H%M%SZ").to_string();
                format!("{prev_base}.{seq}")
            }
            _ => {
                *last = Some((second, 0));
                base
            }
        }
    }
}

/// Sort key for versions issued by [`VersionGenerator`]: the timestamp base,
/// then the numeric `.N` suffix (0 when absent), so `.10` orders after `.9`.
pub fn version_order(version: &str) -> (&str, u32) {
    match version.rsplit_once('.') {
        Some((base, seq)) => match seq.parse() {
            Ok(seq) => (base, seq),
            Err(_) => (version, 0),
        },
        None => (version, 0),
    }
}
