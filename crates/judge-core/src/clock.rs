//! Time source abstraction.
//!
//! Production code injects [`SystemClock`]; tests inject [`ManualClock`] so
//! skew windows, replay TTLs and key grace periods are deterministic.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, SecondsFormat, Utc};

/// Wall-clock source.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Current time as fractional epoch seconds.
    fn epoch_secs(&self) -> f64 {
        let now = self.now();
        now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
    }

    /// Current time as whole epoch seconds.
    fn epoch(&self) -> i64 {
        self.now().timestamp()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at `epoch` whole seconds.
    pub fn at_epoch(epoch: i64) -> Self {
        Self::new(DateTime::from_timestamp(epoch, 0).unwrap_or_default())
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += Duration::seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// ISO-8601 UTC with second precision and a `Z` suffix.
pub fn iso_seconds(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// True iff `|now - ts| <= max_skew_sec`.
pub fn within_skew(now: f64, ts: f64, max_skew_sec: f64) -> bool {
    (now - ts).abs() <= max_skew_sec
}
