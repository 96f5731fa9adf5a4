//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Monotonic time source shared by every component in one event-loop
//! iteration.
//!
//! [`TimeVal`] mirrors XORP's `libxorp/timeval.hh`: a signed
//! microsecond-resolution duration/instant that saturates at [`TimeVal::MAXIMUM`]
//! instead of overflowing, so an arbitrarily distant deadline can be
//! represented without wraparound.

use std::ops::{Add, AddAssign, Sub};
use std::time::{Duration, Instant};

use rand::Rng;

// A signed, microsecond-resolution instant/duration.
//
// Used both as "seconds since an arbitrary epoch" (via [`Clock::now`]) and
// as a plain duration (the result of subtracting two `TimeVal`s, or the
// deadline handed to `wait_and_dispatch`).
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct TimeVal(i64);

impl TimeVal {
    pub const ZERO: TimeVal = TimeVal(0);
    pub const MINIMUM: TimeVal = TimeVal(i64::MIN);
    pub const MAXIMUM: TimeVal = TimeVal(i64::MAX);

    const MICROS_PER_SEC: i64 = 1_000_000;

    pub const fn from_micros(micros: i64) -> TimeVal {
        TimeVal(micros)
    }

    pub fn from_secs(secs: u64) -> TimeVal {
        TimeVal(saturating_mul(secs as i64, Self::MICROS_PER_SEC))
    }

    pub fn from_millis(millis: u64) -> TimeVal {
        TimeVal(saturating_mul(millis as i64, 1_000))
    }

    pub fn as_micros(&self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / Self::MICROS_PER_SEC as f64
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    // Clamps negative durations to zero, as used whenever a deadline in
    // the past must be treated as "due immediately".
    pub fn non_negative(&self) -> TimeVal {
        if self.0 < 0 { TimeVal::ZERO } else { *self }
    }
}

impl From<Duration> for TimeVal {
    fn from(d: Duration) -> TimeVal {
        let micros = d.as_micros().min(i64::MAX as u128) as i64;
        TimeVal(micros)
    }
}

impl TryFrom<TimeVal> for Duration {
    type Error = ();

    fn try_from(tv: TimeVal) -> Result<Duration, ()> {
        if tv.0 < 0 { Err(()) } else { Ok(Duration::from_micros(tv.0 as u64)) }
    }
}

impl Add for TimeVal {
    type Output = TimeVal;

    fn add(self, rhs: TimeVal) -> TimeVal {
        TimeVal(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for TimeVal {
    fn add_assign(&mut self, rhs: TimeVal) {
        *self = *self + rhs;
    }
}

impl Sub for TimeVal {
    type Output = TimeVal;

    // Signed: the result may be negative (e.g. "how overdue is this
    // timer"), unlike `Duration::sub` which would panic.
    fn sub(self, rhs: TimeVal) -> TimeVal {
        TimeVal(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for TimeVal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

fn saturating_mul(a: i64, b: i64) -> i64 {
    a.checked_mul(b).unwrap_or(if (a >= 0) == (b >= 0) { i64::MAX } else { i64::MIN })
}

// A monotonic time source. A single `Clock` caches the reading seen by
// every component during one `EventLoop::run` iteration, per §4.1's
// "all components in one iteration see a single now" contract.
#[derive(Debug)]
pub struct Clock {
    start: Instant,
    now: TimeVal,
}

impl Clock {
    pub fn new() -> Clock {
        let start = Instant::now();
        Clock { start, now: TimeVal::ZERO }
    }

    // Re-reads the underlying OS clock and caches the result. Called once
    // per `EventLoop::run` iteration.
    pub fn advance(&mut self) {
        self.now = TimeVal::from(self.start.elapsed());
    }

    // The cached reading from the last `advance`.
    pub fn current_time(&self) -> TimeVal {
        self.now
    }

    // Uniform-random `TimeVal` in `[lower, upper]`, used to jitter
    // periodic work (e.g. advertisement retransmission) without every
    // instance waking at the exact same instant.
    pub fn random_uniform(lower: TimeVal, upper: TimeVal) -> TimeVal {
        if lower >= upper {
            return lower;
        }
        let mut rng = rand::rng();
        TimeVal(rng.random_range(lower.0..=upper.0))
    }
}

impl Default for Clock {
    fn default() -> Clock {
        Clock::new()
    }
}
