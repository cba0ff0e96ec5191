//! Wall Clock
//!
//! Locked-profit decay is a pure function of ledger state and the current
//! time, so every component reads time through a [`Clock`] instead of calling
//! the system clock directly. Production uses [`SystemClock`]; tests and
//! replays drive a [`ManualClock`].

use std::sync::atomic::{AtomicI64, Ordering};

/// Seconds since Unix epoch (1970-01-01 00:00:00 UTC).
pub type Timestamp = i64;

pub const SECS_PER_DAY: i64 = 86_400;

/// Source of the current time in Unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Clock backed by `chrono::Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp()
    }
}

/// Settable clock. Only moves forward.
#[derive(Debug, Default)]
pub struct ManualClock {
    current: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: AtomicI64::new(start),
        }
    }

    /// Advance clock to a new time. Earlier times are ignored.
    pub fn advance_to(&self, new_time: Timestamp) {
        self.current.fetch_max(new_time, Ordering::SeqCst);
    }

    /// Advance clock by `secs`. Negative deltas are ignored.
    pub fn advance_by(&self, secs: i64) {
        if secs > 0 {
            self.current.fetch_add(secs, Ordering::SeqCst);
        }
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> Timestamp {
        self.current.load(Ordering::SeqCst)
    }
}
