//! Time capability shared by every component.
//!
//! All waits in the node are bounded busy-waits on the single thread of
//! control. Routing them through [`Clock`] keeps that explicit and lets the
//! tests drive retry, backoff and cadence logic in virtual time.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub trait Clock {
    /// Monotonic milliseconds since the clock was created.
    fn now_ms(&self) -> u64;

    /// Occupy the thread for `ms` milliseconds.
    fn delay_ms(&mut self, ms: u64);

    /// Wall-clock time for message timestamps.
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Host clock: `Instant` for elapsed time, the OS clock for wall time.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn delay_ms(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Virtual clock. Delays advance time instead of sleeping.
///
/// Clones share the same time source, so a test can keep a handle while a
/// [`Scheduler`](crate::scheduler::Scheduler) owns another.
#[derive(Clone)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
    epoch: DateTime<Utc>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(
            Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0)
                .single()
                .unwrap_or_default(),
        )
    }

    /// Virtual clock whose `utc_now()` at 0 ms is `epoch`.
    pub fn starting_at(epoch: DateTime<Utc>) -> Self {
        Self {
            now: Rc::new(Cell::new(0)),
            epoch,
        }
    }

    pub fn set_ms(&self, ms: u64) {
        self.now.set(ms);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn delay_ms(&mut self, ms: u64) {
        self.advance_ms(ms);
    }

    fn utc_now(&self) -> DateTime<Utc> {
        self.epoch + ChronoDuration::milliseconds(self.now.get() as i64)
    }
}
