//! Monotonic capture clock
//!
//! All capture timestamps and encoder timing marks are measured against a
//! single process-wide epoch so that microsecond capture times and
//! millisecond packet marks are directly comparable.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// Microseconds since the process clock epoch
pub fn monotonic_us() -> i64 {
    epoch().elapsed().as_micros() as i64
}

/// Milliseconds since the process clock epoch
pub fn monotonic_ms() -> i64 {
    epoch().elapsed().as_millis() as i64
}

/// Injectable clock, so adapters can be driven with synthetic timestamps
pub trait MonotonicClock: Send + Sync {
    fn now_us(&self) -> i64;
}

/// Clock backed by [`monotonic_us`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl MonotonicClock for SystemClock {
    fn now_us(&self) -> i64 {
        monotonic_us()
    }
}

/// Convert a timing mark measured from the clock epoch to milliseconds
pub fn duration_to_ms(d: Duration) -> i64 {
    d.as_millis() as i64
}

/// Duration since the clock epoch, for encoder timing marks
pub fn since_epoch() -> Duration {
    epoch().elapsed()
}
