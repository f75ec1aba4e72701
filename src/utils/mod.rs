//! Shared helpers for the capture and signaling paths

pub mod clock;
pub mod throttle;

pub use clock::{monotonic_ms, monotonic_us, MonotonicClock, SystemClock};
pub use throttle::LogThrottler;
