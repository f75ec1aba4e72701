//! Log throttling for per-frame diagnostics
//!
//! The capture path runs once per rendered frame, so a persistent condition
//! (slot exhaustion, no peer attached to the track) would otherwise log at
//! the render rate.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Limits how often a message with the same key is emitted
pub struct LogThrottler {
    last_logged: Mutex<HashMap<&'static str, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` when `key` has not been logged within the interval,
    /// and records the attempt.
    pub fn should_log(&self, key: &'static str) -> bool {
        let now = Instant::now();
        let mut map = self.last_logged.lock();
        match map.get(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                map.insert(key, now);
                true
            }
        }
    }

    /// Forget `key` once the condition it reports has recovered
    pub fn clear(&self, key: &'static str) {
        self.last_logged.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.last_logged.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_logged.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

/// Throttled `tracing::error!`
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::error!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(100));
        assert!(throttler.should_log("slots_exhausted"));
        assert!(!throttler.should_log("slots_exhausted"));

        thread::sleep(Duration::from_millis(150));
        assert!(throttler.should_log("slots_exhausted"));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("a"));
        assert!(throttler.should_log("b"));
        assert!(!throttler.should_log("a"));
        assert_eq!(throttler.len(), 2);
    }

    #[test]
    fn test_clear() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("track_write"));
        throttler.clear("track_write");
        assert!(throttler.should_log("track_write"));
    }
}
