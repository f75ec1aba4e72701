//! Frame rate and resolution adaptation
//!
//! Decides per captured frame whether it reaches the encoder. Frames
//! arriving faster than `1 / max_fps` are dropped. The proposed output size
//! is advisory: the capture path copies at the context resolution and only
//! reports the suggestion.

use tracing::trace;

use crate::video::format::Resolution;

/// Fraction of the frame interval a frame may arrive early and still pass
const JITTER_TOLERANCE_DIVISOR: i64 = 10;

/// Size proposed for an admitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptedFrame {
    /// Source size
    pub input: Resolution,
    /// Suggested output size, never larger than the source
    pub output: Resolution,
}

/// Per-source rate and resolution adapter
#[derive(Debug, Clone)]
pub struct VideoAdapter {
    /// Minimum interval between admitted frames, 0 when unlimited
    interval_us: i64,
    max_pixel_count: Option<u64>,
    next_frame_us: Option<i64>,
    last_timestamp_us: Option<i64>,
    frames_in: u64,
    frames_dropped: u64,
}

impl VideoAdapter {
    pub fn new(max_fps: u32, max_pixel_count: Option<u64>) -> Self {
        Self {
            interval_us: if max_fps == 0 {
                0
            } else {
                1_000_000 / max_fps as i64
            },
            max_pixel_count,
            next_frame_us: None,
            last_timestamp_us: None,
            frames_in: 0,
            frames_dropped: 0,
        }
    }

    pub fn set_max_fps(&mut self, max_fps: u32) {
        self.interval_us = if max_fps == 0 {
            0
        } else {
            1_000_000 / max_fps as i64
        };
        self.next_frame_us = None;
    }

    pub fn set_max_pixel_count(&mut self, max_pixel_count: Option<u64>) {
        self.max_pixel_count = max_pixel_count;
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in
    }

    /// Admit or drop a frame captured at `timestamp_us`
    ///
    /// Returns `None` when the frame must be dropped. Timestamps that go
    /// backwards are dropped so admitted timestamps never decrease.
    pub fn adapt_frame(&mut self, width: u32, height: u32, timestamp_us: i64) -> Option<AdaptedFrame> {
        self.frames_in += 1;

        if let Some(last) = self.last_timestamp_us {
            if timestamp_us < last {
                self.frames_dropped += 1;
                trace!("Dropping frame with decreasing timestamp {} < {}", timestamp_us, last);
                return None;
            }
        }

        if self.interval_us > 0 {
            let tolerance = self.interval_us / JITTER_TOLERANCE_DIVISOR;
            match self.next_frame_us {
                Some(next) if timestamp_us < next - tolerance => {
                    self.frames_dropped += 1;
                    trace!("Dropping frame at {} us, next slot at {} us", timestamp_us, next);
                    return None;
                }
                Some(next) => {
                    // Late frames restart the cadence instead of bursting to catch up
                    let advanced = next + self.interval_us;
                    self.next_frame_us = Some(if timestamp_us >= advanced {
                        timestamp_us + self.interval_us
                    } else {
                        advanced
                    });
                }
                None => self.next_frame_us = Some(timestamp_us + self.interval_us),
            }
        }

        self.last_timestamp_us = Some(timestamp_us);
        let input = Resolution::new(width, height);
        Some(AdaptedFrame {
            input,
            output: self.scaled_output(input),
        })
    }

    fn scaled_output(&self, input: Resolution) -> Resolution {
        match self.max_pixel_count {
            Some(max) if max > 0 && input.pixels() > max => {
                let scale = (max as f64 / input.pixels() as f64).sqrt();
                // Even dimensions keep 4:2:0 chroma aligned
                let w = ((input.width as f64 * scale) as u32 & !1).max(2);
                let h = ((input.height as f64 * scale) as u32 & !1).max(2);
                Resolution::new(w, h)
            }
            _ => input,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drops_frames_faster_than_max_fps() {
        let mut adapter = VideoAdapter::new(30, None);
        // 120 Hz render loop for one second
        let admitted = (0..120)
            .filter(|i| adapter.adapt_frame(1280, 720, i * 8_333).is_some())
            .count();
        assert!((29..=31).contains(&admitted), "admitted {}", admitted);
        assert_eq!(adapter.frames_in(), 120);
        assert_eq!(adapter.frames_dropped(), 120 - admitted as u64);
    }

    #[test]
    fn test_jitter_within_tolerance_is_admitted() {
        let mut adapter = VideoAdapter::new(30, None);
        assert!(adapter.adapt_frame(640, 480, 0).is_some());
        // 33_333 us interval, arrives 2 ms early
        assert!(adapter.adapt_frame(640, 480, 31_333).is_some());
        assert!(adapter.adapt_frame(640, 480, 40_000).is_none());
    }

    #[test]
    fn test_unlimited_rate_and_backwards_timestamps() {
        let mut adapter = VideoAdapter::new(0, None);
        assert!(adapter.adapt_frame(640, 480, 100).is_some());
        assert!(adapter.adapt_frame(640, 480, 100).is_some());
        assert!(adapter.adapt_frame(640, 480, 50).is_none());
    }

    #[test]
    fn test_advisory_downscale() {
        let mut adapter = VideoAdapter::new(0, Some(1280 * 720));
        let frame = adapter.adapt_frame(1920, 1080, 0).unwrap();
        assert_eq!(frame.input, Resolution::HD1080);
        assert!(frame.output.pixels() <= 1280 * 720);
        assert_eq!(frame.output.width % 2, 0);

        let small = adapter.adapt_frame(640, 480, 1).unwrap();
        assert_eq!(small.output, Resolution::new(640, 480));
    }
}
