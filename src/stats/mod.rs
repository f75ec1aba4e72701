//! Publisher statistics
//!
//! The capture path records timing marks; registered stats sources (the
//! send pipeline, the peer connection) are polled on each tick. Results are
//! published as an immutable [`CalculatedStats`] snapshot through
//! `ArcSwap`, so readers never block the render thread.
//!
//! One aggregator is created per publisher and injected into the components
//! that report into it. Sources unregister when their [`StatsRegistration`]
//! drops.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::utils::monotonic_us;

/// Length of the render FPS sampling window
const SAMPLING_WINDOW: Duration = Duration::from_secs(1);

/// Counters reported by a stats source, cumulative since it started
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RtcStatsSample {
    pub frames_encoded: u64,
    pub total_encode_time_ms: f64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
}

impl RtcStatsSample {
    fn accumulate(&mut self, other: &RtcStatsSample) {
        self.frames_encoded += other.frames_encoded;
        self.total_encode_time_ms += other.total_encode_time_ms;
        self.packets_sent += other.packets_sent;
        self.bytes_sent += other.bytes_sent;
    }
}

/// Something that can report RTC counters
#[async_trait]
pub trait StatsSource: Send + Sync {
    fn name(&self) -> &str;

    /// Current cumulative counters, `None` when unavailable
    async fn collect(&self) -> Option<RtcStatsSample>;
}

/// Raw timing marks, in microseconds of the capture clock
#[derive(Debug, Clone, Default)]
pub struct StatTimings {
    pub frame_rendered_us: i64,
    pub readback_start_us: i64,
    pub readback_end_us: i64,
    pub frame_submit_us: i64,
    pub frames_submitted: u64,
}

/// Derived statistics, refreshed on every tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CalculatedStats {
    /// Frames submitted during the last full sampling window
    pub render_fps: u32,
    /// Duration of the latest GPU copy or readback
    pub texture_capture_ms: f64,
    /// Average encode time since the previous tick
    pub encode_ms: f64,
    pub encode_fps: f64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub bitrate_kbps: f64,
}

struct Window {
    start: Instant,
    frames: u32,
}

/// Process-scoped statistics aggregator for one publisher
pub struct PublisherStats {
    timings: Mutex<StatTimings>,
    window: Mutex<Window>,
    calculated: ArcSwap<CalculatedStats>,
    sources: Mutex<HashMap<u64, Arc<dyn StatsSource>>>,
    next_source_id: AtomicU64,
    previous: Mutex<Option<(Instant, RtcStatsSample)>>,
}

impl PublisherStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            timings: Mutex::new(StatTimings::default()),
            window: Mutex::new(Window {
                start: Instant::now(),
                frames: 0,
            }),
            calculated: ArcSwap::from_pointee(CalculatedStats::default()),
            sources: Mutex::new(HashMap::new()),
            next_source_id: AtomicU64::new(1),
            previous: Mutex::new(None),
        })
    }

    pub fn mark_frame_rendered(&self) {
        self.timings.lock().frame_rendered_us = monotonic_us();
    }

    pub fn mark_readback_start(&self) {
        self.timings.lock().readback_start_us = monotonic_us();
    }

    pub fn mark_readback_end(&self) {
        self.timings.lock().readback_end_us = monotonic_us();
    }

    /// A frame was handed to the encoder
    pub fn mark_frame_submit(&self) {
        {
            let mut timings = self.timings.lock();
            timings.frame_submit_us = monotonic_us();
            timings.frames_submitted += 1;
        }
        self.window.lock().frames += 1;
    }

    pub fn timings(&self) -> StatTimings {
        self.timings.lock().clone()
    }

    /// Latest calculated snapshot
    pub fn snapshot(&self) -> Arc<CalculatedStats> {
        self.calculated.load_full()
    }

    /// Register a source; it is polled until the registration drops
    pub fn register_source(self: &Arc<Self>, source: Arc<dyn StatsSource>) -> StatsRegistration {
        let id = self.next_source_id.fetch_add(1, Ordering::Relaxed);
        debug!("Registered stats source '{}' ({})", source.name(), id);
        self.sources.lock().insert(id, source);
        StatsRegistration {
            id,
            stats: Arc::downgrade(self),
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.lock().len()
    }

    fn unregister(&self, id: u64) {
        if let Some(source) = self.sources.lock().remove(&id) {
            debug!("Unregistered stats source '{}' ({})", source.name(), id);
        }
    }

    /// Recompute statistics now
    pub async fn tick(&self) -> Arc<CalculatedStats> {
        self.tick_at(Instant::now()).await
    }

    /// Recompute statistics as of `now`
    pub async fn tick_at(&self, now: Instant) -> Arc<CalculatedStats> {
        let mut next = (*self.snapshot()).clone();

        {
            let mut window = self.window.lock();
            if now.saturating_duration_since(window.start) >= SAMPLING_WINDOW {
                next.render_fps = window.frames;
                window.frames = 0;
                window.start = now;
            }
        }

        {
            let timings = self.timings.lock();
            if timings.readback_end_us > timings.readback_start_us {
                next.texture_capture_ms =
                    (timings.readback_end_us - timings.readback_start_us) as f64 / 1000.0;
            }
        }

        let sources: Vec<Arc<dyn StatsSource>> = self.sources.lock().values().cloned().collect();
        let mut total = RtcStatsSample::default();
        for source in sources {
            if let Some(sample) = source.collect().await {
                total.accumulate(&sample);
            }
        }

        next.packets_sent = total.packets_sent;
        next.bytes_sent = total.bytes_sent;

        let previous = self.previous.lock().replace((now, total.clone()));
        if let Some((then, prev)) = previous {
            let elapsed = now.saturating_duration_since(then).as_secs_f64();
            let frames = total.frames_encoded.saturating_sub(prev.frames_encoded);
            if elapsed > 0.0 {
                next.encode_fps = frames as f64 / elapsed;
                next.bitrate_kbps =
                    total.bytes_sent.saturating_sub(prev.bytes_sent) as f64 * 8.0 / elapsed / 1000.0;
            }
            if frames > 0 {
                next.encode_ms =
                    (total.total_encode_time_ms - prev.total_encode_time_ms).max(0.0) / frames as f64;
            }
        }

        let next = Arc::new(next);
        self.calculated.store(next.clone());
        next
    }

    /// Tick periodically and log the result until `cancel` fires
    pub fn spawn_ticker(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let stats = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let s = stats.tick().await;
                        debug!(
                            "Rendered {} fps, capture {:.2} ms, encode {:.2} ms @ {:.1} fps, {:.0} kbps",
                            s.render_fps, s.texture_capture_ms, s.encode_ms, s.encode_fps, s.bitrate_kbps
                        );
                    }
                }
            }
            info!("Stats ticker stopped");
        })
    }
}

/// Keeps a stats source registered; unregisters on drop
pub struct StatsRegistration {
    id: u64,
    stats: Weak<PublisherStats>,
}

impl Drop for StatsRegistration {
    fn drop(&mut self) {
        if let Some(stats) = self.stats.upgrade() {
            stats.unregister(self.id);
        }
    }
}
