//! Render target capture
//!
//! [`CaptureAdapter::on_frame_ready`] is called once per rendered frame with
//! the render target. Admitted frames are copied into a frame slot on the
//! render queue and pushed to a [`VideoSink`] as a [`VideoFrame`].
//!
//! ```text
//! render target --> VideoAdapter (rate) --> EncoderContext::obtain_slot
//!                                                 |
//!                      RenderQueue: copy_surface(src -> slot)
//!                                                 |
//!                 GpuFrameBuffer --> VideoFrame --> VideoSink
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, trace};

use crate::config::CaptureConfig;
use crate::error::{PublisherError, Result};
use crate::gpu::{GpuDevice, RenderQueue, SamplerFilter, Surface};
use crate::stats::PublisherStats;
use crate::utils::{LogThrottler, MonotonicClock, SystemClock};
use crate::video::adapter::VideoAdapter;
use crate::video::context::EncoderContext;
use crate::video::format::Resolution;
use crate::video::frame::{GpuFrameBuffer, VideoFrame};
use crate::warn_throttled;

/// Downstream consumer of captured frames
pub trait VideoSink: Send + Sync {
    fn on_frame(&self, frame: VideoFrame);
}

/// Per-frame capture entry point
pub struct CaptureAdapter {
    device: Arc<dyn GpuDevice>,
    queue: Arc<RenderQueue>,
    sink: Arc<dyn VideoSink>,
    stats: Arc<PublisherStats>,
    clock: Arc<dyn MonotonicClock>,
    config: CaptureConfig,
    adapter: Mutex<VideoAdapter>,
    context: Mutex<Option<Arc<EncoderContext>>>,
    throttler: LogThrottler,
}

impl CaptureAdapter {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        queue: Arc<RenderQueue>,
        sink: Arc<dyn VideoSink>,
        stats: Arc<PublisherStats>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            adapter: Mutex::new(VideoAdapter::new(config.max_fps, config.max_pixel_count)),
            device,
            queue,
            sink,
            stats,
            clock: Arc::new(SystemClock),
            config,
            context: Mutex::new(None),
            throttler: LogThrottler::default(),
        }
    }

    /// Drive timestamps from another clock
    pub fn with_clock(mut self, clock: Arc<dyn MonotonicClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn context(&self) -> Option<Arc<EncoderContext>> {
        self.context.lock().clone()
    }

    /// Drop the encoder context; the next admitted frame builds a new one
    pub fn invalidate(&self) {
        if self.context.lock().take().is_some() {
            debug!("Capture context invalidated");
        }
    }

    /// Handle one rendered frame
    ///
    /// Returns `Ok(true)` when a frame was pushed to the sink. Dropped frames
    /// (rate limited, all slots in flight) return `Ok(false)`. Resource
    /// errors are returned and logged at error level.
    pub fn on_frame_ready(&self, source: &Surface) -> Result<bool> {
        let timestamp_us = self.clock.now_us();
        self.stats.mark_frame_rendered();

        let Some(adapted) =
            self.adapter
                .lock()
                .adapt_frame(source.width(), source.height(), timestamp_us)
        else {
            return Ok(false);
        };
        if adapted.output != adapted.input {
            trace!("Adapter suggests {} for {} source", adapted.output, adapted.input);
        }

        let context = match self.ensure_context(source.resolution()) {
            Ok(context) => context,
            Err(e) => {
                error!("Cannot capture frame: {}", e);
                return Err(e);
            }
        };

        let slot = match context.obtain_slot() {
            Ok(slot) => slot,
            Err(PublisherError::SlotsExhausted(n)) => {
                warn_throttled!(
                    self.throttler,
                    "slots_exhausted",
                    "All {} frame slots in flight, dropping frame",
                    n
                );
                return Ok(false);
            }
            Err(e) => {
                error!("Failed to obtain frame slot: {}", e);
                return Err(e);
            }
        };
        self.throttler.clear("slots_exhausted");

        let filter = SamplerFilter::for_sizes(source.resolution(), slot.surface.resolution());
        let device = self.device.clone();
        let stats = self.stats.clone();
        let src = source.clone();
        let dst = slot.surface.clone();
        self.queue.enqueue(move || {
            stats.mark_readback_start();
            if let Err(e) = device.copy_surface(&src, &dst, filter) {
                error!("Render target copy failed: {}", e);
            }
            stats.mark_readback_end();
        });

        let buffer = Arc::new(GpuFrameBuffer::new(slot.surface, slot.frame, context));
        let frame = VideoFrame::new(timestamp_us, buffer);
        self.stats.mark_frame_submit();
        self.sink.on_frame(frame);
        Ok(true)
    }

    fn ensure_context(&self, source: Resolution) -> Result<Arc<EncoderContext>> {
        let mut guard = self.context.lock();
        if let Some(context) = guard.as_ref() {
            if !context.is_fixed_resolution() && context.resolution() != source {
                context.set_resolution(source.width, source.height)?;
            }
            return Ok(context.clone());
        }

        let resolution = if self.config.fixed_resolution {
            Resolution::new(self.config.width, self.config.height)
        } else {
            source
        };
        let context = Arc::new(EncoderContext::new(
            self.device.clone(),
            resolution,
            self.config.fixed_resolution,
            self.config.max_buffers,
        )?);
        *guard = Some(context.clone());
        Ok(context)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gpu::{GpuBackend, GpuVendor, MemoryDevice, SurfaceDesc, SurfaceUsage};
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Sink that keeps every frame it receives
    #[derive(Default)]
    pub(crate) struct CollectingSink {
        pub frames: Mutex<Vec<VideoFrame>>,
    }

    impl VideoSink for CollectingSink {
        fn on_frame(&self, frame: VideoFrame) {
            self.frames.lock().push(frame);
        }
    }

    /// Manually advanced clock
    #[derive(Default)]
    pub(crate) struct ManualClock(pub AtomicI64);

    impl ManualClock {
        pub fn advance_us(&self, us: i64) {
            self.0.fetch_add(us, Ordering::SeqCst);
        }
    }

    impl MonotonicClock for ManualClock {
        fn now_us(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Fixture {
        device: Arc<MemoryDevice>,
        queue: Arc<RenderQueue>,
        sink: Arc<CollectingSink>,
        clock: Arc<ManualClock>,
        adapter: CaptureAdapter,
    }

    fn fixture(device: MemoryDevice, config: CaptureConfig) -> Fixture {
        let device = Arc::new(device);
        let queue = RenderQueue::new("capture-test").unwrap();
        let sink = Arc::new(CollectingSink::default());
        let clock = Arc::new(ManualClock::default());
        let adapter = CaptureAdapter::new(
            device.clone(),
            queue.clone(),
            sink.clone(),
            PublisherStats::new(),
            config,
        )
        .with_clock(clock.clone());
        Fixture {
            device,
            queue,
            sink,
            clock,
            adapter,
        }
    }

    fn unlimited() -> CaptureConfig {
        CaptureConfig {
            max_fps: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_frame_copied_into_slot() {
        let f = fixture(MemoryDevice::new(), unlimited());
        let src = f
            .device
            .create_filled(&SurfaceDesc::new(8, 4, SurfaceUsage::RenderTarget), [1, 2, 3, 255])
            .unwrap();

        assert!(f.adapter.on_frame_ready(&src).unwrap());
        f.queue.flush_blocking();

        let frames = f.sink.frames.lock();
        assert_eq!(frames.len(), 1);
        let mapped = f.device.lock_surface(frames[0].buffer().surface()).unwrap();
        assert_eq!(&mapped[..4], &[1, 2, 3, 255]);
        assert_eq!(frames[0].resolution(), Resolution::new(8, 4));
    }

    #[test]
    fn test_rate_limited_frames_have_no_side_effects() {
        let config = CaptureConfig {
            max_fps: 30,
            ..Default::default()
        };
        let f = fixture(MemoryDevice::new(), config);
        let src = f
            .device
            .create_surface(&SurfaceDesc::new(8, 8, SurfaceUsage::RenderTarget))
            .unwrap();

        assert!(f.adapter.on_frame_ready(&src).unwrap());
        f.clock.advance_us(5_000);
        assert!(!f.adapter.on_frame_ready(&src).unwrap());
        f.clock.advance_us(30_000);
        assert!(f.adapter.on_frame_ready(&src).unwrap());
        f.queue.flush_blocking();

        assert_eq!(f.sink.frames.lock().len(), 2);
        assert_eq!(f.device.copies(), 2);
    }

    #[test]
    fn test_slot_exhaustion_drops_frame() {
        let f = fixture(MemoryDevice::new(), unlimited());
        let src = f
            .device
            .create_surface(&SurfaceDesc::new(8, 8, SurfaceUsage::RenderTarget))
            .unwrap();
        for _ in 0..3 {
            f.clock.advance_us(1);
            assert!(f.adapter.on_frame_ready(&src).unwrap());
        }
        f.clock.advance_us(1);
        assert!(!f.adapter.on_frame_ready(&src).unwrap());

        // Releasing the held frames frees their slots
        f.sink.frames.lock().clear();
        f.clock.advance_us(1);
        assert!(f.adapter.on_frame_ready(&src).unwrap());
        assert!(f.device.surfaces_created() <= 4);
    }

    #[test]
    fn test_resize_follows_source() {
        let f = fixture(MemoryDevice::new(), unlimited());
        let small = f
            .device
            .create_surface(&SurfaceDesc::new(8, 8, SurfaceUsage::RenderTarget))
            .unwrap();
        let large = f
            .device
            .create_surface(&SurfaceDesc::new(16, 8, SurfaceUsage::RenderTarget))
            .unwrap();
        f.adapter.on_frame_ready(&small).unwrap();
        f.clock.advance_us(1);
        f.adapter.on_frame_ready(&large).unwrap();

        let ctx = f.adapter.context().unwrap();
        assert_eq!(ctx.resolution(), Resolution::new(16, 8));
        let frames = f.sink.frames.lock();
        assert_eq!(frames[1].resolution(), Resolution::new(16, 8));
    }

    #[test]
    fn test_fixed_resolution_scales_source() {
        let config = CaptureConfig {
            fixed_resolution: true,
            width: 4,
            height: 4,
            max_fps: 0,
            ..Default::default()
        };
        let f = fixture(MemoryDevice::new(), config);
        let src = f
            .device
            .create_filled(&SurfaceDesc::new(8, 8, SurfaceUsage::RenderTarget), [7, 7, 7, 255])
            .unwrap();
        f.adapter.on_frame_ready(&src).unwrap();
        f.queue.flush_blocking();

        let frames = f.sink.frames.lock();
        assert_eq!(frames[0].resolution(), Resolution::new(4, 4));
        let mapped = f.device.lock_surface(frames[0].buffer().surface()).unwrap();
        assert_eq!(&mapped[..4], &[7, 7, 7, 255]);
    }

    #[test]
    fn test_unsupported_backend_surfaces_error() {
        let f = fixture(
            MemoryDevice::with_backend(GpuBackend::Vulkan(GpuVendor::Intel)),
            unlimited(),
        );
        let src = f
            .device
            .create_surface(&SurfaceDesc::new(8, 8, SurfaceUsage::RenderTarget))
            .unwrap();
        let err = f.adapter.on_frame_ready(&src).unwrap_err();
        assert!(err.is_fatal_for_capture());
        assert!(f.sink.frames.lock().is_empty());
    }
}
