//! Capture sources
//!
//! The session asks its source for a track when negotiation starts and
//! stops it on teardown. [`RenderTargetSource`] wires the host render loop
//! to a WebRTC sample track:
//!
//! ```text
//! host render loop --> on_frame_ready --> CaptureAdapter --> SendPipeline --> VideoTrack
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};
use webrtc::track::track_local::TrackLocal;

use super::video_track::VideoTrack;
use crate::config::PublisherConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::gpu::{GpuDevice, RenderQueue, Surface};
use crate::stats::PublisherStats;
use crate::video::capture::CaptureAdapter;
use crate::video::encoder::{CodecSettings, EncoderFactory, RateControlParameters};
use crate::video::format::Resolution;
use crate::video::pipeline::SendPipeline;

/// Media source bound to one publish session
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Begin producing media; returns the track to send
    async fn start_capture(&self) -> Result<Arc<dyn TrackLocal + Send + Sync>>;

    async fn stop_capture(&self);

    fn stream_name(&self) -> &str;

    fn publishing_token(&self) -> &str;

    /// Director endpoint
    fn url(&self) -> &str;
}

struct ActiveCapture {
    capture: Arc<CaptureAdapter>,
    pipeline: Arc<SendPipeline>,
    track: Arc<VideoTrack>,
}

/// Publishes the host application's render target
pub struct RenderTargetSource {
    config: PublisherConfig,
    device: Arc<dyn GpuDevice>,
    queue: Arc<RenderQueue>,
    factory: Arc<EncoderFactory>,
    stats: Arc<PublisherStats>,
    events: Option<Arc<EventBus>>,
    active: Mutex<Option<ActiveCapture>>,
}

impl RenderTargetSource {
    pub fn new(
        config: PublisherConfig,
        device: Arc<dyn GpuDevice>,
        queue: Arc<RenderQueue>,
        factory: Arc<EncoderFactory>,
        stats: Arc<PublisherStats>,
    ) -> Self {
        Self {
            config,
            device,
            queue,
            factory,
            stats,
            events: None,
            active: Mutex::new(None),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Feed one rendered frame; ignored while not capturing
    pub fn on_frame_ready(&self, render_target: &Surface) -> Result<bool> {
        let capture = match self.active.lock().as_ref() {
            Some(active) => active.capture.clone(),
            None => return Ok(false),
        };
        capture.on_frame_ready(render_target)
    }

    pub fn is_capturing(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn pipeline(&self) -> Option<Arc<SendPipeline>> {
        self.active.lock().as_ref().map(|a| a.pipeline.clone())
    }

    pub fn track(&self) -> Option<Arc<VideoTrack>> {
        self.active.lock().as_ref().map(|a| a.track.clone())
    }

    /// Forward a transport rate update to the encoder
    pub fn set_rates(&self, rates: RateControlParameters) {
        if let Some(pipeline) = self.pipeline() {
            pipeline.set_rates(rates);
        }
    }

    pub fn request_key_frame(&self) {
        if let Some(pipeline) = self.pipeline() {
            pipeline.request_key_frame();
        }
    }

    fn codec_settings(&self) -> CodecSettings {
        let encoder = &self.config.encoder;
        let capture = &self.config.capture;
        CodecSettings {
            start_bitrate_kbps: encoder.start_bitrate_kbps,
            max_bitrate_kbps: encoder.max_bitrate_kbps,
            max_framerate: encoder.max_framerate,
            ..CodecSettings::new(
                encoder.preferred_codec,
                Resolution::new(capture.width, capture.height),
            )
        }
    }
}

#[async_trait]
impl CaptureSource for RenderTargetSource {
    async fn start_capture(&self) -> Result<Arc<dyn TrackLocal + Send + Sync>> {
        if let Some(active) = self.active.lock().as_ref() {
            warn!("Capture already started");
            return Ok(active.track.as_track_local());
        }

        let settings = self.codec_settings();
        let track = Arc::new(VideoTrack::new(
            settings.codec,
            settings.max_framerate,
            &self.config.webrtc,
        ));
        let encoder = self.factory.create(settings.codec.sdp_name())?;
        let pipeline = SendPipeline::start(
            encoder,
            &settings,
            track.clone(),
            Some(self.stats.clone()),
            self.events.clone(),
        )?;
        let capture = Arc::new(CaptureAdapter::new(
            self.device.clone(),
            self.queue.clone(),
            pipeline.clone(),
            self.stats.clone(),
            self.config.capture.clone(),
        ));

        info!(
            "Capture started for '{}' ({} on {})",
            self.config.source.stream_name,
            settings.codec,
            self.device.name()
        );
        let local = track.as_track_local();
        *self.active.lock() = Some(ActiveCapture {
            capture,
            pipeline,
            track,
        });
        Ok(local)
    }

    async fn stop_capture(&self) {
        let active = self.active.lock().take();
        if let Some(active) = active {
            active.capture.invalidate();
            active.pipeline.stop().await;
            info!("Capture stopped for '{}'", self.config.source.stream_name);
        }
    }

    fn stream_name(&self) -> &str {
        &self.config.source.stream_name
    }

    fn publishing_token(&self) -> &str {
        &self.config.source.publishing_token
    }

    fn url(&self) -> &str {
        &self.config.source.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{MemoryDevice, SurfaceDesc, SurfaceUsage};
    use crate::video::encoder::hardware::tests::FakeBackend;
    use std::time::Duration;

    fn source(device: Arc<MemoryDevice>) -> RenderTargetSource {
        let queue = RenderQueue::new("source-test").unwrap();
        let factory = Arc::new(
            EncoderFactory::new(device.clone(), queue.clone()).with_hardware(Arc::new(FakeBackend::default())),
        );
        let mut config = PublisherConfig::default();
        config.source.stream_name = "scene".to_string();
        config.capture.max_fps = 0;
        RenderTargetSource::new(config, device, queue, factory, PublisherStats::new())
    }

    #[tokio::test]
    async fn test_frames_ignored_until_started() {
        let device = Arc::new(MemoryDevice::new());
        let source = source(device.clone());
        let target = device
            .create_surface(&SurfaceDesc::new(16, 16, SurfaceUsage::RenderTarget))
            .unwrap();
        assert!(!source.on_frame_ready(&target).unwrap());
        assert!(!source.is_capturing());
        assert_eq!(source.stream_name(), "scene");
    }

    #[tokio::test]
    async fn test_capture_to_track() {
        let device = Arc::new(MemoryDevice::new());
        let source = source(device.clone());
        let local = source.start_capture().await.unwrap();
        assert_eq!(local.stream_id(), "unrealstream");

        let target = device
            .create_surface(&SurfaceDesc::new(16, 16, SurfaceUsage::RenderTarget))
            .unwrap();
        for _ in 0..3 {
            assert!(source.on_frame_ready(&target).unwrap());
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let pipeline = source.pipeline().unwrap();
        for _ in 0..200 {
            if pipeline.packets_written() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pipeline.packets_written(), 3);
        assert_eq!(source.track().unwrap().stats().keyframes_sent, 1);

        source.stop_capture().await;
        assert!(!source.is_capturing());
        assert!(!source.on_frame_ready(&target).unwrap());
    }
}
