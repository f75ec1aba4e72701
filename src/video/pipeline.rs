//! Send pipeline
//!
//! Bridges captured frames to the transport:
//!
//! ```text
//! CaptureAdapter --> SendPipeline::on_frame --> VideoEncoder::encode
//!                                                    |
//!                                     unbounded mpsc (submission order)
//!                                                    |
//!                               drain task --> PacketSink::write_packet
//! ```
//!
//! The drain task ends when the encoder releases its packet sender.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::capture::VideoSink;
use super::encoder::{CodecSettings, EncodedPacket, EncoderInfo, RateControlParameters, VideoEncoder};
use super::frame::VideoFrame;
use crate::error::Result;
use crate::events::{EventBus, PublisherEvent};
use crate::stats::{PublisherStats, RtcStatsSample, StatsRegistration, StatsSource};
use crate::utils::LogThrottler;
use crate::{error_throttled, warn_throttled};

/// Transport end of the pipeline
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn write_packet(&self, packet: &EncodedPacket) -> Result<()>;
}

/// Encoder-side counters
#[derive(Default)]
struct PipelineCounters {
    frames_submitted: AtomicU64,
    frames_encoded: AtomicU64,
    encode_time_us: AtomicU64,
    packets_written: AtomicU64,
    bytes_written: AtomicU64,
}

struct PipelineStatsSource {
    counters: Arc<PipelineCounters>,
}

#[async_trait]
impl StatsSource for PipelineStatsSource {
    fn name(&self) -> &str {
        "send-pipeline"
    }

    async fn collect(&self) -> Option<RtcStatsSample> {
        // Packet and byte totals come from the peer connection
        Some(RtcStatsSample {
            frames_encoded: self.counters.frames_encoded.load(Ordering::Relaxed),
            total_encode_time_ms: self.counters.encode_time_us.load(Ordering::Relaxed) as f64 / 1000.0,
            ..Default::default()
        })
    }
}

/// Encoder plus packet delivery for one send stream
pub struct SendPipeline {
    encoder: Mutex<VideoEncoder>,
    key_frame_requested: AtomicBool,
    counters: Arc<PipelineCounters>,
    drain: Mutex<Option<JoinHandle<()>>>,
    registration: Mutex<Option<StatsRegistration>>,
    events: Option<Arc<EventBus>>,
    throttler: LogThrottler,
}

impl SendPipeline {
    /// Configure `encoder` and start delivering its packets to `sink`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        mut encoder: VideoEncoder,
        settings: &CodecSettings,
        sink: Arc<dyn PacketSink>,
        stats: Option<Arc<PublisherStats>>,
        events: Option<Arc<EventBus>>,
    ) -> Result<Arc<Self>> {
        encoder.configure(settings)?;
        let (tx, rx) = mpsc::unbounded_channel();
        encoder.register_encode_complete(tx);

        let info = encoder.encoder_info();
        info!(
            "Send pipeline started: {} {} ({})",
            settings.codec,
            settings.resolution(),
            info.implementation_name
        );

        let counters = Arc::new(PipelineCounters::default());
        let drain = tokio::spawn(drain_packets(rx, sink, counters.clone()));
        let registration = stats.map(|stats| {
            stats.register_source(Arc::new(PipelineStatsSource {
                counters: counters.clone(),
            }))
        });

        Ok(Arc::new(Self {
            encoder: Mutex::new(encoder),
            // First frame is always a key frame
            key_frame_requested: AtomicBool::new(true),
            counters,
            drain: Mutex::new(Some(drain)),
            registration: Mutex::new(registration),
            events,
            throttler: LogThrottler::default(),
        }))
    }

    /// Force the next encoded frame to be a key frame
    pub fn request_key_frame(&self) {
        debug!("Key frame requested");
        self.key_frame_requested.store(true, Ordering::Release);
    }

    pub fn set_rates(&self, rates: RateControlParameters) {
        self.encoder.lock().set_rates(rates);
    }

    pub fn encoder_info(&self) -> EncoderInfo {
        self.encoder.lock().encoder_info()
    }

    pub fn frames_submitted(&self) -> u64 {
        self.counters.frames_submitted.load(Ordering::Relaxed)
    }

    pub fn packets_written(&self) -> u64 {
        self.counters.packets_written.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.counters.bytes_written.load(Ordering::Relaxed)
    }

    /// Release the encoder and wait for queued packets to drain
    pub async fn stop(&self) {
        self.encoder.lock().release();
        self.registration.lock().take();
        let handle = self.drain.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Send pipeline stopped");
    }
}

impl VideoSink for SendPipeline {
    fn on_frame(&self, frame: VideoFrame) {
        let force_key_frame = self.key_frame_requested.swap(false, Ordering::AcqRel);
        let result = self.encoder.lock().encode(&frame, force_key_frame);
        match result {
            Ok(()) => {
                self.counters.frames_submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                if force_key_frame {
                    self.key_frame_requested.store(true, Ordering::Release);
                }
                error_throttled!(self.throttler, "encode", "Encode failed: {}", e);
                if let Some(events) = &self.events {
                    events.publish(PublisherEvent::EncoderError {
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

impl Drop for SendPipeline {
    fn drop(&mut self) {
        self.encoder.get_mut().release();
        if let Some(handle) = self.drain.get_mut().take() {
            handle.abort();
        }
    }
}

async fn drain_packets(
    mut rx: mpsc::UnboundedReceiver<EncodedPacket>,
    sink: Arc<dyn PacketSink>,
    counters: Arc<PipelineCounters>,
) {
    let throttler = LogThrottler::default();
    while let Some(packet) = rx.recv().await {
        counters.frames_encoded.fetch_add(1, Ordering::Relaxed);
        counters
            .encode_time_us
            .fetch_add(packet.encode_ms().max(0) as u64 * 1000, Ordering::Relaxed);

        match sink.write_packet(&packet).await {
            Ok(()) => {
                counters.packets_written.fetch_add(1, Ordering::Relaxed);
                counters.bytes_written.fetch_add(packet.len() as u64, Ordering::Relaxed);
                trace!(
                    "Wrote {} bytes (ts {} us, key {})",
                    packet.len(),
                    packet.timestamp_us,
                    packet.key_frame
                );
            }
            Err(e) => {
                warn_throttled!(throttler, "packet_write", "Failed to write packet: {}", e);
            }
        }
    }
    debug!("Packet drain finished");
}
