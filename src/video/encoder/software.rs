//! Software encoder adapter
//!
//! Software codecs need CPU pixels, so every frame goes through a readback
//! and BGRA to I420 conversion before the codec runs. In async mode the copy
//! is fenced and the codec is invoked from the readback completion; in sync
//! mode the render-queue command locks the slot surface directly.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

use super::codec::VideoCodecType;
use super::traits::{
    CodecPacket, CodecSettings, EncodedPacket, EncoderInfo, PacketSender, PacketTiming,
    RateControlParameters,
};
use crate::config::ReadbackMode;
use crate::error::{PublisherError, Result};
use crate::gpu::{GpuDevice, RenderQueue};
use crate::stats::PublisherStats;
use crate::utils::monotonic_ms;
use crate::video::convert::{bgra_to_i420, I420Buffer};
use crate::video::frame::VideoFrame;
use crate::video::readback::AsyncTextureReadback;

/// CPU codec library binding
pub trait SoftwareCodec: Send {
    fn name(&self) -> &str;

    fn configure(&mut self, settings: &CodecSettings) -> Result<()>;

    fn set_rates(&mut self, target_bps: u32, framerate: u32);

    /// Encode one planar frame
    fn encode(
        &mut self,
        frame: &I420Buffer,
        timestamp_us: i64,
        force_key_frame: bool,
    ) -> Result<Vec<CodecPacket>>;
}

struct SoftwareState {
    codec_type: VideoCodecType,
    codec: Box<dyn SoftwareCodec>,
    settings: Option<CodecSettings>,
    sender: Option<PacketSender>,
    pending_rates: Option<RateControlParameters>,
    frames_encoded: u64,
}

/// Encoder over a [`SoftwareCodec`] fed by GPU readback
pub struct SoftwareEncoder {
    device: Arc<dyn GpuDevice>,
    queue: Arc<RenderQueue>,
    mode: ReadbackMode,
    state: Arc<Mutex<SoftwareState>>,
    readback: Arc<Mutex<AsyncTextureReadback>>,
    stats: Option<Arc<PublisherStats>>,
}

impl SoftwareEncoder {
    pub fn new(
        codec_type: VideoCodecType,
        codec: Box<dyn SoftwareCodec>,
        device: Arc<dyn GpuDevice>,
        queue: Arc<RenderQueue>,
        mode: ReadbackMode,
    ) -> Self {
        Self {
            readback: Arc::new(Mutex::new(AsyncTextureReadback::new(device.clone()))),
            device,
            queue,
            mode,
            state: Arc::new(Mutex::new(SoftwareState {
                codec_type,
                codec,
                settings: None,
                sender: None,
                pending_rates: None,
                frames_encoded: 0,
            })),
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<PublisherStats>) -> Self {
        self.readback = Arc::new(Mutex::new(
            AsyncTextureReadback::new(self.device.clone()).with_stats(stats.clone()),
        ));
        self.stats = Some(stats);
        self
    }

    pub fn configure(&mut self, settings: &CodecSettings) -> Result<()> {
        let mut state = self.state.lock();
        state.codec.configure(settings)?;
        info!(
            "Software encoder ({}) configured: {}x{} @ {} kbps",
            state.codec.name(),
            settings.width,
            settings.height,
            settings.start_bitrate_kbps
        );
        state.codec_type = settings.codec;
        state.settings = Some(settings.clone());
        Ok(())
    }

    pub fn register_encode_complete(&mut self, sender: PacketSender) {
        self.state.lock().sender = Some(sender);
    }

    pub fn set_rates(&mut self, rates: RateControlParameters) {
        self.state.lock().pending_rates = Some(rates);
    }

    pub fn encode(&mut self, frame: &VideoFrame, force_key_frame: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.sender.is_none() {
                trace!("Software encoder has no packet sender, skipping frame");
                return Ok(());
            }
            let Some(settings) = state.settings.clone() else {
                return Err(PublisherError::Encoder("encode before configure".to_string()));
            };
            if let Some(rates) = state.pending_rates.take() {
                let target = match settings.max_bitrate_kbps {
                    0 => rates.target_bps(),
                    max => rates.target_bps().min(max.saturating_mul(1000)),
                };
                let fps = if rates.framerate_fps >= 1.0 {
                    rates.framerate_fps.round() as u32
                } else {
                    settings.max_framerate
                };
                debug!("Applying rate change: {} bps, {} fps", target, fps);
                state.codec.set_rates(target, fps);
            }
        }

        let weak = Arc::downgrade(&self.state);
        let frame = frame.clone();
        match self.mode {
            ReadbackMode::Sync => {
                self.queue.enqueue(move || {
                    if weak.strong_count() == 0 {
                        return;
                    }
                    match frame.buffer().to_i420() {
                        Ok(i420) => encode_planar(&weak, &frame, &i420, force_key_frame),
                        Err(e) => warn!("Synchronous readback failed: {}", e),
                    }
                });
            }
            ReadbackMode::Async => {
                let readback = Arc::downgrade(&self.readback);
                self.queue.enqueue(move || {
                    let Some(readback) = readback.upgrade() else {
                        return;
                    };
                    if weak.strong_count() == 0 {
                        return;
                    }
                    let surface = frame.buffer().surface().clone();
                    AsyncTextureReadback::copy_and_complete(
                        &readback,
                        &surface,
                        Box::new(move |data, width, height, stride| {
                            if weak.strong_count() == 0 {
                                return;
                            }
                            match bgra_to_i420(data, width, height, stride) {
                                Ok(i420) => {
                                    let i420 = frame.buffer().set_i420(i420);
                                    encode_planar(&weak, &frame, &i420, force_key_frame);
                                }
                                Err(e) => warn!("Color conversion failed: {}", e),
                            }
                        }),
                    );
                });
            }
        }
        Ok(())
    }

    pub fn release(&mut self) {
        let (codec_type, codec, settings) = {
            let mut state = self.state.lock();
            state.sender = None;
            // The codec moves to the fresh state; a placeholder stays behind
            let codec = std::mem::replace(&mut state.codec, Box::new(ReleasedCodec));
            (state.codec_type, codec, state.settings.clone())
        };
        self.state = Arc::new(Mutex::new(SoftwareState {
            codec_type,
            codec,
            settings,
            sender: None,
            pending_rates: None,
            frames_encoded: 0,
        }));
        self.readback = Arc::new(Mutex::new(match &self.stats {
            Some(stats) => AsyncTextureReadback::new(self.device.clone()).with_stats(stats.clone()),
            None => AsyncTextureReadback::new(self.device.clone()),
        }));
        debug!("Software encoder released");
    }

    pub fn encoder_info(&self) -> EncoderInfo {
        EncoderInfo {
            implementation_name: self.state.lock().codec.name().to_string(),
            is_hardware_accelerated: false,
            supports_native_handle: false,
        }
    }

    pub fn frames_encoded(&self) -> u64 {
        self.state.lock().frames_encoded
    }
}

fn encode_planar(
    state: &Weak<Mutex<SoftwareState>>,
    frame: &VideoFrame,
    i420: &I420Buffer,
    force_key_frame: bool,
) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut state = state.lock();
    if state.sender.is_none() {
        return;
    }

    let encode_start_ms = monotonic_ms();
    let packets = match state.codec.encode(i420, frame.timestamp_us, force_key_frame) {
        Ok(packets) => packets,
        Err(e) => {
            warn!("Software encode failed: {}", e);
            return;
        }
    };
    let encode_finish_ms = monotonic_ms();
    state.frames_encoded += 1;

    let codec = state.codec_type;
    let Some(sender) = state.sender.as_ref() else {
        return;
    };
    for packet in packets {
        let encoded = EncodedPacket {
            codec,
            key_frame: packet.key_frame,
            width: i420.width(),
            height: i420.height(),
            qp: packet.qp,
            timestamp_us: frame.timestamp_us,
            rtp_timestamp: frame.rtp_timestamp(),
            spatial_index: 0,
            timing: PacketTiming {
                capture_time_ms: frame.capture_time_ms(),
                encode_start_ms,
                encode_finish_ms,
                packetization_finish_ms: monotonic_ms(),
            },
            fragmentation: None,
            data: packet.data,
        };
        if sender.send(encoded).is_err() {
            trace!("Packet receiver gone, dropping packet");
        }
    }
}

/// Stand-in left in a released state
struct ReleasedCodec;

impl SoftwareCodec for ReleasedCodec {
    fn name(&self) -> &str {
        "released"
    }

    fn configure(&mut self, _settings: &CodecSettings) -> Result<()> {
        Ok(())
    }

    fn set_rates(&mut self, _target_bps: u32, _framerate: u32) {}

    fn encode(&mut self, _frame: &I420Buffer, _timestamp_us: i64, _force: bool) -> Result<Vec<CodecPacket>> {
        Ok(Vec::new())
    }
}
