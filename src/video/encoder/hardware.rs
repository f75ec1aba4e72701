//! Hardware encoder adapter
//!
//! Submits slot surfaces to a vendor encoder session without a CPU readback.
//! The session is created lazily from the first frame's encoder input, rate
//! changes are latched until the next `encode`, and a frame whose size no
//! longer matches the layer reconfigures the layer before submission.
//!
//! Encode work runs on the render queue. Each command holds a weak reference
//! to the adapter state and becomes a no-op once the adapter is released.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

use super::codec::VideoCodecType;
use super::fragmentation::FragmentationHeader;
use super::traits::{
    CodecPacket, CodecSettings, EncodedPacket, EncoderInfo, LayerConfig, PacketSender, PacketTiming,
    RateControlParameters,
};
use crate::error::{PublisherError, Result};
use crate::gpu::{GpuBackend, RenderQueue, Surface};
use crate::utils::monotonic_ms;
use crate::video::frame::VideoFrame;
use crate::video::pool::{EncoderInput, FrameId};

/// Vendor encoder SDK binding
pub trait HardwareEncoderBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Open an encode session bound to `input`'s surfaces
    fn create_session(
        &self,
        input: &Arc<EncoderInput>,
        config: &LayerConfig,
    ) -> Result<Box<dyn HardwareEncoderSession>>;
}

/// One open hardware encode session
pub trait HardwareEncoderSession: Send {
    fn update_layer_config(&mut self, config: &LayerConfig) -> Result<()>;

    /// Encode one surface; zero or more packets come back
    fn encode(
        &mut self,
        surface: &Surface,
        frame_id: FrameId,
        force_key_frame: bool,
    ) -> Result<Vec<CodecPacket>>;
}

struct HardwareState {
    codec: VideoCodecType,
    layer: Option<LayerConfig>,
    /// Layer changed since the session last saw it
    layer_dirty: bool,
    pending_rates: Option<RateControlParameters>,
    session: Option<Box<dyn HardwareEncoderSession>>,
    sender: Option<PacketSender>,
    frames_submitted: u64,
}

impl HardwareState {
    fn new(codec: VideoCodecType, layer: Option<LayerConfig>) -> Self {
        Self {
            codec,
            layer,
            layer_dirty: false,
            pending_rates: None,
            session: None,
            sender: None,
            frames_submitted: 0,
        }
    }
}

/// Zero-copy encoder over a [`HardwareEncoderBackend`]
pub struct HardwareEncoder {
    backend: Arc<dyn HardwareEncoderBackend>,
    queue: Arc<RenderQueue>,
    gpu_backend: GpuBackend,
    state: Arc<Mutex<HardwareState>>,
}

impl HardwareEncoder {
    pub fn new(
        codec: VideoCodecType,
        backend: Arc<dyn HardwareEncoderBackend>,
        queue: Arc<RenderQueue>,
        gpu_backend: GpuBackend,
    ) -> Self {
        Self {
            backend,
            queue,
            gpu_backend,
            state: Arc::new(Mutex::new(HardwareState::new(codec, None))),
        }
    }

    pub fn configure(&mut self, settings: &CodecSettings) -> Result<()> {
        if settings.width == 0 || settings.height == 0 {
            return Err(PublisherError::Encoder(format!(
                "invalid encoder size {}x{}",
                settings.width, settings.height
            )));
        }
        let layer = LayerConfig::from_settings(settings);
        info!(
            "Hardware encoder ({}) configured: {} @ {} kbps, max {} fps",
            self.backend.name(),
            layer.resolution(),
            settings.start_bitrate_kbps,
            settings.max_framerate
        );
        let mut state = self.state.lock();
        state.codec = settings.codec;
        state.layer = Some(layer);
        state.layer_dirty = state.session.is_some();
        Ok(())
    }

    pub fn register_encode_complete(&mut self, sender: PacketSender) {
        self.state.lock().sender = Some(sender);
    }

    /// Latch a rate change; only the latest one before `encode` is applied
    pub fn set_rates(&mut self, rates: RateControlParameters) {
        self.state.lock().pending_rates = Some(rates);
    }

    pub fn encode(&mut self, frame: &VideoFrame, force_key_frame: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.sender.is_none() {
                trace!("Hardware encoder has no packet sender, skipping frame");
                return Ok(());
            }
            let Some(mut layer) = state.layer.clone() else {
                return Err(PublisherError::Encoder("encode before configure".to_string()));
            };

            if let Some(rates) = state.pending_rates.take() {
                layer.apply_rates(&rates);
                debug!(
                    "Applying rate change: {} bps, {} fps",
                    layer.target_bitrate_bps, layer.max_framerate
                );
                state.layer_dirty = true;
            }

            if layer.width != frame.width() || layer.height != frame.height() {
                warn!(
                    "Frame size {} differs from encoder layer {}, reconfiguring",
                    frame.resolution(),
                    layer.resolution()
                );
                layer.width = frame.width();
                layer.height = frame.height();
                state.layer_dirty = true;
            }
            state.layer = Some(layer);
            state.frames_submitted += 1;
        }

        let weak: Weak<Mutex<HardwareState>> = Arc::downgrade(&self.state);
        let backend = self.backend.clone();
        let frame = frame.clone();
        self.queue.enqueue(move || {
            let Some(state) = weak.upgrade() else {
                return;
            };
            let mut state = state.lock();
            if let Err(e) = encode_on_render_queue(&mut state, backend.as_ref(), &frame, force_key_frame) {
                warn!("Hardware encode failed: {}", e);
            }
        });
        Ok(())
    }

    /// Detach the packet sender; queued work becomes a no-op
    pub fn release(&mut self) {
        let (codec, layer) = {
            let mut state = self.state.lock();
            state.sender = None;
            state.session = None;
            (state.codec, state.layer.clone())
        };
        // In-flight commands hold only a weak reference to the old state
        self.state = Arc::new(Mutex::new(HardwareState::new(codec, layer)));
        debug!("Hardware encoder released");
    }

    pub fn encoder_info(&self) -> EncoderInfo {
        EncoderInfo {
            implementation_name: format!(
                "MILLICAST_HW_ENCODER_{}",
                self.gpu_backend.short_name().to_uppercase()
            ),
            is_hardware_accelerated: true,
            supports_native_handle: true,
        }
    }

    pub fn frames_submitted(&self) -> u64 {
        self.state.lock().frames_submitted
    }
}

fn encode_on_render_queue(
    state: &mut HardwareState,
    backend: &dyn HardwareEncoderBackend,
    frame: &VideoFrame,
    force_key_frame: bool,
) -> Result<()> {
    if state.sender.is_none() {
        return Ok(());
    }
    let layer = state
        .layer
        .clone()
        .ok_or_else(|| PublisherError::Encoder("encoder not configured".to_string()))?;
    let buffer = frame.buffer();

    let session = match state.session.as_mut() {
        Some(session) => {
            if state.layer_dirty {
                session.update_layer_config(&layer)?;
            }
            session
        }
        None => {
            info!("Creating {} session at {}", backend.name(), layer.resolution());
            state.session.insert(backend.create_session(buffer.encoder_input(), &layer)?)
        }
    };
    state.layer_dirty = false;

    let encode_start_ms = monotonic_ms();
    let packets = session.encode(buffer.surface(), buffer.frame_id(), force_key_frame)?;
    let encode_finish_ms = monotonic_ms();

    for packet in packets {
        let fragmentation = state
            .codec
            .is_byte_stream()
            .then(|| FragmentationHeader::from_annex_b(&packet.data));
        let encoded = EncodedPacket {
            codec: state.codec,
            key_frame: packet.key_frame,
            width: frame.width(),
            height: frame.height(),
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
            fragmentation,
            data: packet.data,
        };
        if let Some(sender) = &state.sender {
            if sender.send(encoded).is_err() {
                trace!("Packet receiver gone, dropping packet");
            }
        }
    }
    Ok(())
}
