//! Encoder selection by negotiated codec

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::codec::{SdpVideoFormat, VideoCodecType};
use super::hardware::{HardwareEncoder, HardwareEncoderBackend};
use super::software::{SoftwareCodec, SoftwareEncoder};
use super::VideoEncoder;
use crate::config::ReadbackMode;
use crate::error::{PublisherError, Result};
use crate::gpu::{GpuDevice, RenderQueue};
use crate::stats::PublisherStats;

/// Constructor for a software codec instance
pub type SoftwareCodecCtor = Arc<dyn Fn() -> Box<dyn SoftwareCodec> + Send + Sync>;

/// Builds a [`VideoEncoder`] for a negotiated codec name
///
/// H.264 maps to the hardware path when a backend is installed and the GPU
/// backend can share surfaces with the encoder. VP8 and VP9 map to registered
/// software codecs.
pub struct EncoderFactory {
    device: Arc<dyn GpuDevice>,
    queue: Arc<RenderQueue>,
    hardware: Option<Arc<dyn HardwareEncoderBackend>>,
    software: HashMap<VideoCodecType, SoftwareCodecCtor>,
    readback_mode: ReadbackMode,
    stats: Option<Arc<PublisherStats>>,
}

impl EncoderFactory {
    pub fn new(device: Arc<dyn GpuDevice>, queue: Arc<RenderQueue>) -> Self {
        Self {
            device,
            queue,
            hardware: None,
            software: HashMap::new(),
            readback_mode: ReadbackMode::default(),
            stats: None,
        }
    }

    pub fn with_hardware(mut self, backend: Arc<dyn HardwareEncoderBackend>) -> Self {
        self.hardware = Some(backend);
        self
    }

    pub fn with_software(mut self, codec: VideoCodecType, ctor: SoftwareCodecCtor) -> Self {
        self.software.insert(codec, ctor);
        self
    }

    pub fn with_readback_mode(mut self, mode: ReadbackMode) -> Self {
        self.readback_mode = mode;
        self
    }

    pub fn with_stats(mut self, stats: Arc<PublisherStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    fn hardware_available(&self) -> bool {
        self.hardware.is_some() && self.device.backend().supports_encoder_input()
    }

    /// Formats this factory can produce, H.264 first
    pub fn supported_formats(&self) -> Vec<SdpVideoFormat> {
        let mut formats = Vec::new();
        if self.hardware_available() {
            formats.push(SdpVideoFormat::new(VideoCodecType::H264));
        }
        for codec in [VideoCodecType::VP8, VideoCodecType::VP9] {
            if self.software.contains_key(&codec) {
                formats.push(SdpVideoFormat::new(codec));
            }
        }
        formats
    }

    pub fn create(&self, codec_name: &str) -> Result<VideoEncoder> {
        let codec = VideoCodecType::from_sdp_name(codec_name).ok_or_else(|| {
            PublisherError::Encoder(format!("unsupported codec {}", codec_name))
        })?;

        match codec {
            VideoCodecType::H264 => {
                let Some(backend) = self.hardware.clone().filter(|_| self.hardware_available())
                else {
                    warn!("No hardware H264 encoder on {}", self.device.backend());
                    return Err(PublisherError::NoEncoderInput(self.device.backend().to_string()));
                };
                info!("Creating hardware {} encoder ({})", codec, backend.name());
                Ok(VideoEncoder::Hardware(HardwareEncoder::new(
                    codec,
                    backend,
                    self.queue.clone(),
                    self.device.backend(),
                )))
            }
            VideoCodecType::VP8 | VideoCodecType::VP9 => {
                let ctor = self.software.get(&codec).ok_or_else(|| {
                    PublisherError::Encoder(format!("no software codec registered for {}", codec))
                })?;
                info!("Creating software {} encoder", codec);
                let encoder = SoftwareEncoder::new(
                    codec,
                    ctor(),
                    self.device.clone(),
                    self.queue.clone(),
                    self.readback_mode,
                );
                Ok(VideoEncoder::Software(match &self.stats {
                    Some(stats) => encoder.with_stats(stats.clone()),
                    None => encoder,
                }))
            }
        }
    }
}
