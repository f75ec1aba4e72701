//! Encoder contract types shared by the hardware and software paths

use bytes::Bytes;
use tokio::sync::mpsc;

use super::codec::VideoCodecType;
use super::fragmentation::FragmentationHeader;
use crate::video::format::Resolution;

/// Encoder configuration negotiated for one send stream
#[derive(Debug, Clone, PartialEq)]
pub struct CodecSettings {
    pub codec: VideoCodecType,
    pub width: u32,
    pub height: u32,
    pub start_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub max_framerate: u32,
}

impl CodecSettings {
    pub fn new(codec: VideoCodecType, resolution: Resolution) -> Self {
        Self {
            codec,
            width: resolution.width,
            height: resolution.height,
            start_bitrate_kbps: 2500,
            max_bitrate_kbps: 8000,
            max_framerate: 60,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// Per-layer bitrate contributions in bits per second
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitrateAllocation {
    layers: Vec<u32>,
}

impl BitrateAllocation {
    /// Single-layer allocation
    pub fn new(bps: u32) -> Self {
        Self { layers: vec![bps] }
    }

    pub fn set_layer(&mut self, index: usize, bps: u32) {
        if self.layers.len() <= index {
            self.layers.resize(index + 1, 0);
        }
        self.layers[index] = bps;
    }

    pub fn sum_bps(&self) -> u64 {
        self.layers.iter().map(|&b| b as u64).sum()
    }

    /// Sum of all layers in kbps, rounded to nearest
    pub fn sum_kbps(&self) -> u32 {
        ((self.sum_bps() + 500) / 1000) as u32
    }
}

/// Rate-control update from the transport
#[derive(Debug, Clone, PartialEq)]
pub struct RateControlParameters {
    pub bitrate: BitrateAllocation,
    pub framerate_fps: f64,
}

impl RateControlParameters {
    pub fn new(bitrate: BitrateAllocation, framerate_fps: f64) -> Self {
        Self {
            bitrate,
            framerate_fps,
        }
    }

    /// Target bitrate applied to the encoder
    pub fn target_bps(&self) -> u32 {
        self.bitrate.sum_kbps().saturating_mul(1000)
    }
}

/// Hardware encoder layer configuration
#[derive(Debug, Clone, PartialEq)]
pub struct LayerConfig {
    pub width: u32,
    pub height: u32,
    pub target_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
    pub max_framerate: u32,
}

impl LayerConfig {
    pub fn from_settings(settings: &CodecSettings) -> Self {
        Self {
            width: settings.width,
            height: settings.height,
            target_bitrate_bps: settings.start_bitrate_kbps.saturating_mul(1000),
            max_bitrate_bps: settings.max_bitrate_kbps.saturating_mul(1000),
            max_framerate: settings.max_framerate,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Apply a rate update, clamped to the configured maximum
    pub fn apply_rates(&mut self, rates: &RateControlParameters) {
        let target = rates.target_bps();
        self.target_bitrate_bps = if self.max_bitrate_bps > 0 {
            target.min(self.max_bitrate_bps)
        } else {
            target
        };
        if rates.framerate_fps >= 1.0 {
            self.max_framerate = rates.framerate_fps.round() as u32;
        }
    }
}

/// Raw output of a codec backend for one input frame
#[derive(Debug, Clone)]
pub struct CodecPacket {
    pub data: Bytes,
    pub key_frame: bool,
    pub qp: i32,
}

/// Per-stage timing marks in milliseconds of the capture clock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketTiming {
    pub capture_time_ms: i64,
    pub encode_start_ms: i64,
    pub encode_finish_ms: i64,
    pub packetization_finish_ms: i64,
}

/// Encoded packet delivered to the send pipeline
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub codec: VideoCodecType,
    pub key_frame: bool,
    pub width: u32,
    pub height: u32,
    pub qp: i32,
    /// Capture timestamp of the source frame, microseconds
    pub timestamp_us: i64,
    /// 90 kHz RTP timestamp
    pub rtp_timestamp: u32,
    pub spatial_index: usize,
    pub timing: PacketTiming,
    /// Unit boundaries for Annex-B byte streams
    pub fragmentation: Option<FragmentationHeader>,
}

impl EncodedPacket {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Time spent in the encoder
    pub fn encode_ms(&self) -> i64 {
        self.timing.encode_finish_ms - self.timing.encode_start_ms
    }
}

/// Static description of an encoder implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    pub implementation_name: String,
    pub is_hardware_accelerated: bool,
    /// Accepts GPU surfaces without a CPU readback
    pub supports_native_handle: bool,
}

/// Channel encoded packets are delivered on, in submission order
pub type PacketSender = mpsc::UnboundedSender<EncodedPacket>;
