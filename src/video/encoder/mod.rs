//! Video encoder adapters
//!
//! This module provides:
//! - Hardware encoding straight from GPU slot surfaces (H264)
//! - Software encoding through readback and I420 conversion (VP8, VP9)
//! - Annex-B fragmentation tables for H264 packets
//! - Encoder selection by negotiated codec name

pub mod codec;
pub mod factory;
pub mod fragmentation;
pub mod hardware;
pub mod software;
pub mod traits;

pub use codec::{SdpVideoFormat, VideoCodecType, H264_MAIN_FMTP};
pub use factory::{EncoderFactory, SoftwareCodecCtor};
pub use fragmentation::{Fragment, FragmentationHeader};
pub use hardware::{HardwareEncoder, HardwareEncoderBackend, HardwareEncoderSession};
pub use software::{SoftwareCodec, SoftwareEncoder};
pub use traits::{
    BitrateAllocation, CodecPacket, CodecSettings, EncodedPacket, EncoderInfo, LayerConfig,
    PacketSender, PacketTiming, RateControlParameters,
};

use crate::error::Result;
use crate::video::frame::VideoFrame;

/// Encoder strategy for one send stream
pub enum VideoEncoder {
    Hardware(HardwareEncoder),
    Software(SoftwareEncoder),
}

impl VideoEncoder {
    pub fn configure(&mut self, settings: &CodecSettings) -> Result<()> {
        match self {
            VideoEncoder::Hardware(e) => e.configure(settings),
            VideoEncoder::Software(e) => e.configure(settings),
        }
    }

    pub fn register_encode_complete(&mut self, sender: PacketSender) {
        match self {
            VideoEncoder::Hardware(e) => e.register_encode_complete(sender),
            VideoEncoder::Software(e) => e.register_encode_complete(sender),
        }
    }

    /// Submit a frame; packets arrive on the registered sender
    pub fn encode(&mut self, frame: &VideoFrame, force_key_frame: bool) -> Result<()> {
        match self {
            VideoEncoder::Hardware(e) => e.encode(frame, force_key_frame),
            VideoEncoder::Software(e) => e.encode(frame, force_key_frame),
        }
    }

    pub fn set_rates(&mut self, rates: RateControlParameters) {
        match self {
            VideoEncoder::Hardware(e) => e.set_rates(rates),
            VideoEncoder::Software(e) => e.set_rates(rates),
        }
    }

    pub fn release(&mut self) {
        match self {
            VideoEncoder::Hardware(e) => e.release(),
            VideoEncoder::Software(e) => e.release(),
        }
    }

    pub fn encoder_info(&self) -> EncoderInfo {
        match self {
            VideoEncoder::Hardware(e) => e.encoder_info(),
            VideoEncoder::Software(e) => e.encoder_info(),
        }
    }
}
