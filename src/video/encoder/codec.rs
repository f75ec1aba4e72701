//! Negotiable video codecs and their SDP formats

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Video codecs the publisher can negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodecType {
    /// H.264/AVC, served by the hardware encoder
    H264,
    /// VP8, served by a software codec
    VP8,
    /// VP9, served by a software codec
    VP9,
}

impl VideoCodecType {
    /// Get the codec name for SDP
    pub fn sdp_name(&self) -> &'static str {
        match self {
            VideoCodecType::H264 => "H264",
            VideoCodecType::VP8 => "VP8",
            VideoCodecType::VP9 => "VP9",
        }
    }

    /// Parse a negotiated SDP codec name (case-insensitive)
    pub fn from_sdp_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "H264" => Some(VideoCodecType::H264),
            "VP8" => Some(VideoCodecType::VP8),
            "VP9" => Some(VideoCodecType::VP9),
            _ => None,
        }
    }

    /// Get the RTP clock rate (always 90000 for video)
    pub fn clock_rate(&self) -> u32 {
        90000
    }

    /// Get the MIME type
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodecType::H264 => "video/H264",
            VideoCodecType::VP8 => "video/VP8",
            VideoCodecType::VP9 => "video/VP9",
        }
    }

    /// fmtp line advertised for this codec
    pub fn sdp_fmtp(&self) -> String {
        match self {
            VideoCodecType::H264 => H264_MAIN_FMTP.to_string(),
            VideoCodecType::VP8 | VideoCodecType::VP9 => String::new(),
        }
    }

    /// Annex-B byte stream that needs a fragmentation table
    pub fn is_byte_stream(&self) -> bool {
        matches!(self, VideoCodecType::H264)
    }
}

impl std::fmt::Display for VideoCodecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sdp_name())
    }
}

/// H.264 Main profile, level 1
pub const H264_MAIN_FMTP: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=4d000a";

/// SDP video format: codec name plus fmtp parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpVideoFormat {
    pub name: String,
    pub parameters: BTreeMap<String, String>,
}

impl SdpVideoFormat {
    pub fn new(codec: VideoCodecType) -> Self {
        let parameters = codec
            .sdp_fmtp()
            .split(';')
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            name: codec.sdp_name().to_string(),
            parameters,
        }
    }

    pub fn codec(&self) -> Option<VideoCodecType> {
        VideoCodecType::from_sdp_name(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_h264_format_parameters() {
        let format = SdpVideoFormat::new(VideoCodecType::H264);
        assert_eq!(format.name, "H264");
        assert_eq!(format.parameters["profile-level-id"], "4d000a");
        assert_eq!(format.parameters["packetization-mode"], "1");
        assert_eq!(format.parameters["level-asymmetry-allowed"], "1");
        assert!(SdpVideoFormat::new(VideoCodecType::VP8).parameters.is_empty());
    }

    #[test]
    fn test_from_sdp_name() {
        assert_eq!(VideoCodecType::from_sdp_name("vp9"), Some(VideoCodecType::VP9));
        assert_eq!(VideoCodecType::from_sdp_name("AV1"), None);
    }
}
