use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{PublisherError, Result};
use crate::video::encoder::VideoCodecType;

// Re-export WebRtcConfig from webrtc module
pub use crate::webrtc::config::WebRtcConfig;

/// Director publish endpoint used when no url is configured
pub const DEFAULT_DIRECTOR_URL: &str = "https://director.millicast.com/api/director/publish";

/// Top-level publisher configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Where and as what to publish
    pub source: SourceConfig,
    /// Render-target capture settings
    pub capture: CaptureConfig,
    /// Encoder settings
    pub encoder: EncoderConfig,
    /// Peer connection settings
    pub webrtc: WebRtcConfig,
}

impl PublisherConfig {
    /// Parse configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&content)
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.capture.max_buffers == 0 {
            return Err(PublisherError::Config(
                "capture.max_buffers must be at least 1".to_string(),
            ));
        }
        if self.capture.fixed_resolution && (self.capture.width == 0 || self.capture.height == 0) {
            return Err(PublisherError::Config(format!(
                "fixed capture resolution {}x{} is invalid",
                self.capture.width, self.capture.height
            )));
        }
        if self.encoder.start_bitrate_kbps > self.encoder.max_bitrate_kbps {
            return Err(PublisherError::Config(format!(
                "start bitrate {} kbps exceeds max bitrate {} kbps",
                self.encoder.start_bitrate_kbps, self.encoder.max_bitrate_kbps
            )));
        }
        if self.encoder.max_framerate == 0 {
            return Err(PublisherError::Config(
                "encoder.max_framerate must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Publishing credentials and stream identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Director publish endpoint
    pub url: String,
    /// Stream name announced to the director and in the publish command
    pub stream_name: String,
    /// Publishing token sent as bearer credential
    pub publishing_token: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DIRECTOR_URL.to_string(),
            stream_name: String::new(),
            publishing_token: String::new(),
        }
    }
}

/// How the software path reads pixels back from the GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadbackMode {
    /// Staging copy with a fence, completion on the render queue
    #[default]
    Async,
    /// Lock the slot surface and convert inline
    Sync,
}

/// Render-target capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Ignore render target resizes and capture at `width`x`height`
    pub fixed_resolution: bool,
    pub width: u32,
    pub height: u32,
    /// Frame slots that may be in flight at once
    pub max_buffers: usize,
    /// Drop frames arriving faster than this
    pub max_fps: u32,
    /// Advisory cap on output pixels
    pub max_pixel_count: Option<u64>,
    pub readback_mode: ReadbackMode,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fixed_resolution: false,
            width: 1920,
            height: 1080,
            max_buffers: 3,
            max_fps: 60,
            max_pixel_count: None,
            readback_mode: ReadbackMode::Async,
        }
    }
}

/// Encoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Codec offered first
    pub preferred_codec: VideoCodecType,
    pub start_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub max_framerate: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            preferred_codec: VideoCodecType::H264,
            start_bitrate_kbps: 2500,
            max_bitrate_kbps: 8000,
            max_framerate: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = PublisherConfig::from_json_str(
            r#"{"source": {"stream_name": "arena", "publishing_token": "t0k"},
                "encoder": {"preferred_codec": "vp8"}}"#,
        )
        .unwrap();
        assert_eq!(config.source.stream_name, "arena");
        assert_eq!(config.source.url, DEFAULT_DIRECTOR_URL);
        assert_eq!(config.encoder.preferred_codec, VideoCodecType::VP8);
        assert_eq!(config.capture.max_buffers, 3);
        assert_eq!(config.webrtc.stream_id, "unrealstream");
    }

    #[test]
    fn test_validation_errors() {
        let mut config = PublisherConfig::default();
        config.capture.max_buffers = 0;
        assert!(matches!(config.validate(), Err(PublisherError::Config(_))));

        let mut config = PublisherConfig::default();
        config.encoder.start_bitrate_kbps = 9000;
        assert!(config.validate().is_err());

        let mut config = PublisherConfig::default();
        config.capture.fixed_resolution = true;
        config.capture.width = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"capture": {{"fixed_resolution": true, "width": 1280, "height": 720, "readback_mode": "sync"}}}}"#
        )
        .unwrap();

        let config = PublisherConfig::load(file.path()).await.unwrap();
        assert!(config.capture.fixed_resolution);
        assert_eq!(config.capture.width, 1280);
        assert_eq!(config.capture.readback_mode, ReadbackMode::Sync);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            PublisherConfig::from_json_str("{not json"),
            Err(PublisherError::Json(_))
        ));
    }
}
