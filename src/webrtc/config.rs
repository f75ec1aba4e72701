//! WebRTC configuration

use serde::{Deserialize, Serialize};

/// Default public STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Media stream id the send-only transceiver is bound to
pub const DEFAULT_STREAM_ID: &str = "unrealstream";

/// WebRTC configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// Stream id announced for the video track
    pub stream_id: String,
    /// Track id of the video track
    pub track_id: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            stream_id: DEFAULT_STREAM_ID.to_string(),
            track_id: "video".to_string(),
        }
    }
}
