//! Sample-based send track
//!
//! ```text
//! EncodedPacket (H264 Annex-B / VP8 / VP9)
//!        |
//!        v
//! VideoTrack (PacketSink)
//!   - TrackLocalStaticSample (built-in payloader)
//!        |
//!        v
//! Peer connection (send-only transceiver)
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::config::WebRtcConfig;
use crate::error::{PublisherError, Result};
use crate::video::encoder::{EncodedPacket, VideoCodecType};
use crate::video::pipeline::PacketSink;

/// Track statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoTrackStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub keyframes_sent: u64,
}

/// Outgoing video track fed with encoded packets
pub struct VideoTrack {
    track: Arc<TrackLocalStaticSample>,
    codec: VideoCodecType,
    fps: u32,
    stats: Mutex<VideoTrackStats>,
}

impl VideoTrack {
    pub fn new(codec: VideoCodecType, fps: u32, config: &WebRtcConfig) -> Self {
        let capability = RTCRtpCodecCapability {
            mime_type: codec.mime_type().to_string(),
            clock_rate: codec.clock_rate(),
            channels: 0,
            sdp_fmtp_line: codec.sdp_fmtp(),
            rtcp_feedback: vec![],
        };
        Self {
            track: Arc::new(TrackLocalStaticSample::new(
                capability,
                config.track_id.clone(),
                config.stream_id.clone(),
            )),
            codec,
            fps,
            stats: Mutex::new(VideoTrackStats::default()),
        }
    }

    /// Track handle for the peer connection
    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    pub fn codec(&self) -> VideoCodecType {
        self.codec
    }

    pub fn stats(&self) -> VideoTrackStats {
        self.stats.lock().clone()
    }

    fn frame_duration(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.fps.max(1) as u64)
    }
}

#[async_trait]
impl PacketSink for VideoTrack {
    /// One sample per encoded frame; the payloader splits Annex-B units
    async fn write_packet(&self, packet: &EncodedPacket) -> Result<()> {
        if packet.is_empty() {
            return Ok(());
        }
        let sample = Sample {
            data: packet.data.clone(),
            duration: self.frame_duration(),
            ..Default::default()
        };
        self.track.write_sample(&sample).await.map_err(|e| {
            debug!("{} write_sample failed: {}", self.codec, e);
            PublisherError::Transport(format!("write_sample failed: {}", e))
        })?;

        let mut stats = self.stats.lock();
        stats.frames_sent += 1;
        stats.bytes_sent += packet.len() as u64;
        if packet.key_frame {
            stats.keyframes_sent += 1;
        }
        Ok(())
    }
}
