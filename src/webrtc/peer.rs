//! Publish-only peer connection

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;

use super::config::WebRtcConfig;
use crate::error::{PublisherError, Result};
use crate::stats::{RtcStatsSample, StatsSource};

/// How long to wait for ICE gathering before sending the offer
const ICE_GATHERING_TIMEOUT: Duration = Duration::from_secs(2);

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// WebRTC engine operations the session drives
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach `track` through a send-only transceiver
    async fn add_send_only_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()>;

    /// Create an offer SDP with no receive directions
    async fn create_offer(&self) -> Result<String>;

    /// Apply the offer locally; returns the SDP to send
    async fn set_local_description(&self, sdp: &str) -> Result<String>;

    /// Apply the remote answer
    async fn set_remote_description(&self, sdp: &str) -> Result<()>;

    fn state_watch(&self) -> watch::Receiver<ConnectionState>;

    async fn close(&self) -> Result<()>;

    /// RTC counters for the stats aggregator
    fn stats_source(&self) -> Option<Arc<dyn StatsSource>> {
        None
    }
}

/// Creates peer connections for new sessions
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, config: &WebRtcConfig) -> Result<Arc<dyn PeerConnection>>;
}

/// `webrtc` crate implementation
pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl RtcPeerConnection {
    pub async fn new(config: &WebRtcConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PublisherError::Negotiation(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            PublisherError::Negotiation(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            PublisherError::Negotiation(format!("Failed to create peer connection: {}", e))
        })?);

        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let state_tx = Arc::new(state_tx);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state_tx = state_tx.clone();
            Box::pin(async move {
                let state = match s {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => return,
                };
                info!("Peer connection state: {}", state);
                let _ = state_tx.send(state);
            })
        }));

        Ok(Self { pc, state_rx })
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_send_only_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()> {
        self.pc
            .add_transceiver_from_track(
                track,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| PublisherError::Negotiation(format!("Failed to add transceiver: {}", e)))?;
        debug!("Send-only video transceiver added");
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PublisherError::Negotiation(format!("Failed to create offer: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| PublisherError::Negotiation(format!("Invalid local SDP: {}", e)))?;
        let mut gathering = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| PublisherError::Negotiation(format!("Failed to set local description: {}", e)))?;

        if tokio::time::timeout(ICE_GATHERING_TIMEOUT, gathering.recv()).await.is_err() {
            warn!("ICE gathering incomplete after {:?}, sending partial offer", ICE_GATHERING_TIMEOUT);
        }
        Ok(self
            .pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .unwrap_or_else(|| sdp.to_string()))
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| PublisherError::Negotiation(format!("Invalid SDP answer: {}", e)))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| PublisherError::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| PublisherError::Transport(format!("Failed to close peer connection: {}", e)))
    }

    fn stats_source(&self) -> Option<Arc<dyn StatsSource>> {
        Some(Arc::new(PeerStatsSource { pc: self.pc.clone() }))
    }
}

/// Outbound RTP counters from `get_stats`
struct PeerStatsSource {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl StatsSource for PeerStatsSource {
    fn name(&self) -> &str {
        "peer-connection"
    }

    async fn collect(&self) -> Option<RtcStatsSample> {
        let report = self.pc.get_stats().await;
        let mut sample = RtcStatsSample::default();
        let mut found = false;
        for stat in report.reports.values() {
            if let StatsReportType::OutboundRTP(outbound) = stat {
                sample.packets_sent += outbound.packets_sent;
                sample.bytes_sent += outbound.bytes_sent;
                found = true;
            }
        }
        found.then_some(sample)
    }
}

/// Factory for [`RtcPeerConnection`]
#[derive(Debug, Default, Clone)]
pub struct RtcPeerConnectionFactory;

#[async_trait]
impl PeerConnectionFactory for RtcPeerConnectionFactory {
    async fn create(&self, config: &WebRtcConfig) -> Result<Arc<dyn PeerConnection>> {
        Ok(Arc::new(RtcPeerConnection::new(config).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Failed).unwrap(),
            "\"failed\""
        );
    }
}
