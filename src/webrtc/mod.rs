//! WebRTC publishing
//!
//! Architecture:
//! ```text
//! Publisher (session state machine)
//!    |-- DirectorClient      HTTP: stream name + token -> jwt + ws url
//!    |-- SignalingConnector  WebSocket: publish cmd -> response sdp
//!    |-- PeerConnection      send-only transceiver, offer/answer
//!    +-- CaptureSource       render target -> encoder -> VideoTrack
//! ```

pub mod auth;
pub mod config;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod source;
pub mod video_track;
pub mod websocket;

pub use auth::{DirectorClient, HttpDirectorClient, PublishEndpoint};
pub use config::WebRtcConfig;
pub use peer::{ConnectionState, PeerConnection, PeerConnectionFactory, RtcPeerConnectionFactory};
pub use session::{Publisher, PublisherBuilder, SessionState};
pub use signaling::{InboundMessage, SignalingCommand};
pub use source::{CaptureSource, RenderTargetSource};
pub use video_track::{VideoTrack, VideoTrackStats};
pub use websocket::{signaling_url, SignalingChannel, SignalingConnector, SignalingEvent, WsConnector};
