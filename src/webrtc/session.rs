//! Publish session state machine
//!
//! ```text
//! Idle -> Authenticating -> Connecting -> Negotiating -> AwaitingAnswer -> Connected
//!   ^                                                                         |
//!   +------------------------------ Closing <---------- unpublish() ---------+
//!
//! Error is reachable from every non-terminal state.
//! ```
//!
//! `publish()` spawns one control task per attempt. The task authenticates
//! with the director, opens the signaling socket, negotiates a send-only peer
//! connection and then services signaling messages until the socket closes
//! or `unpublish()` cancels it. Failures are reported through
//! [`PublisherEvent`]s and the state watch, never by panicking.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::auth::{DirectorClient, PublishEndpoint};
use super::config::WebRtcConfig;
use super::peer::{ConnectionState, PeerConnection, PeerConnectionFactory};
use super::signaling::{InboundMessage, SignalingCommand};
use super::source::CaptureSource;
use super::websocket::{signaling_url, SignalingConnector, SignalingEvent};
use crate::error::{PublisherError, Result};
use crate::events::{EventBus, PublisherEvent};
use crate::stats::{PublisherStats, StatsRegistration};

/// Publish session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Authenticating,
    Connecting,
    Negotiating,
    AwaitingAnswer,
    Connected,
    Closing,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Authenticating => "authenticating",
            SessionState::Connecting => "connecting",
            SessionState::Negotiating => "negotiating",
            SessionState::AwaitingAnswer => "awaiting_answer",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Error => "error",
        }
    }

    /// A new publish attempt may start from here
    pub fn can_publish(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Error)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handles owned by the active attempt
#[derive(Default)]
struct SessionHandles {
    peer: Option<Arc<dyn PeerConnection>>,
    outbound: Option<tokio::sync::mpsc::UnboundedSender<String>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    peer_stats: Option<StatsRegistration>,
    capturing: bool,
    attempt: Option<Uuid>,
}

struct Shared {
    source: Arc<dyn CaptureSource>,
    director: Arc<dyn DirectorClient>,
    connector: Arc<dyn SignalingConnector>,
    peers: Arc<dyn PeerConnectionFactory>,
    config: WebRtcConfig,
    stats: Option<Arc<PublisherStats>>,
    events: Arc<EventBus>,
    state_tx: watch::Sender<SessionState>,
    handles: Mutex<SessionHandles>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!("Session state: {} -> {}", previous, state);
            self.events.publish(PublisherEvent::StateChanged {
                state: state.as_str().to_string(),
            });
        }
    }

    /// Move forward unless the attempt was cancelled
    fn advance(&self, cancel: &CancellationToken, state: SessionState) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        self.set_state(state);
        true
    }

    /// Tear down the attempt and land in `Error`
    ///
    /// Runs to completion once started; a concurrent `unpublish()` waits for it.
    async fn fail(&self, cancel: &CancellationToken, event: PublisherEvent) {
        if cancel.is_cancelled() {
            return;
        }
        warn!("Publish failed: {:?}", event);
        self.events.publish(event);
        self.teardown().await;
        if !cancel.is_cancelled() {
            self.set_state(SessionState::Error);
        }
    }

    /// Destroy the peer connection, close the socket and stop capture
    async fn teardown(&self) {
        let (peer, outbound, registration, capturing) = {
            let mut handles = self.handles.lock();
            (
                handles.peer.take(),
                handles.outbound.take(),
                handles.peer_stats.take(),
                std::mem::take(&mut handles.capturing),
            )
        };
        drop(registration);
        drop(outbound);
        if let Some(peer) = peer {
            if let Err(e) = peer.close().await {
                warn!("Failed to close peer connection: {}", e);
            }
        }
        if capturing {
            self.source.stop_capture().await;
        }
    }
}

/// Publishes one capture source to a WebRTC ingest service
pub struct Publisher {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<SessionState>,
}

/// Collects a [`Publisher`]'s collaborators and optional sinks
pub struct PublisherBuilder {
    source: Arc<dyn CaptureSource>,
    director: Arc<dyn DirectorClient>,
    connector: Arc<dyn SignalingConnector>,
    peers: Arc<dyn PeerConnectionFactory>,
    config: WebRtcConfig,
    stats: Option<Arc<PublisherStats>>,
    events: Option<Arc<EventBus>>,
}

impl PublisherBuilder {
    pub fn config(mut self, config: WebRtcConfig) -> Self {
        self.config = config;
        self
    }

    /// Report peer connection counters into `stats`
    pub fn stats(mut self, stats: Arc<PublisherStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Publish events on an existing bus instead of a private one
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Publisher {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        Publisher {
            shared: Arc::new(Shared {
                source: self.source,
                director: self.director,
                connector: self.connector,
                peers: self.peers,
                config: self.config,
                stats: self.stats,
                events: self.events.unwrap_or_else(|| Arc::new(EventBus::new())),
                state_tx,
                handles: Mutex::new(SessionHandles::default()),
            }),
            state_rx,
        }
    }
}

impl Publisher {
    pub fn builder(
        source: Arc<dyn CaptureSource>,
        director: Arc<dyn DirectorClient>,
        connector: Arc<dyn SignalingConnector>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> PublisherBuilder {
        PublisherBuilder {
            source,
            director,
            connector,
            peers,
            config: WebRtcConfig::default(),
            stats: None,
            events: None,
        }
    }

    /// Publisher with a private event bus and no stats reporting
    pub fn new(
        source: Arc<dyn CaptureSource>,
        director: Arc<dyn DirectorClient>,
        connector: Arc<dyn SignalingConnector>,
        peers: Arc<dyn PeerConnectionFactory>,
        config: WebRtcConfig,
    ) -> Self {
        Self::builder(source, director, connector, peers).config(config).build()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.shared.events
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// True iff a peer connection currently exists
    pub fn is_publishing(&self) -> bool {
        self.shared.handles.lock().peer.is_some()
    }

    /// Identifier of the current or last publish attempt
    pub fn attempt_id(&self) -> Option<Uuid> {
        self.shared.handles.lock().attempt
    }

    /// Authenticate with the director and start publishing
    pub fn publish(&self) -> Result<()> {
        self.start(None)
    }

    /// Start publishing on a known signaling endpoint, skipping the director
    pub fn publish_with_endpoint(&self, ws_url: &str, jwt: &str) -> Result<()> {
        self.start(Some(PublishEndpoint {
            jwt: jwt.to_string(),
            ws_url: ws_url.to_string(),
        }))
    }

    fn start(&self, endpoint: Option<PublishEndpoint>) -> Result<()> {
        if self.shared.source.stream_name().is_empty() {
            return Err(PublisherError::Config("stream name is empty".to_string()));
        }

        let mut handles = self.shared.handles.lock();
        let state = self.shared.state();
        if !state.can_publish() {
            return Err(PublisherError::AlreadyPublishing);
        }
        if let Some(task) = handles.task.take() {
            // Previous attempt ended in Error and already tore itself down
            task.abort();
        }

        let cancel = CancellationToken::new();
        let attempt = Uuid::new_v4();
        handles.cancel = Some(cancel.clone());
        handles.attempt = Some(attempt);
        info!(
            "Publish attempt {} for '{}'",
            attempt,
            self.shared.source.stream_name()
        );
        self.shared.set_state(if endpoint.is_some() {
            SessionState::Connecting
        } else {
            SessionState::Authenticating
        });

        let shared = self.shared.clone();
        handles.task = Some(tokio::spawn(async move {
            let failure = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Publish attempt cancelled");
                    None
                }
                failure = run_session(&shared, endpoint, &cancel) => failure,
            };
            if let Some(event) = failure {
                shared.fail(&cancel, event).await;
            }
        }));
        Ok(())
    }

    /// Stop publishing and return to `Idle`
    ///
    /// Does not wait for an outstanding answer.
    pub async fn unpublish(&self) -> Result<()> {
        let (cancel, task) = {
            let mut handles = self.shared.handles.lock();
            if self.shared.state() == SessionState::Idle {
                return Err(PublisherError::NotPublishing);
            }
            (handles.cancel.take(), handles.task.take())
        };

        self.shared.set_state(SessionState::Closing);
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared.teardown().await;
        self.shared.set_state(SessionState::Idle);
        self.shared.events.publish(PublisherEvent::Unpublished {
            stream_name: self.shared.source.stream_name().to_string(),
        });
        Ok(())
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        let mut handles = self.shared.handles.lock();
        if let Some(cancel) = handles.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = handles.task.take() {
            task.abort();
        }
    }
}

/// Drive one attempt up to and through the signaling loop
///
/// Returns the failure to report, or `None` when the attempt was cancelled.
/// Teardown after a failure happens in the caller, outside cancellation.
async fn run_session(
    shared: &Arc<Shared>,
    endpoint: Option<PublishEndpoint>,
    cancel: &CancellationToken,
) -> Option<PublisherEvent> {
    let stream_name = shared.source.stream_name().to_string();

    let endpoint = match endpoint {
        Some(endpoint) => endpoint,
        None => match shared
            .director
            .authenticate(shared.source.url(), &stream_name, shared.source.publishing_token())
            .await
        {
            Ok(endpoint) => endpoint,
            Err(e) => {
                let (status, message) = match e {
                    PublisherError::Auth { status, message } => (status, message),
                    other => (0, other.to_string()),
                };
                return Some(PublisherEvent::AuthenticationFailed { status, message });
            }
        },
    };

    if !shared.advance(cancel, SessionState::Connecting) {
        return None;
    }
    let url = signaling_url(&endpoint.ws_url, &endpoint.jwt);
    let mut channel = match shared.connector.connect(&url).await {
        Ok(channel) => channel,
        Err(e) => return Some(connection_error(e.to_string())),
    };
    shared.handles.lock().outbound = Some(channel.outbound.clone());

    if !shared.advance(cancel, SessionState::Negotiating) {
        return None;
    }
    let peer = match negotiate(shared, &stream_name).await {
        Ok((peer, command)) => {
            if channel.outbound.send(command).is_err() {
                return Some(connection_error("signaling socket closed before offer was sent"));
            }
            peer
        }
        Err(e) => return Some(connection_error(e.to_string())),
    };

    if !shared.advance(cancel, SessionState::AwaitingAnswer) {
        return None;
    }

    let mut peer_state = peer.state_watch();
    let mut peer_state_open = true;
    loop {
        tokio::select! {
            event = channel.inbound.recv() => {
                let message = match event.unwrap_or(SignalingEvent::Closed(None)) {
                    SignalingEvent::Message(text) => text,
                    SignalingEvent::Closed(reason) => {
                        return Some(connection_error(format!(
                            "signaling socket closed{}",
                            reason.map(|r| format!(": {}", r)).unwrap_or_default()
                        )));
                    }
                    SignalingEvent::Error(message) => return Some(connection_error(message)),
                };
                if let Err(e) = handle_message(shared, &peer, &stream_name, &message, cancel).await {
                    return Some(connection_error(e.to_string()));
                }
            }
            changed = peer_state.changed(), if peer_state_open => {
                if changed.is_err() {
                    peer_state_open = false;
                    continue;
                }
                let state = *peer_state.borrow();
                if state == ConnectionState::Failed {
                    return Some(connection_error("peer connection failed"));
                }
            }
        }
    }
}

fn connection_error(message: impl Into<String>) -> PublisherEvent {
    PublisherEvent::ConnectionError {
        message: message.into(),
    }
}

/// Create the peer connection and the publish command carrying its offer
async fn negotiate(shared: &Arc<Shared>, stream_name: &str) -> Result<(Arc<dyn PeerConnection>, String)> {
    let peer = shared.peers.create(&shared.config).await?;
    {
        let mut handles = shared.handles.lock();
        handles.peer_stats = match (&shared.stats, peer.stats_source()) {
            (Some(stats), Some(source)) => Some(stats.register_source(source)),
            _ => None,
        };
        handles.peer = Some(peer.clone());
        handles.capturing = true;
    }

    let track = shared.source.start_capture().await?;
    peer.add_send_only_track(track).await?;
    let offer = peer.create_offer().await?;
    let local = peer.set_local_description(&offer).await?;
    debug!("Local description set ({} bytes)", local.len());

    let trans_id = rand::random::<u32>();
    let command = SignalingCommand::publish(trans_id, stream_name, local).to_json()?;
    Ok((peer, command))
}

async fn handle_message(
    shared: &Arc<Shared>,
    peer: &Arc<dyn PeerConnection>,
    stream_name: &str,
    text: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let message = match InboundMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Dropping malformed signaling message: {}", e);
            return Ok(());
        }
    };

    match message {
        InboundMessage::Response { sdp } => {
            if shared.state() != SessionState::AwaitingAnswer {
                debug!("Ignoring response outside of negotiation");
                return Ok(());
            }
            peer.set_remote_description(&sdp).await?;
            if shared.advance(cancel, SessionState::Connected) {
                shared.events.publish(PublisherEvent::Published {
                    stream_name: stream_name.to_string(),
                });
            }
        }
        InboundMessage::Error(data) => {
            warn!("Signaling error from server: {}", data);
            shared.events.publish(PublisherEvent::SignalingMessage {
                kind: "error".to_string(),
                data,
            });
        }
        InboundMessage::Event(data) => {
            debug!("Signaling event: {}", data);
            shared.events.publish(PublisherEvent::SignalingMessage {
                kind: "event".to_string(),
                data,
            });
        }
        InboundMessage::Unknown(kind) => {
            debug!("Ignoring signaling message of type '{}'", kind);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::VideoCodecType;
    use crate::webrtc::video_track::VideoTrack;
    use crate::webrtc::websocket::SignalingChannel;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use crate::stats::{RtcStatsSample, StatsSource};
    use tokio::sync::{broadcast, mpsc, Semaphore};
    use tokio_test::{assert_err, assert_ok};
    use webrtc::track::track_local::TrackLocal;

    struct FakeSource {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl CaptureSource for FakeSource {
        async fn start_capture(&self) -> Result<Arc<dyn TrackLocal + Send + Sync>> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(VideoTrack::new(VideoCodecType::H264, 60, &WebRtcConfig::default()).as_track_local())
        }

        async fn stop_capture(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn stream_name(&self) -> &str {
            "scene"
        }

        fn publishing_token(&self) -> &str {
            "pub-token"
        }

        fn url(&self) -> &str {
            "https://director.test/publish"
        }
    }

    struct FakeDirector {
        response: Mutex<Option<Result<PublishEndpoint>>>,
        calls: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl DirectorClient for FakeDirector {
        async fn authenticate(&self, url: &str, stream_name: &str, token: &str) -> Result<PublishEndpoint> {
            self.calls
                .lock()
                .push((url.to_string(), stream_name.to_string(), token.to_string()));
            self.response
                .lock()
                .take()
                .unwrap_or_else(|| Err(PublisherError::Transport("no response".into())))
        }
    }

    /// Server side of a fake socket
    struct ServerEnd {
        from_client: mpsc::UnboundedReceiver<String>,
        to_client: mpsc::UnboundedSender<SignalingEvent>,
    }

    #[derive(Default)]
    struct FakeConnector {
        urls: Mutex<Vec<String>>,
        server: Mutex<Option<ServerEnd>>,
    }

    #[async_trait]
    impl SignalingConnector for FakeConnector {
        async fn connect(&self, url: &str) -> Result<SignalingChannel> {
            self.urls.lock().push(url.to_string());
            let (outbound, from_client) = mpsc::unbounded_channel();
            let (to_client, inbound) = mpsc::unbounded_channel();
            *self.server.lock() = Some(ServerEnd { from_client, to_client });
            Ok(SignalingChannel { outbound, inbound })
        }
    }

    struct FakePeer {
        tracks: AtomicUsize,
        local: Mutex<Option<String>>,
        remote: Mutex<Option<String>>,
        closed: AtomicUsize,
        close_gate: Option<Arc<Semaphore>>,
        state_tx: watch::Sender<ConnectionState>,
    }

    struct SilentStats;

    #[async_trait]
    impl StatsSource for SilentStats {
        fn name(&self) -> &str {
            "fake-peer"
        }

        async fn collect(&self) -> Option<RtcStatsSample> {
            None
        }
    }

    #[async_trait]
    impl PeerConnection for FakePeer {
        async fn add_send_only_track(&self, _track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()> {
            self.tracks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn create_offer(&self) -> Result<String> {
            Ok("v=0 offer".to_string())
        }

        async fn set_local_description(&self, sdp: &str) -> Result<String> {
            *self.local.lock() = Some(sdp.to_string());
            Ok(format!("{} +candidates", sdp))
        }

        async fn set_remote_description(&self, sdp: &str) -> Result<()> {
            *self.remote.lock() = Some(sdp.to_string());
            Ok(())
        }

        fn state_watch(&self) -> watch::Receiver<ConnectionState> {
            self.state_tx.subscribe()
        }

        async fn close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.close_gate {
                let _permit = gate.acquire().await;
            }
            Ok(())
        }

        fn stats_source(&self) -> Option<Arc<dyn StatsSource>> {
            Some(Arc::new(SilentStats))
        }
    }

    #[derive(Default)]
    struct FakePeerFactory {
        created: Mutex<Vec<Arc<FakePeer>>>,
        /// Peers block in `close()` until a permit is added
        close_gate: Mutex<Option<Arc<Semaphore>>>,
    }

    #[async_trait]
    impl PeerConnectionFactory for FakePeerFactory {
        async fn create(&self, _config: &WebRtcConfig) -> Result<Arc<dyn PeerConnection>> {
            let (state_tx, _) = watch::channel(ConnectionState::New);
            let peer = Arc::new(FakePeer {
                tracks: AtomicUsize::new(0),
                local: Mutex::new(None),
                remote: Mutex::new(None),
                closed: AtomicUsize::new(0),
                close_gate: self.close_gate.lock().clone(),
                state_tx,
            });
            self.created.lock().push(peer.clone());
            Ok(peer)
        }
    }

    struct Fixture {
        publisher: Publisher,
        source: Arc<FakeSource>,
        director: Arc<FakeDirector>,
        connector: Arc<FakeConnector>,
        peers: Arc<FakePeerFactory>,
    }

    fn fixture(response: Result<PublishEndpoint>) -> Fixture {
        let source = Arc::new(FakeSource {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        });
        let director = Arc::new(FakeDirector {
            response: Mutex::new(Some(response)),
            calls: Mutex::new(Vec::new()),
        });
        let connector = Arc::new(FakeConnector::default());
        let peers = Arc::new(FakePeerFactory::default());
        let publisher = Publisher::new(
            source.clone(),
            director.clone(),
            connector.clone(),
            peers.clone(),
            WebRtcConfig::default(),
        );
        Fixture {
            publisher,
            source,
            director,
            connector,
            peers,
        }
    }

    fn granted() -> Result<PublishEndpoint> {
        Ok(PublishEndpoint {
            jwt: "abc".to_string(),
            ws_url: "wss://x/y".to_string(),
        })
    }

    async fn wait_for(publisher: &Publisher, state: SessionState) {
        let mut rx = publisher.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    fn take_server(connector: &FakeConnector) -> ServerEnd {
        connector.server.lock().take().unwrap()
    }

    async fn next_event(
        rx: &mut broadcast::Receiver<PublisherEvent>,
        matches: impl Fn(&PublisherEvent) -> bool,
    ) -> PublisherEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not received")
    }

    #[tokio::test]
    async fn test_happy_path() {
        let f = fixture(granted());
        assert!(f.publisher.attempt_id().is_none());
        assert_ok!(f.publisher.publish());
        wait_for(&f.publisher, SessionState::AwaitingAnswer).await;
        assert!(f.publisher.attempt_id().is_some());

        assert_eq!(
            f.director.calls.lock()[0],
            (
                "https://director.test/publish".to_string(),
                "scene".to_string(),
                "pub-token".to_string()
            )
        );
        assert_eq!(f.connector.urls.lock()[0], "wss://x/y?token=abc");
        assert!(f.publisher.is_publishing());

        let mut server = take_server(&f.connector);
        let sent: serde_json::Value = serde_json::from_str(&server.from_client.recv().await.unwrap()).unwrap();
        assert_eq!(sent["type"], "cmd");
        assert_eq!(sent["name"], "publish");
        assert!(sent["transId"].is_u64());
        assert_eq!(sent["data"]["name"], "scene");
        assert_eq!(sent["data"]["sdp"], "v=0 offer +candidates");

        let mut events = f.publisher.events().subscribe();
        server
            .to_client
            .send(SignalingEvent::Message(
                r#"{"type":"response","data":{"sdp":"v=0..."}}"#.to_string(),
            ))
            .unwrap();
        wait_for(&f.publisher, SessionState::Connected).await;

        let peer = f.peers.created.lock()[0].clone();
        assert_eq!(peer.remote.lock().as_deref(), Some("v=0..."));
        assert_eq!(peer.local.lock().as_deref(), Some("v=0 offer"));
        assert_eq!(peer.tracks.load(Ordering::SeqCst), 1);
        assert_eq!(f.source.starts.load(Ordering::SeqCst), 1);
        assert!(f.publisher.is_publishing());
        next_event(&mut events, |e| matches!(e, PublisherEvent::Published { .. })).await;
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let f = fixture(Err(PublisherError::Auth {
            status: 403,
            message: "denied".to_string(),
        }));
        let mut events = f.publisher.events().subscribe();
        f.publisher.publish().unwrap();
        wait_for(&f.publisher, SessionState::Error).await;

        let event = next_event(&mut events, |e| {
            matches!(e, PublisherEvent::AuthenticationFailed { .. })
        })
        .await;
        assert_eq!(
            event,
            PublisherEvent::AuthenticationFailed {
                status: 403,
                message: "denied".to_string()
            }
        );
        assert!(f.connector.urls.lock().is_empty());
        assert!(!f.publisher.is_publishing());
        assert_eq!(f.source.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_and_informational_messages() {
        let f = fixture(granted());
        f.publisher.publish().unwrap();
        wait_for(&f.publisher, SessionState::AwaitingAnswer).await;
        let server = take_server(&f.connector);
        let mut events = f.publisher.events().subscribe();

        for text in [
            "{not json",
            r#"{"type":"response","data":{}}"#,
            r#"{"type":"mystery"}"#,
            r#"{"type":"event","data":{"name":"viewercount","count":3}}"#,
        ] {
            server.to_client.send(SignalingEvent::Message(text.to_string())).unwrap();
        }

        let event = next_event(&mut events, |e| {
            matches!(e, PublisherEvent::SignalingMessage { .. })
        })
        .await;
        assert!(matches!(event, PublisherEvent::SignalingMessage { kind, .. } if kind == "event"));
        assert_eq!(f.publisher.state(), SessionState::AwaitingAnswer);
        assert!(f.publisher.is_publishing());
    }

    #[tokio::test]
    async fn test_unpublish_during_negotiation() {
        let f = fixture(granted());
        f.publisher.publish().unwrap();
        wait_for(&f.publisher, SessionState::AwaitingAnswer).await;
        let err = assert_err!(f.publisher.publish());
        assert!(matches!(err, PublisherError::AlreadyPublishing));

        f.publisher.unpublish().await.unwrap();
        assert_eq!(f.publisher.state(), SessionState::Idle);
        assert!(!f.publisher.is_publishing());
        assert_eq!(f.source.stops.load(Ordering::SeqCst), 1);
        assert_eq!(f.peers.created.lock()[0].closed.load(Ordering::SeqCst), 1);
        let err = assert_err!(f.publisher.unpublish().await);
        assert!(matches!(err, PublisherError::NotPublishing));
    }

    #[tokio::test]
    async fn test_remote_close_is_error() {
        let f = fixture(granted());
        f.publisher.publish().unwrap();
        wait_for(&f.publisher, SessionState::AwaitingAnswer).await;
        let server = take_server(&f.connector);
        server.to_client.send(SignalingEvent::Closed(Some("bye".into()))).unwrap();

        wait_for(&f.publisher, SessionState::Error).await;
        assert!(!f.publisher.is_publishing());
        assert_eq!(f.source.stops.load(Ordering::SeqCst), 1);

        // A failed session can be published again
        f.publisher
            .publish_with_endpoint("wss://direct/ws", "jwt2")
            .unwrap();
        wait_for(&f.publisher, SessionState::AwaitingAnswer).await;
        assert_eq!(f.connector.urls.lock()[1], "wss://direct/ws?token=jwt2");
        assert_eq!(f.director.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unpublish_during_failure_teardown_stops_capture() {
        let f = fixture(granted());
        let gate = Arc::new(Semaphore::new(0));
        *f.peers.close_gate.lock() = Some(gate.clone());
        f.publisher.publish().unwrap();
        wait_for(&f.publisher, SessionState::AwaitingAnswer).await;

        let server = take_server(&f.connector);
        server.to_client.send(SignalingEvent::Closed(None)).unwrap();
        let peer = f.peers.created.lock()[0].clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while peer.closed.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("peer close not reached");

        let (unpublished, _) = tokio::join!(f.publisher.unpublish(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            gate.add_permits(1);
        });
        assert_ok!(unpublished);
        assert_eq!(f.source.stops.load(Ordering::SeqCst), 1);
        assert_eq!(f.publisher.state(), SessionState::Idle);
        assert!(!f.publisher.is_publishing());
    }

    #[tokio::test]
    async fn test_builder_wires_shared_bus_and_stats() {
        let source = Arc::new(FakeSource {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        });
        let director = Arc::new(FakeDirector {
            response: Mutex::new(Some(granted())),
            calls: Mutex::new(Vec::new()),
        });
        let bus = Arc::new(EventBus::new());
        let stats = PublisherStats::new();
        let publisher = Publisher::builder(
            source,
            director,
            Arc::new(FakeConnector::default()),
            Arc::new(FakePeerFactory::default()),
        )
        .events(bus.clone())
        .stats(stats.clone())
        .build();

        let mut events = bus.subscribe();
        publisher.publish().unwrap();
        wait_for(&publisher, SessionState::AwaitingAnswer).await;
        next_event(&mut events, |e| {
            matches!(e, PublisherEvent::StateChanged { state } if state == "awaiting_answer")
        })
        .await;
        assert_eq!(stats.source_count(), 1);

        publisher.unpublish().await.unwrap();
        assert_eq!(stats.source_count(), 0);
    }
}
