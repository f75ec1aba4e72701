//! WebSocket signaling transport
//!
//! A connection is exposed as a pair of channels: text frames to send, and
//! [`SignalingEvent`]s received. Dropping the outbound sender closes the
//! socket.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{PublisherError, Result};

/// Something that happened on the signaling socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Message(String),
    /// Remote closed the socket
    Closed(Option<String>),
    Error(String),
}

/// Open signaling connection
pub struct SignalingChannel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<SignalingEvent>,
}

/// Opens signaling connections
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SignalingChannel>;
}

/// `<ws_url>?token=<jwt>`
pub fn signaling_url(ws_url: &str, jwt: &str) -> String {
    let separator = if ws_url.contains('?') { '&' } else { '?' };
    format!("{}{}token={}", ws_url, separator, urlencoding::encode(jwt))
}

/// Connector backed by `tokio-tungstenite`
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<SignalingChannel> {
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| PublisherError::Transport(format!("WebSocket connect failed: {}", e)))?;
        info!("Signaling connected (HTTP {})", response.status());

        let (mut writer, mut reader) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = writer.send(Message::Text(text)).await {
                    warn!("Signaling send failed: {}", e);
                    break;
                }
            }
            let _ = writer.send(Message::Close(None)).await;
            debug!("Signaling writer finished");
        });

        tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                let event = match msg {
                    Ok(Message::Text(text)) => SignalingEvent::Message(text),
                    Ok(Message::Close(frame)) => {
                        let _ = inbound_tx.send(SignalingEvent::Closed(frame.map(|f| f.reason.to_string())));
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = inbound_tx.send(SignalingEvent::Error(e.to_string()));
                        return;
                    }
                };
                if inbound_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(SignalingEvent::Closed(None));
        });

        Ok(SignalingChannel {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
