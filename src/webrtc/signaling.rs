//! Signaling and director message types
//!
//! Director (HTTP):
//! ```json
//! { "data": { "jwt": "<token>", "urls": ["wss://..."] } }
//! ```
//!
//! Signaling (WebSocket text frames):
//! ```json
//! {"type":"cmd","transId":7,"name":"publish","data":{"name":"stream","sdp":"v=0..."}}
//! {"type":"response","data":{"sdp":"v=0..."}}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{PublisherError, Result};

/// Director publish request body
#[derive(Debug, Clone, Serialize)]
pub struct DirectorRequest {
    #[serde(rename = "streamName")]
    pub stream_name: String,
}

/// Director success response
#[derive(Debug, Clone, Deserialize)]
pub struct DirectorResponse {
    pub data: DirectorData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectorData {
    pub jwt: String,
    #[serde(default)]
    pub urls: Vec<String>,
}

/// Outbound signaling command
#[derive(Debug, Clone, Serialize)]
pub struct SignalingCommand {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "transId")]
    pub trans_id: u32,
    pub name: &'static str,
    pub data: PublishData,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishData {
    pub name: String,
    pub sdp: String,
}

impl SignalingCommand {
    /// `publish` command carrying the local offer
    pub fn publish(trans_id: u32, stream_name: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            kind: "cmd",
            trans_id,
            name: "publish",
            data: PublishData {
                name: stream_name.into(),
                sdp: sdp.into(),
            },
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Inbound signaling message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Answer to the publish command
    Response { sdp: String },
    /// Remote error report
    Error(serde_json::Value),
    /// Informational event
    Event(serde_json::Value),
    /// Unrecognized type, ignored
    Unknown(String),
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl InboundMessage {
    /// Parse a text frame
    ///
    /// Invalid JSON, a missing `type`, or a `response` without `data.sdp`
    /// is an error; the caller drops the message.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawMessage = serde_json::from_str(text)?;
        match raw.kind.as_str() {
            "response" => {
                let sdp = raw
                    .data
                    .get("sdp")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| PublisherError::Signaling("response without data.sdp".to_string()))?;
                Ok(InboundMessage::Response { sdp: sdp.to_string() })
            }
            "error" => Ok(InboundMessage::Error(raw.data)),
            "event" => Ok(InboundMessage::Event(raw.data)),
            other => Ok(InboundMessage::Unknown(other.to_string())),
        }
    }
}
