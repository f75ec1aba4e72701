//! Publisher event types
//!
//! Network and signaling failures are reported asynchronously through these
//! events rather than returned to the caller.

use serde::{Deserialize, Serialize};

/// Event broadcast by a publisher session
///
/// JSON structure like:
/// ```json
/// {
///   "event": "session.state_changed",
///   "data": { "state": "connected" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PublisherEvent {
    /// Session state machine moved to a new state
    #[serde(rename = "session.state_changed")]
    StateChanged {
        /// Lowercase state name, e.g. "authenticating", "connected"
        state: String,
    },

    /// Director rejected the publish request. Reported once, never retried.
    #[serde(rename = "session.authentication_failed")]
    AuthenticationFailed { status: u16, message: String },

    /// Remote answer applied, media is flowing
    #[serde(rename = "session.published")]
    Published { stream_name: String },

    /// Session torn down by the caller
    #[serde(rename = "session.unpublished")]
    Unpublished { stream_name: String },

    /// Remote `error` or `event` message. Logged, no state change.
    #[serde(rename = "signaling.message")]
    SignalingMessage {
        /// Message type as sent by the server
        kind: String,
        data: serde_json::Value,
    },

    /// WebSocket or peer connection failed, or the remote closed the session
    #[serde(rename = "session.connection_error")]
    ConnectionError { message: String },

    /// Encoder creation or encode failure on the capture path
    #[serde(rename = "capture.encoder_error")]
    EncoderError { message: String },
}

impl PublisherEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "session.state_changed",
            Self::AuthenticationFailed { .. } => "session.authentication_failed",
            Self::Published { .. } => "session.published",
            Self::Unpublished { .. } => "session.unpublished",
            Self::SignalingMessage { .. } => "signaling.message",
            Self::ConnectionError { .. } => "session.connection_error",
            Self::EncoderError { .. } => "capture.encoder_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_shape() {
        let event = PublisherEvent::AuthenticationFailed {
            status: 403,
            message: "denied".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "session.authentication_failed");
        assert_eq!(json["data"]["status"], 403);
        assert_eq!(event.event_name(), "session.authentication_failed");
    }
}
