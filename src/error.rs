use thiserror::Error;

/// Publisher-wide error type
#[derive(Error, Debug)]
pub enum PublisherError {
    #[error("Authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("No encoder input available: {0}")]
    NoEncoderInput(String),

    #[error("All {0} frame slots are in flight")]
    SlotsExhausted(usize),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Already publishing")]
    AlreadyPublishing,

    #[error("Not publishing")]
    NotPublishing,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PublisherError {
    /// Resource errors indicate misconfiguration rather than a transient condition
    pub fn is_fatal_for_capture(&self) -> bool {
        matches!(
            self,
            PublisherError::NoEncoderInput(_) | PublisherError::Gpu(_) | PublisherError::Encoder(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, PublisherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_message() {
        let err = PublisherError::Auth {
            status: 403,
            message: "denied".to_string(),
        };
        assert_eq!(err.to_string(), "Authentication failed (403): denied");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PublisherError::NoEncoderInput("vulkan/intel".into()).is_fatal_for_capture());
        assert!(!PublisherError::SlotsExhausted(3).is_fatal_for_capture());
        assert!(!PublisherError::Transport("reset".into()).is_fatal_for_capture());
    }
}
