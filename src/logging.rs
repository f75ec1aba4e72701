//! Tracing subscriber setup for hosts without their own

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Log level for the publisher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    /// Debug for the publisher, info for the WebRTC stack
    Verbose,
    Debug,
    Trace,
}

impl LogLevel {
    /// `EnvFilter` directive for this level
    pub fn filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "render_publisher=error,webrtc=error",
            LogLevel::Warn => "render_publisher=warn,webrtc=warn",
            LogLevel::Info => "render_publisher=info,webrtc=warn",
            LogLevel::Verbose => "render_publisher=debug,webrtc=info",
            LogLevel::Debug => "render_publisher=debug,webrtc=debug",
            LogLevel::Trace => "render_publisher=trace,webrtc=debug",
        }
    }
}

/// Install a global fmt subscriber
///
/// `RUST_LOG` takes priority over `level`. Does nothing beyond a message on
/// stderr if a subscriber is already installed.
pub fn init_logging(level: LogLevel) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.filter().into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_parse() {
        for level in [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Verbose,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            assert!(tracing_subscriber::EnvFilter::try_new(level.filter()).is_ok());
        }
        assert_eq!(serde_json::from_str::<LogLevel>("\"verbose\"").unwrap(), LogLevel::Verbose);
    }

    #[test]
    fn test_init_twice() {
        init_logging(LogLevel::Debug);
        init_logging(LogLevel::Info);
    }
}
