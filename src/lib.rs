//! render-publisher - publish GPU-rendered frames over WebRTC
//!
//! This crate captures render targets from a real-time 3D application,
//! encodes them with a hardware or software encoder, and publishes the
//! result to a Millicast-style WebRTC ingest service.

pub mod config;
pub mod error;
pub mod events;
pub mod gpu;
pub mod logging;
pub mod stats;
pub mod utils;
pub mod video;
pub mod webrtc;

pub use error::{PublisherError, Result};
