//! Video capture and encode path
//!
//! Render targets are copied into pooled GPU slots, wrapped as frames and
//! handed to a hardware or software encoder; encoded packets flow to the
//! transport through the send pipeline.

pub mod adapter;
pub mod capture;
pub mod context;
pub mod convert;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod pipeline;
pub mod pool;
pub mod readback;

pub use adapter::{AdaptedFrame, VideoAdapter};
pub use capture::{CaptureAdapter, VideoSink};
pub use context::{CapturerInput, EncoderContext, DEFAULT_MAX_BUFFERS};
pub use convert::{bgra_to_i420, I420Buffer};
pub use encoder::{EncoderFactory, VideoCodecType, VideoEncoder};
pub use format::{PixelFormat, Resolution, Rotation};
pub use frame::{GpuFrameBuffer, VideoFrame};
pub use pipeline::{PacketSink, SendPipeline};
pub use pool::{EncoderInput, FrameId, InputFrame};
pub use readback::{AsyncTextureReadback, SyncReadback};
