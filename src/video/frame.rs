//! Video frame data structures
//!
//! A [`VideoFrame`] is what the encoder receives: a capture timestamp and a
//! shared [`GpuFrameBuffer`]. The buffer keeps its slot identity and the
//! owning [`EncoderContext`] alive; the identity returns to the pool when
//! the last frame referencing the buffer drops.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use super::context::EncoderContext;
use super::convert::I420Buffer;
use super::format::{Resolution, Rotation};
use super::pool::{EncoderInput, FrameId, InputFrame};
use super::readback::SyncReadback;
use crate::error::Result;
use crate::gpu::Surface;

/// Frame buffer backed by a GPU slot surface
pub struct GpuFrameBuffer {
    surface: Surface,
    input: InputFrame,
    context: Arc<EncoderContext>,
    /// Planar copy, filled by the first readback
    i420: Mutex<Option<Arc<I420Buffer>>>,
}

impl GpuFrameBuffer {
    pub fn new(surface: Surface, input: InputFrame, context: Arc<EncoderContext>) -> Self {
        Self {
            surface,
            input,
            context,
            i420: Mutex::new(None),
        }
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn input_frame(&self) -> &InputFrame {
        &self.input
    }

    pub fn frame_id(&self) -> FrameId {
        self.input.id()
    }

    /// Allocator the hardware encoder binds its session to
    pub fn encoder_input(&self) -> &Arc<EncoderInput> {
        self.input.encoder_input()
    }

    pub fn context(&self) -> &Arc<EncoderContext> {
        &self.context
    }

    pub fn resolution(&self) -> Resolution {
        self.surface.resolution()
    }

    pub fn width(&self) -> u32 {
        self.surface.width()
    }

    pub fn height(&self) -> u32 {
        self.surface.height()
    }

    /// I420 pixels, reading the surface back synchronously on first use
    pub fn to_i420(&self) -> Result<Arc<I420Buffer>> {
        if let Some(buffer) = self.i420.lock().as_ref() {
            return Ok(buffer.clone());
        }
        let buffer = Arc::new(SyncReadback::new(self.context.device().clone()).read_i420(&self.surface)?);
        *self.i420.lock() = Some(buffer.clone());
        Ok(buffer)
    }

    /// Store pixels produced by an asynchronous readback
    pub fn set_i420(&self, buffer: I420Buffer) -> Arc<I420Buffer> {
        let buffer = Arc::new(buffer);
        *self.i420.lock() = Some(buffer.clone());
        buffer
    }

    pub fn cached_i420(&self) -> Option<Arc<I420Buffer>> {
        self.i420.lock().clone()
    }
}

impl fmt::Debug for GpuFrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuFrameBuffer")
            .field("surface", &self.surface.id())
            .field("frame_id", &self.input.id())
            .field("resolution", &self.resolution())
            .finish()
    }
}

/// Frame handed to the encoder
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Capture time in microseconds of the monotonic capture clock
    pub timestamp_us: i64,
    pub rotation: Rotation,
    buffer: Arc<GpuFrameBuffer>,
}

impl VideoFrame {
    pub fn new(timestamp_us: i64, buffer: Arc<GpuFrameBuffer>) -> Self {
        Self {
            timestamp_us,
            rotation: Rotation::None,
            buffer,
        }
    }

    pub fn buffer(&self) -> &Arc<GpuFrameBuffer> {
        &self.buffer
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    pub fn resolution(&self) -> Resolution {
        self.buffer.resolution()
    }

    /// Capture time in milliseconds
    pub fn capture_time_ms(&self) -> i64 {
        self.timestamp_us / 1000
    }

    /// 90 kHz RTP timestamp derived from the capture time
    pub fn rtp_timestamp(&self) -> u32 {
        (self.timestamp_us * 90 / 1000) as u32
    }
}
