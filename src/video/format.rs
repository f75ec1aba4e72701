//! Pixel format, resolution and rotation definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel formats that flow through the capture pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// Packed 4-channel B8G8R8A8, the render target format
    Bgra8,
    /// Planar YUV 4:2:0 (I420), the software encoder input
    I420,
    /// Semi-planar YUV 4:2:0 (Y plane + interleaved UV)
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, None for planar ones
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Bgra8 => Some(4),
            PixelFormat::I420 | PixelFormat::Nv12 => None,
        }
    }

    /// Expected frame size in bytes for a tightly packed frame
    pub fn frame_size(&self, resolution: Resolution) -> usize {
        let w = resolution.width as usize;
        let h = resolution.height as usize;
        match self {
            PixelFormat::Bgra8 => w * h * 4,
            PixelFormat::I420 | PixelFormat::Nv12 => {
                let chroma = w.div_ceil(2) * h.div_ceil(2);
                w * h + chroma * 2
            }
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Bgra8 => "BGRA8",
            PixelFormat::I420 => "I420",
            PixelFormat::Nv12 => "NV12",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BGRA8" | "BGRA" | "B8G8R8A8" => Ok(PixelFormat::Bgra8),
            "I420" | "YUV420" => Ok(PixelFormat::I420),
            "NV12" => Ok(PixelFormat::Nv12),
            _ => Err(format!("Unknown pixel format: {}", s)),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Both dimensions non-zero
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Frame rotation. Captured render targets are never rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    None,
    Rotate90,
    Rotate180,
    Rotate270,
}
