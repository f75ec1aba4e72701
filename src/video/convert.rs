//! Pixel format conversion
//!
//! Render targets are BGRA8. Software codecs want planar I420, produced here
//! with the BT.601 limited-range matrix and 2x2 chroma averaging.

use crate::error::{PublisherError, Result};
use crate::video::format::Resolution;

/// I420 buffer with separate Y, U, V planes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I420Buffer {
    /// Raw buffer containing all planes
    data: Vec<u8>,
    width: u32,
    height: u32,
    /// U plane offset
    u_offset: usize,
    /// V plane offset
    v_offset: usize,
}

impl I420Buffer {
    /// Create a zeroed buffer for the given resolution
    pub fn new(resolution: Resolution) -> Self {
        let width = resolution.width;
        let height = resolution.height;

        let y_size = width as usize * height as usize;
        let uv_size = chroma_width(width) * chroma_height(height);

        Self {
            data: vec![0u8; y_size + uv_size * 2],
            width,
            height,
            u_offset: y_size,
            v_offset: y_size + uv_size,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Luma stride in bytes
    pub fn stride_y(&self) -> usize {
        self.width as usize
    }

    /// Chroma stride in bytes
    pub fn stride_uv(&self) -> usize {
        chroma_width(self.width)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn y_plane(&self) -> &[u8] {
        &self.data[..self.u_offset]
    }

    pub fn u_plane(&self) -> &[u8] {
        &self.data[self.u_offset..self.v_offset]
    }

    pub fn v_plane(&self) -> &[u8] {
        &self.data[self.v_offset..]
    }

    /// All three planes, mutably
    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let (y, rest) = self.data.split_at_mut(self.u_offset);
        let (u, v) = rest.split_at_mut(self.v_offset - self.u_offset);
        (y, u, v)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn chroma_width(width: u32) -> usize {
    (width as usize).div_ceil(2)
}

fn chroma_height(height: u32) -> usize {
    (height as usize).div_ceil(2)
}

#[inline]
fn rgb_to_y(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8
}

#[inline]
fn rgb_to_u(r: i32, g: i32, b: i32) -> u8 {
    ((112 * b - 74 * g - 38 * r + 0x8080) >> 8) as u8
}

#[inline]
fn rgb_to_v(r: i32, g: i32, b: i32) -> u8 {
    ((112 * r - 94 * g - 18 * b + 0x8080) >> 8) as u8
}

/// Convert BGRA pixels with a row stride (in pixels) to a new I420 buffer
pub fn bgra_to_i420(src: &[u8], width: u32, height: u32, stride: u32) -> Result<I420Buffer> {
    let mut dst = I420Buffer::new(Resolution::new(width, height));
    bgra_to_i420_into(src, stride, &mut dst)?;
    Ok(dst)
}

/// Convert into an existing buffer, reusing its allocation
pub fn bgra_to_i420_into(src: &[u8], stride: u32, dst: &mut I420Buffer) -> Result<()> {
    let width = dst.width as usize;
    let height = dst.height as usize;
    let stride = stride as usize;

    if stride < width {
        return Err(PublisherError::Gpu(format!(
            "row stride {} shorter than width {}",
            stride, width
        )));
    }
    let required = if height == 0 {
        0
    } else {
        ((height - 1) * stride + width) * 4
    };
    if src.len() < required {
        return Err(PublisherError::Gpu(format!(
            "BGRA source too small: {} < {}",
            src.len(),
            required
        )));
    }

    let cw = chroma_width(dst.width);
    let ch = chroma_height(dst.height);
    let (y_plane, u_plane, v_plane) = dst.planes_mut();

    for row in 0..height {
        let line = &src[row * stride * 4..];
        let out = &mut y_plane[row * width..(row + 1) * width];
        for (col, y) in out.iter_mut().enumerate() {
            let p = col * 4;
            *y = rgb_to_y(line[p + 2] as i32, line[p + 1] as i32, line[p] as i32);
        }
    }

    for cy in 0..ch {
        for cx in 0..cw {
            let (mut r, mut g, mut b, mut n) = (0i32, 0i32, 0i32, 0i32);
            for dy in 0..2 {
                let y = cy * 2 + dy;
                if y >= height {
                    continue;
                }
                for dx in 0..2 {
                    let x = cx * 2 + dx;
                    if x >= width {
                        continue;
                    }
                    let p = (y * stride + x) * 4;
                    b += src[p] as i32;
                    g += src[p + 1] as i32;
                    r += src[p + 2] as i32;
                    n += 1;
                }
            }
            let (r, g, b) = ((r + n / 2) / n, (g + n / 2) / n, (b + n / 2) / n);
            u_plane[cy * cw + cx] = rgb_to_u(r, g, b);
            v_plane[cy * cw + cx] = rgb_to_v(r, g, b);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, stride: u32, bgra: [u8; 4]) -> Vec<u8> {
        let mut v = vec![0u8; (stride * height * 4) as usize];
        for y in 0..height as usize {
            for x in 0..width as usize {
                let p = (y * stride as usize + x) * 4;
                v[p..p + 4].copy_from_slice(&bgra);
            }
        }
        v
    }

    #[test]
    fn test_black_and_white_levels() {
        let black = bgra_to_i420(&solid(4, 4, 4, [0, 0, 0, 255]), 4, 4, 4).unwrap();
        assert!(black.y_plane().iter().all(|&y| y == 16));
        assert!(black.u_plane().iter().all(|&u| u == 128));
        assert!(black.v_plane().iter().all(|&v| v == 128));

        let white = bgra_to_i420(&solid(4, 4, 4, [255, 255, 255, 255]), 4, 4, 4).unwrap();
        assert!(white.y_plane().iter().all(|&y| y == 235));
        assert!(white.u_plane().iter().all(|&u| u == 128));
    }

    #[test]
    fn test_pure_red() {
        let red = bgra_to_i420(&solid(2, 2, 2, [0, 0, 255, 255]), 2, 2, 2).unwrap();
        assert_eq!(red.y_plane()[0], 82);
        assert_eq!(red.u_plane()[0], 90);
        assert_eq!(red.v_plane()[0], 240);
    }

    #[test]
    fn test_odd_dimensions_and_padded_stride() {
        let src = solid(5, 3, 8, [0, 0, 0, 255]);
        let buf = bgra_to_i420(&src, 5, 3, 8).unwrap();
        assert_eq!(buf.stride_uv(), 3);
        assert_eq!(buf.u_plane().len(), 3 * 2);
        assert_eq!(buf.len(), 15 + 12);
        assert!(buf.y_plane().iter().all(|&y| y == 16));
    }

    #[test]
    fn test_short_source_rejected() {
        assert!(bgra_to_i420(&[0u8; 8], 4, 4, 4).is_err());
        assert!(bgra_to_i420(&[0u8; 64], 4, 4, 2).is_err());
    }
}
