//! Host-memory GPU device
//!
//! Surfaces are BGRA8 byte buffers. Copies resample on the CPU. Fences can
//! either signal immediately or be held until [`MemoryDevice::retire`] is
//! called, which lets tests observe in-flight readbacks.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::{
    Fence, GpuBackend, GpuDevice, MappedSurface, NativeHandle, SamplerFilter, Surface, SurfaceDesc,
};
use crate::error::{PublisherError, Result};

/// GPU device backed by host memory
pub struct MemoryDevice {
    backend: GpuBackend,
    name: String,
    defer_fences: AtomicBool,
    pending_fences: Mutex<Vec<Fence>>,
    surfaces_created: AtomicUsize,
    surfaces_released: AtomicUsize,
    copies: AtomicUsize,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::with_backend(GpuBackend::Memory)
    }

    /// Report a different backend, to exercise backend-dependent paths
    pub fn with_backend(backend: GpuBackend) -> Self {
        Self {
            name: format!("host-memory ({})", backend),
            backend,
            defer_fences: AtomicBool::new(false),
            pending_fences: Mutex::new(Vec::new()),
            surfaces_created: AtomicUsize::new(0),
            surfaces_released: AtomicUsize::new(0),
            copies: AtomicUsize::new(0),
        }
    }

    /// Hold readback fences until [`retire`](Self::retire)
    pub fn set_defer_fences(&self, defer: bool) {
        self.defer_fences.store(defer, Ordering::SeqCst);
    }

    /// Signal every outstanding fence
    pub fn retire(&self) {
        for fence in self.pending_fences.lock().drain(..) {
            fence.signal();
        }
    }

    pub fn surfaces_created(&self) -> usize {
        self.surfaces_created.load(Ordering::SeqCst)
    }

    pub fn surfaces_released(&self) -> usize {
        self.surfaces_released.load(Ordering::SeqCst)
    }

    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    /// Create a render target filled with one BGRA color
    pub fn create_filled(&self, desc: &SurfaceDesc, bgra: [u8; 4]) -> Result<Surface> {
        let surface = self.create_surface(desc)?;
        let pixels = bgra
            .iter()
            .copied()
            .cycle()
            .take(desc.width as usize * desc.height as usize * 4)
            .collect::<Vec<u8>>();
        *host_pixels(&surface)?.write() = Bytes::from(pixels);
        Ok(surface)
    }

    /// Overwrite a host surface with tightly packed BGRA pixels
    pub fn upload(&self, surface: &Surface, pixels: Vec<u8>) -> Result<()> {
        let expected = surface.width() as usize * surface.height() as usize * 4;
        if pixels.len() != expected {
            return Err(PublisherError::Gpu(format!(
                "upload size mismatch: {} != {}",
                pixels.len(),
                expected
            )));
        }
        *host_pixels(surface)?.write() = Bytes::from(pixels);
        Ok(())
    }
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn host_pixels(surface: &Surface) -> Result<&Arc<RwLock<Bytes>>> {
    match surface.handle() {
        NativeHandle::Host(data) => Ok(data),
        other => Err(PublisherError::Gpu(format!(
            "surface {} is not host memory: {:?}",
            surface.id(),
            other
        ))),
    }
}

/// Resample a tightly packed BGRA image
fn resample(src: &[u8], sw: u32, sh: u32, dw: u32, dh: u32, filter: SamplerFilter) -> Vec<u8> {
    let (sw, sh, dw, dh) = (sw as usize, sh as usize, dw as usize, dh as usize);
    if sw == dw && sh == dh {
        return src.to_vec();
    }
    let mut out = vec![0u8; dw * dh * 4];
    if sw == 0 || sh == 0 {
        return out;
    }
    let px = |x: usize, y: usize, c: usize| src[(y * sw + x) * 4 + c] as f32;

    for y in 0..dh {
        for x in 0..dw {
            let dst = (y * dw + x) * 4;
            match filter {
                SamplerFilter::Point => {
                    let sx = (x * sw / dw).min(sw - 1);
                    let sy = (y * sh / dh).min(sh - 1);
                    let s = (sy * sw + sx) * 4;
                    out[dst..dst + 4].copy_from_slice(&src[s..s + 4]);
                }
                SamplerFilter::Bilinear => {
                    let fx = ((x as f32 + 0.5) * sw as f32 / dw as f32 - 0.5).max(0.0);
                    let fy = ((y as f32 + 0.5) * sh as f32 / dh as f32 - 0.5).max(0.0);
                    let x0 = (fx as usize).min(sw - 1);
                    let y0 = (fy as usize).min(sh - 1);
                    let x1 = (x0 + 1).min(sw - 1);
                    let y1 = (y0 + 1).min(sh - 1);
                    let tx = fx - x0 as f32;
                    let ty = fy - y0 as f32;
                    for c in 0..4 {
                        let top = px(x0, y0, c) * (1.0 - tx) + px(x1, y0, c) * tx;
                        let bottom = px(x0, y1, c) * (1.0 - tx) + px(x1, y1, c) * tx;
                        out[dst + c] = (top * (1.0 - ty) + bottom * ty).round() as u8;
                    }
                }
            }
        }
    }
    out
}

impl GpuDevice for MemoryDevice {
    fn backend(&self) -> GpuBackend {
        self.backend.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn create_surface(&self, desc: &SurfaceDesc) -> Result<Surface> {
        if desc.width == 0 || desc.height == 0 {
            return Err(PublisherError::Gpu(format!(
                "invalid surface size {}x{}",
                desc.width, desc.height
            )));
        }
        let len = desc.width as usize * desc.height as usize * 4;
        let handle = NativeHandle::Host(Arc::new(RwLock::new(Bytes::from(vec![0u8; len]))));
        self.surfaces_created.fetch_add(1, Ordering::SeqCst);
        trace!(
            "Created {}x{} {:?} host surface",
            desc.width,
            desc.height,
            desc.usage
        );
        Ok(Surface::new(*desc, handle, desc.width))
    }

    fn release_surface(&self, surface: &Surface) {
        self.surfaces_released.fetch_add(1, Ordering::SeqCst);
        trace!("Released host surface {}", surface.id());
    }

    fn copy_surface(&self, src: &Surface, dst: &Surface, filter: SamplerFilter) -> Result<()> {
        let pixels = host_pixels(src)?.read().clone();
        let scaled = resample(
            &pixels,
            src.width(),
            src.height(),
            dst.width(),
            dst.height(),
            filter,
        );
        *host_pixels(dst)?.write() = Bytes::from(scaled);
        self.copies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn copy_to_readback(&self, src: &Surface, dst: &Surface) -> Result<Fence> {
        self.copy_surface(src, dst, SamplerFilter::Point)?;
        if self.defer_fences.load(Ordering::SeqCst) {
            let fence = Fence::new();
            self.pending_fences.lock().push(fence.clone());
            Ok(fence)
        } else {
            Ok(Fence::signaled())
        }
    }

    fn lock_surface<'a>(&self, surface: &'a Surface) -> Result<MappedSurface<'a>> {
        let data = host_pixels(surface)?.read().clone();
        Ok(MappedSurface::from_host(
            data,
            surface.width(),
            surface.height(),
            surface.stride(),
        ))
    }

    fn map_readback<'a>(&self, surface: &'a Surface) -> Result<MappedSurface<'a>> {
        self.lock_surface(surface)
    }
}
