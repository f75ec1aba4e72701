//! GPU to CPU readback
//!
//! Two strategies feed the software encode path:
//!
//! - [`SyncReadback`] locks the surface and converts inline. The lock blocks
//!   until prior GPU work on the surface has retired.
//! - [`AsyncTextureReadback`] copies into a staging surface, then into a
//!   CPU-mappable readback surface signalled by a fence. The completion runs
//!   in the same render command, once the fence signals.
//!
//! Mapped pixels borrow the readback and are unmapped when the
//! [`MappedSurface`] drops, so they cannot be held across the next
//! `schedule_copy`.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::error::{PublisherError, Result};
use crate::gpu::{
    Fence, GpuDevice, MappedSurface, RenderQueue, SamplerFilter, Surface, SurfaceDesc, SurfaceUsage,
};
use crate::stats::PublisherStats;
use crate::video::convert::{bgra_to_i420, I420Buffer};
use crate::video::format::Resolution;

/// Longest wait for a readback fence before the frame is dropped
const FENCE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lock-and-convert readback
pub struct SyncReadback {
    device: Arc<dyn GpuDevice>,
    stats: Option<Arc<PublisherStats>>,
}

impl SyncReadback {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self { device, stats: None }
    }

    pub fn with_stats(mut self, stats: Arc<PublisherStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Read `surface` and convert it to I420, blocking on the GPU
    pub fn read_i420(&self, surface: &Surface) -> Result<I420Buffer> {
        if let Some(stats) = &self.stats {
            stats.mark_readback_start();
        }
        let mapped = self.device.lock_surface(surface)?;
        let buffer = bgra_to_i420(&mapped, mapped.width(), mapped.height(), mapped.stride())?;
        drop(mapped);
        if let Some(stats) = &self.stats {
            stats.mark_readback_end();
        }
        Ok(buffer)
    }
}

/// Completion invoked with `(pixels, width, height, stride_in_pixels)`
pub type ReadbackCallback = Box<dyn FnOnce(&[u8], u32, u32, u32) + Send>;

/// Fenced readback through reusable staging and readback surfaces
pub struct AsyncTextureReadback {
    device: Arc<dyn GpuDevice>,
    staging: Option<Surface>,
    readback: Option<Surface>,
    fence: Option<Fence>,
    stats: Option<Arc<PublisherStats>>,
    reinitializations: u64,
}

impl AsyncTextureReadback {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            staging: None,
            readback: None,
            fence: None,
            stats: None,
            reinitializations: 0,
        }
    }

    pub fn with_stats(mut self, stats: Arc<PublisherStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Times the staging surfaces were (re)built
    pub fn reinitializations(&self) -> u64 {
        self.reinitializations
    }

    fn current_resolution(&self) -> Option<Resolution> {
        self.readback.as_ref().map(|s| s.resolution())
    }

    fn initialize(&mut self, resolution: Resolution) -> Result<()> {
        if let Some(old) = self.staging.take() {
            self.device.release_surface(&old);
        }
        if let Some(old) = self.readback.take() {
            self.device.release_surface(&old);
        }
        let staging = self.device.create_surface(&SurfaceDesc::new(
            resolution.width,
            resolution.height,
            SurfaceUsage::Staging,
        ))?;
        let readback = self.device.create_surface(&SurfaceDesc::new(
            resolution.width,
            resolution.height,
            SurfaceUsage::CpuReadback,
        ))?;
        self.staging = Some(staging);
        self.readback = Some(readback);
        self.reinitializations += 1;
        debug!("Readback surfaces initialized at {}", resolution);
        Ok(())
    }

    /// Copy `src` toward the readback surface
    ///
    /// Staging surfaces are rebuilt only when the source size changes.
    pub fn schedule_copy(&mut self, src: &Surface) -> Result<()> {
        if self.current_resolution() != Some(src.resolution()) {
            self.initialize(src.resolution())?;
        }
        let (Some(staging), Some(readback)) = (&self.staging, &self.readback) else {
            return Err(PublisherError::Gpu("readback surfaces missing".to_string()));
        };
        if let Some(stats) = &self.stats {
            stats.mark_readback_start();
        }
        self.device.copy_surface(src, staging, SamplerFilter::Point)?;
        self.fence = Some(self.device.copy_to_readback(staging, readback)?);
        trace!("Scheduled readback of surface {}", src.id());
        Ok(())
    }

    /// Whether the last scheduled copy has completed
    pub fn poll(&self) -> bool {
        self.fence.as_ref().is_some_and(|f| f.is_signaled())
    }

    /// Map the readback surface
    pub fn map(&self) -> Result<MappedSurface<'_>> {
        let readback = self
            .readback
            .as_ref()
            .ok_or_else(|| PublisherError::Gpu("no readback scheduled".to_string()))?;
        if !self.poll() {
            return Err(PublisherError::Gpu("readback not complete".to_string()));
        }
        let mapped = self.device.map_readback(readback)?;
        if let Some(stats) = &self.stats {
            stats.mark_readback_end();
        }
        Ok(mapped)
    }

    /// Copy `src`, wait for its fence and run `callback` on the mapped pixels
    ///
    /// Must run on the render queue. The copy and its completion happen in
    /// one step so a later copy cannot overwrite the readback surface first.
    /// Gives up when the owner drops the readback while the fence is pending.
    pub fn copy_and_complete(
        readback: &Arc<Mutex<AsyncTextureReadback>>,
        src: &Surface,
        callback: ReadbackCallback,
    ) {
        if let Err(e) = readback.lock().schedule_copy(src) {
            warn!("Readback copy failed: {}", e);
            return;
        }

        let deadline = Instant::now() + FENCE_TIMEOUT;
        while !readback.lock().poll() {
            if Arc::strong_count(readback) == 1 {
                trace!("Readback dropped while its fence was pending");
                return;
            }
            if Instant::now() >= deadline {
                warn!("Readback fence not signalled after {:?}, dropping frame", FENCE_TIMEOUT);
                return;
            }
            std::thread::yield_now();
        }

        let guard = readback.lock();
        let mapped = match guard.map() {
            Ok(mapped) => mapped,
            Err(e) => {
                warn!("Readback map failed: {}", e);
                return;
            }
        };
        callback(&mapped[..], mapped.width(), mapped.height(), mapped.stride());
    }

    /// Enqueue [`copy_and_complete`](Self::copy_and_complete) on the render queue
    ///
    /// Skipped if the readback was dropped before the command runs.
    pub fn readback_async(
        readback: &Arc<Mutex<AsyncTextureReadback>>,
        queue: &RenderQueue,
        src: Surface,
        callback: ReadbackCallback,
    ) {
        let weak = Arc::downgrade(readback);
        queue.enqueue(move || {
            if let Some(readback) = weak.upgrade() {
                AsyncTextureReadback::copy_and_complete(&readback, &src, callback);
            }
        });
    }
}

impl Drop for AsyncTextureReadback {
    fn drop(&mut self) {
        for surface in [self.staging.take(), self.readback.take()].into_iter().flatten() {
            self.device.release_surface(&surface);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::MemoryDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_sync_readback_converts() {
        let device = Arc::new(MemoryDevice::new());
        let surface = device
            .create_filled(&SurfaceDesc::new(4, 2, SurfaceUsage::RenderTarget), [0, 0, 0, 255])
            .unwrap();
        let stats = PublisherStats::new();
        let readback = SyncReadback::new(device.clone()).with_stats(stats.clone());
        let i420 = readback.read_i420(&surface).unwrap();
        assert_eq!(i420.resolution(), Resolution::new(4, 2));
        assert!(i420.y_plane().iter().all(|&y| y == 16));
        assert!(stats.timings().readback_end_us >= stats.timings().readback_start_us);
    }

    #[test]
    fn test_surfaces_reused_until_resize() {
        let device = Arc::new(MemoryDevice::new());
        let mut readback = AsyncTextureReadback::new(device.clone());
        let small = device
            .create_surface(&SurfaceDesc::new(8, 8, SurfaceUsage::RenderTarget))
            .unwrap();
        let large = device
            .create_surface(&SurfaceDesc::new(16, 8, SurfaceUsage::RenderTarget))
            .unwrap();

        for _ in 0..5 {
            readback.schedule_copy(&small).unwrap();
        }
        assert_eq!(readback.reinitializations(), 1);
        readback.schedule_copy(&large).unwrap();
        assert_eq!(readback.reinitializations(), 2);
        assert_eq!(device.surfaces_released(), 2);
    }

    #[test]
    fn test_map_requires_signalled_fence() {
        let device = Arc::new(MemoryDevice::new());
        device.set_defer_fences(true);
        let src = device
            .create_filled(&SurfaceDesc::new(2, 2, SurfaceUsage::RenderTarget), [1, 2, 3, 4])
            .unwrap();
        let mut readback = AsyncTextureReadback::new(device.clone());
        assert!(readback.map().is_err());

        readback.schedule_copy(&src).unwrap();
        assert!(!readback.poll());
        assert!(readback.map().is_err());

        device.retire();
        assert!(readback.poll());
        let mapped = readback.map().unwrap();
        assert_eq!(&mapped[..4], &[1, 2, 3, 4]);
        assert_eq!((mapped.width(), mapped.height(), mapped.stride()), (2, 2, 2));
    }

    #[test]
    fn test_readback_async_completion() {
        let device = Arc::new(MemoryDevice::new());
        let queue = RenderQueue::new("readback-test").unwrap();
        let readback = Arc::new(Mutex::new(AsyncTextureReadback::new(device.clone())));
        let src = device
            .create_filled(&SurfaceDesc::new(6, 4, SurfaceUsage::RenderTarget), [9, 9, 9, 255])
            .unwrap();

        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        AsyncTextureReadback::readback_async(
            &readback,
            &queue,
            src,
            Box::new(move |pixels, w, h, stride| {
                *s.lock() = Some((pixels.len(), w, h, stride, pixels[0]));
            }),
        );
        queue.flush_blocking();
        assert_eq!(*seen.lock(), Some((6 * 4 * 4, 6, 4, 6, 9)));
    }

    #[test]
    fn test_queued_readbacks_keep_their_pixels() {
        let device = Arc::new(MemoryDevice::new());
        let queue = RenderQueue::new("readback-test").unwrap();
        let readback = Arc::new(Mutex::new(AsyncTextureReadback::new(device.clone())));
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        queue.enqueue(move || {
            let _ = gate_rx.recv();
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        for value in [10u8, 200] {
            let src = device
                .create_filled(&SurfaceDesc::new(2, 2, SurfaceUsage::RenderTarget), [value, value, value, 255])
                .unwrap();
            let s = seen.clone();
            AsyncTextureReadback::readback_async(
                &readback,
                &queue,
                src,
                Box::new(move |pixels, _, _, _| s.lock().push(pixels[0])),
            );
        }
        gate_tx.send(()).unwrap();
        queue.flush_blocking();
        assert_eq!(*seen.lock(), vec![10, 200]);
    }

    #[test]
    fn test_pending_fence_abandoned_on_drop() {
        let device = Arc::new(MemoryDevice::new());
        device.set_defer_fences(true);
        let readback = Arc::new(Mutex::new(AsyncTextureReadback::new(device.clone())));
        let src = device
            .create_surface(&SurfaceDesc::new(2, 2, SurfaceUsage::RenderTarget))
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let owner = readback.clone();
        let worker = std::thread::spawn(move || {
            AsyncTextureReadback::copy_and_complete(
                &readback,
                &src,
                Box::new(move |_, _, _, _| {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            );
        });
        while device.copies() < 2 {
            std::thread::yield_now();
        }
        drop(owner);
        worker.join().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_completion_skipped_after_drop() {
        let device = Arc::new(MemoryDevice::new());
        let queue = RenderQueue::new("readback-test").unwrap();
        let readback = Arc::new(Mutex::new(AsyncTextureReadback::new(device.clone())));
        let src = device
            .create_surface(&SurfaceDesc::new(2, 2, SurfaceUsage::RenderTarget))
            .unwrap();

        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        queue.enqueue(move || {
            let _ = gate_rx.recv();
        });

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        AsyncTextureReadback::readback_async(
            &readback,
            &queue,
            src,
            Box::new(move |_, _, _, _| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        drop(readback);
        gate_tx.send(()).unwrap();
        queue.flush_blocking();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
