//! GPU abstraction consumed by the capture pipeline
//!
//! The pipeline never talks to a graphics API directly. It needs four
//! operations from the renderer: create a surface, copy one surface into
//! another (scaling if sizes differ), lock a surface for CPU reads, and copy
//! a surface into a CPU-addressable readback surface signalled by a fence.
//! [`GpuDevice`] is that seam. [`MemoryDevice`] implements it over host
//! memory for headless rendering and tests.

pub mod memory;
pub mod render_queue;

pub use memory::MemoryDevice;
pub use render_queue::RenderQueue;

use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::video::format::{PixelFormat, Resolution};

/// GPU vendor, relevant for Vulkan where encoder interop differs per vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Other,
}

/// Rendering backend the host application runs on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GpuBackend {
    D3D11,
    D3D12,
    Vulkan(GpuVendor),
    /// Host-memory surfaces (headless rendering)
    Memory,
    Other(String),
}

impl GpuBackend {
    /// Whether encoder input surfaces can be allocated on this backend
    pub fn supports_encoder_input(&self) -> bool {
        match self {
            GpuBackend::D3D11 | GpuBackend::D3D12 | GpuBackend::Memory => true,
            GpuBackend::Vulkan(vendor) => matches!(vendor, GpuVendor::Nvidia | GpuVendor::Amd),
            GpuBackend::Other(_) => false,
        }
    }

    /// Short name used in encoder implementation names
    pub fn short_name(&self) -> &str {
        match self {
            GpuBackend::D3D11 => "D3D11",
            GpuBackend::D3D12 => "D3D12",
            GpuBackend::Vulkan(_) => "Vulkan",
            GpuBackend::Memory => "Memory",
            GpuBackend::Other(name) => name.as_str(),
        }
    }
}

impl fmt::Display for GpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuBackend::Vulkan(vendor) => write!(f, "Vulkan ({:?})", vendor),
            other => write!(f, "{}", other.short_name()),
        }
    }
}

/// How a surface is used, which decides its heap and bind flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceUsage {
    RenderTarget,
    /// Render target shareable with the hardware encoder
    SharedRenderTarget,
    /// GPU-side staging copy for readback
    Staging,
    /// CPU-mappable readback destination
    CpuReadback,
}

/// Surface creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: SurfaceUsage,
}

impl SurfaceDesc {
    pub fn new(width: u32, height: u32, usage: SurfaceUsage) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Bgra8,
            usage,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// Backend-specific handle behind a [`Surface`]
#[derive(Clone)]
pub enum NativeHandle {
    D3D11Texture(usize),
    D3D12Resource(usize),
    VulkanImage(u64),
    CudaArray(usize),
    /// Host-memory pixels, swapped wholesale on every write
    Host(Arc<RwLock<Bytes>>),
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeHandle::D3D11Texture(p) => write!(f, "D3D11Texture({:#x})", p),
            NativeHandle::D3D12Resource(p) => write!(f, "D3D12Resource({:#x})", p),
            NativeHandle::VulkanImage(h) => write!(f, "VulkanImage({:#x})", h),
            NativeHandle::CudaArray(p) => write!(f, "CudaArray({:#x})", p),
            NativeHandle::Host(data) => write!(f, "Host({} bytes)", data.read().len()),
        }
    }
}

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct SurfaceInner {
    id: u64,
    desc: SurfaceDesc,
    handle: NativeHandle,
    /// Row stride in pixels
    stride: u32,
}

/// Shared handle to a GPU surface
///
/// Cloning is cheap and refers to the same underlying resource.
#[derive(Debug, Clone)]
pub struct Surface {
    inner: Arc<SurfaceInner>,
}

impl Surface {
    pub fn new(desc: SurfaceDesc, handle: NativeHandle, stride: u32) -> Self {
        Self {
            inner: Arc::new(SurfaceInner {
                id: NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed),
                desc,
                handle,
                stride,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn desc(&self) -> &SurfaceDesc {
        &self.inner.desc
    }

    pub fn width(&self) -> u32 {
        self.inner.desc.width
    }

    pub fn height(&self) -> u32 {
        self.inner.desc.height
    }

    pub fn resolution(&self) -> Resolution {
        self.inner.desc.resolution()
    }

    pub fn stride(&self) -> u32 {
        self.inner.stride
    }

    pub fn handle(&self) -> &NativeHandle {
        &self.inner.handle
    }

    /// Same underlying resource
    pub fn ptr_eq(&self, other: &Surface) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Completion marker for GPU work
#[derive(Debug, Clone, Default)]
pub struct Fence {
    signaled: Arc<AtomicBool>,
}

impl Fence {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fence whose work already retired
    pub fn signaled() -> Self {
        let fence = Self::new();
        fence.signal();
        fence
    }

    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}

/// Sampler used when the copy destination differs in size from the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerFilter {
    Point,
    Bilinear,
}

impl SamplerFilter {
    pub fn for_sizes(src: Resolution, dst: Resolution) -> Self {
        if src == dst {
            SamplerFilter::Point
        } else {
            SamplerFilter::Bilinear
        }
    }
}

enum MappedData {
    Host(Bytes),
    External {
        ptr: *const u8,
        len: usize,
        unmap: Option<Box<dyn FnOnce()>>,
    },
}

/// CPU view of a locked or mapped surface
///
/// The view borrows the surface it was mapped from and unmaps on drop, so
/// the pixels cannot outlive the mapping.
pub struct MappedSurface<'a> {
    data: MappedData,
    width: u32,
    height: u32,
    stride: u32,
    _surface: PhantomData<&'a Surface>,
}

impl<'a> MappedSurface<'a> {
    /// Map host-memory pixels
    pub fn from_host(data: Bytes, width: u32, height: u32, stride: u32) -> Self {
        Self {
            data: MappedData::Host(data),
            width,
            height,
            stride,
            _surface: PhantomData,
        }
    }

    /// Wrap a pointer returned by a graphics API map call
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` bytes until `unmap` runs,
    /// which happens when the returned value is dropped.
    pub unsafe fn from_raw(
        ptr: *const u8,
        len: usize,
        width: u32,
        height: u32,
        stride: u32,
        unmap: Box<dyn FnOnce()>,
    ) -> Self {
        Self {
            data: MappedData::External {
                ptr,
                len,
                unmap: Some(unmap),
            },
            width,
            height,
            stride,
            _surface: PhantomData,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in pixels
    pub fn stride(&self) -> u32 {
        self.stride
    }
}

impl Deref for MappedSurface<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.data {
            MappedData::Host(bytes) => bytes,
            // SAFETY: guaranteed valid until unmap by the `from_raw` contract
            MappedData::External { ptr, len, .. } => unsafe {
                std::slice::from_raw_parts(*ptr, *len)
            },
        }
    }
}

impl Drop for MappedSurface<'_> {
    fn drop(&mut self) {
        if let MappedData::External { unmap, .. } = &mut self.data {
            if let Some(unmap) = unmap.take() {
                unmap();
            }
        }
    }
}

/// Renderer operations needed by the capture pipeline
///
/// All methods are called from the render queue thread.
pub trait GpuDevice: Send + Sync {
    fn backend(&self) -> GpuBackend;

    /// Adapter name for logs
    fn name(&self) -> &str;

    fn create_surface(&self, desc: &SurfaceDesc) -> Result<Surface>;

    /// Called when the pool destroys a surface
    fn release_surface(&self, _surface: &Surface) {}

    /// Copy `src` into `dst`, resampling with `filter` when sizes differ
    fn copy_surface(&self, src: &Surface, dst: &Surface, filter: SamplerFilter) -> Result<()>;

    /// Copy `src` into a CPU-readable surface; the fence signals on completion
    fn copy_to_readback(&self, src: &Surface, dst: &Surface) -> Result<Fence>;

    /// Lock a surface for CPU reads, blocking until prior GPU work retires
    fn lock_surface<'a>(&self, surface: &'a Surface) -> Result<MappedSurface<'a>>;

    /// Map a readback surface whose fence has signalled
    fn map_readback<'a>(&self, surface: &'a Surface) -> Result<MappedSurface<'a>>;
}
