//! Encoder context: capture resolution plus the frame slot map
//!
//! Binds the [`EncoderInput`] allocator to GPU surfaces. The slot map owns
//! one surface per live identity. Release hooks installed on the allocator
//! hold only a weak reference to the map and remove entries by id, so the
//! allocator never keeps the context alive.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

use crate::error::{PublisherError, Result};
use crate::gpu::{GpuDevice, Surface, SurfaceDesc, SurfaceUsage};
use crate::video::format::Resolution;
use crate::video::pool::{EncoderInput, FrameId, InputFrame};

/// Default number of frame slots in flight
pub const DEFAULT_MAX_BUFFERS: usize = 3;

type SlotMap = Mutex<HashMap<FrameId, Surface>>;

/// One obtained frame slot
pub struct CapturerInput {
    pub frame: InputFrame,
    pub surface: Surface,
    /// Surface was allocated for this call
    pub is_new: bool,
}

/// Capture resolution and bounded pool of GPU-backed frame slots
pub struct EncoderContext {
    device: Arc<dyn GpuDevice>,
    input: Arc<EncoderInput>,
    fixed_resolution: bool,
    resolution: Mutex<Resolution>,
    slots: Arc<SlotMap>,
}

impl EncoderContext {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        resolution: Resolution,
        fixed_resolution: bool,
        max_buffers: usize,
    ) -> Result<Self> {
        if !resolution.is_valid() {
            return Err(PublisherError::Config(format!(
                "invalid capture resolution {}",
                resolution
            )));
        }
        let input = match EncoderInput::new(device.backend(), resolution, max_buffers) {
            Ok(input) => input,
            Err(e) => {
                error!("No encoder input for {} ({}): {}", device.name(), device.backend(), e);
                return Err(e);
            }
        };
        info!(
            "Encoder context created: {} on {}, {} buffers{}",
            resolution,
            device.backend(),
            max_buffers,
            if fixed_resolution { ", fixed" } else { "" }
        );

        Ok(Self {
            device,
            input,
            fixed_resolution,
            resolution: Mutex::new(resolution),
            slots: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn encoder_input(&self) -> &Arc<EncoderInput> {
        &self.input
    }

    pub fn resolution(&self) -> Resolution {
        *self.resolution.lock()
    }

    pub fn is_fixed_resolution(&self) -> bool {
        self.fixed_resolution
    }

    pub fn max_buffers(&self) -> usize {
        self.input.max_buffers()
    }

    /// Surfaces currently mapped to a live identity
    pub fn live_surfaces(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn surface_for(&self, id: FrameId) -> Option<Surface> {
        self.slots.lock().get(&id).cloned()
    }

    /// Obtain a frame slot
    ///
    /// Reuses the slot's surface when its identity is recycled at the
    /// current resolution. Returns [`PublisherError::SlotsExhausted`] when
    /// every slot is in flight.
    pub fn obtain_slot(&self) -> Result<CapturerInput> {
        let frame = self
            .input
            .obtain()
            .ok_or(PublisherError::SlotsExhausted(self.input.max_buffers()))?;
        let resolution = frame.resolution();

        if let Some(surface) = self.slots.lock().get(&frame.id()) {
            if surface.resolution() == resolution {
                return Ok(CapturerInput {
                    surface: surface.clone(),
                    frame,
                    is_new: false,
                });
            }
        }

        let desc = SurfaceDesc::new(
            resolution.width,
            resolution.height,
            SurfaceUsage::SharedRenderTarget,
        );
        let surface = self.device.create_surface(&desc)?;
        if let Some(old) = self.slots.lock().insert(frame.id(), surface.clone()) {
            self.device.release_surface(&old);
        }
        debug!(
            "Created slot surface {} for frame {} at {}",
            surface.id(),
            frame.id(),
            resolution
        );

        let weak: Weak<SlotMap> = Arc::downgrade(&self.slots);
        let device = self.device.clone();
        self.input.set_release_hook(
            frame.id(),
            Box::new(move |id| {
                if let Some(slots) = weak.upgrade() {
                    if let Some(surface) = slots.lock().remove(&id) {
                        device.release_surface(&surface);
                    }
                }
            }),
        );

        Ok(CapturerInput {
            frame,
            surface,
            is_new: true,
        })
    }

    /// Change the capture resolution
    ///
    /// No-op when fixed or unchanged. Idle slots are flushed; in-flight
    /// slots keep their surface until their last reference drops.
    pub fn set_resolution(&self, width: u32, height: u32) -> Result<()> {
        if self.fixed_resolution {
            return Ok(());
        }
        let resolution = Resolution::new(width, height);
        if !resolution.is_valid() {
            return Err(PublisherError::Config(format!(
                "invalid capture resolution {}",
                resolution
            )));
        }
        {
            let mut current = self.resolution.lock();
            if *current == resolution {
                return Ok(());
            }
            info!("Capture resolution changed: {} -> {}", *current, resolution);
            *current = resolution;
        }
        self.input.set_resolution(resolution);
        Ok(())
    }

    /// Destroy all idle slots
    pub fn flush(&self) {
        self.input.flush();
    }
}

impl Drop for EncoderContext {
    fn drop(&mut self) {
        let surfaces: Vec<Surface> = self.slots.lock().drain().map(|(_, s)| s).collect();
        for surface in &surfaces {
            self.device.release_surface(surface);
        }
        debug!("Encoder context dropped, released {} surfaces", surfaces.len());
    }
}
