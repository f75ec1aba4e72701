//! Encoder input allocator
//!
//! Hands out reference-counted frame identities, bounded by `max_buffers`.
//! An identity whose last [`InputFrame`] is dropped becomes available and is
//! recycled least-recently-used first. Identities that no longer match the
//! current resolution are destroyed instead of recycled, firing their
//! release hooks.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{PublisherError, Result};
use crate::gpu::GpuBackend;
use crate::video::format::Resolution;

/// Logical frame identifier, monotonic per allocator
pub type FrameId = u64;

/// Called once when an identity is destroyed
pub type ReleaseHook = Box<dyn FnOnce(FrameId) + Send>;

struct FrameEntry {
    resolution: Resolution,
    ref_count: usize,
    /// Allocator tick at last obtain, for LRU recycling
    last_used: u64,
    hooks: Vec<ReleaseHook>,
}

struct PoolState {
    resolution: Resolution,
    entries: HashMap<FrameId, FrameEntry>,
    next_id: FrameId,
    tick: u64,
}

impl PoolState {
    /// Remove an entry and hand back its hooks to fire without the lock
    fn destroy(&mut self, id: FrameId) -> Vec<(FrameId, ReleaseHook)> {
        match self.entries.remove(&id) {
            Some(entry) => entry.hooks.into_iter().map(|h| (id, h)).collect(),
            None => Vec::new(),
        }
    }
}

fn fire(hooks: Vec<(FrameId, ReleaseHook)>) {
    for (id, hook) in hooks {
        hook(id);
    }
}

/// Bounded allocator of encoder input frame identities
pub struct EncoderInput {
    backend: GpuBackend,
    max_buffers: usize,
    state: Mutex<PoolState>,
}

impl EncoderInput {
    /// Create an allocator for `backend`
    ///
    /// Fails with [`PublisherError::NoEncoderInput`] when the backend cannot
    /// host encoder input surfaces.
    pub fn new(backend: GpuBackend, resolution: Resolution, max_buffers: usize) -> Result<Arc<Self>> {
        if !backend.supports_encoder_input() {
            return Err(PublisherError::NoEncoderInput(format!(
                "unsupported GPU backend {}",
                backend
            )));
        }
        if max_buffers == 0 {
            return Err(PublisherError::Config("max_buffers must be at least 1".into()));
        }
        Ok(Arc::new(Self {
            backend,
            max_buffers,
            state: Mutex::new(PoolState {
                resolution,
                entries: HashMap::new(),
                next_id: 1,
                tick: 0,
            }),
        }))
    }

    pub fn backend(&self) -> &GpuBackend {
        &self.backend
    }

    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }

    pub fn resolution(&self) -> Resolution {
        self.state.lock().resolution
    }

    /// Live identities, available or in flight
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identities currently referenced
    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.ref_count > 0)
            .count()
    }

    /// Obtain an identity, or `None` when all `max_buffers` are in flight
    pub fn obtain(self: &Arc<Self>) -> Option<InputFrame> {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        let resolution = state.resolution;

        let recycled = state
            .entries
            .iter()
            .filter(|(_, e)| e.ref_count == 0 && e.resolution == resolution)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(id, _)| *id);

        let id = match recycled {
            Some(id) => id,
            None if state.entries.len() < self.max_buffers => {
                let id = state.next_id;
                state.next_id += 1;
                state.entries.insert(
                    id,
                    FrameEntry {
                        resolution,
                        ref_count: 0,
                        last_used: tick,
                        hooks: Vec::new(),
                    },
                );
                debug!("Allocated encoder input frame {} at {}", id, resolution);
                id
            }
            None => return None,
        };

        if let Some(entry) = state.entries.get_mut(&id) {
            entry.ref_count = 1;
            entry.last_used = tick;
        }
        trace!("Obtained encoder input frame {}", id);

        Some(InputFrame {
            id,
            resolution,
            pool: self.clone(),
        })
    }

    /// Install a hook fired when `id` is destroyed
    ///
    /// Fires immediately if `id` is already gone.
    pub fn set_release_hook(&self, id: FrameId, hook: ReleaseHook) {
        let mut state = self.state.lock();
        match state.entries.get_mut(&id) {
            Some(entry) => entry.hooks.push(hook),
            None => {
                drop(state);
                hook(id);
            }
        }
    }

    /// Change the allocation resolution and destroy idle identities
    pub fn set_resolution(&self, resolution: Resolution) {
        {
            let mut state = self.state.lock();
            if state.resolution == resolution {
                return;
            }
            state.resolution = resolution;
        }
        self.flush();
    }

    /// Destroy every identity that is not in flight
    pub fn flush(&self) {
        let hooks = {
            let mut state = self.state.lock();
            let idle: Vec<FrameId> = state
                .entries
                .iter()
                .filter(|(_, e)| e.ref_count == 0)
                .map(|(id, _)| *id)
                .collect();
            if !idle.is_empty() {
                debug!("Flushing {} idle encoder input frames", idle.len());
            }
            idle.into_iter()
                .flat_map(|id| state.destroy(id))
                .collect::<Vec<_>>()
        };
        fire(hooks);
    }

    fn add_ref(&self, id: FrameId) {
        if let Some(entry) = self.state.lock().entries.get_mut(&id) {
            entry.ref_count += 1;
        }
    }

    fn release(&self, id: FrameId) {
        let hooks = {
            let mut state = self.state.lock();
            let current = state.resolution;
            match state.entries.get_mut(&id) {
                Some(entry) => {
                    entry.ref_count = entry.ref_count.saturating_sub(1);
                    if entry.ref_count == 0 && entry.resolution != current {
                        trace!("Destroying stale encoder input frame {}", id);
                        state.destroy(id)
                    } else {
                        Vec::new()
                    }
                }
                None => Vec::new(),
            }
        };
        fire(hooks);
    }
}

impl Drop for EncoderInput {
    fn drop(&mut self) {
        let ids: Vec<FrameId> = self.state.get_mut().entries.keys().copied().collect();
        let hooks = ids
            .into_iter()
            .flat_map(|id| self.state.get_mut().destroy(id))
            .collect::<Vec<_>>();
        fire(hooks);
    }
}

/// Reference-counted handle to one encoder input identity
///
/// Cloning adds a reference; dropping the last clone returns the identity
/// to the allocator.
pub struct InputFrame {
    id: FrameId,
    resolution: Resolution,
    pool: Arc<EncoderInput>,
}

impl InputFrame {
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Resolution the identity was allocated at
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Allocator that owns this identity
    pub fn encoder_input(&self) -> &Arc<EncoderInput> {
        &self.pool
    }
}

impl Clone for InputFrame {
    fn clone(&self) -> Self {
        self.pool.add_ref(self.id);
        Self {
            id: self.id,
            resolution: self.resolution,
            pool: self.pool.clone(),
        }
    }
}

impl Drop for InputFrame {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

impl fmt::Debug for InputFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputFrame")
            .field("id", &self.id)
            .field("resolution", &self.resolution)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(max: usize) -> Arc<EncoderInput> {
        EncoderInput::new(GpuBackend::Memory, Resolution::new(64, 64), max).unwrap()
    }

    #[test]
    fn test_bound_and_recycling() {
        let pool = pool(3);
        let a = pool.obtain().unwrap();
        let b = pool.obtain().unwrap();
        let c = pool.obtain().unwrap();
        assert!(pool.obtain().is_none());
        assert_eq!(pool.in_flight(), 3);

        let b_id = b.id();
        drop(b);
        let d = pool.obtain().unwrap();
        assert_eq!(d.id(), b_id);
        assert_eq!(pool.len(), 3);
        drop((a, c, d));
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_lru_recycling_order() {
        let pool = pool(2);
        let a = pool.obtain().unwrap();
        let b = pool.obtain().unwrap();
        let (a_id, b_id) = (a.id(), b.id());
        drop(a);
        drop(b);
        // a was obtained first, so it is least recently used
        assert_eq!(pool.obtain().unwrap().id(), a_id);
        let first = pool.obtain().unwrap();
        let second = pool.obtain().unwrap();
        assert_ne!(first.id(), second.id());
        assert!([a_id, b_id].contains(&first.id()));
    }

    #[test]
    fn test_clone_keeps_identity_in_flight() {
        let pool = pool(1);
        let a = pool.obtain().unwrap();
        let a2 = a.clone();
        drop(a);
        assert!(pool.obtain().is_none());
        drop(a2);
        assert!(pool.obtain().is_some());
    }

    #[test]
    fn test_resize_destroys_idle_and_defers_in_flight() {
        let pool = pool(3);
        let destroyed = Arc::new(AtomicUsize::new(0));

        let held = pool.obtain().unwrap();
        let idle = pool.obtain().unwrap();
        for id in [held.id(), idle.id()] {
            let d = destroyed.clone();
            pool.set_release_hook(
                id,
                Box::new(move |_| {
                    d.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        drop(idle);

        pool.set_resolution(Resolution::new(128, 128));
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);

        drop(held);
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert!(pool.is_empty());

        let fresh = pool.obtain().unwrap();
        assert_eq!(fresh.resolution(), Resolution::new(128, 128));
    }

    #[test]
    fn test_unsupported_backend() {
        let result = EncoderInput::new(
            GpuBackend::Vulkan(crate::gpu::GpuVendor::Intel),
            Resolution::HD720,
            3,
        );
        assert!(matches!(result, Err(PublisherError::NoEncoderInput(_))));
    }

    #[test]
    fn test_hook_on_destroyed_id_fires_immediately() {
        let pool = pool(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        pool.set_release_hook(
            42,
            Box::new(move |id| {
                assert_eq!(id, 42);
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
